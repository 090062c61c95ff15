// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::{PieceRetriever, RetrievalOptions};
use crate::error::{Error, Result};
use crate::network::Network;
use crate::piece::{PieceCid, collect_validated};
use alloy_primitives::Address;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Outermost retriever: tries the FilBeam CDN edge when the request has
/// CDN enabled, falling through to the wrapped retriever on any failure.
pub struct CdnRetriever {
    http: reqwest::Client,
    cdn_host: String,
    inner: Arc<dyn PieceRetriever>,
}

impl CdnRetriever {
    pub fn new(http: reqwest::Client, network: Network, inner: Arc<dyn PieceRetriever>) -> Self {
        CdnRetriever {
            http,
            cdn_host: network.cdn_host().to_string(),
            inner,
        }
    }

    #[cfg(test)]
    fn with_host(http: reqwest::Client, cdn_host: String, inner: Arc<dyn PieceRetriever>) -> Self {
        CdnRetriever {
            http,
            cdn_host,
            inner,
        }
    }

    /// Edge URL for a client's piece: `https://<client>.<host>/<piece>`.
    fn edge_url(&self, piece: &PieceCid, client: Address) -> Result<Url> {
        let url = format!("https://0x{client:x}.{}/{piece}", self.cdn_host);
        Url::parse(&url).map_err(|e| Error::InvalidAddress(format!("cdn url {url}: {e}")))
    }

    async fn fetch_from_edge(&self, piece: PieceCid, client: Address) -> Result<Vec<u8>> {
        let url = self.edge_url(&piece, client)?;
        let response = self.http.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(Error::Http {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        collect_validated(response.bytes_stream(), &piece, None).await
    }
}

#[async_trait]
impl PieceRetriever for CdnRetriever {
    async fn fetch_piece(
        &self,
        piece: PieceCid,
        client: Address,
        options: &RetrievalOptions,
    ) -> Result<Vec<u8>> {
        if options.with_cdn {
            match self.fetch_from_edge(piece, client).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => debug!(%piece, "cdn edge miss: {e}"),
            }
        }
        self.inner.fetch_piece(piece, client, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticInner(Vec<u8>);

    #[async_trait]
    impl PieceRetriever for StaticInner {
        async fn fetch_piece(
            &self,
            _piece: PieceCid,
            _client: Address,
            _options: &RetrievalOptions,
        ) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn edge_url_embeds_client_and_piece() {
        let retriever = CdnRetriever::with_host(
            reqwest::Client::new(),
            "calibration.filbeam.io".into(),
            Arc::new(StaticInner(vec![])),
        );
        let piece = PieceCid::from_data(&[1u8; 200]).unwrap();
        let client = Address::repeat_byte(0xab);
        let url = retriever.edge_url(&piece, client).unwrap();
        assert_eq!(
            url.host_str().unwrap(),
            format!("0x{client:x}.calibration.filbeam.io")
        );
        assert_eq!(url.path(), format!("/{piece}"));
    }

    #[tokio::test]
    async fn cdn_disabled_goes_straight_to_inner() {
        let retriever = CdnRetriever::with_host(
            reqwest::Client::new(),
            "calibration.filbeam.io".into(),
            Arc::new(StaticInner(b"from inner".to_vec())),
        );
        let piece = PieceCid::from_data(&[1u8; 200]).unwrap();
        let bytes = retriever
            .fetch_piece(piece, Address::ZERO, &RetrievalOptions::default())
            .await
            .unwrap();
        assert_eq!(bytes, b"from inner");
    }

    #[tokio::test]
    async fn cdn_failure_falls_through_to_inner() {
        // an unresolvable edge host forces the fallback path
        let retriever = CdnRetriever::with_host(
            reqwest::Client::new(),
            "invalid.test".into(),
            Arc::new(StaticInner(b"fallback".to_vec())),
        );
        let piece = PieceCid::from_data(&[1u8; 200]).unwrap();
        let options = RetrievalOptions {
            with_cdn: true,
            ..Default::default()
        };
        let bytes = retriever
            .fetch_piece(piece, Address::ZERO, &options)
            .await
            .unwrap();
        assert_eq!(bytes, b"fallback");
    }
}
