// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::race::{Candidate, race_download};
use super::{PieceRetriever, RetrievalOptions};
use crate::error::Result;
use crate::pdp::PdpConnect;
use crate::piece::PieceCid;
use crate::subgraph::SubgraphApi;
use alloy_primitives::Address;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Subgraph-backed retriever: asks the indexing service which providers
/// advertise the piece and races them; on any failure it falls through
/// to the wrapped retriever.
pub struct SubgraphRetriever {
    subgraph: Arc<dyn SubgraphApi>,
    connect: Arc<dyn PdpConnect>,
    inner: Arc<dyn PieceRetriever>,
}

impl SubgraphRetriever {
    pub fn new(
        subgraph: Arc<dyn SubgraphApi>,
        connect: Arc<dyn PdpConnect>,
        inner: Arc<dyn PieceRetriever>,
    ) -> Self {
        SubgraphRetriever {
            subgraph,
            connect,
            inner,
        }
    }
}

#[async_trait]
impl PieceRetriever for SubgraphRetriever {
    async fn fetch_piece(
        &self,
        piece: PieceCid,
        client: Address,
        options: &RetrievalOptions,
    ) -> Result<Vec<u8>> {
        // an explicit provider hint bypasses subgraph discovery entirely
        if options.provider_address.is_none() {
            match self.subgraph.providers_for_piece(&piece).await {
                Ok(providers) if !providers.is_empty() => {
                    let candidates = providers
                        .into_iter()
                        .map(|p| Candidate {
                            address: p.address,
                            client: self.connect.connect(p.service_url),
                        })
                        .collect();
                    match race_download(candidates, piece, &options.cancel).await {
                        Ok(bytes) => return Ok(bytes),
                        Err(e) => {
                            debug!(%piece, "subgraph-discovered providers failed: {e}");
                        }
                    }
                }
                Ok(_) => debug!(%piece, "subgraph knows no providers for piece"),
                Err(e) => debug!(%piece, "subgraph discovery failed: {e}"),
            }
        }
        self.inner.fetch_piece(piece, client, options).await
    }
}
