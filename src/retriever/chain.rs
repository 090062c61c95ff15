// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::race::{Candidate, race_download};
use super::{PieceRetriever, RetrievalOptions};
use crate::chain::ChainApi;
use crate::error::{Error, Result};
use crate::pdp::PdpConnect;
use crate::piece::PieceCid;
use crate::registry::ProviderResolver;
use alloy_primitives::Address;
use async_trait::async_trait;
use itertools::Itertools;
use std::sync::Arc;
use url::Url;

/// Chain-end retriever: discovers candidate providers from the client's
/// on-chain data sets and races them. There is no retriever below this
/// one, so exhaustion means [`Error::AllProvidersFailed`].
pub struct ChainRetriever {
    chain: Arc<dyn ChainApi>,
    resolver: Arc<ProviderResolver>,
    connect: Arc<dyn PdpConnect>,
}

impl ChainRetriever {
    pub fn new(
        chain: Arc<dyn ChainApi>,
        resolver: Arc<ProviderResolver>,
        connect: Arc<dyn PdpConnect>,
    ) -> Self {
        ChainRetriever {
            chain,
            resolver,
            connect,
        }
    }

    async fn candidates(
        &self,
        client: Address,
        options: &RetrievalOptions,
    ) -> Result<Vec<Candidate>> {
        if let Some(addr) = options.provider_address {
            let provider = self.resolver.provider_by_address(addr).await?;
            let Some(url) = provider.service_url() else {
                return Ok(vec![]);
            };
            let url = parse_service_url(url)?;
            return Ok(vec![Candidate {
                address: provider.service_provider,
                client: self.connect.connect(url),
            }]);
        }

        let data_sets = self.chain.client_data_sets(client).await?;
        let ids: Vec<u64> = data_sets
            .iter()
            .filter(|s| s.is_live)
            .map(|s| s.provider_id)
            .unique()
            .collect();
        let providers = self.resolver.providers(&ids).await?;
        let mut candidates = Vec::new();
        for provider in providers {
            let Some(url) = provider.service_url() else {
                continue;
            };
            let url = parse_service_url(url)?;
            candidates.push(Candidate {
                address: provider.service_provider,
                client: self.connect.connect(url),
            });
        }
        Ok(candidates)
    }
}

fn parse_service_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| Error::MalformedServerResponse(format!("service URL {url}: {e}")))
}

#[async_trait]
impl PieceRetriever for ChainRetriever {
    async fn fetch_piece(
        &self,
        piece: PieceCid,
        client: Address,
        options: &RetrievalOptions,
    ) -> Result<Vec<u8>> {
        let candidates = self.candidates(client, options).await?;
        race_download(candidates, piece, &options.cancel).await
    }
}
