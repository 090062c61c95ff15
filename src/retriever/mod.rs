// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Piece retrieval: a chain of composable retrievers (CDN → subgraph →
//! on-chain discovery) racing candidate providers for the first
//! successful, digest-validated response.

mod cdn;
mod chain;
mod race;
mod subgraph;

pub use cdn::CdnRetriever;
pub use chain::ChainRetriever;
pub use subgraph::SubgraphRetriever;

use crate::error::Result;
use crate::piece::PieceCid;
use alloy_primitives::Address;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Options threaded from the download entry points into the chain.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOptions {
    /// Restrict retrieval to one provider instead of discovering
    /// candidates.
    pub provider_address: Option<Address>,
    /// Consult the CDN edge before anything else.
    pub with_cdn: bool,
    /// Cancels every in-flight provider task when triggered.
    pub cancel: CancellationToken,
}

/// One stage of the retrieval chain. On failure a stage falls through to
/// the retriever it wraps; the chain-end stage fails with
/// [`crate::error::Error::AllProvidersFailed`] instead.
#[async_trait]
pub trait PieceRetriever: Send + Sync {
    /// Fetch and validate a piece, returning the full byte buffer whose
    /// recomputed commitment matches `piece`.
    async fn fetch_piece(
        &self,
        piece: PieceCid,
        client: Address,
        options: &RetrievalOptions,
    ) -> Result<Vec<u8>>;
}
