// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-provider HTTP client for the PDP service API.
//!
//! Every response body is deserialized into a dedicated response struct
//! and validated before use; a response that is missing a required field,
//! carries a wrong type or an unparsable piece CID is rejected as
//! [`Error::MalformedServerResponse`].

mod client;
#[cfg(test)]
pub(crate) mod test_api;

pub use client::PdpClient;

use crate::error::Result;
use crate::piece::PieceCid;
use crate::types::MetadataMap;
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

/// Payload of an upload: either an in-memory buffer, or a byte stream.
/// Streams require a precomputed piece CID since the body cannot be
/// replayed for hashing.
pub enum UploadSource {
    Buffer(bytes::Bytes),
    Stream(reqwest::Body),
}

/// A piece scheduled for addition, with optional per-piece metadata.
#[derive(Debug, Clone)]
pub struct PieceEntry {
    pub piece_cid: PieceCid,
    pub metadata: MetadataMap,
}

/// Parameters for creating a data set on the provider, optionally seeded
/// with initial pieces.
#[derive(Debug, Clone)]
pub struct CreateDataSet {
    pub client_data_set_id: u64,
    pub payee: Address,
    pub record_keeper: Address,
    pub with_cdn: bool,
    pub metadata: MetadataMap,
    pub pieces: Vec<PieceEntry>,
}

/// Result of asking the provider to create a data set.
#[derive(Debug, Clone)]
pub struct CreateDataSetTicket {
    pub tx_hash: B256,
    pub status_url: Option<Url>,
}

/// Server-side view of a transaction adding pieces to a data set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieceAdditionStatus {
    pub tx_status: TxStatus,
    /// `None` while the server has not yet examined the landed message.
    pub add_message_ok: Option<bool>,
    #[serde(default)]
    pub confirmed_piece_ids: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

/// One piece of a provider-side data set listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSetPiece {
    pub piece_id: u64,
    pub piece_cid: PieceCid,
}

/// Provider-side state of a data set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSetState {
    pub id: u64,
    pub pieces: Vec<DataSetPiece>,
    pub next_challenge_epoch: u64,
}

/// Comprehensive status of data-set creation, combining chain and server
/// observations.
#[derive(Debug, Clone, Default)]
pub struct DataSetCreationStatus {
    pub tx_mined: bool,
    pub tx_success: bool,
    pub data_set_live: bool,
    pub server_confirmed: bool,
    pub data_set_id: Option<u64>,
}

/// Factory producing a [`PdpApi`] client for a provider's service URL.
/// Selection and retrieval create clients for arbitrary providers; tests
/// substitute canned implementations.
pub trait PdpConnect: Send + Sync {
    fn connect(&self, base: Url) -> std::sync::Arc<dyn PdpApi>;
}

/// Production connector sharing one HTTP connection pool across
/// providers.
pub struct HttpPdpConnect {
    http: reqwest::Client,
}

impl HttpPdpConnect {
    pub fn new(http: reqwest::Client) -> Self {
        HttpPdpConnect { http }
    }
}

impl PdpConnect for HttpPdpConnect {
    fn connect(&self, base: Url) -> std::sync::Arc<dyn PdpApi> {
        std::sync::Arc::new(PdpClient::new(self.http.clone(), base))
    }
}

/// The provider PDP API the orchestration code consumes. [`PdpClient`]
/// is the HTTP implementation; tests substitute their own.
#[async_trait]
pub trait PdpApi: Send + Sync {
    /// Liveness probe; any non-success response is a failure.
    async fn ping(&self) -> Result<()>;

    /// Upload piece bytes, returning the canonical piece CID and size as
    /// acknowledged by the server.
    async fn upload_piece(
        &self,
        source: UploadSource,
        precomputed: Option<PieceCid>,
    ) -> Result<(PieceCid, u64)>;

    /// True iff the piece is present and parked (ready to serve).
    async fn find_piece(&self, piece: &PieceCid) -> Result<bool>;

    /// Ask the provider to create a data set (optionally pre-seeded with
    /// pieces) on the client's behalf.
    async fn create_data_set(&self, request: &CreateDataSet) -> Result<CreateDataSetTicket>;

    /// Ask the provider to add pieces to an existing data set. The
    /// caller passes the exact `next_piece_id` expected by chain state.
    async fn add_pieces(
        &self,
        data_set_id: u64,
        client_data_set_id: u64,
        next_piece_id: u64,
        pieces: &[PieceEntry],
    ) -> Result<B256>;

    /// Server view of an add-pieces transaction; `None` while the server
    /// does not know the hash yet (HTTP 404).
    async fn piece_addition_status(
        &self,
        data_set_id: u64,
        tx_hash: B256,
    ) -> Result<Option<PieceAdditionStatus>>;

    /// Server view of data-set creation progress; `None` while unknown.
    async fn data_set_creation_status(
        &self,
        tx_hash: B256,
    ) -> Result<Option<DataSetCreationStatus>>;

    async fn get_data_set(&self, data_set_id: u64) -> Result<DataSetState>;

    /// Schedule removal of a piece; returns the server's transaction hash.
    async fn delete_piece(
        &self,
        data_set_id: u64,
        client_data_set_id: u64,
        piece_id: u64,
    ) -> Result<B256>;

    /// Streamed piece retrieval from the provider's serving endpoint.
    async fn download_piece(&self, piece: &PieceCid) -> Result<reqwest::Response>;

    fn base_url(&self) -> &Url;
}
