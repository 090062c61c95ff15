// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use alloy_primitives::{Address, B256};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Client error taxonomy. Variants carry enough context for a caller to
/// pick a next action (retry, wait, top up); transaction hashes are
/// included whenever known.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // input
    #[error("invalid piece CID: {0}")]
    InvalidPieceCid(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),
    #[error("conflicting options: {0}")]
    OptionsConflict(String),

    // capacity
    #[error("data of {size} bytes is below the minimum upload size of {min} bytes")]
    TooSmall { size: u64, min: u64 },
    #[error("data of {size} bytes exceeds the maximum upload size of {max} bytes")]
    TooLarge { size: u64, max: u64 },
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: String, available: String },
    #[error("unsupported token {0}")]
    UnsupportedToken(Address),
    #[error("unsupported network, chain id {0}")]
    UnsupportedNetwork(u64),

    // state
    #[error("data set {id} is owned by {owner}, not by this client")]
    DataSetNotOwnedByClient { id: u64, owner: Address },
    #[error("data set {id} CDN setting does not match the request (data set CDN: {actual})")]
    DataSetCdnMismatch { id: u64, actual: bool },
    #[error("data set {0} not found")]
    DataSetNotFound(u64),
    #[error("rail {0} not found")]
    RailNotFound(u64),
    #[error("cannot settle rail {rail_id} up to epoch {until}: current epoch is {current}")]
    FutureEpochRejected { rail_id: u64, until: u64, current: u64 },
    #[error("no provider responded to a ping")]
    NoHealthyProvider,
    #[error("no providers available: {0}")]
    NoProvidersAvailable(String),

    // transport
    #[error("chain call {op} failed: {cause}")]
    ChainCallFailed { op: &'static str, cause: String },
    #[error("transaction {0} was not seen on chain within the propagation window")]
    TxNotPropagated(B256),
    #[error("transaction {0} reverted")]
    TxReverted(B256),
    #[error("server rejected piece addition for transaction {0}")]
    ServerRejectedPieceAddition(B256),
    #[error("server timed out during {0}")]
    ServerTimeout(&'static str),
    #[error("malformed server response: {0}")]
    MalformedServerResponse(String),
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    // content
    #[error("digest mismatch: expected {expected}, got {got}")]
    DigestMismatch { expected: String, got: String },
    #[error("piece {0} was not parked within the timeout")]
    PieceParkingTimeout(String),
    #[error("piece {0} is not present in the data set")]
    PieceNotFound(String),
    #[error("server confirmed fewer pieces than submitted (missing index {index})")]
    MissingConfirmedPieceId { index: usize },
    #[error("all providers failed: {}", format_provider_failures(.0))]
    AllProvidersFailed(Vec<(Address, String)>),

    // lifecycle
    #[error("operation cancelled")]
    Cancelled,
    #[error("data set creation failed: {reason}")]
    DataSetCreationFailed { reason: String },
    #[error("session key is not authorised for {0}")]
    SessionKeyNotAuthorised(String),
}

fn format_provider_failures(failures: &[(Address, String)]) -> String {
    if failures.is_empty() {
        return "no candidate providers".into();
    }
    failures
        .iter()
        .map(|(addr, reason)| format!("{addr}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Tag a transport-level failure with the chain operation it came from.
    pub(crate) fn chain(op: &'static str, cause: impl std::fmt::Display) -> Self {
        Error::ChainCallFailed {
            op,
            cause: cause.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            Error::Http {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else if e.is_timeout() {
            Error::ServerTimeout("http request")
        } else {
            Error::MalformedServerResponse(e.to_string())
        }
    }
}
