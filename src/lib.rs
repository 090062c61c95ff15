// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Rust client for Filecoin warm storage on the Synapse PDP stack.
//!
//! The crate is organised as a dependency graph rooted in [`Synapse`]: the
//! facade owns the chain adapter, the payments service and the storage
//! manager; storage contexts hold cheap handles to those, never back
//! pointers. Uploads flow through a [`storage::StorageContext`], which
//! batches on-chain piece additions; downloads flow through a chain of
//! [`retriever::PieceRetriever`]s racing candidate providers.

pub mod chain;
pub mod client;
pub mod error;
pub mod network;
pub mod payments;
pub mod pdp;
pub mod piece;
pub mod registry;
pub mod retriever;
pub mod session;
pub mod stats;
pub mod storage;
pub mod subgraph;
pub mod types;

pub use client::{Synapse, SynapseConfig};
pub use error::{Error, Result};
pub use network::Network;
pub use piece::PieceCid;
