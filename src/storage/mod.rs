// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Storage orchestration: contexts bound to one provider ↔ data set
//! pair, and the manager that caches and dispatches across them.
//!
//! A context owns its pending-piece queue, batching flag and in-flight
//! upload set; nothing is shared between contexts, so they are safe to
//! drive in parallel. Within one context add-pieces transactions are
//! strictly sequential.

mod context;
mod manager;
mod resolve;

pub use context::StorageContext;
pub use manager::{DownloadOptions, StorageManager, UploadTarget};
pub use resolve::smart_select;

use crate::error::{Error, Result};
use crate::piece::PieceCid;
use crate::types::{MetadataMap, ProviderInfo};
use alloy_primitives::{Address, B256, U256};
use std::time::Duration;

/// Uploads below one fr32 quad cannot be committed.
pub const MIN_UPLOAD_SIZE: u64 = 127;
/// Cap accepted by the provider upload endpoint.
pub const MAX_UPLOAD_SIZE: u64 = 200 * 1024 * 1024;
/// Pieces coalesced into one add-pieces transaction.
pub const DEFAULT_UPLOAD_BATCH_SIZE: usize = 32;

pub(crate) const PARKING_POLL: Duration = Duration::from_secs(2);
pub(crate) const PARKING_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const TX_PROPAGATION_POLL: Duration = Duration::from_secs(1);
pub(crate) const TX_PROPAGATION_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const RECEIPT_POLL: Duration = Duration::from_secs(2);
pub(crate) const RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);
pub(crate) const ADDITION_CONFIRM_POLL: Duration = Duration::from_secs(2);
pub(crate) const ADDITION_CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const CREATION_POLL: Duration = Duration::from_secs(2);
pub(crate) const CREATION_TIMEOUT: Duration = Duration::from_secs(7 * 60);
pub(crate) const COALESCE_WAIT: Duration = Duration::from_secs(15);
pub(crate) const COALESCE_POLL: Duration = Duration::from_millis(200);

/// Context selection knobs. `data_set_id`, `provider_id` and
/// `provider_address` steer resolution; everything unset means smart
/// selection with health probing.
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    pub provider_id: Option<u64>,
    pub provider_address: Option<Address>,
    pub data_set_id: Option<u64>,
    pub with_cdn: bool,
    pub metadata: MetadataMap,
    /// Always create a fresh data set instead of reusing one.
    pub force_create: bool,
    /// Restrict selection to IPNI-indexing providers.
    pub with_ipni: bool,
    /// Allow dev-only provider deployments.
    pub dev: bool,
    pub upload_batch_size: Option<usize>,
    /// Provider ids that must not be selected.
    pub exclude_providers: Vec<u64>,
}

impl StorageOptions {
    /// True iff any option beyond metadata and the CDN flag is set; such
    /// requests never reuse the cached default context set.
    pub(crate) fn has_non_default_selection(&self) -> bool {
        self.provider_id.is_some()
            || self.provider_address.is_some()
            || self.data_set_id.is_some()
            || self.force_create
            || self.upload_batch_size.is_some()
    }
}

/// Hooks observed while a context is resolved or created. Guarded: a
/// panicking callback is logged and ignored.
#[derive(Default)]
pub struct ContextCallbacks {
    pub on_provider_selected: Option<Box<dyn Fn(&ProviderInfo) + Send + Sync>>,
    /// `(data_set_id, existing)`; fires once the data set is known.
    pub on_data_set_resolved: Option<Box<dyn Fn(u64, bool) + Send + Sync>>,
    /// Creation progress: elapsed time since the creation began.
    pub on_creation_progress: Option<Box<dyn Fn(Duration) + Send + Sync>>,
}

/// Per-upload hooks, fired in order: upload complete → piece added →
/// piece confirmed.
#[derive(Default)]
pub struct UploadCallbacks {
    pub on_upload_complete: Option<Box<dyn Fn(PieceCid) + Send + Sync>>,
    pub on_piece_added: Option<Box<dyn Fn(B256) + Send + Sync>>,
    pub on_piece_confirmed: Option<Box<dyn Fn(&[u64]) + Send + Sync>>,
}

/// Per-upload settings: piece metadata, lifecycle hooks and a
/// cancellation token covering the upload-and-park phase. Once the
/// piece is queued for an on-chain addition the batch is not
/// cancellable.
#[derive(Default)]
pub struct UploadOptions {
    pub metadata: MetadataMap,
    pub callbacks: UploadCallbacks,
    pub cancel: tokio_util::sync::CancellationToken,
}

/// Outcome of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub piece_cid: PieceCid,
    pub size: u64,
    pub piece_id: u64,
}

/// Proving-cycle view of one piece.
#[derive(Debug, Clone, PartialEq)]
pub struct PieceStatus {
    pub exists: bool,
    pub piece_id: Option<u64>,
    pub challenge_window_start: Option<u64>,
    pub proving_deadline: Option<u64>,
    pub last_proven: Option<u64>,
    pub in_challenge_window: bool,
    pub is_proof_overdue: bool,
    pub hours_until_challenge_window: f64,
}

/// Estimated storage cost for a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageCosts {
    pub per_epoch: U256,
    pub per_day: U256,
    pub per_month: U256,
}

/// Operator allowance verdict for a planned upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowanceCheck {
    pub sufficient: bool,
    pub message: Option<String>,
}

/// Result of [`StorageManager::preflight_upload`].
#[derive(Debug, Clone, PartialEq)]
pub struct PreflightResult {
    pub estimated_cost: StorageCosts,
    pub allowance_check: AllowanceCheck,
    /// Selection happens at upload time, never during preflight.
    pub selected_provider: Option<ProviderInfo>,
    pub selected_data_set_id: Option<u64>,
}

/// Validate a payload size against the upload bounds.
pub(crate) fn check_upload_size(size: u64) -> Result<()> {
    if size < MIN_UPLOAD_SIZE {
        return Err(Error::TooSmall {
            size,
            min: MIN_UPLOAD_SIZE,
        });
    }
    if size > MAX_UPLOAD_SIZE {
        return Err(Error::TooLarge {
            size,
            max: MAX_UPLOAD_SIZE,
        });
    }
    Ok(())
}
