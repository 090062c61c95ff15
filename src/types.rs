// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Shared data model: providers, data sets, rails and metadata.

use crate::error::Error;
use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key → value metadata attached to data sets and pieces on chain.
pub type MetadataMap = BTreeMap<String, String>;

/// Sentinel metadata key marking a data set as CDN-enabled. The value is
/// always the empty string.
pub const WITH_CDN_KEY: &str = "withCDN";

const MAX_METADATA_ENTRIES: usize = 10;
const MAX_METADATA_KEY_BYTES: usize = 32;
const MAX_METADATA_VALUE_BYTES: usize = 128;

/// Validate caller-supplied metadata before it is sent anywhere.
pub fn validate_metadata(metadata: &MetadataMap) -> Result<(), Error> {
    if metadata.len() > MAX_METADATA_ENTRIES {
        return Err(Error::MalformedMetadata(format!(
            "{} entries exceed the maximum of {MAX_METADATA_ENTRIES}",
            metadata.len()
        )));
    }
    for (key, value) in metadata {
        if key.is_empty() || key.len() > MAX_METADATA_KEY_BYTES {
            return Err(Error::MalformedMetadata(format!(
                "key {key:?} must be 1..={MAX_METADATA_KEY_BYTES} bytes"
            )));
        }
        if value.len() > MAX_METADATA_VALUE_BYTES {
            return Err(Error::MalformedMetadata(format!(
                "value for {key:?} exceeds {MAX_METADATA_VALUE_BYTES} bytes"
            )));
        }
    }
    Ok(())
}

/// True iff every entry of `requested` appears in `actual` with the same
/// value. Extra entries in `actual` are allowed.
pub fn metadata_is_subset(requested: &MetadataMap, actual: &MetadataMap) -> bool {
    requested
        .iter()
        .all(|(k, v)| actual.get(k).is_some_and(|actual_v| actual_v == v))
}

/// A provider registry entry. Only the PDP product is used by this client;
/// providers without one (or with an empty service URL) are unusable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: u64,
    pub service_provider: Address,
    pub payee: Address,
    pub name: String,
    pub description: String,
    pub active: bool,
    pub pdp: Option<PdpOffering>,
}

impl ProviderInfo {
    /// A provider is usable iff it advertises a PDP product with a
    /// non-empty service URL.
    pub fn service_url(&self) -> Option<&str> {
        self.pdp
            .as_ref()
            .map(|p| p.service_url.as_str())
            .filter(|url| !url.is_empty())
    }
}

/// The PDP product data attached to a provider registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdpOffering {
    pub service_url: String,
    pub min_piece_size: u64,
    pub max_piece_size: u64,
    pub ipni_piece: bool,
    pub storage_price_per_tib_per_month: U256,
    pub location: String,
    /// Opaque capability bag; the `serviceStatus` key marks dev-only
    /// deployments.
    pub capabilities: MetadataMap,
}

/// On-chain data set owned by a client ↔ provider pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSetInfo {
    pub pdp_verifier_data_set_id: u64,
    pub client_data_set_id: u64,
    pub provider_id: u64,
    pub payer: Address,
    pub payee: Address,
    pub pdp_rail_id: u64,
    pub cache_miss_rail_id: u64,
    pub cdn_rail_id: u64,
    /// 0 means the payment rail is still active.
    pub pdp_end_epoch: u64,
    pub current_piece_count: u64,
    pub next_piece_id: u64,
    pub is_live: bool,
    pub is_managed: bool,
    pub metadata: MetadataMap,
}

impl DataSetInfo {
    pub fn with_cdn(&self) -> bool {
        self.cdn_rail_id > 0
    }

    /// Usable target for new uploads: live, managed by the warm-storage
    /// service, and not scheduled for termination.
    pub fn is_usable(&self) -> bool {
        self.is_live && self.is_managed && self.pdp_end_epoch == 0
    }

    /// Compatibility of this data set with a request: every requested
    /// metadata entry must match and the CDN flag must agree with the
    /// observed rails.
    pub fn is_compatible(&self, requested: &MetadataMap, with_cdn: bool) -> bool {
        self.with_cdn() == with_cdn && metadata_is_subset(requested, &self.metadata)
    }
}

/// Sort key for choosing among compatible data sets: prefer sets that
/// already hold pieces, then the lowest id.
pub fn preferred_data_set_order(a: &DataSetInfo, b: &DataSetInfo) -> std::cmp::Ordering {
    (b.current_piece_count > 0)
        .cmp(&(a.current_piece_count > 0))
        .then(a.pdp_verifier_data_set_id.cmp(&b.pdp_verifier_data_set_id))
}

/// Full rail record as read from the payments contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RailView {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub operator: Address,
    pub validator: Address,
    pub payment_rate: U256,
    pub lockup_period: u64,
    pub lockup_fixed: U256,
    pub settled_up_to: u64,
    /// > 0 once the rail has been terminated.
    pub end_epoch: u64,
    pub commission_rate_bps: u64,
    pub service_fee_recipient: Address,
}

impl RailView {
    pub fn is_terminated(&self) -> bool {
        self.end_epoch > 0
    }
}

/// Summary entry from the payer/payee rail listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RailInfo {
    pub rail_id: u64,
    pub is_terminated: bool,
    pub end_epoch: u64,
}

/// Run a caller-supplied callback, containing any panic it raises.
/// Callbacks are untrusted and must never poison the pipeline.
pub(crate) fn run_callback(label: &'static str, f: impl FnOnce()) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        tracing::warn!("callback {label} panicked; continuing");
    }
}
