// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Provider and data-set resolution for new storage contexts.
//!
//! ```text
//! (dataSetId && !forceCreate)  → by_data_set_id
//! (providerId)                 → by_provider_id
//! (providerAddress)            → by_provider_address
//! otherwise                    → smart_select
//! ```

use super::StorageOptions;
use crate::chain::ChainApi;
use crate::error::{Error, Result};
use crate::pdp::PdpConnect;
use crate::registry::{ProviderFilter, ProviderResolver, provider_passes};
use crate::types::{DataSetInfo, MetadataMap, ProviderInfo, preferred_data_set_order};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};
use url::Url;

/// Ping attempts per provider before the selection generator moves on.
const PING_ATTEMPTS: usize = 2;

/// Outcome of resolution: the provider to talk to and, when one was
/// found, the data set to append to.
#[derive(Debug)]
pub(crate) struct Resolution {
    pub provider: ProviderInfo,
    /// `None` means a fresh data set is created with the first batch.
    pub data_set_id: Option<u64>,
    pub existing: bool,
    /// Metadata of the resolved data set (the requested metadata when a
    /// set is yet to be created).
    pub data_set_metadata: MetadataMap,
}

pub(crate) async fn resolve(
    chain: &Arc<dyn ChainApi>,
    resolver: &ProviderResolver,
    connect: &Arc<dyn PdpConnect>,
    options: &StorageOptions,
) -> Result<Resolution> {
    if let Some(id) = options.data_set_id {
        if !options.force_create {
            return by_data_set_id(chain, resolver, id, options).await;
        }
    }
    if let Some(provider_id) = options.provider_id {
        return by_provider_id(chain, resolver, provider_id, options).await;
    }
    if let Some(addr) = options.provider_address {
        let id = chain
            .provider_id_by_address(addr)
            .await?
            .ok_or_else(|| Error::NoProvidersAvailable(format!("no provider at {addr}")))?;
        return by_provider_id(chain, resolver, id, options).await;
    }
    smart_select_resolution(chain, resolver, connect, options).await
}

async fn by_data_set_id(
    chain: &Arc<dyn ChainApi>,
    resolver: &ProviderResolver,
    id: u64,
    options: &StorageOptions,
) -> Result<Resolution> {
    let data_set = chain
        .data_set(id)
        .await?
        .ok_or(Error::DataSetNotFound(id))?;
    if data_set.payer != chain.payer() {
        return Err(Error::DataSetNotOwnedByClient {
            id,
            owner: data_set.payer,
        });
    }
    if let Some(provider_id) = options.provider_id {
        if provider_id != data_set.provider_id {
            return Err(Error::OptionsConflict(format!(
                "data set {id} belongs to provider {}, not {provider_id}",
                data_set.provider_id
            )));
        }
    }
    if data_set.with_cdn() != options.with_cdn {
        return Err(Error::DataSetCdnMismatch {
            id,
            actual: data_set.with_cdn(),
        });
    }
    let provider = resolver.provider(data_set.provider_id).await?;
    if let Some(addr) = options.provider_address {
        if addr != provider.service_provider {
            return Err(Error::OptionsConflict(format!(
                "data set {id} is served by {}, not {addr}",
                provider.service_provider
            )));
        }
    }
    Ok(Resolution {
        provider,
        data_set_id: Some(id),
        existing: true,
        data_set_metadata: data_set.metadata,
    })
}

async fn by_provider_id(
    chain: &Arc<dyn ChainApi>,
    resolver: &ProviderResolver,
    provider_id: u64,
    options: &StorageOptions,
) -> Result<Resolution> {
    let provider = resolver.provider(provider_id).await?;
    if provider.service_url().is_none() {
        return Err(Error::NoProvidersAvailable(format!(
            "provider {provider_id} has no PDP service URL"
        )));
    }
    if options.force_create {
        return Ok(Resolution {
            provider,
            data_set_id: None,
            existing: false,
            data_set_metadata: options.metadata.clone(),
        });
    }
    let candidates = usable_sets(chain, options).await?;
    let best = candidates
        .into_iter()
        .find(|set| set.provider_id == provider_id);
    Ok(match best {
        Some(set) => Resolution {
            provider,
            data_set_id: Some(set.pdp_verifier_data_set_id),
            existing: true,
            data_set_metadata: set.metadata,
        },
        None => Resolution {
            provider,
            data_set_id: None,
            existing: false,
            data_set_metadata: options.metadata.clone(),
        },
    })
}

/// The client's data sets that could absorb this request, best first.
async fn usable_sets(
    chain: &Arc<dyn ChainApi>,
    options: &StorageOptions,
) -> Result<Vec<DataSetInfo>> {
    let mut sets: Vec<_> = chain
        .client_data_sets(chain.payer())
        .await?
        .into_iter()
        .filter(|set| {
            set.is_usable()
                && set.is_compatible(&options.metadata, options.with_cdn)
                && !options.exclude_providers.contains(&set.provider_id)
        })
        .collect();
    sets.sort_by(preferred_data_set_order);
    Ok(sets)
}

async fn smart_select_resolution(
    chain: &Arc<dyn ChainApi>,
    resolver: &ProviderResolver,
    connect: &Arc<dyn PdpConnect>,
    options: &StorageOptions,
) -> Result<Resolution> {
    let filter = ProviderFilter {
        with_ipni: options.with_ipni,
        include_dev: options.dev,
    };

    let mut tried = HashSet::new();

    // first preference: providers already holding a compatible data set
    if !options.force_create {
        for set in usable_sets(chain, options).await? {
            if !tried.insert(set.provider_id) {
                continue;
            }
            let Some(provider) = chain.provider(set.provider_id).await? else {
                continue;
            };
            if !provider_passes(&provider, &filter) {
                continue;
            }
            if ping_provider(connect, &provider).await {
                return Ok(Resolution {
                    provider,
                    data_set_id: Some(set.pdp_verifier_data_set_id),
                    existing: true,
                    data_set_metadata: set.metadata,
                });
            }
            debug!(provider = set.provider_id, "provider with existing data set unreachable");
        }
    }

    // fall back to the approved pool in random order
    let mut pool: Vec<_> = resolver
        .approved_providers(&filter)
        .await?
        .into_iter()
        .filter(|p| !tried.contains(&p.id) && !options.exclude_providers.contains(&p.id))
        .collect();
    pool.shuffle(&mut rand::thread_rng());

    for provider in pool {
        if ping_provider(connect, &provider).await {
            return Ok(Resolution {
                provider,
                data_set_id: None,
                existing: false,
                data_set_metadata: options.metadata.clone(),
            });
        }
    }
    Err(Error::NoHealthyProvider)
}

/// Public entry point used by the manager when it needs a provider
/// without building a whole context.
pub async fn smart_select(
    chain: &Arc<dyn ChainApi>,
    resolver: &ProviderResolver,
    connect: &Arc<dyn PdpConnect>,
    options: &StorageOptions,
) -> Result<ProviderInfo> {
    smart_select_resolution(chain, resolver, connect, options)
        .await
        .map(|r| r.provider)
}

async fn ping_provider(connect: &Arc<dyn PdpConnect>, provider: &ProviderInfo) -> bool {
    let Some(url) = provider.service_url() else {
        return false;
    };
    let Ok(url) = Url::parse(url) else {
        trace!(provider = provider.id, "unparsable service URL");
        return false;
    };
    let client = connect.connect(url);
    for attempt in 0..PING_ATTEMPTS {
        match client.ping().await {
            Ok(()) => return true,
            Err(e) => trace!(provider = provider.id, attempt, "ping failed: {e}"),
        }
    }
    false
}
