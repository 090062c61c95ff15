// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Provider discovery over the on-chain service registry.
//!
//! The approved-provider list changes rarely; it is read once per process
//! and memoized. Registry rows for multiple ids are fetched in one
//! multicall by the chain adapter.

use crate::chain::ChainApi;
use crate::error::{Error, Result};
use crate::types::ProviderInfo;
use alloy_primitives::Address;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::trace;

/// Capability key carrying the provider's deployment status.
pub const SERVICE_STATUS_CAPABILITY: &str = "serviceStatus";
/// Capability value marking a dev-only deployment. Inherited from the
/// registry conventions; adjust here if the registry ever renames it.
pub const DEV_STATUS_SENTINEL: &str = "dev";

/// Which providers a caller is willing to use.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderFilter {
    /// Require IPNI piece indexing.
    pub with_ipni: bool,
    /// Allow dev-only deployments.
    pub include_dev: bool,
}

/// True iff the provider advertises itself as a dev-only deployment.
pub fn is_dev_only(provider: &ProviderInfo) -> bool {
    provider
        .pdp
        .as_ref()
        .and_then(|p| p.capabilities.get(SERVICE_STATUS_CAPABILITY))
        .is_some_and(|status| status.as_bytes() == DEV_STATUS_SENTINEL.as_bytes())
}

/// Selection predicate. Providers without a usable PDP product are
/// always excluded; the rest follows the filter flags.
pub fn provider_passes(provider: &ProviderInfo, filter: &ProviderFilter) -> bool {
    let Some(pdp) = &provider.pdp else {
        return false;
    };
    if provider.service_url().is_none() {
        trace!(provider = provider.id, "skipping provider without service URL");
        return false;
    }
    if filter.with_ipni && !pdp.ipni_piece {
        return false;
    }
    if !filter.include_dev && is_dev_only(provider) {
        return false;
    }
    true
}

/// Lookup and filtering of registered providers.
pub struct ProviderResolver {
    chain: Arc<dyn ChainApi>,
    approved: OnceCell<Vec<u64>>,
}

impl ProviderResolver {
    pub fn new(chain: Arc<dyn ChainApi>) -> Self {
        ProviderResolver {
            chain,
            approved: OnceCell::new(),
        }
    }

    /// Ids on the warm-storage approval list, memoized per process.
    pub async fn approved_provider_ids(&self) -> Result<Vec<u64>> {
        self.approved
            .get_or_try_init(|| self.chain.approved_provider_ids())
            .await
            .map(|ids| ids.clone())
    }

    pub async fn provider(&self, id: u64) -> Result<ProviderInfo> {
        self.chain
            .provider(id)
            .await?
            .ok_or_else(|| Error::NoProvidersAvailable(format!("provider {id} is not registered")))
    }

    pub async fn provider_by_address(&self, addr: Address) -> Result<ProviderInfo> {
        let id = self.chain.provider_id_by_address(addr).await?.ok_or_else(|| {
            Error::NoProvidersAvailable(format!("no provider registered at {addr}"))
        })?;
        self.provider(id).await
    }

    pub async fn providers(&self, ids: &[u64]) -> Result<Vec<ProviderInfo>> {
        self.chain.providers(ids).await
    }

    /// All approved providers that pass the filter.
    pub async fn approved_providers(&self, filter: &ProviderFilter) -> Result<Vec<ProviderInfo>> {
        let ids = self.approved_provider_ids().await?;
        let providers = self.chain.providers(&ids).await?;
        Ok(providers
            .into_iter()
            .filter(|p| provider_passes(p, filter))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::test_api::TestChain;
    use crate::types::{MetadataMap, PdpOffering};
    use alloy_primitives::U256;
    use std::sync::atomic::Ordering;

    pub(crate) fn provider(id: u64, url: &str) -> ProviderInfo {
        ProviderInfo {
            id,
            service_provider: Address::repeat_byte(id as u8),
            payee: Address::repeat_byte(id as u8),
            name: format!("provider-{id}"),
            description: String::new(),
            active: true,
            pdp: Some(PdpOffering {
                service_url: url.to_string(),
                min_piece_size: 127,
                max_piece_size: 200 * 1024 * 1024,
                ipni_piece: false,
                storage_price_per_tib_per_month: U256::from(2u64),
                location: String::new(),
                capabilities: MetadataMap::new(),
            }),
        }
    }

    fn dev_provider(id: u64) -> ProviderInfo {
        let mut p = provider(id, "https://dev.example/");
        p.pdp
            .as_mut()
            .unwrap()
            .capabilities
            .insert(SERVICE_STATUS_CAPABILITY.into(), DEV_STATUS_SENTINEL.into());
        p
    }

    #[test]
    fn providers_without_pdp_or_url_are_always_excluded() {
        let filter = ProviderFilter::default();
        let mut no_pdp = provider(1, "https://a.example/");
        no_pdp.pdp = None;
        assert!(!provider_passes(&no_pdp, &filter));

        let no_url = provider(2, "");
        assert!(!provider_passes(&no_url, &filter));

        assert!(provider_passes(&provider(3, "https://b.example/"), &filter));
    }

    #[test]
    fn dev_only_providers_need_an_opt_in() {
        let dev = dev_provider(1);
        assert!(!provider_passes(&dev, &ProviderFilter::default()));
        assert!(provider_passes(
            &dev,
            &ProviderFilter {
                include_dev: true,
                ..Default::default()
            }
        ));
        // a different serviceStatus value is not dev-only
        let mut staging = dev_provider(2);
        staging
            .pdp
            .as_mut()
            .unwrap()
            .capabilities
            .insert(SERVICE_STATUS_CAPABILITY.into(), "staging".into());
        assert!(provider_passes(&staging, &ProviderFilter::default()));
    }

    #[test]
    fn ipni_filter_requires_the_capability() {
        let filter = ProviderFilter {
            with_ipni: true,
            ..Default::default()
        };
        let plain = provider(1, "https://a.example/");
        assert!(!provider_passes(&plain, &filter));

        let mut indexed = provider(2, "https://b.example/");
        indexed.pdp.as_mut().unwrap().ipni_piece = true;
        assert!(provider_passes(&indexed, &filter));
    }

    #[tokio::test]
    async fn approved_ids_are_read_once_per_process() {
        let chain = Arc::new(
            TestChain::new(Address::repeat_byte(0xcc))
                .with_provider(provider(1, "https://a.example/")),
        );
        let resolver = ProviderResolver::new(chain.clone());
        assert_eq!(resolver.approved_provider_ids().await.unwrap(), vec![1]);
        assert_eq!(resolver.approved_provider_ids().await.unwrap(), vec![1]);
        assert_eq!(chain.approved_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn approved_providers_apply_the_filter() {
        let chain = Arc::new(
            TestChain::new(Address::repeat_byte(0xcc))
                .with_provider(provider(1, "https://a.example/"))
                .with_provider(dev_provider(2)),
        );
        let resolver = ProviderResolver::new(chain);
        let visible = resolver
            .approved_providers(&ProviderFilter::default())
            .await
            .unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, 1);
    }
}
