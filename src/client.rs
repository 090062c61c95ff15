// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Public facade: builds the dependency graph from a configuration
//! object and owns every long-lived service.
//!
//! The graph is root-owned: the facade owns the chain adapter, the
//! payments service and the storage manager; contexts and retrievers
//! hold non-owning handles, never back-pointers.

use crate::chain::{ChainAdapter, ChainApi};
use crate::error::{Error, Result};
use crate::network::{AddressBook, Network};
use crate::payments::PaymentsService;
use crate::pdp::{HttpPdpConnect, PdpConnect};
use crate::piece::PieceCid;
use crate::registry::ProviderResolver;
use crate::retriever::{CdnRetriever, ChainRetriever, PieceRetriever, SubgraphRetriever};
use crate::session::SessionKeyHelper;
use crate::stats::StatsClient;
use crate::storage::{DownloadOptions, StorageManager};
use crate::subgraph::{SubgraphApi, SubgraphService};
use alloy_network::EthereumWallet;
use alloy_primitives::Address;
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_signer_local::PrivateKeySigner;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const HTTP_TIMEOUT: Duration = Duration::from_secs(90);

/// Facade configuration. Exactly one signing source must be provided:
/// a raw private key plus RPC URL, a local signer plus RPC URL, or a
/// pre-built (already signer-wrapped) provider.
#[derive(Default)]
pub struct SynapseConfig {
    pub private_key: Option<String>,
    pub signer: Option<PrivateKeySigner>,
    pub rpc_url: Option<Url>,
    pub provider: Option<DynProvider>,
    /// Default CDN preference for downloads and new contexts.
    pub with_cdn: bool,
    /// Enables the subgraph retriever stage when set.
    pub subgraph_endpoint: Option<Url>,
    /// Read `pendingTransactionCount` before every write and pin the
    /// nonce explicitly instead of trusting the signer wrapper.
    pub disable_nonce_manager: bool,
    /// Contract address overrides; defaults come from the network.
    pub addresses: Option<AddressBook>,
}

impl SynapseConfig {
    pub fn from_private_key(private_key: impl Into<String>, rpc_url: Url) -> Self {
        SynapseConfig {
            private_key: Some(private_key.into()),
            rpc_url: Some(rpc_url),
            ..Default::default()
        }
    }
}

enum SignerSource {
    PrivateKey,
    Signer,
    Provider,
}

fn signer_source(config: &SynapseConfig) -> Result<SignerSource> {
    let sources = [
        config.private_key.is_some(),
        config.signer.is_some(),
        config.provider.is_some(),
    ];
    match sources.iter().filter(|set| **set).count() {
        0 => Err(Error::OptionsConflict(
            "one of private_key, signer or provider is required".into(),
        )),
        1 => {
            if (config.private_key.is_some() || config.signer.is_some())
                && config.rpc_url.is_none()
            {
                return Err(Error::OptionsConflict(
                    "private_key and signer require an rpc_url".into(),
                ));
            }
            Ok(if config.private_key.is_some() {
                SignerSource::PrivateKey
            } else if config.signer.is_some() {
                SignerSource::Signer
            } else {
                SignerSource::Provider
            })
        }
        _ => Err(Error::OptionsConflict(
            "private_key, signer and provider are mutually exclusive".into(),
        )),
    }
}

/// Entry point to the warm-storage service.
pub struct Synapse {
    network: Network,
    address: Address,
    adapter: ChainAdapter,
    payments: Arc<PaymentsService>,
    storage: StorageManager,
    stats: StatsClient,
}

impl Synapse {
    pub async fn new(mut config: SynapseConfig) -> Result<Self> {
        let source = signer_source(&config)?;

        let (provider, signer): (DynProvider, Option<PrivateKeySigner>) = match source {
            SignerSource::PrivateKey => {
                let key = config.private_key.take().expect("checked above");
                let signer: PrivateKeySigner = key
                    .parse()
                    .map_err(|e| Error::InvalidAddress(format!("private key: {e}")))?;
                let rpc_url = config.rpc_url.take().expect("checked above");
                let provider = ProviderBuilder::new()
                    .wallet(EthereumWallet::from(signer.clone()))
                    .connect_http(rpc_url)
                    .erased();
                (provider, Some(signer))
            }
            SignerSource::Signer => {
                let signer = config.signer.take().expect("checked above");
                let rpc_url = config.rpc_url.take().expect("checked above");
                let provider = ProviderBuilder::new()
                    .wallet(EthereumWallet::from(signer.clone()))
                    .connect_http(rpc_url)
                    .erased();
                (provider, Some(signer))
            }
            SignerSource::Provider => (config.provider.take().expect("checked above"), None),
        };

        let address = match &signer {
            Some(signer) => signer.address(),
            None => *provider
                .get_accounts()
                .await
                .map_err(|e| Error::chain("get_accounts", e))?
                .first()
                .ok_or_else(|| {
                    Error::InvalidAddress("the provider exposes no signing account".into())
                })?,
        };

        let chain_id = provider
            .get_chain_id()
            .await
            .map_err(|e| Error::chain("get_chain_id", e))?;
        let network = Network::from_chain_id(chain_id)?;
        let addresses = config.addresses.unwrap_or_else(|| network.addresses());

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::MalformedServerResponse(e.to_string()))?;

        let adapter = ChainAdapter::new(
            provider,
            address,
            addresses,
            config.disable_nonce_manager,
        );
        let chain: Arc<dyn ChainApi> = Arc::new(adapter.clone());
        let resolver = Arc::new(ProviderResolver::new(chain.clone()));
        let connect: Arc<dyn PdpConnect> = Arc::new(HttpPdpConnect::new(http.clone()));

        let payments = Arc::new(PaymentsService::new(
            adapter.clone(),
            signer.map(|s| Arc::new(s) as _),
            chain_id,
        ));

        // retriever chain: CDN wraps (subgraph wraps) chain discovery
        let chain_retriever: Arc<dyn PieceRetriever> = Arc::new(ChainRetriever::new(
            chain.clone(),
            resolver.clone(),
            connect.clone(),
        ));
        let discovery: Arc<dyn PieceRetriever> = match &config.subgraph_endpoint {
            Some(endpoint) => {
                let subgraph: Arc<dyn SubgraphApi> =
                    Arc::new(SubgraphService::new(http.clone(), endpoint.clone()));
                Arc::new(SubgraphRetriever::new(
                    subgraph,
                    connect.clone(),
                    chain_retriever,
                ))
            }
            None => chain_retriever,
        };
        let retriever: Arc<dyn PieceRetriever> =
            Arc::new(CdnRetriever::new(http.clone(), network, discovery));

        let storage = StorageManager::new(
            chain,
            resolver,
            connect,
            retriever,
            payments.clone(),
            addresses.warm_storage,
            config.with_cdn,
        );

        Ok(Synapse {
            network,
            address,
            adapter,
            payments,
            storage,
            stats: StatsClient::new(http, network),
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Address paying for storage and rails.
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn payments(&self) -> &PaymentsService {
        &self.payments
    }

    pub fn stats(&self) -> &StatsClient {
        &self.stats
    }

    /// Helper bound to the on-chain session-key registry.
    pub async fn session_keys(&self, session_key: Address) -> Result<SessionKeyHelper> {
        let registry = self.adapter.session_key_registry().await?;
        Ok(SessionKeyHelper::new(
            self.adapter.clone(),
            registry,
            session_key,
        ))
    }

    /// Parse and download a piece by CID string.
    pub async fn download(&self, piece_cid: &str, options: &DownloadOptions) -> Result<Vec<u8>> {
        let piece: PieceCid = piece_cid.parse()?;
        self.storage.download(piece, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_signer_source_is_required() {
        assert!(matches!(
            signer_source(&SynapseConfig::default()),
            Err(Error::OptionsConflict(_))
        ));

        let both = SynapseConfig {
            private_key: Some("0x01".into()),
            signer: Some(PrivateKeySigner::random()),
            rpc_url: Some(Url::parse("http://localhost:1234").unwrap()),
            ..Default::default()
        };
        assert!(matches!(
            signer_source(&both),
            Err(Error::OptionsConflict(_))
        ));

        let key_only = SynapseConfig {
            private_key: Some("0x01".into()),
            ..Default::default()
        };
        assert!(matches!(
            signer_source(&key_only),
            Err(Error::OptionsConflict(_))
        ));

        let valid = SynapseConfig::from_private_key(
            "0x0101",
            Url::parse("http://localhost:1234").unwrap(),
        );
        assert!(matches!(
            signer_source(&valid),
            Ok(SignerSource::PrivateKey)
        ));
    }
}
