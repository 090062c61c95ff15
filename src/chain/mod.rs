// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Typed read/write access to the four on-chain contracts.
//!
//! Reads that can be coalesced (registry lookups, token metadata probes,
//! session-key expiries) go through the Multicall3 aggregator; writes go
//! through the signer-wrapped provider. When the nonce manager is
//! disabled the adapter reads the pending transaction count immediately
//! before each write and pins the nonce explicitly.

pub mod contracts;
#[cfg(test)]
pub(crate) mod test_api;

use crate::error::{Error, Result};
use crate::network::AddressBook;
use crate::types::{DataSetInfo, MetadataMap, ProviderInfo, PdpOffering, RailInfo, RailView};
use alloy_primitives::{Address, B256, U256};
use alloy_provider::{DynProvider, Provider};
use async_trait::async_trait;
use contracts::{Payments, PdpVerifier, ServiceProviderRegistry, WarmStorage};
use std::time::Duration;

/// Proving-period parameters read from the warm-storage service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvingParams {
    pub max_proving_period: u64,
    pub challenge_window: u64,
}

/// Current service price quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServicePrice {
    pub per_tib_per_month: U256,
    pub per_tib_per_month_with_cdn: U256,
    pub token: Address,
    pub epochs_per_month: U256,
}

/// Chain operations consumed by the resolver, the retrievers and the
/// storage orchestration. `ChainAdapter` is the production
/// implementation; tests substitute their own.
#[async_trait]
pub trait ChainApi: Send + Sync {
    /// Address of the signing client.
    fn payer(&self) -> Address;

    /// Current chain epoch (block height).
    async fn current_epoch(&self) -> Result<u64>;

    async fn data_set(&self, id: u64) -> Result<Option<DataSetInfo>>;
    async fn client_data_sets(&self, payer: Address) -> Result<Vec<DataSetInfo>>;
    async fn next_client_data_set_id(&self, payer: Address) -> Result<u64>;

    async fn approved_provider_ids(&self) -> Result<Vec<u64>>;
    async fn provider(&self, id: u64) -> Result<Option<ProviderInfo>>;
    async fn providers(&self, ids: &[u64]) -> Result<Vec<ProviderInfo>>;
    async fn provider_id_by_address(&self, addr: Address) -> Result<Option<u64>>;

    async fn proving_params(&self) -> Result<ProvingParams>;
    async fn storage_price(&self) -> Result<ServicePrice>;

    /// Whether the transaction is known to the chain (possibly pending).
    async fn tx_seen(&self, hash: B256) -> Result<bool>;
    /// `None` until a receipt exists, then the success flag.
    async fn tx_receipt_status(&self, hash: B256) -> Result<Option<bool>>;
}

/// Production chain adapter over an alloy provider.
#[derive(Clone)]
pub struct ChainAdapter {
    provider: DynProvider,
    payer: Address,
    addresses: AddressBook,
    explicit_nonce: bool,
}

impl ChainAdapter {
    pub fn new(
        provider: DynProvider,
        payer: Address,
        addresses: AddressBook,
        explicit_nonce: bool,
    ) -> Self {
        ChainAdapter {
            provider,
            payer,
            addresses,
            explicit_nonce,
        }
    }

    pub(crate) fn provider(&self) -> &DynProvider {
        &self.provider
    }

    pub(crate) fn addresses(&self) -> &AddressBook {
        &self.addresses
    }

    /// Explicit nonce for the next write, or `None` when the signer
    /// wrapper manages nonces. Must be called immediately before the
    /// write; pipelining writes in explicit mode is not supported.
    pub(crate) async fn next_nonce(&self) -> Result<Option<u64>> {
        if !self.explicit_nonce {
            return Ok(None);
        }
        let count = self
            .provider
            .get_transaction_count(self.payer)
            .pending()
            .await
            .map_err(|e| Error::chain("pending_transaction_count", e))?;
        Ok(Some(count))
    }

    pub(crate) fn warm_storage(&self) -> WarmStorage::WarmStorageInstance<DynProvider> {
        WarmStorage::new(self.addresses.warm_storage, self.provider.clone())
    }

    pub(crate) fn registry(
        &self,
    ) -> ServiceProviderRegistry::ServiceProviderRegistryInstance<DynProvider> {
        ServiceProviderRegistry::new(self.addresses.service_registry, self.provider.clone())
    }

    pub(crate) fn pdp_verifier(&self) -> PdpVerifier::PdpVerifierInstance<DynProvider> {
        PdpVerifier::new(self.addresses.pdp_verifier, self.provider.clone())
    }

    /// Address of the session-key registry, published by the warm-storage
    /// service.
    pub async fn session_key_registry(&self) -> Result<Address> {
        self.warm_storage()
            .sessionKeyRegistry()
            .call()
            .await
            .map_err(|e| map_call_error("sessionKeyRegistry", e))
    }

    /// Paginated listing of active pieces in a data set, straight from
    /// the PDP verifier.
    pub async fn active_pieces(
        &self,
        data_set_id: u64,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<Vec<u8>>, Vec<u64>, bool)> {
        let out = self
            .pdp_verifier()
            .getActivePieces(U256::from(data_set_id), U256::from(offset), U256::from(limit))
            .call()
            .await
            .map_err(|e| map_call_error("getActivePieces", e))?;
        let pieces = out.pieces.into_iter().map(|p| p.data.to_vec()).collect();
        let ids = out.pieceIds.into_iter().map(to_u64).collect();
        Ok((pieces, ids, out.hasMore))
    }
}

#[async_trait]
impl ChainApi for ChainAdapter {
    fn payer(&self) -> Address {
        self.payer
    }

    async fn current_epoch(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| Error::chain("block_number", e))
    }

    async fn data_set(&self, id: u64) -> Result<Option<DataSetInfo>> {
        match self.warm_storage().getDataSet(U256::from(id)).call().await {
            Ok(info) => {
                let info = convert_data_set(info);
                // the contract returns a zeroed record for unknown ids
                if info.pdp_verifier_data_set_id == 0 && !info.is_live {
                    Ok(None)
                } else {
                    Ok(Some(info))
                }
            }
            Err(e) => Err(map_call_error("getDataSet", e)),
        }
    }

    async fn client_data_sets(&self, payer: Address) -> Result<Vec<DataSetInfo>> {
        let sets = self
            .warm_storage()
            .getClientDataSets(payer)
            .call()
            .await
            .map_err(|e| map_call_error("getClientDataSets", e))?;
        Ok(sets.into_iter().map(convert_data_set).collect())
    }

    async fn next_client_data_set_id(&self, payer: Address) -> Result<u64> {
        self.warm_storage()
            .clientDataSetIDs(payer)
            .call()
            .await
            .map(to_u64)
            .map_err(|e| map_call_error("clientDataSetIDs", e))
    }

    async fn approved_provider_ids(&self) -> Result<Vec<u64>> {
        let ids = self
            .warm_storage()
            .getApprovedProviders()
            .call()
            .await
            .map_err(|e| map_call_error("getApprovedProviders", e))?;
        Ok(ids.into_iter().map(to_u64).collect())
    }

    async fn provider(&self, id: u64) -> Result<Option<ProviderInfo>> {
        Ok(self.providers(&[id]).await?.into_iter().next())
    }

    async fn providers(&self, ids: &[u64]) -> Result<Vec<ProviderInfo>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let registry = self.registry();

        // coalesce the two reads per id through the aggregator when more
        // than one call would otherwise go out
        let (records, services) = if ids.len() >= 2 {
            let mut record_calls = self.provider.multicall().dynamic();
            for id in ids {
                record_calls = record_calls.add_dynamic(registry.getProvider(U256::from(*id)));
            }
            let mut service_calls = self.provider.multicall().dynamic();
            for id in ids {
                service_calls = service_calls.add_dynamic(registry.getPDPService(U256::from(*id)));
            }
            let records = record_calls
                .aggregate3()
                .await
                .map_err(|e| Error::chain("getProvider", e))?;
            let services = service_calls
                .aggregate3()
                .await
                .map_err(|e| Error::chain("getPDPService", e))?;
            (
                records.into_iter().map(|r| r.ok()).collect::<Vec<_>>(),
                services.into_iter().map(|r| r.ok()).collect::<Vec<_>>(),
            )
        } else {
            let record = registry.getProvider(U256::from(ids[0])).call().await.ok();
            let service = registry.getPDPService(U256::from(ids[0])).call().await.ok();
            (vec![record], vec![service])
        };

        let mut providers = Vec::with_capacity(ids.len());
        for ((id, record), service) in ids.iter().zip(records).zip(services) {
            let Some(record) = record else { continue };
            // a provider with no registered PDP product is unusable and skipped
            let pdp = service.map(|s| PdpOffering {
                service_url: s.offering.serviceURL,
                min_piece_size: to_u64(s.offering.minPieceSizeInBytes),
                max_piece_size: to_u64(s.offering.maxPieceSizeInBytes),
                ipni_piece: s.offering.ipniPiece,
                storage_price_per_tib_per_month: s.offering.storagePricePerTibPerMonth,
                location: s.offering.location,
                capabilities: s
                    .capabilityKeys
                    .into_iter()
                    .zip(s.capabilityValues)
                    .collect(),
            });
            providers.push(ProviderInfo {
                id: *id,
                service_provider: record.serviceProvider,
                payee: record.payee,
                name: record.name,
                description: record.description,
                active: record.active,
                pdp,
            });
        }
        Ok(providers)
    }

    async fn provider_id_by_address(&self, addr: Address) -> Result<Option<u64>> {
        let id = self
            .registry()
            .getProviderIdByAddress(addr)
            .call()
            .await
            .map(to_u64)
            .map_err(|e| map_call_error("getProviderIdByAddress", e))?;
        Ok((id != 0).then_some(id))
    }

    async fn proving_params(&self) -> Result<ProvingParams> {
        let warm = self.warm_storage();
        let max_proving_period = warm
            .getMaxProvingPeriod()
            .call()
            .await
            .map_err(|e| map_call_error("getMaxProvingPeriod", e))?;
        let challenge_window = warm
            .challengeWindow()
            .call()
            .await
            .map(to_u64)
            .map_err(|e| map_call_error("challengeWindow", e))?;
        Ok(ProvingParams {
            max_proving_period,
            challenge_window,
        })
    }

    async fn storage_price(&self) -> Result<ServicePrice> {
        let quote = self
            .warm_storage()
            .getServicePrice()
            .call()
            .await
            .map_err(|e| map_call_error("getServicePrice", e))?;
        Ok(ServicePrice {
            per_tib_per_month: quote.pricePerTiBPerMonthNoCDN,
            per_tib_per_month_with_cdn: quote.pricePerTiBPerMonthWithCDN,
            token: quote.tokenAddress,
            epochs_per_month: quote.epochsPerMonth,
        })
    }

    async fn tx_seen(&self, hash: B256) -> Result<bool> {
        let tx = self
            .provider
            .get_transaction_by_hash(hash)
            .await
            .map_err(|e| Error::chain("get_transaction_by_hash", e))?;
        Ok(tx.is_some())
    }

    async fn tx_receipt_status(&self, hash: B256) -> Result<Option<bool>> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| Error::chain("get_transaction_receipt", e))?;
        Ok(receipt.map(|r| r.status()))
    }
}

/// Two-phase transaction wait shared by orchestration code: first the
/// transaction must become visible on chain, then its receipt must report
/// success.
pub async fn wait_tx_success(
    chain: &dyn ChainApi,
    hash: B256,
    propagation_timeout: Duration,
    propagation_interval: Duration,
    receipt_timeout: Duration,
    receipt_interval: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + propagation_timeout;
    loop {
        if chain.tx_seen(hash).await? {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::TxNotPropagated(hash));
        }
        tokio::time::sleep(propagation_interval).await;
    }

    let deadline = tokio::time::Instant::now() + receipt_timeout;
    loop {
        match chain.tx_receipt_status(hash).await? {
            Some(true) => return Ok(()),
            Some(false) => return Err(Error::TxReverted(hash)),
            None => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(Error::TxNotPropagated(hash));
                }
                tokio::time::sleep(receipt_interval).await;
            }
        }
    }
}

pub(crate) fn convert_data_set(info: WarmStorage::DataSetInfoView) -> DataSetInfo {
    let metadata: MetadataMap = info
        .metadataKeys
        .into_iter()
        .zip(info.metadataValues)
        .collect();
    DataSetInfo {
        pdp_verifier_data_set_id: to_u64(info.pdpVerifierDataSetId),
        client_data_set_id: to_u64(info.clientDataSetId),
        provider_id: to_u64(info.providerId),
        payer: info.payer,
        payee: info.payee,
        pdp_rail_id: to_u64(info.pdpRailId),
        cache_miss_rail_id: to_u64(info.cacheMissRailId),
        cdn_rail_id: to_u64(info.cdnRailId),
        pdp_end_epoch: to_u64(info.pdpEndEpoch),
        current_piece_count: to_u64(info.currentPieceCount),
        next_piece_id: to_u64(info.nextPieceId),
        is_live: info.isLive,
        is_managed: info.isManaged,
        metadata,
    }
}

pub(crate) fn convert_rail(rail: Payments::RailView) -> RailView {
    RailView {
        token: rail.token,
        from: rail.from,
        to: rail.to,
        operator: rail.operator,
        validator: rail.validator,
        payment_rate: rail.paymentRate,
        lockup_period: to_u64(rail.lockupPeriod),
        lockup_fixed: rail.lockupFixed,
        settled_up_to: to_u64(rail.settledUpTo),
        end_epoch: to_u64(rail.endEpoch),
        commission_rate_bps: to_u64(rail.commissionRateBps),
        service_fee_recipient: rail.serviceFeeRecipient,
    }
}

pub(crate) fn convert_rail_info(info: Payments::RailInfo) -> RailInfo {
    RailInfo {
        rail_id: to_u64(info.railId),
        is_terminated: info.isTerminated,
        end_epoch: to_u64(info.endEpoch),
    }
}

/// Saturating narrowing for ids and epochs; the chain never legitimately
/// exceeds u64 for these.
pub(crate) fn to_u64(value: U256) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// Map a contract call failure, surfacing known named reverts as typed
/// error kinds and everything else as `ChainCallFailed`.
pub(crate) fn map_call_error(op: &'static str, err: alloy_contract::Error) -> Error {
    if let Some(data) = err.as_revert_data() {
        if let Some(mapped) = decode_payments_revert(&data) {
            return mapped;
        }
    }
    Error::chain(op, err)
}

/// Best-effort decoding of the payments contract's named errors.
pub(crate) fn decode_payments_revert(data: &[u8]) -> Option<Error> {
    use alloy_sol_types::SolInterface;
    match Payments::PaymentsErrors::abi_decode(data).ok()? {
        Payments::PaymentsErrors::RailInactiveOrSettled(e) => {
            Some(Error::RailNotFound(to_u64(e.railId)))
        }
        Payments::PaymentsErrors::CannotSettleFutureEpochs(e) => Some(Error::FutureEpochRejected {
            rail_id: to_u64(e.railId),
            until: to_u64(e.untilEpoch),
            current: to_u64(e.currentEpoch),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_sol_types::SolError;

    #[test]
    fn known_reverts_decode_to_typed_errors() {
        let data = Payments::CannotSettleFutureEpochs {
            railId: U256::from(456),
            untilEpoch: U256::from(2_000_100),
            currentEpoch: U256::from(2_000_000),
        }
        .abi_encode();
        match decode_payments_revert(&data) {
            Some(Error::FutureEpochRejected {
                rail_id: 456,
                until: 2_000_100,
                current: 2_000_000,
            }) => {}
            other => panic!("unexpected mapping: {other:?}"),
        }

        let data = Payments::RailInactiveOrSettled {
            railId: U256::from(9),
        }
        .abi_encode();
        assert!(matches!(
            decode_payments_revert(&data),
            Some(Error::RailNotFound(9))
        ));
    }

    #[test]
    fn unknown_revert_data_is_not_decoded() {
        assert!(decode_payments_revert(&[0xde, 0xad, 0xbe, 0xef]).is_none());
    }

    #[test]
    fn data_set_conversion_zips_metadata() {
        let view = WarmStorage::DataSetInfoView {
            pdpVerifierDataSetId: U256::from(12),
            clientDataSetId: U256::from(3),
            providerId: U256::from(7),
            payer: Address::repeat_byte(1),
            payee: Address::repeat_byte(2),
            pdpRailId: U256::from(100),
            cacheMissRailId: U256::ZERO,
            cdnRailId: U256::from(101),
            pdpEndEpoch: U256::ZERO,
            currentPieceCount: U256::from(5),
            nextPieceId: U256::from(5),
            isLive: true,
            isManaged: true,
            metadataKeys: vec!["withCDN".into(), "app".into()],
            metadataValues: vec![String::new(), "demo".into()],
        };
        let info = convert_data_set(view);
        assert!(info.with_cdn());
        assert_eq!(info.metadata.get("app").unwrap(), "demo");
        assert!(info.is_usable());
    }
}
