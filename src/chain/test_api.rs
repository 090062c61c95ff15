// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-memory [`ChainApi`] used by unit tests across the crate.

use super::{ChainApi, ProvingParams, ServicePrice};
use crate::error::Result;
use crate::types::{DataSetInfo, ProviderInfo};
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub(crate) struct TestChain {
    pub payer: Address,
    pub epoch: AtomicU64,
    pub data_sets: Mutex<HashMap<u64, DataSetInfo>>,
    pub providers: Mutex<HashMap<u64, ProviderInfo>>,
    pub approved: Mutex<Vec<u64>>,
    pub next_client_id: AtomicU64,
    pub proving: ProvingParams,
    /// Transactions that never become visible on chain.
    pub lost_txs: Mutex<HashSet<B256>>,
    /// Receipt overrides; anything else confirms successfully.
    pub receipts: Mutex<HashMap<B256, bool>>,
    pub approved_reads: AtomicUsize,
}

impl TestChain {
    pub fn new(payer: Address) -> Self {
        TestChain {
            payer,
            epoch: AtomicU64::new(1_000_000),
            data_sets: Mutex::new(HashMap::new()),
            providers: Mutex::new(HashMap::new()),
            approved: Mutex::new(Vec::new()),
            next_client_id: AtomicU64::new(0),
            proving: ProvingParams {
                max_proving_period: 2880,
                challenge_window: 60,
            },
            lost_txs: Mutex::new(HashSet::new()),
            receipts: Mutex::new(HashMap::new()),
            approved_reads: AtomicUsize::new(0),
        }
    }

    pub fn with_provider(self, provider: ProviderInfo) -> Self {
        self.approved.lock().unwrap().push(provider.id);
        self.providers.lock().unwrap().insert(provider.id, provider);
        self
    }

    pub fn with_data_set(self, data_set: DataSetInfo) -> Self {
        self.data_sets
            .lock()
            .unwrap()
            .insert(data_set.pdp_verifier_data_set_id, data_set);
        self
    }
}

#[async_trait]
impl ChainApi for TestChain {
    fn payer(&self) -> Address {
        self.payer
    }

    async fn current_epoch(&self) -> Result<u64> {
        Ok(self.epoch.load(Ordering::SeqCst))
    }

    async fn data_set(&self, id: u64) -> Result<Option<DataSetInfo>> {
        Ok(self.data_sets.lock().unwrap().get(&id).cloned())
    }

    async fn client_data_sets(&self, payer: Address) -> Result<Vec<DataSetInfo>> {
        let mut sets: Vec<_> = self
            .data_sets
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.payer == payer)
            .cloned()
            .collect();
        sets.sort_by_key(|s| s.pdp_verifier_data_set_id);
        Ok(sets)
    }

    async fn next_client_data_set_id(&self, _payer: Address) -> Result<u64> {
        Ok(self.next_client_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn approved_provider_ids(&self) -> Result<Vec<u64>> {
        self.approved_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.approved.lock().unwrap().clone())
    }

    async fn provider(&self, id: u64) -> Result<Option<ProviderInfo>> {
        Ok(self.providers.lock().unwrap().get(&id).cloned())
    }

    async fn providers(&self, ids: &[u64]) -> Result<Vec<ProviderInfo>> {
        let providers = self.providers.lock().unwrap();
        Ok(ids.iter().filter_map(|id| providers.get(id).cloned()).collect())
    }

    async fn provider_id_by_address(&self, addr: Address) -> Result<Option<u64>> {
        Ok(self
            .providers
            .lock()
            .unwrap()
            .values()
            .find(|p| p.service_provider == addr)
            .map(|p| p.id))
    }

    async fn proving_params(&self) -> Result<ProvingParams> {
        Ok(self.proving)
    }

    async fn storage_price(&self) -> Result<ServicePrice> {
        Ok(ServicePrice {
            per_tib_per_month: U256::from(2_000_000_000_000_000_000u128),
            per_tib_per_month_with_cdn: U256::from(3_000_000_000_000_000_000u128),
            token: Address::ZERO,
            epochs_per_month: U256::from(86_400u64),
        })
    }

    async fn tx_seen(&self, hash: B256) -> Result<bool> {
        Ok(!self.lost_txs.lock().unwrap().contains(&hash))
    }

    async fn tx_receipt_status(&self, hash: B256) -> Result<Option<bool>> {
        if self.lost_txs.lock().unwrap().contains(&hash) {
            return Ok(None);
        }
        Ok(Some(
            self.receipts.lock().unwrap().get(&hash).copied().unwrap_or(true),
        ))
    }
}
