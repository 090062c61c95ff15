// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Short-lived session keys: delegated signers authorised for a subset
//! of PDP permissions, each with its own expiry epoch.
//!
//! Session keys are ephemeral; this helper only reads and writes their
//! on-chain authorisation. Persisting the derived key is the caller's
//! business.

use crate::chain::contracts::SessionKeyRegistry;
use crate::chain::{ChainAdapter, ChainApi, map_call_error, to_u64};
use crate::error::{Error, Result};
use alloy_primitives::{Address, B256, U256, keccak256};
use alloy_provider::Provider;
use std::collections::BTreeMap;

/// Permissions a session key can hold, identified on chain by the
/// keccak hash of their type string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionPermission {
    CreateDataSet,
    AddPieces,
    SchedulePieceRemovals,
    DeleteDataSet,
}

impl SessionPermission {
    pub fn type_string(&self) -> &'static str {
        match self {
            SessionPermission::CreateDataSet => "createDataSet",
            SessionPermission::AddPieces => "addPieces",
            SessionPermission::SchedulePieceRemovals => "schedulePieceRemovals",
            SessionPermission::DeleteDataSet => "deleteDataSet",
        }
    }

    pub fn type_hash(&self) -> B256 {
        keccak256(self.type_string().as_bytes())
    }
}

/// Queries and maintains the on-chain authorisation of one session key.
pub struct SessionKeyHelper {
    adapter: ChainAdapter,
    registry: Address,
    session_key: Address,
}

impl SessionKeyHelper {
    pub fn new(adapter: ChainAdapter, registry: Address, session_key: Address) -> Self {
        SessionKeyHelper {
            adapter,
            registry,
            session_key,
        }
    }

    pub fn session_key(&self) -> Address {
        self.session_key
    }

    fn registry_contract(
        &self,
    ) -> SessionKeyRegistry::SessionKeyRegistryInstance<alloy_provider::DynProvider> {
        SessionKeyRegistry::new(self.registry, self.adapter.provider().clone())
    }

    /// Expiry epoch per permission, batched through the aggregator when
    /// more than one permission is asked for.
    pub async fn fetch_expiries(
        &self,
        permissions: &[SessionPermission],
    ) -> Result<BTreeMap<SessionPermission, u64>> {
        let owner = self.adapter.payer();
        let registry = self.registry_contract();

        let expiries: Vec<u64> = if permissions.len() >= 2 {
            let mut calls = self.adapter.provider().multicall().dynamic();
            for permission in permissions {
                calls = calls.add_dynamic(registry.authorizationExpiry(
                    owner,
                    self.session_key,
                    permission.type_hash(),
                ));
            }
            calls
                .aggregate3()
                .await
                .map_err(|e| Error::chain("authorizationExpiry", e))?
                .into_iter()
                .map(|r| r.map(to_u64).unwrap_or(0))
                .collect()
        } else if let Some(permission) = permissions.first() {
            let expiry = registry
                .authorizationExpiry(owner, self.session_key, permission.type_hash())
                .call()
                .await
                .map_err(|e| map_call_error("authorizationExpiry", e))?;
            vec![to_u64(expiry)]
        } else {
            vec![]
        };

        Ok(permissions.iter().copied().zip(expiries).collect())
    }

    /// Authorise (or re-authorise) the session key for the permissions
    /// until `expiry_epoch`.
    pub async fn login(
        &self,
        expiry_epoch: u64,
        permissions: &[SessionPermission],
        origin: &str,
    ) -> Result<B256> {
        self.submit_login(U256::from(expiry_epoch), permissions, origin)
            .await
    }

    /// Revocation is a login with expiry zero.
    pub async fn revoke(&self, permissions: &[SessionPermission]) -> Result<B256> {
        self.submit_login(U256::ZERO, permissions, "").await
    }

    async fn submit_login(
        &self,
        expiry: U256,
        permissions: &[SessionPermission],
        origin: &str,
    ) -> Result<B256> {
        let hashes: Vec<B256> = permissions.iter().map(|p| p.type_hash()).collect();
        let registry = self.registry_contract();
        let mut call = registry.login(self.session_key, expiry, hashes, origin.to_string());
        if let Some(nonce) = self.adapter.next_nonce().await? {
            call = call.nonce(nonce);
        }
        let pending = call.send().await.map_err(|e| map_call_error("login", e))?;
        pending.watch().await.map_err(|e| Error::chain("login", e))
    }
}
