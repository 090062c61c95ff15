// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Payments coordination: deposits, operator approvals and rail
//! settlement against the on-chain payments contract.
//!
//! One stable-coin token (USDFC, 18 decimals) is supported; operations
//! that name any other token are rejected with
//! [`Error::UnsupportedToken`].

use crate::chain::contracts::{Erc20, Payments, Permit};
use crate::chain::{ChainAdapter, ChainApi, convert_rail, convert_rail_info, map_call_error, to_u64};
use crate::error::{Error, Result};
use crate::types::{RailInfo, RailView, run_callback};
use alloy_primitives::{Address, B256, U256};
use alloy_signer::Signer;
use alloy_sol_types::{Eip712Domain, SolStruct};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Fixed network fee attached to a validated rail settlement, in attoFIL.
pub const SETTLEMENT_FEE: u64 = 1_300_000_000_000_000; // 0.0013 FIL

/// Default permit validity window.
pub const PERMIT_DEADLINE_SECS: u64 = 3600;

/// USDFC carries 18 decimals on both networks.
pub const TOKEN_DECIMALS: u8 = 18;

/// Whole-token helper used in examples and tests: `usdfc(10)` is ten
/// USDFC in base units.
pub fn usdfc(whole: u64) -> U256 {
    U256::from(whole) * U256::from(10u64).pow(U256::from(TOKEN_DECIMALS))
}

/// Raw account row from the payments contract plus the derived available
/// balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountInfo {
    pub funds: U256,
    pub lockup_current: U256,
    pub lockup_rate: U256,
    pub lockup_last_settled_at: u64,
    pub available_funds: U256,
}

/// Operator delegation state for one `(owner, operator)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceApproval {
    pub is_approved: bool,
    pub rate_allowance: U256,
    pub rate_used: U256,
    pub lockup_allowance: U256,
    pub lockup_used: U256,
    pub max_lockup_period: u64,
}

/// Result of a settlement simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementAmounts {
    pub total_settled: U256,
    pub total_net_payee: U256,
    pub total_operator_commission: U256,
    pub final_settled_epoch: u64,
    pub note: String,
}

/// A submitted settlement transaction and the fee value it carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementTx {
    pub tx_hash: B256,
    pub value: U256,
}

/// Which settlement entry point applies to a rail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementPath {
    /// Active rail: validated settlement, network fee required.
    Active,
    /// Terminated rail: validator bypassed, no fee.
    Terminated,
}

impl SettlementPath {
    pub fn for_rail(rail: &RailView) -> Self {
        if rail.is_terminated() {
            SettlementPath::Terminated
        } else {
            SettlementPath::Active
        }
    }
}

/// Funds available for new lockups: `funds − (lockupCurrent +
/// lockupRate × elapsed)`, clamped at zero.
pub fn available_funds(
    funds: U256,
    lockup_current: U256,
    lockup_rate: U256,
    lockup_last_settled_at: u64,
    current_epoch: u64,
) -> U256 {
    let elapsed = U256::from(current_epoch.saturating_sub(lockup_last_settled_at));
    let locked = lockup_current.saturating_add(lockup_rate.saturating_mul(elapsed));
    funds.saturating_sub(locked)
}

/// EIP-712 domain for the token's permit, with the `version()` read
/// tolerated to be absent.
pub fn permit_domain(
    name: String,
    version: Option<String>,
    chain_id: u64,
    token: Address,
) -> Eip712Domain {
    Eip712Domain::new(
        Some(name.into()),
        Some(version.unwrap_or_else(|| "1".to_string()).into()),
        Some(U256::from(chain_id)),
        Some(token),
        None,
    )
}

fn default_deadline() -> U256 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    U256::from(now + PERMIT_DEADLINE_SECS)
}

/// Lifecycle hooks for the deposit golden path. Every callback is
/// optional and guarded; errors raised inside never break the deposit.
#[derive(Default)]
pub struct DepositCallbacks {
    pub on_allowance_checked: Option<Box<dyn Fn(U256, U256) + Send + Sync>>,
    pub on_approval_sent: Option<Box<dyn Fn(B256) + Send + Sync>>,
    pub on_approval_confirmed: Option<Box<dyn Fn(B256) + Send + Sync>>,
    pub on_deposit_sent: Option<Box<dyn Fn(B256) + Send + Sync>>,
}

/// The one payments read the storage manager needs for preflight
/// checks, kept behind a seam so storage tests can script it.
#[async_trait::async_trait]
pub trait OperatorApprovalSource: Send + Sync {
    async fn operator_approval(&self, operator: Address) -> Result<ServiceApproval>;
}

#[async_trait::async_trait]
impl OperatorApprovalSource for PaymentsService {
    async fn operator_approval(&self, operator: Address) -> Result<ServiceApproval> {
        self.service_approval(operator).await
    }
}

/// Token operations, deposits, operator approvals and rail settlement.
pub struct PaymentsService {
    adapter: ChainAdapter,
    /// Absent when the facade was handed a pre-built provider; permit
    /// deposits need a local signer and fail without one.
    signer: Option<Arc<dyn Signer + Send + Sync>>,
    chain_id: u64,
}

impl PaymentsService {
    pub fn new(
        adapter: ChainAdapter,
        signer: Option<Arc<dyn Signer + Send + Sync>>,
        chain_id: u64,
    ) -> Self {
        PaymentsService {
            adapter,
            signer,
            chain_id,
        }
    }

    fn token(&self) -> Address {
        self.adapter.addresses().usdfc
    }

    fn payments_address(&self) -> Address {
        self.adapter.addresses().payments
    }

    fn payments(&self) -> Payments::PaymentsInstance<alloy_provider::DynProvider> {
        Payments::new(self.payments_address(), self.adapter.provider().clone())
    }

    fn erc20(&self) -> Erc20::Erc20Instance<alloy_provider::DynProvider> {
        Erc20::new(self.token(), self.adapter.provider().clone())
    }

    /// Signer wallet balance: the native gas token when `token` is
    /// `None`, otherwise the supported stable-coin's `balanceOf`. Any
    /// other token is rejected.
    pub async fn wallet_balance(&self, token: Option<Address>) -> Result<U256> {
        use alloy_provider::Provider;
        let Some(token) = token else {
            return self
                .adapter
                .provider()
                .get_balance(self.adapter.payer())
                .await
                .map_err(|e| Error::chain("get_balance", e));
        };
        if token != self.token() {
            return Err(Error::UnsupportedToken(token));
        }
        Erc20::new(token, self.adapter.provider().clone())
            .balanceOf(self.adapter.payer())
            .call()
            .await
            .map_err(|e| map_call_error("balanceOf", e))
    }

    /// Funds inside the payments contract that are not locked up.
    pub async fn balance(&self) -> Result<U256> {
        Ok(self.account_info().await?.available_funds)
    }

    pub async fn account_info(&self) -> Result<AccountInfo> {
        let account = self
            .payments()
            .accounts(self.token(), self.adapter.payer())
            .call()
            .await
            .map_err(|e| map_call_error("accounts", e))?;
        let current_epoch = self.adapter.current_epoch().await?;
        let lockup_last_settled_at = to_u64(account.lockupLastSettledAt);
        Ok(AccountInfo {
            funds: account.funds,
            lockup_current: account.lockupCurrent,
            lockup_rate: account.lockupRate,
            lockup_last_settled_at,
            available_funds: available_funds(
                account.funds,
                account.lockupCurrent,
                account.lockupRate,
                lockup_last_settled_at,
                current_epoch,
            ),
        })
    }

    pub async fn allowance(&self, spender: Address) -> Result<U256> {
        self.erc20()
            .allowance(self.adapter.payer(), spender)
            .call()
            .await
            .map_err(|e| map_call_error("allowance", e))
    }

    pub async fn approve(&self, spender: Address, amount: U256) -> Result<B256> {
        let erc20 = self.erc20();
        let mut call = erc20.approve(spender, amount);
        if let Some(nonce) = self.adapter.next_nonce().await? {
            call = call.nonce(nonce);
        }
        let pending = call.send().await.map_err(|e| map_call_error("approve", e))?;
        pending
            .watch()
            .await
            .map_err(|e| Error::chain("approve", e))
    }

    /// Grant the warm-storage operator the right to move funds within the
    /// given rate and lockup caps.
    pub async fn approve_service(
        &self,
        operator: Address,
        rate_allowance: U256,
        lockup_allowance: U256,
        max_lockup_period: u64,
    ) -> Result<B256> {
        self.set_operator_approval(
            operator,
            true,
            rate_allowance,
            lockup_allowance,
            max_lockup_period,
        )
        .await
    }

    pub async fn revoke_service(&self, operator: Address) -> Result<B256> {
        self.set_operator_approval(operator, false, U256::ZERO, U256::ZERO, 0)
            .await
    }

    async fn set_operator_approval(
        &self,
        operator: Address,
        approved: bool,
        rate_allowance: U256,
        lockup_allowance: U256,
        max_lockup_period: u64,
    ) -> Result<B256> {
        let payments = self.payments();
        let mut call = payments.setOperatorApproval(
            self.token(),
            operator,
            approved,
            rate_allowance,
            lockup_allowance,
            U256::from(max_lockup_period),
        );
        if let Some(nonce) = self.adapter.next_nonce().await? {
            call = call.nonce(nonce);
        }
        let pending = call
            .send()
            .await
            .map_err(|e| map_call_error("setOperatorApproval", e))?;
        pending
            .watch()
            .await
            .map_err(|e| Error::chain("setOperatorApproval", e))
    }

    pub async fn service_approval(&self, operator: Address) -> Result<ServiceApproval> {
        let out = self
            .payments()
            .operatorApprovals(self.token(), self.adapter.payer(), operator)
            .call()
            .await
            .map_err(|e| map_call_error("operatorApprovals", e))?;
        Ok(ServiceApproval {
            is_approved: out.isApproved,
            rate_allowance: out.rateAllowance,
            rate_used: out.rateUsed,
            lockup_allowance: out.lockupAllowance,
            lockup_used: out.lockupUsed,
            max_lockup_period: to_u64(out.maxLockupPeriod),
        })
    }

    /// Deposit into the payments contract. If the current ERC-20
    /// allowance is short, an exact-amount `approve` is issued first and
    /// awaited before the deposit goes out.
    pub async fn deposit(&self, amount: U256, callbacks: &DepositCallbacks) -> Result<B256> {
        if amount.is_zero() {
            return Err(Error::InvalidAmount("deposit of zero".into()));
        }
        let wallet = self.wallet_balance(Some(self.token())).await?;
        if wallet < amount {
            return Err(Error::InsufficientFunds {
                needed: amount.to_string(),
                available: wallet.to_string(),
            });
        }

        let allowance = self.allowance(self.payments_address()).await?;
        if let Some(cb) = &callbacks.on_allowance_checked {
            run_callback("on_allowance_checked", || cb(allowance, amount));
        }

        if allowance < amount {
            let erc20 = self.erc20();
            let mut call = erc20.approve(self.payments_address(), amount);
            if let Some(nonce) = self.adapter.next_nonce().await? {
                call = call.nonce(nonce);
            }
            let pending = call.send().await.map_err(|e| map_call_error("approve", e))?;
            let hash = *pending.tx_hash();
            if let Some(cb) = &callbacks.on_approval_sent {
                run_callback("on_approval_sent", || cb(hash));
            }
            pending
                .watch()
                .await
                .map_err(|e| Error::chain("approve", e))?;
            if let Some(cb) = &callbacks.on_approval_confirmed {
                run_callback("on_approval_confirmed", || cb(hash));
            }
        }

        let payments = self.payments();
        let mut call = payments.deposit(self.token(), self.adapter.payer(), amount);
        if let Some(nonce) = self.adapter.next_nonce().await? {
            call = call.nonce(nonce);
        }
        let pending = call.send().await.map_err(|e| map_call_error("deposit", e))?;
        let hash = *pending.tx_hash();
        if let Some(cb) = &callbacks.on_deposit_sent {
            run_callback("on_deposit_sent", || cb(hash));
        }
        pending
            .watch()
            .await
            .map_err(|e| Error::chain("deposit", e))?;
        Ok(hash)
    }

    /// Single-transaction deposit using an EIP-2612 permit.
    pub async fn deposit_with_permit(&self, amount: U256, deadline: Option<U256>) -> Result<B256> {
        let (permit, deadline, v, r, s) = self.signed_permit(amount, deadline).await?;
        debug!(owner = %permit.owner, value = %permit.value, "submitting permit deposit");
        let payments = self.payments();
        let mut call = payments.depositWithPermit(
            self.token(),
            self.adapter.payer(),
            amount,
            deadline,
            v,
            r,
            s,
        );
        if let Some(nonce) = self.adapter.next_nonce().await? {
            call = call.nonce(nonce);
        }
        let pending = call
            .send()
            .await
            .map_err(|e| map_call_error("depositWithPermit", e))?;
        pending
            .watch()
            .await
            .map_err(|e| Error::chain("depositWithPermit", e))
    }

    /// Permit deposit plus operator grant in one on-chain call.
    pub async fn deposit_with_permit_and_approve_operator(
        &self,
        amount: U256,
        deadline: Option<U256>,
        operator: Address,
        rate_allowance: U256,
        lockup_allowance: U256,
        max_lockup_period: u64,
    ) -> Result<B256> {
        let (_, deadline, v, r, s) = self.signed_permit(amount, deadline).await?;
        let payments = self.payments();
        let mut call = payments.depositWithPermitAndApproveOperator(
            self.token(),
            self.adapter.payer(),
            amount,
            deadline,
            v,
            r,
            s,
            operator,
            rate_allowance,
            lockup_allowance,
            U256::from(max_lockup_period),
        );
        if let Some(nonce) = self.adapter.next_nonce().await? {
            call = call.nonce(nonce);
        }
        let pending = call
            .send()
            .await
            .map_err(|e| map_call_error("depositWithPermitAndApproveOperator", e))?;
        pending
            .watch()
            .await
            .map_err(|e| Error::chain("depositWithPermitAndApproveOperator", e))
    }

    /// Probe the token and produce the `(v, r, s)` permit signature.
    /// `version()` is allowed to be missing and falls back to `"1"`.
    async fn signed_permit(
        &self,
        amount: U256,
        deadline: Option<U256>,
    ) -> Result<(Permit, U256, u8, B256, B256)> {
        use alloy_provider::Provider;
        if amount.is_zero() {
            return Err(Error::InvalidAmount("deposit of zero".into()));
        }
        let erc20 = self.erc20();
        let owner = self.adapter.payer();
        let (balance, name, version, nonce) = self
            .adapter
            .provider()
            .multicall()
            .add(erc20.balanceOf(owner))
            .add(erc20.name())
            .add(erc20.version())
            .add(erc20.nonces(owner))
            .aggregate3()
            .await
            .map_err(|e| Error::chain("permit multicall", e))?;

        let balance = balance.map_err(|e| Error::chain("balanceOf", e))?;
        if balance < amount {
            return Err(Error::InsufficientFunds {
                needed: amount.to_string(),
                available: balance.to_string(),
            });
        }
        let name = name.map_err(|e| Error::chain("name", e))?;
        let nonce = nonce.map_err(|e| Error::chain("nonces", e))?;

        let domain = permit_domain(name, version.ok(), self.chain_id, self.token());
        let deadline = deadline.unwrap_or_else(default_deadline);
        let permit = Permit {
            owner,
            spender: self.payments_address(),
            value: amount,
            nonce,
            deadline,
        };
        let hash = permit.eip712_signing_hash(&domain);
        let signer = self.signer.as_ref().ok_or_else(|| {
            Error::OptionsConflict("permit deposits require a local signer".into())
        })?;
        let signature = signer
            .sign_hash(&hash)
            .await
            .map_err(|e| Error::chain("sign_typed_data", e))?;
        let v = if signature.v() { 28 } else { 27 };
        Ok((
            permit,
            deadline,
            v,
            signature.r().into(),
            signature.s().into(),
        ))
    }

    pub async fn withdraw(&self, amount: U256) -> Result<B256> {
        if amount.is_zero() {
            return Err(Error::InvalidAmount("withdrawal of zero".into()));
        }
        let available = self.balance().await?;
        if amount > available {
            return Err(Error::InsufficientFunds {
                needed: amount.to_string(),
                available: available.to_string(),
            });
        }
        let payments = self.payments();
        let mut call = payments.withdraw(self.token(), amount);
        if let Some(nonce) = self.adapter.next_nonce().await? {
            call = call.nonce(nonce);
        }
        let pending = call
            .send()
            .await
            .map_err(|e| map_call_error("withdraw", e))?;
        pending
            .watch()
            .await
            .map_err(|e| Error::chain("withdraw", e))
    }

    pub async fn get_rail(&self, rail_id: u64) -> Result<RailView> {
        self.payments()
            .getRail(U256::from(rail_id))
            .call()
            .await
            .map(convert_rail)
            .map_err(|e| {
                // an unknown rail reverts; transport failures stay tagged
                if e.as_revert_data().is_some() {
                    match map_call_error("getRail", e) {
                        Error::ChainCallFailed { .. } => Error::RailNotFound(rail_id),
                        mapped => mapped,
                    }
                } else {
                    map_call_error("getRail", e)
                }
            })
    }

    /// Settle a rail through the validated path. `until_epoch` defaults
    /// to the current epoch; the fixed network fee rides along as value.
    pub async fn settle(&self, rail_id: u64, until_epoch: Option<u64>) -> Result<SettlementTx> {
        let until = match until_epoch {
            Some(epoch) => epoch,
            None => self.adapter.current_epoch().await?,
        };
        let fee = U256::from(SETTLEMENT_FEE);
        let payments = self.payments();
        let mut call = payments
            .settleRail(U256::from(rail_id), U256::from(until))
            .value(fee);
        if let Some(nonce) = self.adapter.next_nonce().await? {
            call = call.nonce(nonce);
        }
        let pending = call
            .send()
            .await
            .map_err(|e| map_call_error("settleRail", e))?;
        let tx_hash = pending
            .watch()
            .await
            .map_err(|e| Error::chain("settleRail", e))?;
        Ok(SettlementTx {
            tx_hash,
            value: fee,
        })
    }

    /// Read-only settlement simulation.
    pub async fn get_settlement_amounts(
        &self,
        rail_id: u64,
        until_epoch: Option<u64>,
    ) -> Result<SettlementAmounts> {
        let until = match until_epoch {
            Some(epoch) => epoch,
            None => self.adapter.current_epoch().await?,
        };
        let out = self
            .payments()
            .settleRail(U256::from(rail_id), U256::from(until))
            .value(U256::from(SETTLEMENT_FEE))
            .call()
            .await
            .map_err(|e| map_call_error("settleRail", e))?;
        Ok(SettlementAmounts {
            total_settled: out.totalSettledAmount,
            total_net_payee: out.totalNetPayeeAmount,
            total_operator_commission: out.totalOperatorCommission,
            final_settled_epoch: to_u64(out.finalSettledEpoch),
            note: out.note,
        })
    }

    /// Settle a terminated rail, bypassing the validator; no fee needed.
    pub async fn settle_terminated_rail(&self, rail_id: u64) -> Result<SettlementTx> {
        let payments = self.payments();
        let mut call = payments.settleTerminatedRailWithoutValidation(U256::from(rail_id));
        if let Some(nonce) = self.adapter.next_nonce().await? {
            call = call.nonce(nonce);
        }
        let pending = call
            .send()
            .await
            .map_err(|e| map_call_error("settleTerminatedRailWithoutValidation", e))?;
        let tx_hash = pending
            .watch()
            .await
            .map_err(|e| Error::chain("settleTerminatedRailWithoutValidation", e))?;
        Ok(SettlementTx {
            tx_hash,
            value: U256::ZERO,
        })
    }

    /// Read the rail and pick the right settlement path for its state.
    pub async fn settle_auto(
        &self,
        rail_id: u64,
        until_epoch: Option<u64>,
    ) -> Result<SettlementTx> {
        let rail = self.get_rail(rail_id).await?;
        match SettlementPath::for_rail(&rail) {
            SettlementPath::Terminated => self.settle_terminated_rail(rail_id).await,
            SettlementPath::Active => self.settle(rail_id, until_epoch).await,
        }
    }

    pub async fn rails_as_payer(&self) -> Result<Vec<RailInfo>> {
        let rails = self
            .payments()
            .getRailsForPayerAndToken(self.adapter.payer(), self.token())
            .call()
            .await
            .map_err(|e| map_call_error("getRailsForPayerAndToken", e))?;
        Ok(rails.into_iter().map(convert_rail_info).collect())
    }

    pub async fn rails_as_payee(&self) -> Result<Vec<RailInfo>> {
        let rails = self
            .payments()
            .getRailsForPayeeAndToken(self.adapter.payer(), self.token())
            .call()
            .await
            .map_err(|e| map_call_error("getRailsForPayeeAndToken", e))?;
        Ok(rails.into_iter().map(convert_rail_info).collect())
    }
}
