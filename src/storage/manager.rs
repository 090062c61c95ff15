// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::context::StorageContext;
use super::{
    AllowanceCheck, ContextCallbacks, PreflightResult, StorageCosts, StorageOptions,
    UploadOptions, UploadResult, check_upload_size,
};
use crate::chain::{ChainApi, ServicePrice};
use crate::error::{Error, Result};
use crate::payments::{OperatorApprovalSource, ServiceApproval};
use crate::pdp::PdpConnect;
use crate::piece::PieceCid;
use crate::registry::ProviderResolver;
use crate::retriever::{PieceRetriever, RetrievalOptions};
use crate::types::{WITH_CDN_KEY, metadata_is_subset, run_callback};
use alloy_primitives::{Address, U256};
use bytes::Bytes;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lockup horizon assumed when checking operator allowances: ten days of
/// epochs.
pub const DEFAULT_LOCKUP_PERIOD: u64 = 28_800;

const EPOCHS_PER_DAY: u64 = 2_880;
const TIB: u64 = 1 << 40;

/// Where an upload should land.
pub enum UploadTarget<'a> {
    /// The cached default context set (created on demand).
    Default,
    Context(&'a StorageContext),
    /// Fan the piece out to several contexts; the buffer is hashed once.
    Contexts(&'a [StorageContext]),
}

impl UploadTarget<'_> {
    fn is_explicit(&self) -> bool {
        !matches!(self, UploadTarget::Default)
    }
}

/// Per-download knobs.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub provider_address: Option<Address>,
    /// Overrides the manager's default CDN preference.
    pub with_cdn: Option<bool>,
    pub cancel: CancellationToken,
}

/// Multi-context orchestration: caches a default context set and
/// dispatches uploads and downloads.
pub struct StorageManager {
    chain: Arc<dyn ChainApi>,
    resolver: Arc<ProviderResolver>,
    connect: Arc<dyn PdpConnect>,
    retriever: Arc<dyn PieceRetriever>,
    approvals: Arc<dyn OperatorApprovalSource>,
    /// Warm-storage service address: record keeper for new data sets and
    /// the operator whose allowance the preflight check inspects.
    service: Address,
    default_with_cdn: bool,
    default_contexts: TokioMutex<Option<Vec<StorageContext>>>,
}

impl StorageManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainApi>,
        resolver: Arc<ProviderResolver>,
        connect: Arc<dyn PdpConnect>,
        retriever: Arc<dyn PieceRetriever>,
        approvals: Arc<dyn OperatorApprovalSource>,
        service: Address,
        default_with_cdn: bool,
    ) -> Self {
        StorageManager {
            chain,
            resolver,
            connect,
            retriever,
            approvals,
            service,
            default_with_cdn,
            default_contexts: TokioMutex::new(None),
        }
    }

    /// Create (or reuse) a context per the options. Cached default
    /// contexts are reused only for plain metadata/CDN requests.
    pub async fn create_context(
        &self,
        options: &StorageOptions,
        callbacks: &ContextCallbacks,
    ) -> Result<StorageContext> {
        if !options.has_non_default_selection() {
            let mut cell = self.default_contexts.lock().await;
            if let Some(cached) = cell.as_ref() {
                if cache_hit(cached, options, 1) {
                    let context = cached[0].clone();
                    if let Some(cb) = &callbacks.on_provider_selected {
                        run_callback("on_provider_selected", || cb(context.provider()));
                    }
                    debug!(provider = context.provider().id, "reusing cached default context");
                    return Ok(context);
                }
            }
            let context = StorageContext::create(
                self.chain.clone(),
                &self.resolver,
                self.connect.clone(),
                self.service,
                options,
                callbacks,
            )
            .await?;
            *cell = Some(vec![context.clone()]);
            return Ok(context);
        }

        StorageContext::create(
            self.chain.clone(),
            &self.resolver,
            self.connect.clone(),
            self.service,
            options,
            callbacks,
        )
        .await
    }

    /// Upload a buffer to the targeted context(s).
    pub async fn upload(
        &self,
        data: Bytes,
        target: UploadTarget<'_>,
        options: &StorageOptions,
        upload: UploadOptions,
    ) -> Result<UploadResult> {
        if target.is_explicit() && conflicts_with_explicit_target(options) {
            return Err(Error::OptionsConflict(
                "explicit contexts are mutually exclusive with provider/data-set/CDN options"
                    .into(),
            ));
        }
        match target {
            UploadTarget::Default => {
                let context = self
                    .create_context(options, &ContextCallbacks::default())
                    .await?;
                context.upload(data, upload).await
            }
            UploadTarget::Context(context) => context.upload(data, upload).await,
            UploadTarget::Contexts([]) => Err(Error::OptionsConflict(
                "an empty context list cannot take an upload".into(),
            )),
            UploadTarget::Contexts([context]) => context.upload(data, upload).await,
            UploadTarget::Contexts(contexts) => {
                check_upload_size(data.len() as u64)?;
                // hash exactly once; every context gets the precomputed
                // CID, and the caller's hooks observe the first upload
                let piece_cid = PieceCid::from_data(&data)?;
                let mut upload = Some(upload);
                let futures: Vec<_> = contexts
                    .iter()
                    .map(|context| {
                        let options = upload.take().unwrap_or_default();
                        context.upload_with_cid(data.clone(), piece_cid, options)
                    })
                    .collect();
                let results = futures::future::join_all(futures).await;
                let mut first: Option<UploadResult> = None;
                for result in results {
                    let result = result?;
                    first.get_or_insert(result);
                }
                Ok(first.expect("non-empty context list"))
            }
        }
    }

    /// Streamed uploads cannot fan out; only a single context may be
    /// targeted.
    pub async fn upload_stream(
        &self,
        body: reqwest::Body,
        piece_cid: PieceCid,
        target: UploadTarget<'_>,
        upload: UploadOptions,
    ) -> Result<UploadResult> {
        match target {
            UploadTarget::Context(context) => context.upload_stream(body, piece_cid, upload).await,
            UploadTarget::Contexts([context]) => {
                context.upload_stream(body, piece_cid, upload).await
            }
            UploadTarget::Contexts(_) => Err(Error::OptionsConflict(
                "streaming uploads cannot fan out to multiple contexts".into(),
            )),
            UploadTarget::Default => {
                let context = self
                    .create_context(&StorageOptions::default(), &ContextCallbacks::default())
                    .await?;
                context.upload_stream(body, piece_cid, upload).await
            }
        }
    }

    /// Download a piece through the retriever chain. When default
    /// contexts are cached, providers that already report the piece are
    /// hinted to the chain.
    pub async fn download(&self, piece: PieceCid, options: &DownloadOptions) -> Result<Vec<u8>> {
        let with_cdn = options.with_cdn.unwrap_or(self.default_with_cdn);

        let mut provider_hint = options.provider_address;
        if provider_hint.is_none() && !with_cdn {
            provider_hint = self.default_context_hint(&piece).await;
        }

        let retrieval = RetrievalOptions {
            provider_address: provider_hint,
            with_cdn,
            cancel: options.cancel.clone(),
        };
        self.retriever
            .fetch_piece(piece, self.chain.payer(), &retrieval)
            .await
    }

    /// Ask each cached default context whether it holds the piece and
    /// pick a random positive answer as the retrieval hint.
    async fn default_context_hint(&self, piece: &PieceCid) -> Option<Address> {
        let contexts = self.default_contexts.lock().await.clone()?;
        let checks = contexts.iter().map(|c| c.has_piece(piece));
        let results = futures::future::join_all(checks).await;
        let mut holders: Vec<Address> = contexts
            .iter()
            .zip(results)
            .filter(|(_, has)| matches!(has, Ok(true)))
            .map(|(c, _)| c.provider().service_provider)
            .collect();
        holders.shuffle(&mut rand::thread_rng());
        holders.first().copied()
    }

    /// Cost and allowance estimate for an upload of `size` bytes. No
    /// provider is selected during preflight.
    pub async fn preflight_upload(&self, size: u64, with_cdn: bool) -> Result<PreflightResult> {
        check_upload_size(size)?;
        let price = self.chain.storage_price().await?;
        let estimated_cost = preflight_cost(&price, size, with_cdn);
        let approval = self.approvals.operator_approval(self.service).await?;
        let allowance_check = check_allowance(
            &approval,
            estimated_cost.per_epoch,
            estimated_cost.per_epoch * U256::from(DEFAULT_LOCKUP_PERIOD),
        );
        Ok(PreflightResult {
            estimated_cost,
            allowance_check,
            selected_provider: None,
            selected_data_set_id: None,
        })
    }

    /// Build up to `count` contexts, preferring explicit data sets, then
    /// explicit providers, then smart selection. Stops early when the
    /// approved pool runs dry.
    pub async fn create_contexts(
        &self,
        count: usize,
        data_set_ids: &[u64],
        provider_ids: &[u64],
        options: &StorageOptions,
        callbacks: &ContextCallbacks,
    ) -> Result<Vec<StorageContext>> {
        let mut contexts: Vec<StorageContext> = Vec::with_capacity(count);
        let mut chosen_providers: Vec<u64> = options.exclude_providers.clone();

        for id in data_set_ids.iter().take(count) {
            let mut opts = options.clone();
            opts.data_set_id = Some(*id);
            let context = StorageContext::create(
                self.chain.clone(),
                &self.resolver,
                self.connect.clone(),
                self.service,
                &opts,
                callbacks,
            )
            .await?;
            chosen_providers.push(context.provider().id);
            contexts.push(context);
        }

        for id in provider_ids {
            if contexts.len() >= count {
                break;
            }
            if chosen_providers.contains(id) {
                continue;
            }
            let mut opts = options.clone();
            opts.provider_id = Some(*id);
            let context = StorageContext::create(
                self.chain.clone(),
                &self.resolver,
                self.connect.clone(),
                self.service,
                &opts,
                callbacks,
            )
            .await?;
            chosen_providers.push(context.provider().id);
            contexts.push(context);
        }

        while contexts.len() < count {
            let mut opts = options.clone();
            opts.exclude_providers = chosen_providers.clone();
            match StorageContext::create(
                self.chain.clone(),
                &self.resolver,
                self.connect.clone(),
                self.service,
                &opts,
                callbacks,
            )
            .await
            {
                Ok(context) => {
                    chosen_providers.push(context.provider().id);
                    contexts.push(context);
                }
                Err(Error::NoHealthyProvider | Error::NoProvidersAvailable(_)) => {
                    debug!(
                        built = contexts.len(),
                        requested = count,
                        "approved provider pool exhausted"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(contexts)
    }
}

/// True iff the options name anything an explicit context already pins
/// down.
fn conflicts_with_explicit_target(options: &StorageOptions) -> bool {
    options.has_non_default_selection() || options.with_cdn
}

/// Default-context reuse predicate: the set has the right size, no
/// excluded provider is in it, and the requested metadata (plus the CDN
/// sentinel) is a subset of every cached data set's metadata.
pub(crate) fn cache_hit(
    cached: &[StorageContext],
    options: &StorageOptions,
    count: usize,
) -> bool {
    if cached.len() != count {
        return false;
    }
    let mut requested = options.metadata.clone();
    if options.with_cdn {
        requested.insert(WITH_CDN_KEY.to_string(), String::new());
    }
    cached.iter().all(|context| {
        !options.exclude_providers.contains(&context.provider().id)
            && metadata_is_subset(&requested, context.data_set_metadata())
            && context.with_cdn() == options.with_cdn
    })
}

/// Storage cost of `size` bytes at the quoted price.
pub(crate) fn preflight_cost(price: &ServicePrice, size: u64, with_cdn: bool) -> StorageCosts {
    let per_tib_month = if with_cdn {
        price.per_tib_per_month_with_cdn
    } else {
        price.per_tib_per_month
    };
    let per_month = (per_tib_month * U256::from(size)).div_ceil(U256::from(TIB));
    let epochs_per_month = price.epochs_per_month.max(U256::from(1));
    let per_epoch = per_month.div_ceil(epochs_per_month);
    StorageCosts {
        per_epoch,
        per_day: per_epoch * U256::from(EPOCHS_PER_DAY),
        per_month,
    }
}

/// Compare a planned upload's rate and lockup needs against the
/// operator's remaining allowance.
pub(crate) fn check_allowance(
    approval: &ServiceApproval,
    rate_needed: U256,
    lockup_needed: U256,
) -> AllowanceCheck {
    if !approval.is_approved {
        return AllowanceCheck {
            sufficient: false,
            message: Some("the warm-storage operator is not approved; call approve_service".into()),
        };
    }
    let rate_available = approval.rate_allowance.saturating_sub(approval.rate_used);
    let lockup_available = approval
        .lockup_allowance
        .saturating_sub(approval.lockup_used);
    let mut shortfalls = Vec::new();
    if rate_available < rate_needed {
        shortfalls.push(format!(
            "rate allowance short by {}",
            rate_needed - rate_available
        ));
    }
    if lockup_available < lockup_needed {
        shortfalls.push(format!(
            "lockup allowance short by {}",
            lockup_needed - lockup_available
        ));
    }
    if shortfalls.is_empty() {
        AllowanceCheck {
            sufficient: true,
            message: None,
        }
    } else {
        AllowanceCheck {
            sufficient: false,
            message: Some(shortfalls.join("; ")),
        }
    }
}
