// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::resolve::{Resolution, resolve};
use super::{
    ADDITION_CONFIRM_POLL, ADDITION_CONFIRM_TIMEOUT, COALESCE_POLL, COALESCE_WAIT, CREATION_POLL,
    CREATION_TIMEOUT, ContextCallbacks, PARKING_POLL, PARKING_TIMEOUT, PieceStatus, RECEIPT_POLL,
    RECEIPT_TIMEOUT, StorageOptions, TX_PROPAGATION_POLL, TX_PROPAGATION_TIMEOUT,
    UploadCallbacks, UploadOptions, UploadResult, check_upload_size,
};
use crate::chain::{ChainApi, wait_tx_success};
use crate::error::{Error, Result};
use crate::network::EPOCH_DURATION_SECONDS;
use crate::pdp::{CreateDataSet, PdpApi, PdpConnect, PieceEntry, TxStatus, UploadSource};
use crate::piece::{PieceCid, collect_validated};
use crate::registry::ProviderResolver;
use crate::types::{MetadataMap, ProviderInfo, WITH_CDN_KEY, run_callback};
use alloy_primitives::Address;
use bytes::Bytes;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex as TokioMutex, oneshot};
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};
use url::Url;

/// A storage context bound to one provider and (once known) one data
/// set. Cheap to clone; clones share the queue and batching state.
#[derive(Clone)]
pub struct StorageContext {
    inner: Arc<ContextInner>,
}

struct DataSetRef {
    data_set_id: Option<u64>,
    client_data_set_id: Option<u64>,
}

struct PendingPiece {
    piece_cid: PieceCid,
    metadata: MetadataMap,
    responder: oneshot::Sender<Result<u64>>,
    callbacks: UploadCallbacks,
}

#[derive(Default)]
struct BatchQueue {
    pending: VecDeque<PendingPiece>,
    processing: bool,
}

struct ContextInner {
    chain: Arc<dyn ChainApi>,
    pdp: Arc<dyn PdpApi>,
    provider: ProviderInfo,
    /// Warm-storage service address, recorded as the data set's record
    /// keeper at creation.
    record_keeper: Address,
    with_cdn: bool,
    metadata: MetadataMap,
    data_set_metadata: MetadataMap,
    upload_batch_size: usize,
    data_set: TokioMutex<DataSetRef>,
    queue: StdMutex<BatchQueue>,
    active_uploads: StdMutex<HashSet<u64>>,
    upload_seq: AtomicU64,
}

impl StorageContext {
    /// Resolve (or create) a context per the options. `record_keeper`
    /// is the warm-storage service address on the current network.
    pub async fn create(
        chain: Arc<dyn ChainApi>,
        resolver: &ProviderResolver,
        connect: Arc<dyn PdpConnect>,
        record_keeper: Address,
        options: &StorageOptions,
        callbacks: &ContextCallbacks,
    ) -> Result<Self> {
        crate::types::validate_metadata(&options.metadata)?;
        let resolution = resolve(&chain, resolver, &connect, options).await?;
        let context = Self::from_resolution(chain, connect, record_keeper, options, resolution)?;

        if let Some(cb) = &callbacks.on_provider_selected {
            run_callback("on_provider_selected", || cb(&context.inner.provider));
        }
        if options.force_create {
            context.inner.create_data_set_eager(callbacks).await?;
        } else if let Some(id) = context.data_set_id().await {
            if let Some(cb) = &callbacks.on_data_set_resolved {
                run_callback("on_data_set_resolved", || cb(id, true));
            }
        }
        Ok(context)
    }

    pub(crate) fn from_resolution(
        chain: Arc<dyn ChainApi>,
        connect: Arc<dyn PdpConnect>,
        record_keeper: Address,
        options: &StorageOptions,
        resolution: Resolution,
    ) -> Result<Self> {
        let url = resolution.provider.service_url().ok_or_else(|| {
            Error::NoProvidersAvailable(format!(
                "provider {} has no PDP service URL",
                resolution.provider.id
            ))
        })?;
        let url = Url::parse(url)
            .map_err(|e| Error::NoProvidersAvailable(format!("service URL {url}: {e}")))?;
        let pdp = connect.connect(url);

        let mut data_set_metadata = resolution.data_set_metadata;
        if !resolution.existing && options.with_cdn {
            data_set_metadata.insert(WITH_CDN_KEY.to_string(), String::new());
        }

        Ok(StorageContext {
            inner: Arc::new(ContextInner {
                chain,
                pdp,
                provider: resolution.provider,
                record_keeper,
                with_cdn: options.with_cdn,
                metadata: options.metadata.clone(),
                data_set_metadata,
                upload_batch_size: options
                    .upload_batch_size
                    .unwrap_or(super::DEFAULT_UPLOAD_BATCH_SIZE)
                    .max(1),
                data_set: TokioMutex::new(DataSetRef {
                    data_set_id: resolution.data_set_id,
                    client_data_set_id: None,
                }),
                queue: StdMutex::new(BatchQueue::default()),
                active_uploads: StdMutex::new(HashSet::new()),
                upload_seq: AtomicU64::new(0),
            }),
        })
    }

    pub fn provider(&self) -> &ProviderInfo {
        &self.inner.provider
    }

    /// Whether two handles refer to the same underlying context.
    pub fn same_context(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn with_cdn(&self) -> bool {
        self.inner.with_cdn
    }

    /// Metadata of the resolved data set (the requested metadata plus the
    /// CDN sentinel until one exists on chain).
    pub fn data_set_metadata(&self) -> &MetadataMap {
        &self.inner.data_set_metadata
    }

    pub async fn data_set_id(&self) -> Option<u64> {
        self.inner.data_set.lock().await.data_set_id
    }

    /// Upload a byte buffer; resolves once the piece is confirmed on
    /// chain and acknowledged by the provider.
    pub async fn upload(&self, data: Bytes, options: UploadOptions) -> Result<UploadResult> {
        check_upload_size(data.len() as u64)?;
        self.inner
            .clone()
            .upload_inner(UploadSource::Buffer(data), None, options)
            .await
    }

    /// Upload with a piece CID that was already computed (multi-context
    /// fan-out hashes exactly once).
    pub async fn upload_with_cid(
        &self,
        data: Bytes,
        piece_cid: PieceCid,
        options: UploadOptions,
    ) -> Result<UploadResult> {
        check_upload_size(data.len() as u64)?;
        self.inner
            .clone()
            .upload_inner(UploadSource::Buffer(data), Some(piece_cid), options)
            .await
    }

    /// Upload a byte stream. The size is unknown up front, so only the
    /// provider enforces bounds; the piece CID must be precomputed.
    pub async fn upload_stream(
        &self,
        body: reqwest::Body,
        piece_cid: PieceCid,
        options: UploadOptions,
    ) -> Result<UploadResult> {
        self.inner
            .clone()
            .upload_inner(UploadSource::Stream(body), Some(piece_cid), options)
            .await
    }

    /// Fetch a piece directly from this context's provider, validating
    /// the digest.
    pub async fn download(&self, piece: PieceCid) -> Result<Vec<u8>> {
        if !self.inner.pdp.find_piece(&piece).await? {
            return Err(Error::PieceNotFound(piece.to_string()));
        }
        let response = self.inner.pdp.download_piece(&piece).await?;
        collect_validated(response.bytes_stream(), &piece, None).await
    }

    /// Whether this context's provider has the piece parked.
    pub async fn has_piece(&self, piece: &PieceCid) -> Result<bool> {
        self.inner.pdp.find_piece(piece).await
    }

    /// Proving-cycle status of a piece in this context's data set.
    pub async fn piece_status(&self, piece: PieceCid) -> Result<PieceStatus> {
        let data_set_id = self.data_set_id().await;
        let (exists, state, current_epoch, params) = tokio::join!(
            self.inner.pdp.find_piece(&piece),
            async {
                match data_set_id {
                    Some(id) => self.inner.pdp.get_data_set(id).await.map(Some),
                    None => Ok(None),
                }
            },
            self.inner.chain.current_epoch(),
            self.inner.chain.proving_params(),
        );
        let exists = exists?;
        let state = state?;
        let current_epoch = current_epoch?;
        let params = params?;

        let piece_id = state
            .as_ref()
            .and_then(|s| s.pieces.iter().find(|p| p.piece_cid == piece))
            .map(|p| p.piece_id);

        let next_challenge = state.map(|s| s.next_challenge_epoch).unwrap_or(0);
        if !exists || next_challenge == 0 {
            return Ok(PieceStatus {
                exists,
                piece_id,
                challenge_window_start: None,
                proving_deadline: None,
                last_proven: None,
                in_challenge_window: false,
                is_proof_overdue: false,
                hours_until_challenge_window: 0.0,
            });
        }

        let start = next_challenge;
        let deadline = start + params.challenge_window;
        let hours_until = start.saturating_sub(current_epoch) as f64 * EPOCH_DURATION_SECONDS as f64
            / 3600.0;
        Ok(PieceStatus {
            exists,
            piece_id,
            challenge_window_start: Some(start),
            proving_deadline: Some(deadline),
            last_proven: Some(start.saturating_sub(params.max_proving_period)),
            in_challenge_window: current_epoch >= start && current_epoch < deadline,
            is_proof_overdue: current_epoch >= deadline,
            hours_until_challenge_window: hours_until,
        })
    }

    /// Schedule removal of a piece from this context's data set.
    pub async fn delete_piece(&self, piece: PieceCid) -> Result<alloy_primitives::B256> {
        let (data_set_id, client_data_set_id) = {
            let ds = self.inner.data_set.lock().await;
            let id = ds.data_set_id.ok_or(Error::PieceNotFound(piece.to_string()))?;
            (id, ds.client_data_set_id)
        };
        let client_data_set_id = match client_data_set_id {
            Some(id) => id,
            None => {
                let info = self
                    .inner
                    .chain
                    .data_set(data_set_id)
                    .await?
                    .ok_or(Error::DataSetNotFound(data_set_id))?;
                info.client_data_set_id
            }
        };
        let state = self.inner.pdp.get_data_set(data_set_id).await?;
        let piece_id = state
            .pieces
            .iter()
            .find(|p| p.piece_cid == piece)
            .map(|p| p.piece_id)
            .ok_or(Error::PieceNotFound(piece.to_string()))?;
        self.inner
            .pdp
            .delete_piece(data_set_id, client_data_set_id, piece_id)
            .await
    }
}

impl ContextInner {
    async fn upload_inner(
        self: Arc<Self>,
        source: UploadSource,
        precomputed: Option<PieceCid>,
        options: UploadOptions,
    ) -> Result<UploadResult> {
        crate::types::validate_metadata(&options.metadata)?;
        let token = self.upload_seq.fetch_add(1, Ordering::SeqCst);
        self.active_uploads.lock().unwrap().insert(token);

        // the upload-and-park phase honours the caller's cancellation
        // token; the batched chain transaction later does not
        let uploaded = tokio::select! {
            _ = options.cancel.cancelled() => Err(Error::Cancelled),
            result = self.run_upload_phase(source, precomputed) => result,
        };
        let (piece_cid, size) = match uploaded {
            Ok(pair) => pair,
            Err(e) => {
                self.active_uploads.lock().unwrap().remove(&token);
                return Err(e);
            }
        };

        if let Some(cb) = &options.callbacks.on_upload_complete {
            run_callback("on_upload_complete", || cb(piece_cid));
        }
        self.active_uploads.lock().unwrap().remove(&token);

        let (responder, receiver) = oneshot::channel();
        {
            let mut queue = self.queue.lock().unwrap();
            queue.pending.push_back(PendingPiece {
                piece_cid,
                metadata: options.metadata,
                responder,
                callbacks: options.callbacks,
            });
        }
        self.schedule_batch();

        let piece_id = receiver
            .await
            .map_err(|_| Error::chain("add pieces batch", "batch task dropped"))??;
        Ok(UploadResult {
            piece_cid,
            size,
            piece_id,
        })
    }

    /// Post the bytes and wait until the provider reports the piece
    /// parked.
    async fn run_upload_phase(
        &self,
        source: UploadSource,
        precomputed: Option<PieceCid>,
    ) -> Result<(PieceCid, u64)> {
        let (piece_cid, size) = self.pdp.upload_piece(source, precomputed).await?;

        let deadline = Instant::now() + PARKING_TIMEOUT;
        loop {
            if self.pdp.find_piece(&piece_cid).await? {
                return Ok((piece_cid, size));
            }
            if Instant::now() >= deadline {
                return Err(Error::PieceParkingTimeout(piece_cid.to_string()));
            }
            sleep(PARKING_POLL).await;
        }
    }

    fn schedule_batch(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            inner.process_pending_pieces().await;
        });
    }

    /// Single-flight batch processor; `processing` gates re-entry and a
    /// non-empty queue on exit schedules another pass.
    async fn process_pending_pieces(self: Arc<Self>) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.processing || queue.pending.is_empty() {
                return;
            }
            queue.processing = true;
        }

        self.run_batch().await;

        let reschedule = {
            let mut queue = self.queue.lock().unwrap();
            queue.processing = false;
            !queue.pending.is_empty()
        };
        if reschedule {
            self.schedule_batch();
        }
    }

    async fn run_batch(self: &Arc<Self>) {
        // let concurrent uploads coalesce into this batch, bounded so a
        // full batch never waits
        let snapshot: HashSet<u64> = self.active_uploads.lock().unwrap().clone();
        if !snapshot.is_empty() {
            let deadline = Instant::now() + COALESCE_WAIT;
            loop {
                if self.queue.lock().unwrap().pending.len() >= self.upload_batch_size {
                    break;
                }
                let still_in_flight = {
                    let active = self.active_uploads.lock().unwrap();
                    snapshot.iter().any(|token| active.contains(token))
                };
                if !still_in_flight || Instant::now() >= deadline {
                    break;
                }
                sleep(COALESCE_POLL).await;
            }
        }

        let batch: Vec<PendingPiece> = {
            let mut queue = self.queue.lock().unwrap();
            let take = queue.pending.len().min(self.upload_batch_size);
            queue.pending.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }
        debug!(pieces = batch.len(), provider = self.provider.id, "submitting piece batch");

        match self.try_submit(&batch).await {
            Ok(confirmed_ids) => {
                for (index, entry) in batch.into_iter().enumerate() {
                    match confirmed_ids.get(index) {
                        Some(id) => {
                            if let Some(cb) = &entry.callbacks.on_piece_confirmed {
                                run_callback("on_piece_confirmed", || cb(&confirmed_ids));
                            }
                            let _ = entry.responder.send(Ok(*id));
                        }
                        None => {
                            let _ = entry
                                .responder
                                .send(Err(Error::MissingConfirmedPieceId { index }));
                        }
                    }
                }
            }
            Err(e) => {
                warn!(provider = self.provider.id, "piece batch failed: {e}");
                // a single failure rejects the whole batch; later batches
                // are independent
                for entry in batch {
                    let _ = entry.responder.send(Err(e.clone()));
                }
            }
        }
    }

    /// Issue the on-chain piece addition (creating the data set when
    /// needed) and drive the two-phase confirmation. Returns the
    /// confirmed piece ids in batch order.
    async fn try_submit(&self, batch: &[PendingPiece]) -> Result<Vec<u64>> {
        let entries: Vec<PieceEntry> = batch
            .iter()
            .map(|p| PieceEntry {
                piece_cid: p.piece_cid,
                metadata: p.metadata.clone(),
            })
            .collect();

        let existing = { self.data_set.lock().await.data_set_id };
        let (tx_hash, created) = match existing {
            Some(data_set_id) => {
                let info = self
                    .chain
                    .data_set(data_set_id)
                    .await?
                    .ok_or(Error::DataSetNotFound(data_set_id))?;
                let tx = self
                    .pdp
                    .add_pieces(
                        data_set_id,
                        info.client_data_set_id,
                        info.next_piece_id,
                        &entries,
                    )
                    .await?;
                (tx, false)
            }
            None => {
                let client_data_set_id =
                    self.chain.next_client_data_set_id(self.chain.payer()).await?;
                let ticket = self
                    .pdp
                    .create_data_set(&CreateDataSet {
                        client_data_set_id,
                        payee: self.provider.payee,
                        record_keeper: self.record_keeper,
                        with_cdn: self.with_cdn,
                        metadata: self.metadata.clone(),
                        pieces: entries,
                    })
                    .await?;
                self.data_set.lock().await.client_data_set_id = Some(client_data_set_id);
                (ticket.tx_hash, true)
            }
        };

        for entry in batch {
            if let Some(cb) = &entry.callbacks.on_piece_added {
                run_callback("on_piece_added", || cb(tx_hash));
            }
        }

        wait_tx_success(
            self.chain.as_ref(),
            tx_hash,
            TX_PROPAGATION_TIMEOUT,
            TX_PROPAGATION_POLL,
            RECEIPT_TIMEOUT,
            RECEIPT_POLL,
        )
        .await?;

        if created {
            self.await_creation(tx_hash, &ContextCallbacks::default())
                .await?;
            // a fresh data set numbers its pieces densely from zero
            Ok((0..batch.len() as u64).collect())
        } else {
            self.await_addition(tx_hash).await
        }
    }

    /// Poll the provider's piece-addition status document until it
    /// reports an outcome.
    async fn await_addition(&self, tx_hash: alloy_primitives::B256) -> Result<Vec<u64>> {
        let data_set_id = self
            .data_set
            .lock()
            .await
            .data_set_id
            .expect("addition always has a data set");
        let deadline = Instant::now() + ADDITION_CONFIRM_TIMEOUT;
        loop {
            let status = self.pdp.piece_addition_status(data_set_id, tx_hash).await?;
            match status {
                Some(status) => {
                    if status.add_message_ok == Some(false) {
                        return Err(Error::ServerRejectedPieceAddition(tx_hash));
                    }
                    if status.tx_status != TxStatus::Pending && status.add_message_ok == Some(true)
                    {
                        return Ok(status.confirmed_piece_ids);
                    }
                }
                None => {} // server has not indexed the transaction yet
            }
            if Instant::now() >= deadline {
                return Err(Error::ServerTimeout("piece addition confirmation"));
            }
            sleep(ADDITION_CONFIRM_POLL).await;
        }
    }

    /// Poll the provider's comprehensive creation status until the data
    /// set is live and server-confirmed; records the new id.
    async fn await_creation(
        &self,
        tx_hash: alloy_primitives::B256,
        callbacks: &ContextCallbacks,
    ) -> Result<u64> {
        let started = Instant::now();
        let deadline = started + CREATION_TIMEOUT;
        loop {
            if let Some(cb) = &callbacks.on_creation_progress {
                run_callback("on_creation_progress", || cb(started.elapsed()));
            }
            if let Some(status) = self.pdp.data_set_creation_status(tx_hash).await? {
                if status.tx_mined && !status.tx_success {
                    return Err(Error::DataSetCreationFailed {
                        reason: "creation transaction failed on chain".into(),
                    });
                }
                if status.server_confirmed && status.data_set_live {
                    let data_set_id = status.data_set_id.ok_or_else(|| {
                        Error::MalformedServerResponse(
                            "creation confirmed without a data set id".into(),
                        )
                    })?;
                    self.data_set.lock().await.data_set_id = Some(data_set_id);
                    return Ok(data_set_id);
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::DataSetCreationFailed {
                    reason: "timed out waiting for data set creation".into(),
                });
            }
            sleep(CREATION_POLL).await;
        }
    }

    /// Eager creation used by `force_create`: same two-phase
    /// confirmation, without pieces.
    async fn create_data_set_eager(
        self: &Arc<Self>,
        callbacks: &ContextCallbacks,
    ) -> Result<u64> {
        if let Some(id) = { self.data_set.lock().await.data_set_id } {
            return Ok(id);
        }
        let client_data_set_id = self.chain.next_client_data_set_id(self.chain.payer()).await?;
        let ticket = self
            .pdp
            .create_data_set(&CreateDataSet {
                client_data_set_id,
                payee: self.provider.payee,
                record_keeper: self.record_keeper,
                with_cdn: self.with_cdn,
                metadata: self.metadata.clone(),
                pieces: vec![],
            })
            .await?;
        self.data_set.lock().await.client_data_set_id = Some(client_data_set_id);

        wait_tx_success(
            self.chain.as_ref(),
            ticket.tx_hash,
            TX_PROPAGATION_TIMEOUT,
            TX_PROPAGATION_POLL,
            RECEIPT_TIMEOUT,
            RECEIPT_POLL,
        )
        .await
        .map_err(|e| Error::DataSetCreationFailed {
            reason: e.to_string(),
        })?;

        let id = self.await_creation(ticket.tx_hash, callbacks).await?;
        if let Some(cb) = &callbacks.on_data_set_resolved {
            run_callback("on_data_set_resolved", || cb(id, false));
        }
        Ok(id)
    }
}
