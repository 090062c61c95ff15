// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Scriptable in-memory [`PdpApi`] used by unit tests across the crate.

use super::{
    CreateDataSet, CreateDataSetTicket, DataSetCreationStatus, DataSetState, PdpApi, PdpConnect,
    PieceAdditionStatus, PieceEntry, TxStatus, UploadSource,
};
use crate::error::{Error, Result};
use crate::piece::{PieceCid, PieceHasher};
use alloy_primitives::B256;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

#[derive(Debug, Clone)]
pub(crate) struct AddCall {
    pub data_set_id: u64,
    pub client_data_set_id: u64,
    pub next_piece_id: u64,
    pub piece_count: usize,
    pub tx_hash: B256,
}

#[derive(Debug, Clone)]
pub(crate) struct CreateCall {
    pub client_data_set_id: u64,
    pub piece_count: usize,
    pub tx_hash: B256,
}

pub(crate) struct MockPdp {
    base: Url,
    ping_ok: AtomicBool,
    pings: AtomicUsize,
    /// Uploaded pieces become findable immediately unless disabled.
    pub park_on_upload: AtomicBool,
    pub parked: Mutex<HashSet<PieceCid>>,
    pub uploads: Mutex<Vec<PieceCid>>,
    tx_counter: AtomicU64,
    pub add_calls: Mutex<Vec<AddCall>>,
    pub create_calls: Mutex<Vec<CreateCall>>,
    /// Status polls answered "not ready yet" before the real document.
    pub polls_before_ready: AtomicUsize,
    poll_counts: Mutex<HashMap<B256, usize>>,
    pub reject_additions: AtomicBool,
    /// Drop this many confirmed piece ids from the tail of the response.
    pub confirm_shortfall: AtomicUsize,
    pub created_data_set_id: AtomicU64,
    pub data_set_state: Mutex<Option<DataSetState>>,
}

impl MockPdp {
    pub fn new(base: &str) -> Self {
        MockPdp {
            base: Url::parse(base).unwrap(),
            ping_ok: AtomicBool::new(true),
            pings: AtomicUsize::new(0),
            park_on_upload: AtomicBool::new(true),
            parked: Mutex::new(HashSet::new()),
            uploads: Mutex::new(Vec::new()),
            tx_counter: AtomicU64::new(1),
            add_calls: Mutex::new(Vec::new()),
            create_calls: Mutex::new(Vec::new()),
            polls_before_ready: AtomicUsize::new(0),
            poll_counts: Mutex::new(HashMap::new()),
            reject_additions: AtomicBool::new(false),
            confirm_shortfall: AtomicUsize::new(0),
            created_data_set_id: AtomicU64::new(1000),
            data_set_state: Mutex::new(None),
        }
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.ping_ok.store(ok, Ordering::SeqCst);
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    fn next_tx(&self) -> B256 {
        let n = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        B256::from(alloy_primitives::U256::from(n))
    }

    fn ready(&self, tx: B256) -> bool {
        let mut counts = self.poll_counts.lock().unwrap();
        let seen = counts.entry(tx).or_insert(0);
        *seen += 1;
        *seen > self.polls_before_ready.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PdpApi for MockPdp {
    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.ping_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Http {
                status: 503,
                url: self.base.to_string(),
            })
        }
    }

    async fn upload_piece(
        &self,
        source: UploadSource,
        precomputed: Option<PieceCid>,
    ) -> Result<(PieceCid, u64)> {
        let (cid, size) = match source {
            UploadSource::Buffer(bytes) => {
                let cid = match precomputed {
                    Some(cid) => cid,
                    None => {
                        let mut hasher = PieceHasher::new();
                        hasher.update(&bytes);
                        hasher.finalize()?
                    }
                };
                (cid, bytes.len() as u64)
            }
            UploadSource::Stream(_) => {
                let cid = precomputed.ok_or_else(|| {
                    Error::OptionsConflict("stream upload without piece CID".into())
                })?;
                (cid, 0)
            }
        };
        self.uploads.lock().unwrap().push(cid);
        if self.park_on_upload.load(Ordering::SeqCst) {
            self.parked.lock().unwrap().insert(cid);
        }
        Ok((cid, size))
    }

    async fn find_piece(&self, piece: &PieceCid) -> Result<bool> {
        Ok(self.parked.lock().unwrap().contains(piece))
    }

    async fn create_data_set(&self, request: &CreateDataSet) -> Result<CreateDataSetTicket> {
        let tx_hash = self.next_tx();
        self.create_calls.lock().unwrap().push(CreateCall {
            client_data_set_id: request.client_data_set_id,
            piece_count: request.pieces.len(),
            tx_hash,
        });
        Ok(CreateDataSetTicket {
            tx_hash,
            status_url: None,
        })
    }

    async fn add_pieces(
        &self,
        data_set_id: u64,
        client_data_set_id: u64,
        next_piece_id: u64,
        pieces: &[PieceEntry],
    ) -> Result<B256> {
        let tx_hash = self.next_tx();
        self.add_calls.lock().unwrap().push(AddCall {
            data_set_id,
            client_data_set_id,
            next_piece_id,
            piece_count: pieces.len(),
            tx_hash,
        });
        Ok(tx_hash)
    }

    async fn piece_addition_status(
        &self,
        _data_set_id: u64,
        tx_hash: B256,
    ) -> Result<Option<PieceAdditionStatus>> {
        let call = self
            .add_calls
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.tx_hash == tx_hash)
            .cloned();
        let Some(call) = call else { return Ok(None) };
        if !self.ready(tx_hash) {
            return Ok(Some(PieceAdditionStatus {
                tx_status: TxStatus::Pending,
                add_message_ok: None,
                confirmed_piece_ids: vec![],
            }));
        }
        if self.reject_additions.load(Ordering::SeqCst) {
            return Ok(Some(PieceAdditionStatus {
                tx_status: TxStatus::Confirmed,
                add_message_ok: Some(false),
                confirmed_piece_ids: vec![],
            }));
        }
        let shortfall = self.confirm_shortfall.load(Ordering::SeqCst);
        let confirmed: Vec<u64> = (call.next_piece_id
            ..call.next_piece_id + call.piece_count as u64)
            .take(call.piece_count.saturating_sub(shortfall))
            .collect();
        Ok(Some(PieceAdditionStatus {
            tx_status: TxStatus::Confirmed,
            add_message_ok: Some(true),
            confirmed_piece_ids: confirmed,
        }))
    }

    async fn data_set_creation_status(
        &self,
        tx_hash: B256,
    ) -> Result<Option<DataSetCreationStatus>> {
        let known = self
            .create_calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.tx_hash == tx_hash);
        if !known {
            return Ok(None);
        }
        if !self.ready(tx_hash) {
            return Ok(Some(DataSetCreationStatus {
                tx_mined: false,
                ..Default::default()
            }));
        }
        Ok(Some(DataSetCreationStatus {
            tx_mined: true,
            tx_success: true,
            data_set_live: true,
            server_confirmed: true,
            data_set_id: Some(self.created_data_set_id.load(Ordering::SeqCst)),
        }))
    }

    async fn get_data_set(&self, data_set_id: u64) -> Result<DataSetState> {
        self.data_set_state
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::DataSetNotFound(data_set_id))
    }

    async fn delete_piece(
        &self,
        _data_set_id: u64,
        _client_data_set_id: u64,
        _piece_id: u64,
    ) -> Result<B256> {
        Ok(self.next_tx())
    }

    async fn download_piece(&self, _piece: &PieceCid) -> Result<reqwest::Response> {
        Err(Error::Http {
            status: 501,
            url: self.base.to_string(),
        })
    }

    fn base_url(&self) -> &Url {
        &self.base
    }
}

/// Connector handing out [`MockPdp`] clients keyed by service URL.
pub(crate) struct MockConnect {
    fixed: Option<Arc<MockPdp>>,
    clients: Mutex<HashMap<String, Arc<MockPdp>>>,
}

impl MockConnect {
    /// Every provider answers pings.
    pub fn healthy() -> Self {
        MockConnect {
            fixed: None,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Every URL resolves to the one given client.
    pub fn with_client(client: Arc<MockPdp>) -> Self {
        MockConnect {
            fixed: Some(client),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn client_for(&self, url: &str) -> Arc<MockPdp> {
        if let Some(fixed) = &self.fixed {
            return fixed.clone();
        }
        self.clients
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(MockPdp::new(url)))
            .clone()
    }

    pub fn set_ping_ok(&self, url: &str, ok: bool) {
        self.client_for(url).set_ping_ok(ok);
    }
}

impl PdpConnect for MockConnect {
    fn connect(&self, base: Url) -> Arc<dyn PdpApi> {
        self.client_for(base.as_str())
    }
}
