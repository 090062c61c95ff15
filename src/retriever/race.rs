// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::error::{Error, Result};
use crate::pdp::PdpApi;
use crate::piece::{PieceCid, collect_validated};
use alloy_primitives::Address;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A provider taking part in a retrieval race.
pub(crate) struct Candidate {
    pub address: Address,
    pub client: Arc<dyn PdpApi>,
}

/// Race every candidate for the piece: each task checks piece presence
/// and then requests the body; the first successful response wins and all
/// other tasks are cancelled before validation begins. If every task
/// fails the per-provider reasons are collected into
/// [`Error::AllProvidersFailed`].
pub(crate) async fn race_download(
    candidates: Vec<Candidate>,
    piece: PieceCid,
    parent: &CancellationToken,
) -> Result<Vec<u8>> {
    if candidates.is_empty() {
        return Err(Error::AllProvidersFailed(vec![]));
    }

    let race_token = parent.child_token();
    let mut tasks = JoinSet::new();
    for candidate in candidates {
        let token = race_token.child_token();
        let address = candidate.address;
        let client = candidate.client;
        tasks.spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => Err("cancelled".to_string()),
                result = attempt(client, piece) => result.map_err(|e| e.to_string()),
            };
            (address, outcome)
        });
    }

    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (address, outcome) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                failures.push((Address::ZERO, format!("task failed: {e}")));
                continue;
            }
        };
        match outcome {
            Ok(response) => {
                // first success: stop the rest of the field before the
                // winning body is consumed
                race_token.cancel();
                tasks.abort_all();
                debug!(%address, %piece, "retrieval race won");
                return collect_validated(response.bytes_stream(), &piece, None).await;
            }
            Err(reason) => {
                trace!(%address, %piece, reason, "provider lost retrieval race");
                failures.push((address, reason));
            }
        }
    }
    Err(Error::AllProvidersFailed(failures))
}

async fn attempt(client: Arc<dyn PdpApi>, piece: PieceCid) -> Result<reqwest::Response> {
    if !client.find_piece(&piece).await? {
        return Err(Error::NoProvidersAvailable(
            "provider does not report the piece".into(),
        ));
    }
    client.download_piece(&piece).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdp::PdpClient;
    use axum::Router;
    use axum::extract::State;
    use axum::routing::get;
    use std::future::IntoFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use url::Url;

    #[derive(Clone)]
    struct PieceServer {
        payload: Vec<u8>,
        delay: Duration,
        status: u16,
        bodies_completed: Arc<AtomicUsize>,
    }

    async fn find_handler() -> ([(&'static str, &'static str); 1], String) {
        let cid = PieceCid::from_data(&payload()).unwrap();
        (
            [("content-type", "application/json")],
            format!(r#"{{"pieceCid":"{cid}","parked":true}}"#),
        )
    }

    async fn piece_handler(
        State(server): State<PieceServer>,
    ) -> (axum::http::StatusCode, Vec<u8>) {
        tokio::time::sleep(server.delay).await;
        let status = axum::http::StatusCode::from_u16(server.status).unwrap();
        server.bodies_completed.fetch_add(1, Ordering::SeqCst);
        (status, server.payload.clone())
    }

    fn payload() -> Vec<u8> {
        vec![0x42; 600]
    }

    async fn spawn_provider(server: PieceServer) -> Candidate {
        let app = Router::new()
            .route("/pdp/pieces/{cid}/find", get(find_handler))
            .route("/piece/{cid}", get(piece_handler))
            .with_state(server);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, app).into_future());
        let base = Url::parse(&format!("http://{addr}/")).unwrap();
        Candidate {
            address: Address::repeat_byte(addr.port() as u8),
            client: Arc::new(PdpClient::new(reqwest::Client::new(), base)),
        }
    }

    #[tokio::test]
    async fn first_success_wins_and_slow_providers_are_cancelled() {
        let slow_completed = Arc::new(AtomicUsize::new(0));
        let fast = spawn_provider(PieceServer {
            payload: payload(),
            delay: Duration::ZERO,
            status: 200,
            bodies_completed: Arc::new(AtomicUsize::new(0)),
        })
        .await;
        let slow = spawn_provider(PieceServer {
            payload: payload(),
            delay: Duration::from_secs(10),
            status: 200,
            bodies_completed: slow_completed.clone(),
        })
        .await;
        let broken = spawn_provider(PieceServer {
            payload: payload(),
            delay: Duration::ZERO,
            status: 500,
            bodies_completed: Arc::new(AtomicUsize::new(0)),
        })
        .await;

        let piece = PieceCid::from_data(&payload()).unwrap();
        let token = CancellationToken::new();
        let bytes = race_download(vec![fast, slow, broken], piece, &token)
            .await
            .unwrap();
        assert_eq!(bytes, payload());
        // the slow provider's response never finished before the race
        // resolved
        assert_eq!(slow_completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_failures_collapse_into_a_summary() {
        let a = spawn_provider(PieceServer {
            payload: payload(),
            delay: Duration::ZERO,
            status: 500,
            bodies_completed: Arc::new(AtomicUsize::new(0)),
        })
        .await;
        let b = spawn_provider(PieceServer {
            payload: payload(),
            delay: Duration::ZERO,
            status: 503,
            bodies_completed: Arc::new(AtomicUsize::new(0)),
        })
        .await;

        let piece = PieceCid::from_data(&payload()).unwrap();
        let token = CancellationToken::new();
        let err = race_download(vec![a, b], piece, &token).await.unwrap_err();
        match err {
            Error::AllProvidersFailed(failures) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn corrupted_winner_is_a_digest_mismatch() {
        let provider = spawn_provider(PieceServer {
            payload: vec![0x43; 600], // not the requested piece
            delay: Duration::ZERO,
            status: 200,
            bodies_completed: Arc::new(AtomicUsize::new(0)),
        })
        .await;
        let piece = PieceCid::from_data(&payload()).unwrap();
        let token = CancellationToken::new();
        let err = race_download(vec![provider], piece, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn empty_candidate_set_fails_immediately() {
        let piece = PieceCid::from_data(&payload()).unwrap();
        let token = CancellationToken::new();
        let err = race_download(vec![], piece, &token).await.unwrap_err();
        assert!(matches!(err, Error::AllProvidersFailed(f) if f.is_empty()));
    }
}
