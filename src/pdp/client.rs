// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::{
    CreateDataSet, CreateDataSetTicket, DataSetCreationStatus, DataSetPiece, DataSetState,
    PdpApi, PieceAdditionStatus, PieceEntry, TxStatus, UploadSource,
};
use crate::error::{Error, Result};
use crate::piece::{PieceCid, PieceHasher};
use crate::types::{MetadataMap, WITH_CDN_KEY};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Header carrying a precomputed piece CID alongside an upload body.
const PIECE_CID_HEADER: &str = "x-piece-cid";
/// Pings must answer quickly; slow providers are as bad as dead ones
/// during selection.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP implementation of [`PdpApi`], bound to one provider's service URL.
#[derive(Clone)]
pub struct PdpClient {
    http: reqwest::Client,
    base: Url,
}

impl PdpClient {
    pub fn new(http: reqwest::Client, mut base: Url) -> Self {
        // normalise so `join` keeps any base path the provider mounted
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        PdpClient { http, base }
    }

    fn endpoint(&self, path: &str) -> Url {
        self.base
            .join(path)
            .expect("relative api paths always join")
    }

    async fn parse_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let url = response.url().to_string();
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                url,
            });
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::MalformedServerResponse(format!("{url}: {e}")))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    piece_cid: PieceCid,
    size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindPieceResponse {
    #[allow(dead_code)]
    piece_cid: PieceCid,
    parked: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PieceEntryBody<'a> {
    piece_cid: String,
    metadata: &'a MetadataMap,
}

impl<'a> From<&'a PieceEntry> for PieceEntryBody<'a> {
    fn from(entry: &'a PieceEntry) -> Self {
        PieceEntryBody {
            piece_cid: entry.piece_cid.to_string(),
            metadata: &entry.metadata,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateDataSetBody<'a> {
    client_data_set_id: u64,
    payee: Address,
    record_keeper: Address,
    metadata: MetadataMap,
    pieces: Vec<PieceEntryBody<'a>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDataSetResponse {
    tx_hash: B256,
    #[serde(default)]
    status_url: Option<Url>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AddPiecesBody<'a> {
    client_data_set_id: u64,
    next_piece_id: u64,
    pieces: Vec<PieceEntryBody<'a>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxHashResponse {
    tx_hash: B256,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataSetPieceWire {
    piece_id: u64,
    piece_cid: PieceCid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataSetStateWire {
    id: u64,
    pieces: Vec<DataSetPieceWire>,
    next_challenge_epoch: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreationStatusWire {
    tx_status: TxStatus,
    create_message_ok: Option<bool>,
    data_set_created: bool,
    #[serde(default)]
    data_set_id: Option<u64>,
}

#[async_trait]
impl PdpApi for PdpClient {
    async fn ping(&self) -> Result<()> {
        let url = self.endpoint("pdp/ping");
        let response = self
            .http
            .get(url.clone())
            .timeout(PING_TIMEOUT)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::Http {
                status: response.status().as_u16(),
                url: url.to_string(),
            })
        }
    }

    async fn upload_piece(
        &self,
        source: UploadSource,
        precomputed: Option<PieceCid>,
    ) -> Result<(PieceCid, u64)> {
        let (body, precomputed) = match source {
            UploadSource::Buffer(bytes) => {
                let precomputed = match precomputed {
                    Some(cid) => cid,
                    None => {
                        let mut hasher = PieceHasher::new();
                        hasher.update(&bytes);
                        hasher.finalize()?
                    }
                };
                (reqwest::Body::from(bytes), precomputed)
            }
            UploadSource::Stream(body) => {
                let Some(precomputed) = precomputed else {
                    return Err(Error::OptionsConflict(
                        "streamed uploads require a precomputed piece CID".into(),
                    ));
                };
                (body, precomputed)
            }
        };

        let response = self
            .http
            .post(self.endpoint("pdp/pieces/upload"))
            .header(PIECE_CID_HEADER, precomputed.to_string())
            .body(body)
            .send()
            .await?;
        let parsed: UploadResponse = Self::parse_json(response).await?;
        if parsed.piece_cid != precomputed {
            return Err(Error::DigestMismatch {
                expected: precomputed.to_string(),
                got: parsed.piece_cid.to_string(),
            });
        }
        Ok((parsed.piece_cid, parsed.size))
    }

    async fn find_piece(&self, piece: &PieceCid) -> Result<bool> {
        let response = self
            .http
            .get(self.endpoint(&format!("pdp/pieces/{piece}/find")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let parsed: FindPieceResponse = Self::parse_json(response).await?;
        Ok(parsed.parked)
    }

    async fn create_data_set(&self, request: &CreateDataSet) -> Result<CreateDataSetTicket> {
        let mut metadata = request.metadata.clone();
        if request.with_cdn {
            metadata.insert(WITH_CDN_KEY.to_string(), String::new());
        }
        let body = CreateDataSetBody {
            client_data_set_id: request.client_data_set_id,
            payee: request.payee,
            record_keeper: request.record_keeper,
            metadata,
            pieces: request.pieces.iter().map(Into::into).collect(),
        };
        let response = self
            .http
            .post(self.endpoint("pdp/data-sets"))
            .json(&body)
            .send()
            .await?;
        let parsed: CreateDataSetResponse = Self::parse_json(response).await?;
        Ok(CreateDataSetTicket {
            tx_hash: parsed.tx_hash,
            status_url: parsed.status_url,
        })
    }

    async fn add_pieces(
        &self,
        data_set_id: u64,
        client_data_set_id: u64,
        next_piece_id: u64,
        pieces: &[PieceEntry],
    ) -> Result<B256> {
        let body = AddPiecesBody {
            client_data_set_id,
            next_piece_id,
            pieces: pieces.iter().map(Into::into).collect(),
        };
        let response = self
            .http
            .post(self.endpoint(&format!("pdp/data-sets/{data_set_id}/pieces")))
            .json(&body)
            .send()
            .await?;
        let parsed: TxHashResponse = Self::parse_json(response).await?;
        Ok(parsed.tx_hash)
    }

    async fn piece_addition_status(
        &self,
        data_set_id: u64,
        tx_hash: B256,
    ) -> Result<Option<PieceAdditionStatus>> {
        let response = self
            .http
            .get(self.endpoint(&format!("pdp/data-sets/{data_set_id}/pieces/added/{tx_hash}")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            // the server has not indexed the transaction yet
            return Ok(None);
        }
        Ok(Some(Self::parse_json(response).await?))
    }

    async fn data_set_creation_status(
        &self,
        tx_hash: B256,
    ) -> Result<Option<DataSetCreationStatus>> {
        let response = self
            .http
            .get(self.endpoint(&format!("pdp/data-sets/created/{tx_hash}")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let wire: CreationStatusWire = Self::parse_json(response).await?;
        Ok(Some(DataSetCreationStatus {
            tx_mined: wire.tx_status != TxStatus::Pending,
            tx_success: wire.tx_status == TxStatus::Confirmed
                && wire.create_message_ok != Some(false),
            data_set_live: wire.data_set_created,
            server_confirmed: wire.data_set_created,
            data_set_id: wire.data_set_id,
        }))
    }

    async fn get_data_set(&self, data_set_id: u64) -> Result<DataSetState> {
        let response = self
            .http
            .get(self.endpoint(&format!("pdp/data-sets/{data_set_id}")))
            .send()
            .await?;
        let wire: DataSetStateWire = Self::parse_json(response).await?;
        Ok(DataSetState {
            id: wire.id,
            pieces: wire
                .pieces
                .into_iter()
                .map(|p| DataSetPiece {
                    piece_id: p.piece_id,
                    piece_cid: p.piece_cid,
                })
                .collect(),
            next_challenge_epoch: wire.next_challenge_epoch,
        })
    }

    async fn delete_piece(
        &self,
        data_set_id: u64,
        client_data_set_id: u64,
        piece_id: u64,
    ) -> Result<B256> {
        let mut url = self.endpoint(&format!("pdp/data-sets/{data_set_id}/pieces/{piece_id}"));
        url.query_pairs_mut()
            .append_pair("clientDataSetId", &client_data_set_id.to_string());
        let response = self.http.delete(url).send().await?;
        let parsed: TxHashResponse = Self::parse_json(response).await?;
        Ok(parsed.tx_hash)
    }

    async fn download_piece(&self, piece: &PieceCid) -> Result<reqwest::Response> {
        let url = self.endpoint(&format!("piece/{piece}"));
        let response = self.http.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(Error::Http {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    fn base_url(&self) -> &Url {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use std::future::IntoFuture;

    async fn serve(app: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, app).into_future());
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    fn client(base: Url) -> PdpClient {
        PdpClient::new(reqwest::Client::new(), base)
    }

    fn sample_piece() -> PieceCid {
        PieceCid::from_data(&[0xaa; 256]).unwrap()
    }

    #[tokio::test]
    async fn ping_accepts_success_and_rejects_errors() {
        let app = Router::new().route("/pdp/ping", get(|| async { StatusCode::OK }));
        let ok = client(serve(app).await);
        ok.ping().await.unwrap();

        let app = Router::new()
            .route("/pdp/ping", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let down = client(serve(app).await);
        assert!(matches!(
            down.ping().await.unwrap_err(),
            Error::Http { status: 503, .. }
        ));
    }

    #[tokio::test]
    async fn upload_returns_server_acknowledged_cid() {
        let piece = PieceCid::from_data(b"hello warm storage, this is a piece payload").unwrap();
        let body = format!(r#"{{"pieceCid":"{piece}","size":44}}"#);
        let app = Router::new().route(
            "/pdp/pieces/upload",
            post(move || async move { ([("content-type", "application/json")], body) }),
        );
        let client = client(serve(app).await);
        let (cid, size) = client
            .upload_piece(
                UploadSource::Buffer(bytes::Bytes::from_static(
                    b"hello warm storage, this is a piece payload",
                )),
                None,
            )
            .await
            .unwrap();
        assert_eq!(cid, piece);
        assert_eq!(size, 44);
    }

    #[tokio::test]
    async fn upload_rejects_mismatched_server_cid() {
        let other = sample_piece();
        let body = format!(r#"{{"pieceCid":"{other}","size":5}}"#);
        let app = Router::new().route(
            "/pdp/pieces/upload",
            post(move || async move { ([("content-type", "application/json")], body) }),
        );
        let client = client(serve(app).await);
        let err = client
            .upload_piece(UploadSource::Buffer(bytes::Bytes::from_static(b"12345")), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn streamed_upload_without_cid_is_rejected() {
        let client = client(Url::parse("http://127.0.0.1:9/").unwrap());
        let err = client
            .upload_piece(UploadSource::Stream(reqwest::Body::from("data")), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OptionsConflict(_)));
    }

    #[tokio::test]
    async fn find_piece_maps_404_to_absent() {
        let piece = sample_piece();
        let parked = format!(r#"{{"pieceCid":"{piece}","parked":true}}"#);
        let app = Router::new().route(
            "/pdp/pieces/{cid}/find",
            get(move |Path(cid): Path<String>| async move {
                if cid == piece.to_string() {
                    (
                        StatusCode::OK,
                        [("content-type", "application/json")],
                        parked,
                    )
                } else {
                    (
                        StatusCode::NOT_FOUND,
                        [("content-type", "application/json")],
                        String::new(),
                    )
                }
            }),
        );
        let client = client(serve(app).await);
        assert!(client.find_piece(&piece).await.unwrap());
        let missing = PieceCid::from_data(&[1u8; 200]).unwrap();
        assert!(!client.find_piece(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_piece_cid_in_response_is_rejected() {
        let app = Router::new().route(
            "/pdp/pieces/{cid}/find",
            get(|| async {
                (
                    [("content-type", "application/json")],
                    r#"{"pieceCid":"not-a-cid","parked":true}"#,
                )
            }),
        );
        let client = client(serve(app).await);
        let err = client.find_piece(&sample_piece()).await.unwrap_err();
        assert!(matches!(err, Error::MalformedServerResponse(_)));
    }

    #[tokio::test]
    async fn piece_addition_status_parses_all_phases() {
        let app = Router::new().route(
            "/pdp/data-sets/{id}/pieces/added/{tx}",
            get(|| async {
                (
                    [("content-type", "application/json")],
                    r#"{"txStatus":"confirmed","addMessageOk":true,"confirmedPieceIds":[0,1,2]}"#,
                )
            }),
        );
        let confirmed = client(serve(app).await);
        let status = confirmed
            .piece_addition_status(1, B256::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.tx_status, TxStatus::Confirmed);
        assert_eq!(status.add_message_ok, Some(true));
        assert_eq!(status.confirmed_piece_ids, vec![0, 1, 2]);

        let app = Router::new().route(
            "/pdp/data-sets/{id}/pieces/added/{tx}",
            get(|| async { StatusCode::NOT_FOUND }),
        );
        let unknown = client(serve(app).await);
        assert!(unknown
            .piece_addition_status(1, B256::ZERO)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn add_pieces_posts_expected_body() {
        use axum::Json;
        let app = Router::new().route(
            "/pdp/data-sets/{id}/pieces",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["clientDataSetId"], 3);
                assert_eq!(body["nextPieceId"], 5);
                assert_eq!(body["pieces"].as_array().unwrap().len(), 1);
                (
                    [("content-type", "application/json")],
                    format!(r#"{{"txHash":"{:?}"}}"#, B256::repeat_byte(0x77)),
                )
            }),
        );
        let client = client(serve(app).await);
        let tx = client
            .add_pieces(
                9,
                3,
                5,
                &[PieceEntry {
                    piece_cid: sample_piece(),
                    metadata: MetadataMap::new(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(tx, B256::repeat_byte(0x77));
    }

    #[tokio::test]
    async fn get_data_set_is_strictly_validated() {
        // missing nextChallengeEpoch
        let app = Router::new().route(
            "/pdp/data-sets/{id}",
            get(|| async {
                (
                    [("content-type", "application/json")],
                    r#"{"id":4,"pieces":[]}"#,
                )
            }),
        );
        let client = client(serve(app).await);
        assert!(matches!(
            client.get_data_set(4).await.unwrap_err(),
            Error::MalformedServerResponse(_)
        ));
    }
}
