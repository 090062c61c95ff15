// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Subgraph-backed piece discovery: a GraphQL service indexing data sets
//! and their providers, queried by piece CID.

use crate::error::{Error, Result};
use crate::piece::PieceCid;
use alloy_primitives::Address;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use url::Url;

/// A provider advertising a piece, as reported by the subgraph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceProvider {
    pub address: Address,
    pub service_url: Url,
}

/// Discovery queries the retriever chain consumes. [`SubgraphService`]
/// is the GraphQL-over-HTTP implementation.
#[async_trait]
pub trait SubgraphApi: Send + Sync {
    async fn providers_for_piece(&self, piece: &PieceCid) -> Result<Vec<PieceProvider>>;
}

const PROVIDERS_QUERY: &str = r#"
query ProvidersForPiece($cid: String!) {
  pieces(where: { cid: $cid, removed: false }) {
    dataSet {
      serviceProvider { address serviceUrl }
    }
  }
}"#;

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<PiecesData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct PiecesData {
    pieces: Vec<PieceRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PieceRow {
    data_set: DataSetRow,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataSetRow {
    service_provider: ServiceProviderRow,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceProviderRow {
    address: Address,
    service_url: String,
}

/// GraphQL client for a warm-storage subgraph deployment.
pub struct SubgraphService {
    http: reqwest::Client,
    endpoint: Url,
}

impl SubgraphService {
    pub fn new(http: reqwest::Client, endpoint: Url) -> Self {
        SubgraphService { http, endpoint }
    }
}

#[async_trait]
impl SubgraphApi for SubgraphService {
    async fn providers_for_piece(&self, piece: &PieceCid) -> Result<Vec<PieceProvider>> {
        let body = json!({
            "query": PROVIDERS_QUERY,
            "variables": { "cid": piece.to_string() },
        });
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                url: self.endpoint.to_string(),
            });
        }
        let parsed: GraphQlResponse = response
            .json()
            .await
            .map_err(|e| Error::MalformedServerResponse(e.to_string()))?;
        if let Some(err) = parsed.errors.first() {
            return Err(Error::MalformedServerResponse(format!(
                "subgraph error: {}",
                err.message
            )));
        }
        let rows = parsed
            .data
            .ok_or_else(|| Error::MalformedServerResponse("subgraph returned no data".into()))?;

        let mut providers = Vec::new();
        for row in rows.pieces {
            let sp = row.data_set.service_provider;
            // rows with an unusable URL are dropped rather than failing
            // the whole discovery
            match Url::parse(&sp.service_url) {
                Ok(service_url) => providers.push(PieceProvider {
                    address: sp.address,
                    service_url,
                }),
                Err(e) => {
                    tracing::debug!(address = %sp.address, "dropping subgraph row: {e}");
                }
            }
        }
        providers.dedup_by_key(|p| p.address);
        Ok(providers)
    }
}
