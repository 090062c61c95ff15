// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! FilBeam stats service: per-data-set CDN egress quotas.

use crate::error::{Error, Result};
use crate::network::Network;
use alloy_primitives::U256;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

/// Remaining egress quotas for one data set, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSetStats {
    pub cdn_egress_quota: U256,
    pub cache_miss_egress_quota: U256,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsWire {
    cdn_egress_quota: String,
    cache_miss_egress_quota: String,
}

/// Client for the stats endpoint of the FilBeam CDN.
pub struct StatsClient {
    http: reqwest::Client,
    base: Url,
}

impl StatsClient {
    pub fn new(http: reqwest::Client, network: Network) -> Self {
        StatsClient {
            http,
            base: Url::parse(network.stats_base()).expect("static stats URLs parse"),
        }
    }

    pub fn with_base(http: reqwest::Client, base: Url) -> Self {
        StatsClient { http, base }
    }

    /// Quotas are served as decimal strings and converted to 256-bit
    /// integers; a missing data set maps to [`Error::DataSetNotFound`].
    pub async fn data_set_stats(&self, data_set_id: u64) -> Result<DataSetStats> {
        let url = self
            .base
            .join(&format!("data-set/{data_set_id}"))
            .expect("relative stats paths join");
        let response = self.http.get(url.clone()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::DataSetNotFound(data_set_id));
        }
        if !response.status().is_success() {
            return Err(Error::Http {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        let wire: StatsWire = response
            .json()
            .await
            .map_err(|e| Error::MalformedServerResponse(e.to_string()))?;
        Ok(DataSetStats {
            cdn_egress_quota: parse_quota(&wire.cdn_egress_quota)?,
            cache_miss_egress_quota: parse_quota(&wire.cache_miss_egress_quota)?,
        })
    }
}

fn parse_quota(value: &str) -> Result<U256> {
    U256::from_str_radix(value, 10)
        .map_err(|e| Error::MalformedServerResponse(format!("quota {value:?}: {e}")))
}
