//! Kalshi-backed candidate catalog
//!
//! Searches events (with nested markets) and returns the raw records;
//! normalization happens in the parent module.

use super::CandidateCatalog;
use crate::error::HedgeError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::env;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.elections.kalshi.com/trade-api/v2";

/// Results returned per query
pub const DEFAULT_PAGE_SIZE: usize = 10;

// Keys that may hold the result array, in priority order.
const RESULT_KEYS: &[&str] = &["events", "series", "markets"];

#[derive(Clone)]
pub struct KalshiCatalog {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    page_size: usize,
}

impl KalshiCatalog {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// `KALSHI_API_BASE_URL` (defaults to the public v2 API), optional `KALSHI_API_KEY`
    pub fn from_env() -> Result<Self> {
        let base_url =
            env::var("KALSHI_API_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        let mut catalog = Self::new(base_url)?;
        catalog.api_key = env::var("KALSHI_API_KEY").ok().filter(|k| !k.is_empty());
        Ok(catalog)
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[async_trait]
impl CandidateCatalog for KalshiCatalog {
    async fn search(&self, query: &str) -> Result<Vec<Value>> {
        let url = format!("{}/events", self.base_url);
        let limit = self.page_size.to_string();

        let mut request = self.client.get(&url).query(&[
            ("query", query),
            ("limit", limit.as_str()),
            ("with_nested_markets", "true"),
        ]);

        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            HedgeError::TransportError(format!("Kalshi request failed for '{}': {}", query, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HedgeError::TransportError(format!(
                "Kalshi API returned {} for '{}': {}",
                status, query, body
            )));
        }

        let body = response.json::<Value>().await.map_err(|e| {
            HedgeError::TransportError(format!("Invalid JSON response from Kalshi: {}", e))
        })?;

        let records = result_page(body, self.page_size);
        debug!(query, count = records.len(), "Kalshi search complete");

        Ok(records)
    }
}

/// Pull the result array out of a response body and cap it at `page_size`.
fn result_page(body: Value, page_size: usize) -> Vec<Value> {
    let records = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => RESULT_KEYS
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    records.into_iter().take(page_size).collect()
}
