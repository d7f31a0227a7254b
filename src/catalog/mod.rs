//! Candidate catalog trait and record normalization
//!
//! Catalog records arrive with varying field names. They are normalized
//! into the fixed `Candidate` shape right here, on ingestion, so no other
//! stage ever looks at a raw record.

use crate::models::{Candidate, SubAlternative};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;
use tokio::sync::Mutex;

pub mod kalshi;
pub use kalshi::KalshiCatalog;

/// Trait for the external market catalog
#[async_trait]
pub trait CandidateCatalog: Send + Sync {
    /// One page of raw candidate records for `query`.
    async fn search(&self, query: &str) -> Result<Vec<Value>>;
}

// Priority-ordered source fields per normalized attribute.
const KEY_FIELDS: &[&str] = &["event_ticker", "series_ticker", "ticker", "event_title"];
const TITLE_FIELDS: &[&str] = &["event_title", "series_title", "title", "sub_title"];
const GROUP_FIELDS: &[&str] = &["event_ticker", "series_ticker"];
const SUB_ALTERNATIVES_FIELD: &str = "markets";
const SIDE_A_LABEL_FIELDS: &[&str] = &["yes_sub_title", "yes_subtitle"];
const SIDE_B_LABEL_FIELDS: &[&str] = &["no_sub_title", "no_subtitle"];
const SIDE_A_PRICE_FIELDS: &[&str] = &["yes_ask", "yes_bid", "yes_price"];
const SIDE_B_PRICE_FIELDS: &[&str] = &["no_ask", "no_bid", "no_price"];
const LAST_PRICE_FIELDS: &[&str] = &["last_price"];

impl Candidate {
    /// Normalize one raw catalog record returned for `origin_query`.
    pub fn from_record(record: &Value, origin_query: &str) -> Self {
        let unique_key =
            first_string(record, KEY_FIELDS).unwrap_or_else(|| content_key(record));

        let sub_alternatives = record
            .get(SUB_ALTERNATIVES_FIELD)
            .and_then(Value::as_array)
            .map(|markets| markets.iter().filter_map(sub_alternative).collect())
            .unwrap_or_default();

        Candidate {
            unique_key,
            title: first_string(record, TITLE_FIELDS).unwrap_or_default(),
            origin_query: origin_query.to_string(),
            group_id: first_string(record, GROUP_FIELDS),
            factor_id: None,
            factor_label: None,
            sub_alternatives,
        }
    }
}

fn sub_alternative(market: &Value) -> Option<SubAlternative> {
    Some(SubAlternative {
        ticker: first_string(market, &["ticker"])?,
        side_a_label: first_string(market, SIDE_A_LABEL_FIELDS),
        side_b_label: first_string(market, SIDE_B_LABEL_FIELDS),
        side_a_price: first_number(market, SIDE_A_PRICE_FIELDS),
        side_b_price: first_number(market, SIDE_B_PRICE_FIELDS),
        last_price: first_number(market, LAST_PRICE_FIELDS),
    })
}

/// First non-empty string (or number, stringified) among `fields`.
pub(crate) fn first_string(record: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| match record.get(*field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// First number (or numeric string) among `fields`.
pub(crate) fn first_number(record: &Value, fields: &[&str]) -> Option<f64> {
    fields.iter().find_map(|field| match record.get(*field)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

/// Dedup key for records carrying no identifier: SHA256 of the canonical JSON.
fn content_key(record: &Value) -> String {
    let mut hasher = Sha256::new();

    // Stream JSON directly into hasher (no intermediate String)
    if serde_json::to_writer(&mut HashWriter(&mut hasher), record).is_err() {
        return format!("raw:{}", record);
    }

    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

//
// ========== In-memory catalog ==========
//

/// Fixed query → page catalog for development & testing
#[derive(Default)]
pub struct StaticCatalog {
    pages: HashMap<String, Vec<Value>>,
    failures: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<String>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, query: impl Into<String>, records: Vec<Value>) -> Self {
        self.pages.insert(query.into(), records);
        self
    }

    /// `query` fails with a transport error carrying `message`.
    pub fn with_failure(mut self, query: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures.insert(query.into(), message.into());
        self
    }

    /// `query` answers only after `delay`.
    pub fn with_delay(mut self, query: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(query.into(), delay);
        self
    }

    /// Queries in the order they were received
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl CandidateCatalog for StaticCatalog {
    async fn search(&self, query: &str) -> Result<Vec<Value>> {
        self.calls.lock().await.push(query.to_string());

        if let Some(delay) = self.delays.get(query) {
            tokio::time::sleep(*delay).await;
        }

        if let Some(message) = self.failures.get(query) {
            return Err(crate::error::HedgeError::TransportError(message.clone()));
        }

        Ok(self.pages.get(query).cloned().unwrap_or_default())
    }
}
