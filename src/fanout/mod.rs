//! Query fan-out and candidate deduplication
//!
//! Factors → search queries → one catalog call per unique query →
//! normalized candidates, deduplicated by `unique_key`.
//!
//! Conflicts resolve first-write-wins in a fixed order: factor order for
//! queries, query submission order for candidates. Catalog calls run
//! concurrently but results are consumed in submission order, so the
//! outcome never depends on which response arrives first.

use crate::catalog::CandidateCatalog;
use crate::config::FanoutConfig;
use crate::extract::extract;
use crate::knowledge::KnowledgeSource;
use crate::models::{Candidate, Factor, Registry};
use crate::Result;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const QUERY_INSTRUCTIONS: &str =
    "You generate short search phrases for finding prediction markets. Return a JSON array of strings only. No markdown, no explanation.";

// Object keys that may hold the query list.
const QUERY_KEYS: &[&str] = &["queries", "terms", "search_terms"];

/// A unique query and the factor that claimed it first
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryAssignment {
    pub query: String,
    pub factor_id: String,
    pub factor_label: String,
}

pub struct QueryFanout {
    knowledge: Arc<dyn KnowledgeSource>,
    catalog: Arc<dyn CandidateCatalog>,
    config: FanoutConfig,
    max_output_tokens: u32,
}

impl QueryFanout {
    pub fn new(
        knowledge: Arc<dyn KnowledgeSource>,
        catalog: Arc<dyn CandidateCatalog>,
        config: FanoutConfig,
    ) -> Self {
        Self {
            knowledge,
            catalog,
            config,
            max_output_tokens: 2000,
        }
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    /// A copy of `registry` whose factors carry generated search queries.
    pub async fn generate_queries(&self, registry: &Registry) -> Result<Registry> {
        let generated: Vec<Vec<String>> = stream::iter(registry.factors())
            .map(|factor| self.queries_for(factor))
            .buffered(self.config.max_concurrency.max(1))
            .try_collect()
            .await?;

        let mut by_id: HashMap<&str, Vec<String>> = registry
            .factors()
            .iter()
            .map(|f| f.id.as_str())
            .zip(generated)
            .collect();

        let total: usize = by_id.values().map(Vec::len).sum();
        info!(factors = registry.len(), queries = total, "Search queries generated");

        Ok(registry.with_search_queries(|f| by_id.remove(f.id.as_str()).unwrap_or_default()))
    }

    async fn queries_for(&self, factor: &Factor) -> Result<Vec<String>> {
        let prompt = query_prompt(factor, &self.config);
        let raw = self
            .knowledge
            .ask(&prompt, QUERY_INSTRUCTIONS, true, self.max_output_tokens)
            .await?;

        let queries = parse_queries(&raw, self.config.queries_max);
        debug!(factor_id = %factor.id, ?queries, "Factor queries");
        Ok(queries)
    }

    /// Dispatch every unique query and return deduplicated candidates.
    pub async fn collect_candidates(&self, registry: &Registry) -> Result<Vec<Candidate>> {
        let plan = build_query_plan(registry);
        info!(
            unique_queries = plan.len(),
            queries = ?plan.iter().map(|a| a.query.as_str()).collect::<Vec<_>>(),
            "Dispatching catalog searches"
        );

        // `buffered` yields in submission order regardless of completion order.
        let pages: Vec<Vec<Value>> = stream::iter(plan.iter())
            .map(|assignment| self.catalog.search(&assignment.query))
            .buffered(self.config.max_concurrency.max(1))
            .try_collect()
            .await?;

        let raw = attribute_pages(&plan, pages);
        let raw_count = raw.len();
        let unique = dedup_candidates(raw);

        info!(
            raw = raw_count,
            unique = unique.len(),
            "Catalog results deduplicated"
        );

        Ok(unique)
    }
}

fn query_prompt(factor: &Factor, config: &FanoutConfig) -> String {
    format!(
        r#"Factor: "{label}"
Description: {description}

Generate {min}-{max} short, concrete search phrases someone would type to find prediction
markets or events tied to this factor (e.g. "chip export ban", "fed rate cut june").
Web search is optional. Return only a JSON array of strings."#,
        label = factor.label,
        description = factor.description,
        min = config.queries_min,
        max = config.queries_max,
    )
}

/// Query list from a knowledge-source answer.
///
/// Unparsable text becomes a single query: a bad fallback here only costs
/// one wasted catalog call.
pub fn parse_queries(raw: &str, max: usize) -> Vec<String> {
    let items: Vec<String> = match extract(raw) {
        Ok(Value::Array(items)) => items.iter().map(query_text).collect(),
        Ok(Value::Object(map)) => QUERY_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .map(|items| items.iter().map(query_text).collect())
            .unwrap_or_default(),
        Ok(_) => Vec::new(),
        Err(e) => {
            warn!(error = %e, "Query list not parsable, using raw text as one query");
            vec![raw.trim().to_string()]
        }
    };

    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|q| !q.is_empty() && seen.insert(q.clone()))
        .take(max)
        .collect()
}

fn query_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Unique queries in factor order; the first factor to claim a query keeps it.
pub fn build_query_plan(registry: &Registry) -> Vec<QueryAssignment> {
    let mut seen = HashSet::new();
    let mut plan = Vec::new();

    for factor in registry.factors() {
        for query in &factor.search_queries {
            let query = query.trim();
            if query.is_empty() || !seen.insert(query.to_string()) {
                continue;
            }
            plan.push(QueryAssignment {
                query: query.to_string(),
                factor_id: factor.id.clone(),
                factor_label: factor.label.clone(),
            });
        }
    }

    plan
}

/// Normalize pages (in plan order) and tag each candidate with its query's factor.
fn attribute_pages(plan: &[QueryAssignment], pages: Vec<Vec<Value>>) -> Vec<Candidate> {
    plan.iter()
        .zip(pages)
        .flat_map(|(assignment, page)| {
            page.into_iter().map(move |record| {
                let mut candidate = Candidate::from_record(&record, &assignment.query);
                candidate.factor_id = Some(assignment.factor_id.clone());
                candidate.factor_label = Some(assignment.factor_label.clone());
                candidate
            })
        })
        .collect()
}

/// Keep the first candidate per `unique_key`. Idempotent.
pub fn dedup_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::with_capacity(candidates.len());
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.unique_key.clone()))
        .collect()
}
