//! Batch Scorer
//!
//! Candidates are scored in fixed-size batches, one knowledge-source call
//! per batch, with `unique_key` as the correlation field. Unmatched
//! candidates score 0, so ranking is total and deterministic.

use crate::catalog::{first_number, first_string};
use crate::config::ScoringConfig;
use crate::extract::{extract_with_policy, ExtractionPolicy};
use crate::knowledge::KnowledgeSource;
use crate::models::{clamp_unit, Candidate, Registry, ScoredCandidate, Subject};
use crate::Result;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SCORING_INSTRUCTIONS: &str =
    "You are a financial analyst. Return only valid JSON. No prose, no explanation, no markdown.";

const KEY_FIELDS: &[&str] = &["unique_key", "event_ticker", "key"];
const RATIONALE_FIELDS: &[&str] = &["rationale", "reasoning"];

/// Score and rationale for one key, as returned by the knowledge source
#[derive(Debug, Clone, PartialEq)]
pub struct BatchScore {
    pub score: f64,
    pub rationale: String,
}

pub struct BatchScorer {
    knowledge: Arc<dyn KnowledgeSource>,
    config: ScoringConfig,
    policy: ExtractionPolicy,
    max_output_tokens: u32,
}

impl BatchScorer {
    pub fn new(knowledge: Arc<dyn KnowledgeSource>, config: ScoringConfig) -> Self {
        Self {
            knowledge,
            config,
            policy: ExtractionPolicy::Strict,
            max_output_tokens: 2000,
        }
    }

    pub fn with_policy(mut self, policy: ExtractionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    /// Every candidate with its score attached, in input order.
    pub async fn score_all(
        &self,
        subject: &Subject,
        registry: &Registry,
        candidates: &[Candidate],
    ) -> Result<Vec<ScoredCandidate>> {
        let batch_size = self.config.batch_size.max(1);
        let batches: Vec<&[Candidate]> = candidates.chunks(batch_size).collect();

        info!(
            candidates = candidates.len(),
            batches = batches.len(),
            batch_size,
            "Scoring candidates"
        );

        let results: Vec<HashMap<String, BatchScore>> = stream::iter(batches.iter().enumerate())
            .map(|(index, batch)| self.score_batch(index, subject, registry, batch))
            .buffered(self.config.max_concurrency.max(1))
            .try_collect()
            .await?;

        Ok(merge_scores(&batches, &results))
    }

    /// `score_all`, ranked and cut to the configured top-K.
    pub async fn shortlist(
        &self,
        subject: &Subject,
        registry: &Registry,
        candidates: &[Candidate],
    ) -> Result<Vec<ScoredCandidate>> {
        let scored = self.score_all(subject, registry, candidates).await?;
        Ok(rank_top_k(scored, self.config.top_k))
    }

    async fn score_batch(
        &self,
        index: usize,
        subject: &Subject,
        registry: &Registry,
        batch: &[Candidate],
    ) -> Result<HashMap<String, BatchScore>> {
        let prompt = scoring_prompt(subject, registry, batch);
        let raw = self
            .knowledge
            .ask(&prompt, SCORING_INSTRUCTIONS, true, self.max_output_tokens)
            .await?;

        let value = extract_with_policy(&raw, self.policy)?;
        let keys: HashSet<&str> = batch.iter().map(|c| c.unique_key.as_str()).collect();
        let scores = parse_batch_scores(&value, &keys);

        info!(
            batch = index + 1,
            size = batch.len(),
            matched = scores.len(),
            "Batch scored"
        );

        Ok(scores)
    }
}

fn scoring_prompt(subject: &Subject, registry: &Registry, batch: &[Candidate]) -> String {
    let ticker = &subject.ticker;

    let factors: Vec<Value> = registry
        .factors()
        .iter()
        .map(|f| {
            json!({
                "id": f.id,
                "category": f.category,
                "label": f.label,
                "description": f.description,
                "confidence": f.confidence(),
            })
        })
        .collect();

    let rows: Vec<Value> = batch
        .iter()
        .map(|c| {
            json!({
                "unique_key": c.unique_key,
                "title": c.title,
                "factor": c.factor_label,
            })
        })
        .collect();

    format!(
        r#"Score how well each prediction market below could hedge a holding in {ticker}.
Use web search, your knowledge of {ticker} and its sector, and the factor registry.

Holding:
{holding}

Factor registry (drivers for this security):
{factors}

Markets to score:
{rows}

Scoring rules:
- Score each market from 0 to 1: how likely it is to hedge the holding's price.
- High score: a clear inverse relationship can be built, e.g. an earnings-miss market for the company itself.
- Around 0.5: likely uncorrelated with the holding.
- Low score: no usable relationship, or hard to hedge with.
- Echo each "unique_key" exactly as given so results can be matched.

Return this JSON only:
{{
  "scores": [
    {{ "unique_key": "<exact unique_key>", "score": <0-1>, "rationale": "<one sentence on how the market hedges the holding>" }}
  ]
}}"#,
        holding = pretty(subject),
        factors = pretty(&factors),
        rows = pretty(&rows),
    )
}

fn pretty<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

/// Scores keyed by `unique_key`, restricted to `batch_keys`.
///
/// Accepts `{"scores": [...]}` or a bare array. Within one response the
/// first entry per key wins; keys outside the batch are dropped.
pub fn parse_batch_scores(value: &Value, batch_keys: &HashSet<&str>) -> HashMap<String, BatchScore> {
    let entries = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map
            .get("scores")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[],
    };

    let mut scores = HashMap::with_capacity(entries.len());

    for entry in entries {
        let Some(key) = first_string(entry, KEY_FIELDS) else {
            debug!(?entry, "Score entry without key");
            continue;
        };

        if !batch_keys.contains(key.as_str()) {
            warn!(key = %key, "Score for a key outside this batch, ignoring");
            continue;
        }

        scores.entry(key).or_insert_with(|| BatchScore {
            score: clamp_unit(first_number(entry, &["score"]).unwrap_or(0.0)),
            rationale: first_string(entry, RATIONALE_FIELDS).unwrap_or_default(),
        });
    }

    scores
}

/// Attach each batch's scores to its candidates; unmatched ones score 0.
pub fn merge_scores(
    batches: &[&[Candidate]],
    results: &[HashMap<String, BatchScore>],
) -> Vec<ScoredCandidate> {
    batches
        .iter()
        .zip(results)
        .flat_map(|(batch, scores)| {
            batch.iter().map(move |candidate| {
                let (score, rationale) = scores
                    .get(&candidate.unique_key)
                    .map(|s| (s.score, s.rationale.clone()))
                    .unwrap_or((0.0, String::new()));

                ScoredCandidate {
                    candidate: candidate.clone(),
                    score,
                    rationale,
                }
            })
        })
        .collect()
}

/// Stable descending sort by score, cut to `k`.
pub fn rank_top_k(mut scored: Vec<ScoredCandidate>, k: usize) -> Vec<ScoredCandidate> {
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HedgeError;
    use crate::knowledge::ScriptedKnowledgeSource;
    use std::time::Duration;

    fn candidate(key: &str) -> Candidate {
        Candidate {
            unique_key: key.to_string(),
            title: format!("title {}", key),
            origin_query: "q".to_string(),
            group_id: None,
            factor_id: None,
            factor_label: None,
            sub_alternatives: vec![],
        }
    }

    fn keys(scored: &[ScoredCandidate]) -> Vec<&str> {
        scored.iter().map(|s| s.candidate.unique_key.as_str()).collect()
    }

    fn scorer(source: Arc<ScriptedKnowledgeSource>) -> BatchScorer {
        BatchScorer::new(source, ScoringConfig::default())
    }

    /// Scores every `C..` key that appears in the prompt.
    fn echo_scores(overrides: &'static [(&'static str, f64)]) -> ScriptedKnowledgeSource {
        ScriptedKnowledgeSource::from_fn(move |req| {
            let entries: Vec<Value> = (0..64)
                .map(|i| format!("C{:02}", i))
                .filter(|key| req.prompt.contains(&format!("\"{}\"", key)))
                .map(|key| {
                    let score = overrides
                        .iter()
                        .find(|(k, _)| *k == key)
                        .map(|(_, s)| *s)
                        .unwrap_or(0.2);
                    json!({"unique_key": key, "score": score, "rationale": "r"})
                })
                .collect();
            Ok(json!({ "scores": entries }).to_string())
        })
    }

    #[tokio::test]
    async fn test_batches_preserve_order_and_ties() {
        let candidates: Vec<Candidate> = (0..32).map(|i| candidate(&format!("C{:02}", i))).collect();
        let source = Arc::new(echo_scores(&[("C03", 0.5), ("C07", 0.5), ("C20", 0.9)]));
        let registry = Registry::new("AAPL", vec![]);
        let subject = Subject::new("AAPL", 500.0);

        let scorer = scorer(source.clone());
        let merged = scorer.score_all(&subject, &registry, &candidates).await.unwrap();

        assert_eq!(source.call_count().await, 3);
        let expected: Vec<String> = (0..32).map(|i| format!("C{:02}", i)).collect();
        assert_eq!(keys(&merged), expected.iter().map(String::as_str).collect::<Vec<_>>());

        let top = rank_top_k(merged, 3);
        assert_eq!(keys(&top), vec!["C20", "C03", "C07"]);
    }

    #[tokio::test]
    async fn test_merge_order_ignores_batch_completion_order() {
        let candidates: Vec<Candidate> = (0..32).map(|i| candidate(&format!("C{:02}", i))).collect();
        // Batch 1 answers last, batch 3 first.
        let source = Arc::new(
            echo_scores(&[("C00", 0.4), ("C15", 0.6), ("C30", 0.8)]).with_delay(|req| {
                if req.prompt.contains("\"C00\"") {
                    Some(Duration::from_millis(60))
                } else if req.prompt.contains("\"C15\"") {
                    Some(Duration::from_millis(30))
                } else {
                    None
                }
            }),
        );

        let merged = scorer(source.clone())
            .score_all(&Subject::new("AAPL", 1.0), &Registry::new("AAPL", vec![]), &candidates)
            .await
            .unwrap();

        assert_eq!(source.call_count().await, 3);
        let expected: Vec<String> = (0..32).map(|i| format!("C{:02}", i)).collect();
        assert_eq!(keys(&merged), expected.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(merged[0].score, 0.4);
        assert_eq!(merged[15].score, 0.6);
        assert_eq!(merged[30].score, 0.8);
        assert_eq!(merged[31].score, 0.2);
    }

    #[tokio::test]
    async fn test_unknown_and_missing_keys() {
        let source = Arc::new(ScriptedKnowledgeSource::from_responses([
            r#"Here you go: {"scores": [
                {"event_ticker": "A", "score": "0.8", "reasoning": "earnings"},
                {"unique_key": "A", "score": 0.1},
                {"unique_key": "ZZZ", "score": 1.0},
                {"unique_key": "B", "score": 3}
            ]}"#,
        ]));
        let candidates = vec![candidate("A"), candidate("B"), candidate("C")];

        let merged = scorer(source)
            .score_all(&Subject::new("AAPL", 1.0), &Registry::new("AAPL", vec![]), &candidates)
            .await
            .unwrap();

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].score, 0.8);
        assert_eq!(merged[0].rationale, "earnings");
        assert_eq!(merged[1].score, 1.0);
        assert_eq!(merged[2].score, 0.0);
        assert!(merged[2].rationale.is_empty());
    }

    #[tokio::test]
    async fn test_strict_policy_propagates_extraction_error() {
        let source = Arc::new(ScriptedKnowledgeSource::from_responses(["I cannot score these."]));
        let err = scorer(source)
            .score_all(&Subject::new("AAPL", 1.0), &Registry::new("AAPL", vec![]), &[candidate("A")])
            .await
            .unwrap_err();
        assert!(matches!(err, HedgeError::ExtractionError(_)));
    }

    #[tokio::test]
    async fn test_lenient_policy_zeroes_batch() {
        let source = Arc::new(ScriptedKnowledgeSource::from_responses(["I cannot score these."]));
        let merged = scorer(source)
            .with_policy(ExtractionPolicy::EmptyOnFailure)
            .score_all(&Subject::new("AAPL", 1.0), &Registry::new("AAPL", vec![]), &[candidate("A")])
            .await
            .unwrap();
        assert_eq!(merged[0].score, 0.0);
    }

    #[tokio::test]
    async fn test_shortlist_and_prompt() {
        let source = Arc::new(echo_scores(&[("C01", 0.7)]));
        let candidates = vec![candidate("C00"), candidate("C01")];

        let top = BatchScorer::new(source.clone(), ScoringConfig { top_k: 1, ..Default::default() })
            .shortlist(&Subject::new("AAPL", 1.0), &Registry::new("AAPL", vec![]), &candidates)
            .await
            .unwrap();
        assert_eq!(keys(&top), vec!["C01"]);

        let calls = source.calls().await;
        assert!(calls[0].allow_open_search);
        assert!(calls[0].prompt.contains("\"unique_key\": \"C00\""));
    }

    #[test]
    fn test_empty_input_makes_no_calls() {
        let source = Arc::new(ScriptedKnowledgeSource::from_responses(Vec::<String>::new()));
        let merged = tokio_test::block_on(scorer(source.clone()).score_all(
            &Subject::new("AAPL", 1.0),
            &Registry::new("AAPL", vec![]),
            &[],
        ))
        .unwrap();
        assert!(merged.is_empty());
        assert_eq!(tokio_test::block_on(source.call_count()), 0);
    }
}
