//! Registry refinement loop
//!
//! DISCOVER → (REFINE → CHALLENGE → EVALUATE EXIT) × rounds → DONE
//!
//! Every step is a strictly sequential knowledge-source call whose input is
//! the previous step's registry. Parse failures always propagate: an empty
//! registry would look like "no change" and end the loop early.

use crate::config::RefinementConfig;
use crate::extract::extract;
use crate::knowledge::KnowledgeSource;
use crate::models::{ExitReason, Registry, RoundStats, Subject};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod parse;
pub mod prompts;

use parse::{parse_registry, reconcile};

/// Refinement state machine
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefinementPhase {
    Discovering,
    Refining { round: u32 },
    Challenging { round: u32, refine_stats: RoundStats },
    EvaluatingExit { round: u32 },
    Done { reason: ExitReason, rounds: u32 },
}

#[derive(Debug, Clone)]
pub struct RefinementOutcome {
    /// Final registry, sorted by descending confidence
    pub registry: Registry,
    pub exit_reason: ExitReason,
    pub rounds_completed: u32,
    /// Combined (refine + challenge) stats per completed round
    pub history: Vec<RoundStats>,
}

/// Exit check after a completed round, in precedence order.
pub fn evaluate_exit(
    registry: &Registry,
    combined: &RoundStats,
    round: u32,
    config: &RefinementConfig,
) -> Option<ExitReason> {
    if round >= config.max_rounds {
        return Some(ExitReason::IterationCap);
    }

    if round >= 1 && combined.total() == 0 {
        return Some(ExitReason::Stabilized);
    }

    if registry.all_confident_above(config.confidence_exit_threshold) {
        return Some(ExitReason::HighConfidence);
    }

    None
}

pub struct RefinementEngine {
    knowledge: Arc<dyn KnowledgeSource>,
    config: RefinementConfig,
    max_output_tokens: u32,
}

impl RefinementEngine {
    pub fn new(knowledge: Arc<dyn KnowledgeSource>, config: RefinementConfig) -> Self {
        Self {
            knowledge,
            config,
            max_output_tokens: 4000,
        }
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    /// Broad discovery: the initial registry.
    pub async fn discover(&self, subject: &Subject) -> Result<Registry> {
        let prompt = prompts::discovery_prompt(subject, &self.config);
        let empty = Registry::new(subject.ticker.clone(), Vec::new());
        self.call(subject, &empty, &prompt, prompts::DISCOVERY_INSTRUCTIONS)
            .await
    }

    /// Targeted refinement of `registry`.
    pub async fn refine(&self, subject: &Subject, registry: &Registry) -> Result<Registry> {
        let prompt = prompts::refinement_prompt(subject, registry, &self.config);
        self.call(subject, registry, &prompt, prompts::REFINEMENT_INSTRUCTIONS)
            .await
    }

    /// Adversarial challenge of `registry`.
    pub async fn challenge(&self, subject: &Subject, registry: &Registry) -> Result<Registry> {
        let prompt = prompts::challenge_prompt(subject, registry, &self.config);
        self.call(subject, registry, &prompt, prompts::CHALLENGE_INSTRUCTIONS)
            .await
    }

    async fn call(
        &self,
        subject: &Subject,
        previous: &Registry,
        prompt: &str,
        instructions: &str,
    ) -> Result<Registry> {
        let raw = self
            .knowledge
            .ask(prompt, instructions, true, self.max_output_tokens)
            .await?;

        let value = extract(&raw)?;
        let parsed = parse_registry(&value, &subject.ticker)?;
        let stats = reconcile(previous, &parsed.registry, parsed.reported);

        Ok(parsed.registry.with_round_stats(stats))
    }

    /// Run the full loop until an exit condition holds.
    pub async fn run(&self, subject: &Subject) -> Result<RefinementOutcome> {
        let mut registry = Registry::new(subject.ticker.clone(), Vec::new());
        let mut history: Vec<RoundStats> = Vec::new();
        let mut phase = RefinementPhase::Discovering;

        loop {
            debug!(?phase, ticker = %subject.ticker, "Refinement phase");

            phase = match phase {
                RefinementPhase::Discovering => {
                    registry = self.discover(subject).await?;
                    info!(
                        ticker = %subject.ticker,
                        factors = registry.len(),
                        avg_confidence = registry.avg_confidence(),
                        "Broad discovery complete"
                    );
                    self.check_band(&registry, 0);

                    if self.config.max_rounds == 0 {
                        RefinementPhase::Done {
                            reason: ExitReason::IterationCap,
                            rounds: 0,
                        }
                    } else {
                        RefinementPhase::Refining { round: 1 }
                    }
                }

                RefinementPhase::Refining { round } => {
                    registry = self.refine(subject, &registry).await?;
                    let refine_stats = registry.round_stats;
                    debug!(round, ?refine_stats, "Targeted pass complete");
                    RefinementPhase::Challenging { round, refine_stats }
                }

                RefinementPhase::Challenging { round, refine_stats } => {
                    registry = self.challenge(subject, &registry).await?;
                    let combined = refine_stats.combine(&registry.round_stats);

                    info!(
                        round,
                        added = combined.added,
                        retired = combined.retired,
                        modified = combined.modified,
                        avg_confidence = combined.avg_confidence,
                        source = ?combined.source,
                        "Refinement round complete"
                    );
                    self.check_band(&registry, round);

                    history.push(combined);
                    RefinementPhase::EvaluatingExit { round }
                }

                RefinementPhase::EvaluatingExit { round } => {
                    let combined = history.last().copied().unwrap_or_default();
                    match evaluate_exit(&registry, &combined, round, &self.config) {
                        Some(reason) => RefinementPhase::Done {
                            reason,
                            rounds: round,
                        },
                        None => RefinementPhase::Refining { round: round + 1 },
                    }
                }

                RefinementPhase::Done { reason, rounds } => {
                    info!(
                        ticker = %subject.ticker,
                        rounds,
                        reason = %reason,
                        factors = registry.len(),
                        "Exiting refinement"
                    );

                    return Ok(RefinementOutcome {
                        registry: registry.sorted_by_confidence(),
                        exit_reason: reason,
                        rounds_completed: rounds,
                        history,
                    });
                }
            };
        }
    }

    /// The factor band is a goal for the knowledge source, only observed here.
    fn check_band(&self, registry: &Registry, round: u32) {
        let len = registry.len();
        if len < self.config.factor_min || len > self.config.factor_max {
            warn!(
                round,
                factors = len,
                min = self.config.factor_min,
                max = self.config.factor_max,
                "Registry size outside target band"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HedgeError;
    use crate::knowledge::ScriptedKnowledgeSource;
    use crate::models::{DiffSource, Factor};
    use serde_json::json;

    fn subject() -> Subject {
        Subject::new("AAPL", 2779.8).with_name("Apple Inc.")
    }

    /// Registry response; `counts` = (added, retired, modified) when reported
    fn registry_json(factors: &[(&str, f64, f64)], counts: Option<(u32, u32, u32)>) -> String {
        let factors: Vec<_> = factors
            .iter()
            .map(|(id, s, e)| {
                json!({
                    "id": id,
                    "category": "driver",
                    "label": format!("label {}", id),
                    "description": "desc",
                    "salience": s,
                    "evidence_quality": e,
                    "confidence": s * e,
                })
            })
            .collect();

        let mut body = json!({ "ticker": "AAPL", "factors": factors });
        if let Some((a, r, m)) = counts {
            body["new_factors_added"] = json!(a);
            body["factors_retired"] = json!(r);
            body["factors_modified"] = json!(m);
        }
        format!("```json\n{}\n```", body)
    }

    fn engine(source: Arc<ScriptedKnowledgeSource>, max_rounds: u32) -> RefinementEngine {
        RefinementEngine::new(
            source,
            RefinementConfig {
                max_rounds,
                ..RefinementConfig::default()
            },
        )
    }

    const BASE: &[(&str, f64, f64)] = &[("f_001", 0.6, 0.5), ("f_002", 0.4, 0.5), ("f_003", 0.8, 0.5)];

    #[tokio::test]
    async fn test_stops_stabilized_at_round_one() {
        let source = Arc::new(ScriptedKnowledgeSource::from_responses([
            registry_json(BASE, Some((3, 0, 0))),
            registry_json(BASE, Some((0, 0, 0))),
            registry_json(BASE, Some((0, 0, 0))),
        ]));

        let outcome = engine(source.clone(), 5).run(&subject()).await.unwrap();

        assert_eq!(outcome.exit_reason, ExitReason::Stabilized);
        assert_eq!(outcome.rounds_completed, 1);
        assert_eq!(outcome.history.len(), 1);
        assert_eq!(outcome.history[0].total(), 0);
        assert_eq!(source.call_count().await, 3);
    }

    #[tokio::test]
    async fn test_runs_exactly_max_rounds_when_never_settling() {
        let max_rounds = 3;
        let mut responses = vec![registry_json(&[("f_000", 0.3, 0.5)], None)];
        for call in 1..=(2 * max_rounds) {
            let id = format!("f_{:03}", call);
            responses.push(registry_json(&[(id.as_str(), 0.3, 0.5)], None));
        }
        let source = Arc::new(ScriptedKnowledgeSource::from_responses(responses));

        let outcome = engine(source.clone(), max_rounds).run(&subject()).await.unwrap();

        assert_eq!(outcome.exit_reason, ExitReason::IterationCap);
        assert_eq!(outcome.rounds_completed, max_rounds);
        assert_eq!(outcome.history.len(), max_rounds as usize);
        assert!(outcome.history.iter().all(|s| s.total() > 0));
        assert_eq!(source.call_count().await, 1 + 2 * max_rounds as usize);
    }

    #[tokio::test]
    async fn test_high_confidence_exit() {
        let strong = &[("f_001", 0.9, 0.9), ("f_002", 0.95, 0.9)];
        let source = Arc::new(ScriptedKnowledgeSource::from_responses([
            registry_json(BASE, None),
            registry_json(strong, Some((0, 1, 2))),
            registry_json(strong, Some((0, 0, 1))),
        ]));

        let outcome = engine(source, 4).run(&subject()).await.unwrap();

        assert_eq!(outcome.exit_reason, ExitReason::HighConfidence);
        assert_eq!(outcome.rounds_completed, 1);
        assert_eq!(outcome.history[0].source, DiffSource::Reported);
        assert_eq!(outcome.history[0].total(), 4);
    }

    #[tokio::test]
    async fn test_zero_report_over_changed_registry_does_not_stabilize() {
        let changed = &[("f_001", 0.6, 0.5), ("f_009", 0.2, 0.5)];
        let source = Arc::new(ScriptedKnowledgeSource::from_responses([
            registry_json(BASE, None),
            registry_json(changed, Some((0, 0, 0))),
            registry_json(changed, Some((0, 0, 0))),
        ]));

        let outcome = engine(source, 1).run(&subject()).await.unwrap();

        // The cap is reached in round 1, but the round's diff must not read as zero.
        assert_eq!(outcome.exit_reason, ExitReason::IterationCap);
        assert_eq!(outcome.history[0].source, DiffSource::Computed);
        assert_eq!(outcome.history[0].added, 1);
        assert_eq!(outcome.history[0].retired, 2);
    }

    #[tokio::test]
    async fn test_parse_failure_propagates() {
        let source = Arc::new(ScriptedKnowledgeSource::from_responses([
            registry_json(BASE, None),
            registry_json(BASE, Some((0, 0, 0))),
            "I could not complete the search.".to_string(),
        ]));

        let err = engine(source, 3).run(&subject()).await.unwrap_err();
        assert!(matches!(err, HedgeError::ExtractionError(_)));
    }

    #[tokio::test]
    async fn test_transport_failure_propagates() {
        let source = Arc::new(ScriptedKnowledgeSource::from_results([
            Ok(registry_json(BASE, None)),
            Err(HedgeError::TransportError("429 Too Many Requests".to_string())),
        ]));

        let err = engine(source, 3).run(&subject()).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_zero_rounds_is_discovery_only() {
        let source = Arc::new(ScriptedKnowledgeSource::from_responses([registry_json(
            BASE, None,
        )]));

        let outcome = engine(source.clone(), 0).run(&subject()).await.unwrap();

        assert_eq!(outcome.exit_reason, ExitReason::IterationCap);
        assert_eq!(outcome.rounds_completed, 0);
        assert!(outcome.history.is_empty());
        assert_eq!(source.call_count().await, 1);
    }

    #[tokio::test]
    async fn test_final_registry_sorted_by_confidence() {
        let source = Arc::new(ScriptedKnowledgeSource::from_responses([
            registry_json(BASE, None),
            registry_json(BASE, Some((0, 0, 0))),
            registry_json(BASE, Some((0, 0, 0))),
        ]));

        let outcome = engine(source, 2).run(&subject()).await.unwrap();
        let ids: Vec<&str> = outcome.registry.factors().iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["f_003", "f_001", "f_002"]);
    }

    #[tokio::test]
    async fn test_calls_use_open_search_and_carry_registry() {
        let source = Arc::new(ScriptedKnowledgeSource::from_responses([
            registry_json(BASE, None),
            registry_json(BASE, Some((0, 0, 0))),
            registry_json(BASE, Some((0, 0, 0))),
        ]));

        engine(source.clone(), 2).run(&subject()).await.unwrap();

        let calls = source.calls().await;
        assert!(calls.iter().all(|c| c.allow_open_search));
        assert_eq!(calls[0].instructions, prompts::DISCOVERY_INSTRUCTIONS);
        assert!(calls[1].prompt.contains("\"AAPL label f_002\""));
        assert_eq!(calls[2].instructions, prompts::CHALLENGE_INSTRUCTIONS);
    }

    #[test]
    fn test_exit_precedence() {
        let config = RefinementConfig {
            max_rounds: 2,
            ..RefinementConfig::default()
        };
        let confident = Registry::new("AAPL", vec![Factor::new("a", "", "", "", 0.9, 0.9)]);
        let weak = Registry::new("AAPL", vec![Factor::new("a", "", "", "", 0.5, 0.5)]);
        let zero = RoundStats::default();
        let busy = RoundStats {
            modified: 1,
            ..RoundStats::default()
        };

        assert_eq!(evaluate_exit(&confident, &zero, 2, &config), Some(ExitReason::IterationCap));
        assert_eq!(evaluate_exit(&confident, &zero, 1, &config), Some(ExitReason::Stabilized));
        assert_eq!(evaluate_exit(&confident, &busy, 1, &config), Some(ExitReason::HighConfidence));
        assert_eq!(evaluate_exit(&weak, &busy, 1, &config), None);

        let empty = Registry::new("AAPL", vec![]);
        assert_eq!(evaluate_exit(&empty, &busy, 1, &config), None);
    }
}
