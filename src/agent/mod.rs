//! Main orchestrator - runs the hedge pipeline end to end
//!
//! DISCOVER → REFINE/CHALLENGE → QUERIES → CATALOG → SCORE → DECIDE → BUDGET

use crate::catalog::CandidateCatalog;
use crate::config::EngineConfig;
use crate::fanout::{build_query_plan, QueryFanout};
use crate::knowledge::KnowledgeSource;
use crate::models::{HedgeReport, Subject};
use crate::positions::PositionDecider;
use crate::refinement::RefinementEngine;
use crate::scoring::{rank_top_k, BatchScorer};
use crate::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Owns the injected collaborators; one `run` per subject.
pub struct HedgeOrchestrator {
    knowledge: Arc<dyn KnowledgeSource>,
    catalog: Arc<dyn CandidateCatalog>,
    config: EngineConfig,
}

impl HedgeOrchestrator {
    pub fn new(
        knowledge: Arc<dyn KnowledgeSource>,
        catalog: Arc<dyn CandidateCatalog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            knowledge,
            catalog,
            config,
        }
    }

    pub async fn run(&self, subject: Subject) -> Result<HedgeReport> {
        let start_time = Instant::now();
        let run_id = Uuid::new_v4();
        let mut reasoning_trace = Vec::new();
        let config = &self.config;

        info!(
            run_id = %run_id,
            ticker = %subject.ticker,
            market_value = subject.market_value,
            "Orchestrator: starting hedge run"
        );

        reasoning_trace.push(format!("INPUT: {} ({:.2})", subject.ticker, subject.market_value));

        // === REFINE ===
        let refinement = RefinementEngine::new(self.knowledge.clone(), config.refinement.clone())
            .with_max_output_tokens(config.discovery_max_tokens);
        let outcome = refinement.run(&subject).await?;

        for (i, stats) in outcome.history.iter().enumerate() {
            reasoning_trace.push(format!(
                "REFINE: round {} +{} -{} ~{} (avg confidence {:.3})",
                i + 1,
                stats.added,
                stats.retired,
                stats.modified,
                stats.avg_confidence
            ));
        }
        reasoning_trace.push(format!(
            "REFINE: {} factors, stopped on {} after {} round(s)",
            outcome.registry.len(),
            outcome.exit_reason,
            outcome.rounds_completed
        ));

        // === QUERIES ===
        let fanout = QueryFanout::new(
            self.knowledge.clone(),
            self.catalog.clone(),
            config.fanout.clone(),
        )
        .with_max_output_tokens(config.structured_max_tokens);

        let registry = fanout.generate_queries(&outcome.registry).await?;
        reasoning_trace.push(format!(
            "QUERIES: {} unique queries",
            build_query_plan(&registry).len()
        ));

        // === CATALOG ===
        let candidates = fanout.collect_candidates(&registry).await?;
        reasoning_trace.push(format!("CATALOG: {} unique candidates", candidates.len()));

        // === SCORE ===
        let scorer = BatchScorer::new(self.knowledge.clone(), config.scoring.clone())
            .with_policy(config.extraction_policy)
            .with_max_output_tokens(config.structured_max_tokens);

        let scored = scorer.score_all(&subject, &registry, &candidates).await?;
        let shortlist = rank_top_k(scored.clone(), config.scoring.top_k);

        debug!(
            shortlist = ?shortlist.iter().map(|s| s.candidate.unique_key.as_str()).collect::<Vec<_>>(),
            "Shortlist ranked"
        );
        reasoning_trace.push(format!(
            "SCORE: {} scored, top {} kept",
            scored.len(),
            shortlist.len()
        ));

        // === DECIDE + BUDGET ===
        let decider = PositionDecider::new(self.knowledge.clone(), config.positions.clone())
            .with_policy(config.extraction_policy)
            .with_max_output_tokens(config.structured_max_tokens);

        let (positions, total_budget) = decider.take_positions(&subject, &shortlist).await?;

        for position in &positions {
            match &position.chosen_sub_alternative {
                Some(sub) => reasoning_trace.push(format!(
                    "DECIDE: {} → {} {} ({:.2})",
                    position.scored.candidate.unique_key,
                    position.stance,
                    sub.ticker,
                    position.budget_amount
                )),
                None => reasoning_trace.push(format!(
                    "DECIDE: {} → no position",
                    position.scored.candidate.unique_key
                )),
            }
        }
        reasoning_trace.push(format!("BUDGET: {:.2} total", total_budget));

        let execution_time_ms = start_time.elapsed().as_millis() as u64;

        info!(
            run_id = %run_id,
            exit_reason = %outcome.exit_reason,
            candidates = candidates.len(),
            decided = positions.iter().filter(|p| p.is_decided()).count(),
            total_budget,
            execution_time_ms,
            "Orchestrator: hedge run complete"
        );

        Ok(HedgeReport {
            run_id,
            subject,
            registry,
            exit_reason: outcome.exit_reason,
            rounds_completed: outcome.rounds_completed,
            round_history: outcome.history,
            candidates,
            scored,
            positions,
            total_budget,
            reasoning_trace,
            created_at: Utc::now(),
            execution_time_ms,
        })
    }
}
