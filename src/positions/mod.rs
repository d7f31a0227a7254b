//! Position Decider & budget apportionment
//!
//! One knowledge-source call per shortlisted candidate that has
//! sub-alternatives. The answer is validated against the candidate's own
//! sub-alternatives; anything unrecognized becomes "no decision".

use crate::catalog::first_string;
use crate::config::PositionConfig;
use crate::extract::{extract_with_policy, ExtractionPolicy};
use crate::knowledge::KnowledgeSource;
use crate::models::{Position, ScoredCandidate, Stance, SubAlternative, Subject};
use crate::Result;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DECISION_INSTRUCTIONS: &str =
    "You are a financial analyst choosing a hedge position. Return only valid JSON. No prose, no explanation, no markdown.";

const TICKER_FIELDS: &[&str] = &["sub_alternative_ticker", "sub_market_ticker", "ticker"];
const RATIONALE_FIELDS: &[&str] = &["rationale", "reasoning"];

/// A validated pick for one candidate
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub sub_alternative: SubAlternative,
    pub stance: Stance,
    pub rationale: String,
}

pub struct PositionDecider {
    knowledge: Arc<dyn KnowledgeSource>,
    config: PositionConfig,
    policy: ExtractionPolicy,
    max_output_tokens: u32,
}

impl PositionDecider {
    pub fn new(knowledge: Arc<dyn KnowledgeSource>, config: PositionConfig) -> Self {
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

    /// Decide every candidate (in input order), then apportion the budget.
    pub async fn take_positions(
        &self,
        subject: &Subject,
        shortlist: &[ScoredCandidate],
    ) -> Result<(Vec<Position>, f64)> {
        let positions = self.decide_all(subject, shortlist).await?;
        Ok(apportion_budget(
            positions,
            subject.market_value,
            self.config.hedge_ratio,
        ))
    }

    /// Positions with decisions but no budget yet.
    pub async fn decide_all(
        &self,
        subject: &Subject,
        shortlist: &[ScoredCandidate],
    ) -> Result<Vec<Position>> {
        stream::iter(shortlist)
            .map(|scored| self.decide(subject, scored))
            .buffered(self.config.max_concurrency.max(1))
            .try_collect()
            .await
    }

    pub async fn decide(&self, subject: &Subject, scored: &ScoredCandidate) -> Result<Position> {
        let candidate = &scored.candidate;
        let mut position = Position::undecided(scored.clone());

        if candidate.sub_alternatives.is_empty() {
            debug!(key = %candidate.unique_key, "No sub-alternatives, skipping decision");
            return Ok(position);
        }

        let prompt = decision_prompt(subject, scored);
        let raw = self
            .knowledge
            .ask(&prompt, DECISION_INSTRUCTIONS, true, self.max_output_tokens)
            .await?;
        let value = extract_with_policy(&raw, self.policy)?;

        match parse_decision(&value, &candidate.sub_alternatives) {
            Some(decision) => {
                info!(
                    key = %candidate.unique_key,
                    sub_alternative = %decision.sub_alternative.ticker,
                    stance = %decision.stance,
                    "Position decided"
                );
                position.chosen_sub_alternative = Some(decision.sub_alternative);
                position.stance = decision.stance;
                position.rationale = decision.rationale;
            }
            None => info!(key = %candidate.unique_key, "No usable decision"),
        }

        Ok(position)
    }
}

fn decision_prompt(subject: &Subject, scored: &ScoredCandidate) -> String {
    let candidate = &scored.candidate;
    let ticker = &subject.ticker;

    let subs: Vec<Value> = candidate
        .sub_alternatives
        .iter()
        .map(|s| {
            json!({
                "ticker": s.ticker,
                "yes_subtitle": s.side_a_label,
                "no_subtitle": s.side_b_label,
                "yes_price": s.side_a_price,
                "no_price": s.side_b_price,
                "last_price": s.last_price,
            })
        })
        .collect();

    format!(
        r#"Holding to hedge:
{holding}

Market:
- key: {key}
- title: {title}

Sub-markets (pick exactly ONE and decide yes or no):
{subs}

Choose the single best sub-market to hedge {ticker} and the stance to take.
- stance "yes" = buy YES contracts (the outcome happens).
- stance "no" = buy NO contracts (the outcome does not happen).

Take the side whose outcome would hurt {ticker}'s price or stability if it happened,
never the side that would benefit it. For example, for AAPL and "Apple releases new
product", take "no".

Return this JSON only:
{{
  "sub_alternative_ticker": "<exact ticker from the list>",
  "stance": "yes" or "no",
  "rationale": "<a few sentences on why this outcome would damage the holding>"
}}"#,
        holding = serde_json::to_string_pretty(subject).unwrap_or_else(|_| ticker.clone()),
        key = candidate.unique_key,
        title = candidate.title,
        subs = serde_json::to_string_pretty(&subs).unwrap_or_default(),
    )
}

/// Validate a decision against the candidate's sub-alternatives.
///
/// `None` when the ticker is missing or unknown, or the stance is missing.
pub fn parse_decision(value: &Value, sub_alternatives: &[SubAlternative]) -> Option<Decision> {
    let ticker = first_string(value, TICKER_FIELDS)?;
    let stance = parse_stance(value)?;

    let Some(sub_alternative) = sub_alternatives.iter().find(|s| s.ticker == ticker) else {
        warn!(ticker = %ticker, "Decision names an unknown sub-alternative");
        return None;
    };

    Some(Decision {
        sub_alternative: sub_alternative.clone(),
        stance,
        rationale: first_string(value, RATIONALE_FIELDS).unwrap_or_default(),
    })
}

// Any present stance other than an explicit favor reads as oppose.
fn parse_stance(value: &Value) -> Option<Stance> {
    let raw = first_string(value, &["stance"])?;
    match raw.to_lowercase().as_str() {
        "yes" | "favor" => Some(Stance::Favor),
        _ => Some(Stance::Oppose),
    }
}

/// Round half away from zero to cents.
///
/// Operates on the stored `f64`, so a value like 1.005 (held as
/// 1.00499...) rounds down to 1.00.
pub fn round_currency(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Split `market_value * ratio` evenly across decided positions.
///
/// Undecided positions get 0; with no decided positions every share is 0.
/// Returns the positions and the total budget.
pub fn apportion_budget(
    mut positions: Vec<Position>,
    market_value: f64,
    ratio: f64,
) -> (Vec<Position>, f64) {
    let total = (market_value * ratio).max(0.0);
    let decided = positions.iter().filter(|p| p.is_decided()).count();

    let share = if decided > 0 {
        round_currency(total / decided as f64)
    } else {
        0.0
    };

    for position in &mut positions {
        position.budget_amount = if position.is_decided() { share } else { 0.0 };
    }

    info!(
        total_budget = total,
        decided,
        share,
        "Budget apportioned"
    );

    (positions, round_currency(total))
}
