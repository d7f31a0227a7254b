//! Core data models for the factor hedge pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::warn;
use uuid::Uuid;

//
// ================= Subject =================
//

/// The holding whose drivers are researched and hedged
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subject {
    pub ticker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_basis: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
    pub market_value: f64,
}

impl Subject {
    pub fn new(ticker: impl Into<String>, market_value: f64) -> Self {
        Self {
            ticker: ticker.into(),
            name: None,
            asset_type: None,
            quantity: None,
            cost_basis: None,
            current_price: None,
            market_value,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

//
// ================= Factor =================
//

/// One driver hypothesis for a security.
///
/// `confidence` is derived: it is recomputed from `salience` and
/// `evidence_quality` and cannot be set on its own.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Factor {
    pub id: String,
    pub category: String,
    pub label: String,
    pub description: String,
    salience: f64,
    evidence_quality: f64,
    confidence: f64,
    pub search_queries: Vec<String>,
}

impl Factor {
    pub fn new(
        id: impl Into<String>,
        category: impl Into<String>,
        label: impl Into<String>,
        description: impl Into<String>,
        salience: f64,
        evidence_quality: f64,
    ) -> Self {
        let mut factor = Self {
            id: id.into(),
            category: category.into(),
            label: label.into(),
            description: description.into(),
            salience: 0.0,
            evidence_quality: 0.0,
            confidence: 0.0,
            search_queries: Vec::new(),
        };
        factor.set_scores(salience, evidence_quality);
        factor
    }

    pub fn salience(&self) -> f64 {
        self.salience
    }

    pub fn evidence_quality(&self) -> f64 {
        self.evidence_quality
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Update both scores; confidence follows.
    pub fn set_scores(&mut self, salience: f64, evidence_quality: f64) {
        self.salience = clamp_unit(salience);
        self.evidence_quality = clamp_unit(evidence_quality);
        self.confidence = self.salience * self.evidence_quality;
    }

    /// Same hypothesis content, ignoring id and search queries
    pub fn same_content(&self, other: &Factor) -> bool {
        self.category == other.category
            && self.label == other.label
            && self.description == other.description
            && (self.salience - other.salience).abs() < f64::EPSILON
            && (self.evidence_quality - other.evidence_quality).abs() < f64::EPSILON
    }
}

/// Clamp into [0, 1]; NaN becomes 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

//
// ================= Registry =================
//

/// Where a round's diff counts came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiffSource {
    /// Counts reported by the knowledge source were consistent and used as-is
    Reported,
    /// Counts computed by comparing factor ids and content
    #[default]
    Computed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct RoundStats {
    pub added: u32,
    pub retired: u32,
    pub modified: u32,
    pub avg_confidence: f64,
    #[serde(default)]
    pub source: DiffSource,
}

impl RoundStats {
    pub fn total(&self) -> u32 {
        self.added + self.retired + self.modified
    }

    /// Sum the counts of two consecutive calls; the later call's average wins.
    pub fn combine(&self, later: &RoundStats) -> RoundStats {
        RoundStats {
            added: self.added + later.added,
            retired: self.retired + later.retired,
            modified: self.modified + later.modified,
            avg_confidence: later.avg_confidence,
            source: if self.source == DiffSource::Reported && later.source == DiffSource::Reported {
                DiffSource::Reported
            } else {
                DiffSource::Computed
            },
        }
    }
}

/// The current authoritative set of factors for a subject
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Registry {
    pub subject_id: String,
    factors: Vec<Factor>,
    pub round_stats: RoundStats,
}

impl Registry {
    /// Build a registry, keeping the first factor for each id.
    pub fn new(subject_id: impl Into<String>, factors: Vec<Factor>) -> Self {
        let subject_id = subject_id.into();
        let mut seen = HashSet::with_capacity(factors.len());
        let mut unique = Vec::with_capacity(factors.len());

        for factor in factors {
            if seen.insert(factor.id.clone()) {
                unique.push(factor);
            } else {
                warn!(
                    subject_id = %subject_id,
                    factor_id = %factor.id,
                    "Dropping duplicate factor id"
                );
            }
        }

        let mut registry = Self {
            subject_id,
            factors: unique,
            round_stats: RoundStats::default(),
        };
        registry.round_stats.avg_confidence = registry.avg_confidence();
        registry
    }

    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Factor> {
        self.factors.iter().find(|f| f.id == id)
    }

    pub fn avg_confidence(&self) -> f64 {
        if self.factors.is_empty() {
            return 0.0;
        }
        self.factors.iter().map(Factor::confidence).sum::<f64>() / self.factors.len() as f64
    }

    /// Non-empty and every factor strictly above `threshold`
    pub fn all_confident_above(&self, threshold: f64) -> bool {
        !self.factors.is_empty() && self.factors.iter().all(|f| f.confidence() > threshold)
    }

    pub fn with_round_stats(mut self, stats: RoundStats) -> Self {
        self.round_stats = stats;
        self
    }

    /// Descending confidence; ties keep their current order.
    pub fn sorted_by_confidence(mut self) -> Self {
        self.factors
            .sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));
        self
    }

    /// A copy whose factors carry the given search queries (looked up by id).
    pub fn with_search_queries<F>(&self, mut queries_for: F) -> Self
    where
        F: FnMut(&Factor) -> Vec<String>,
    {
        let factors = self
            .factors
            .iter()
            .map(|factor| {
                let mut updated = factor.clone();
                updated.search_queries = queries_for(factor);
                updated
            })
            .collect();

        Self {
            subject_id: self.subject_id.clone(),
            factors,
            round_stats: self.round_stats,
        }
    }
}

//
// ================= Exit =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    IterationCap,
    Stabilized,
    HighConfidence,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::IterationCap => "iteration cap",
            ExitReason::Stabilized => "stabilized",
            ExitReason::HighConfidence => "high confidence",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Candidates =================
//

/// One mutually exclusive outcome under a candidate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubAlternative {
    pub ticker: String,
    pub side_a_label: Option<String>,
    pub side_b_label: Option<String>,
    pub side_a_price: Option<f64>,
    pub side_b_price: Option<f64>,
    pub last_price: Option<f64>,
}

/// One external market entry under consideration as a hedge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub unique_key: String,
    pub title: String,
    pub origin_query: String,
    pub group_id: Option<String>,
    #[serde(default)]
    pub factor_id: Option<String>,
    #[serde(default)]
    pub factor_label: Option<String>,
    #[serde(default)]
    pub sub_alternatives: Vec<SubAlternative>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredCandidate {
    #[serde(flatten)]
    pub candidate: Candidate,
    pub score: f64,
    pub rationale: String,
}

//
// ================= Positions =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Stance {
    Favor,
    Oppose,
    None,
}

impl fmt::Display for Stance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stance::Favor => "favor",
            Stance::Oppose => "oppose",
            Stance::None => "none",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    #[serde(flatten)]
    pub scored: ScoredCandidate,
    pub chosen_sub_alternative: Option<SubAlternative>,
    pub stance: Stance,
    #[serde(rename = "decision_rationale")]
    pub rationale: String,
    pub budget_amount: f64,
}

impl Position {
    /// A position for which no sub-alternative was chosen
    pub fn undecided(scored: ScoredCandidate) -> Self {
        Self {
            scored,
            chosen_sub_alternative: None,
            stance: Stance::None,
            rationale: String::new(),
            budget_amount: 0.0,
        }
    }

    pub fn is_decided(&self) -> bool {
        self.chosen_sub_alternative.is_some()
    }
}

//
// ================= Final Report =================
//

#[derive(Debug, Clone, Serialize)]
pub struct HedgeReport {
    pub run_id: Uuid,
    pub subject: Subject,
    pub registry: Registry,
    pub exit_reason: ExitReason,
    pub rounds_completed: u32,
    pub round_history: Vec<RoundStats>,
    pub candidates: Vec<Candidate>,
    pub scored: Vec<ScoredCandidate>,
    pub positions: Vec<Position>,
    pub total_budget: f64,
    pub reasoning_trace: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}
