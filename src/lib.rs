//! Factor Hedge Orchestrator
//!
//! Researches what drives a holding's price and turns that research into
//! prediction-market hedges:
//! - Builds a factor registry and refines it over targeted and adversarial rounds
//! - Fans factors out into catalog searches, deduplicating candidates
//! - Scores candidates in batches and keeps a top-K shortlist
//! - Picks one sub-alternative and stance per candidate and splits a budget
//!
//! PIPELINE:
//! DISCOVER → REFINE/CHALLENGE → QUERIES → CATALOG → SCORE → DECIDE → BUDGET

pub mod agent;
pub mod catalog;
pub mod config;
pub mod error;
pub mod extract;
pub mod fanout;
pub mod gemini;
pub mod knowledge;
pub mod models;
pub mod positions;
pub mod refinement;
pub mod scoring;

pub use error::{HedgeError, Result};

// Re-export common types
pub use agent::HedgeOrchestrator;
pub use catalog::{CandidateCatalog, KalshiCatalog, StaticCatalog};
pub use config::EngineConfig;
pub use knowledge::{KnowledgeSource, ScriptedKnowledgeSource};
pub use models::*;
