//! Prompt builders for the refinement loop
//!
//! Prompts only describe the task; the engine validates whatever registry
//! comes back structurally and never judges the quality of a mutation.

use crate::config::RefinementConfig;
use crate::models::{Registry, Subject};
use serde_json::json;

pub const DISCOVERY_INSTRUCTIONS: &str =
    "You are a financial research analyst. Search thoroughly before responding. Return valid JSON only.";

pub const REFINEMENT_INSTRUCTIONS: &str =
    "You are a financial research analyst refining a factor registry. Return valid JSON only. No markdown, no prose.";

pub const CHALLENGE_INSTRUCTIONS: &str =
    "You are a skeptical financial analyst stress-testing a factor registry. Return valid JSON only. No markdown, no prose.";

/// Shape every registry-producing call must return
fn registry_schema(ticker: &str) -> String {
    format!(
        r#"{{
  "ticker": "{ticker}",
  "factors": [
    {{
      "id": "<stable id, e.g. f_001; keep existing ids, new ids for new factors>",
      "category": "<short string>",
      "label": "<concise factor label>",
      "description": "<1-3 sentences with specifics>",
      "salience": <float 0-1>,
      "evidence_quality": <float 0-1>,
      "confidence": <salience x evidence_quality>
    }}
  ],
  "new_factors_added": <int>,
  "factors_retired": <int>,
  "factors_modified": <int>,
  "avg_confidence": <float>
}}"#
    )
}

fn subject_json(subject: &Subject) -> String {
    serde_json::to_string_pretty(subject).unwrap_or_else(|_| subject.ticker.clone())
}

/// Factors without search queries, as the knowledge source should see them
fn factors_json(registry: &Registry) -> String {
    let factors: Vec<_> = registry
        .factors()
        .iter()
        .map(|f| {
            json!({
                "id": f.id,
                "category": f.category,
                "label": f.label,
                "description": f.description,
                "salience": f.salience(),
                "evidence_quality": f.evidence_quality(),
                "confidence": f.confidence(),
            })
        })
        .collect();

    serde_json::to_string_pretty(&factors).unwrap_or_else(|_| "[]".to_string())
}

pub fn discovery_prompt(subject: &Subject, config: &RefinementConfig) -> String {
    let ticker = &subject.ticker;
    format!(
        r#"Identify the factors that could materially move {ticker}, upside or downside.

Holding:
{holding}

Search broadly, for example:
- "{ticker} key drivers"
- "what is moving {ticker} right now"
- "{ticker} latest news"
Prior knowledge of the company and its sector may be used as well.

Build a factor registry of about {min}-{max} factors: the most material drivers only,
together covering most of the security's upside and downside.

Return exactly this JSON:
{schema}
"#,
        holding = subject_json(subject),
        min = config.factor_min,
        max = config.factor_max,
        schema = registry_schema(ticker),
    )
}

pub fn refinement_prompt(subject: &Subject, registry: &Registry, config: &RefinementConfig) -> String {
    let ticker = &subject.ticker;
    let hints: Vec<String> = registry
        .factors()
        .iter()
        .map(|f| format!("- [{}] \"{} {}\"", f.id, ticker, f.label))
        .collect();

    format!(
        r#"Refine the factor registry for {ticker}.

Current factors:
{factors}

Gather evidence for every factor at once. Targeted queries, one or more per factor:
{hints}

You may confirm, enrich, merge, split, relabel, re-score, delete or add factors;
the registry is replaced as a whole by your answer. Keep about {min}-{max} factors.

Scoring:
- salience: how much this could move the stock (0-1)
- evidence_quality: how strong and recent the evidence is (0-1)
- confidence: salience x evidence_quality

Report how many factors you added, retired and modified relative to the list above.

Return exactly this JSON:
{schema}
"#,
        factors = factors_json(registry),
        hints = hints.join("\n"),
        min = config.factor_min,
        max = config.factor_max,
        schema = registry_schema(ticker),
    )
}

pub fn challenge_prompt(subject: &Subject, registry: &Registry, config: &RefinementConfig) -> String {
    let ticker = &subject.ticker;
    format!(
        r#"Stress-test the factor registry for {ticker}. Assume it is overconfident and incomplete.

Current factors (challenge them):
{factors}

Look for what consensus is missing, for example:
- "{ticker} bear case"
- "{ticker} catalysts analysts are ignoring"
- "{ticker} underappreciated drivers"

- Understated factors: raise salience.
- Overstated or priced-in factors: lower confidence or delete.
- Missing drivers: add them.
- Vague descriptions: sharpen them.

The aim is a more complete and accurate registry, not disagreement for its own sake.
Keep about {min}-{max} factors. Report how many factors you added, retired and
modified relative to the list above.

Return exactly this JSON:
{schema}
"#,
        factors = factors_json(registry),
        min = config.factor_min,
        max = config.factor_max,
        schema = registry_schema(ticker),
    )
}
