//! Registry parsing and diff bookkeeping
//!
//! The knowledge source's registry replaces the previous one wholesale.
//! Its self-reported diff counts are kept only when they agree with what
//! can be checked structurally.

use crate::catalog::{first_number, first_string};
use crate::error::HedgeError;
use crate::models::{DiffSource, Factor, Registry, RoundStats};
use crate::Result;
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

/// Diff counts as reported by the knowledge source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportedDiff {
    pub added: u32,
    pub retired: u32,
    pub modified: u32,
}

impl ReportedDiff {
    pub fn total(&self) -> u32 {
        self.added
            .saturating_add(self.retired)
            .saturating_add(self.modified)
    }
}

#[derive(Debug, Clone)]
pub struct ParsedRegistry {
    pub registry: Registry,
    pub reported: Option<ReportedDiff>,
}

/// Validate an extracted JSON value as a registry.
pub fn parse_registry(value: &Value, fallback_subject: &str) -> Result<ParsedRegistry> {
    let factors_json = match value {
        Value::Array(items) => items,
        Value::Object(map) => map
            .get("factors")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                HedgeError::InvalidRegistry("No factors array in response".to_string())
            })?,
        _ => {
            return Err(HedgeError::InvalidRegistry(
                "Registry is not a JSON object".to_string(),
            ))
        }
    };

    let factors = factors_json
        .iter()
        .enumerate()
        .map(|(index, f)| parse_factor(index, f))
        .collect::<Result<Vec<_>>>()?;

    let subject_id = first_string(value, &["subject_id", "ticker"])
        .unwrap_or_else(|| fallback_subject.to_string());

    Ok(ParsedRegistry {
        registry: Registry::new(subject_id, factors),
        reported: reported_diff(value),
    })
}

fn parse_factor(index: usize, value: &Value) -> Result<Factor> {
    if !value.is_object() {
        return Err(HedgeError::InvalidRegistry(format!(
            "Factor #{} is not an object",
            index
        )));
    }

    let id = first_string(value, &["id"]).ok_or_else(|| {
        HedgeError::InvalidRegistry(format!("Factor #{} has no id", index))
    })?;

    let text = |field: &str| first_string(value, &[field]).unwrap_or_default();

    Ok(Factor::new(
        id.clone(),
        text("category"),
        text("label"),
        text("description"),
        score_field(value, &id, "salience")?,
        score_field(value, &id, "evidence_quality")?,
    ))
}

/// Missing scores count as 0; present but non-numeric ones are rejected.
fn score_field(value: &Value, id: &str, field: &str) -> Result<f64> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(0.0),
        Some(_) => first_number(value, &[field]).ok_or_else(|| {
            HedgeError::InvalidRegistry(format!("Factor {} has non-numeric {}", id, field))
        }),
    }
}

fn reported_diff(value: &Value) -> Option<ReportedDiff> {
    let count = |fields: &[&str]| {
        fields
            .iter()
            .find_map(|f| value.get(*f).and_then(Value::as_u64))
            .and_then(|n| u32::try_from(n).ok())
    };

    Some(ReportedDiff {
        added: count(&["new_factors_added", "added"])?,
        retired: count(&["factors_retired", "retired"])?,
        modified: count(&["factors_modified", "modified"])?,
    })
}

/// Structural diff by factor id.
pub fn compute_diff(previous: &Registry, next: &Registry) -> RoundStats {
    let previous_ids: HashSet<&str> = previous.factors().iter().map(|f| f.id.as_str()).collect();
    let next_ids: HashSet<&str> = next.factors().iter().map(|f| f.id.as_str()).collect();

    let added = next_ids.difference(&previous_ids).count() as u32;
    let retired = previous_ids.difference(&next_ids).count() as u32;
    let modified = next
        .factors()
        .iter()
        .filter(|f| {
            previous
                .get(&f.id)
                .map(|old| !old.same_content(f))
                .unwrap_or(false)
        })
        .count() as u32;

    RoundStats {
        added,
        retired,
        modified,
        avg_confidence: next.avg_confidence(),
        source: DiffSource::Computed,
    }
}

/// Choose between reported and computed counts for one call.
pub fn reconcile(previous: &Registry, next: &Registry, reported: Option<ReportedDiff>) -> RoundStats {
    let computed = compute_diff(previous, next);

    let Some(reported) = reported else {
        debug!("No reported diff, using computed counts");
        return computed;
    };

    let within_bounds = reported.added as usize <= next.len()
        && reported.retired as usize <= previous.len()
        && reported.modified as usize <= previous.len().min(next.len());
    let hides_changes = || reported.total() == 0 && computed.total() > 0;

    if within_bounds && !hides_changes() {
        RoundStats {
            added: reported.added,
            retired: reported.retired,
            modified: reported.modified,
            avg_confidence: computed.avg_confidence,
            source: DiffSource::Reported,
        }
    } else {
        debug!(
            ?reported,
            computed_added = computed.added,
            computed_retired = computed.retired,
            computed_modified = computed.modified,
            "Reported diff inconsistent, using computed counts"
        );
        computed
    }
}
