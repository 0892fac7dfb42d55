//! Structural diff between two executions, compared step-name by step-name.

use decision_trail_types::{DiffRow, ExecutionDetail, StepRecord};
use std::collections::{BTreeSet, HashMap};

/// Builds one comparison row per step name across both executions.
///
/// Names are not guaranteed unique within an execution; the last step with a
/// given name wins (steps arrive ordered by start time). Row order follows
/// the lexicographic order of the union of names, not either execution's
/// chronology. A side with no step of that name reports `None` in every
/// column.
pub fn diff_executions(a: &ExecutionDetail, b: &ExecutionDetail) -> Vec<DiffRow> {
    let a_steps = by_name(&a.steps);
    let b_steps = by_name(&b.steps);

    let names: BTreeSet<&str> = a_steps.keys().chain(b_steps.keys()).copied().collect();

    names
        .into_iter()
        .map(|name| {
            let sa = a_steps.get(name).copied();
            let sb = b_steps.get(name).copied();
            DiffRow {
                step: name.to_string(),
                a_status: sa.map(|s| s.status),
                b_status: sb.map(|s| s.status),
                a_duration_ms: sa.map(|s| s.duration_ms),
                b_duration_ms: sb.map(|s| s.duration_ms),
                a_keywords: sa.and_then(keywords_of),
                b_keywords: sb.and_then(keywords_of),
                a_reasoning: sa.map(|s| s.reasoning.clone()),
                b_reasoning: sb.map(|s| s.reasoning.clone()),
            }
        })
        .collect()
}

fn by_name(steps: &[StepRecord]) -> HashMap<&str, &StepRecord> {
    let mut map = HashMap::with_capacity(steps.len());
    for step in steps {
        map.insert(step.name.as_str(), step);
    }
    map
}

fn keywords_of(step: &StepRecord) -> Option<serde_json::Value> {
    step.output.get("keywords").cloned()
}
