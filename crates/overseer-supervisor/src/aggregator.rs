use crate::types::{AggregatedResult, WorkflowState};
use overseer_core::{SupervisorError, SupervisorResult};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// How step outputs are combined into one [`AggregatedResult`].
#[derive(Debug, Clone)]
pub enum AggregationStrategy {
    /// Keyed union of step outputs; keys are step names, so no conflict
    /// resolution is needed.
    Merge,
    /// Majority value across step outputs, with a confidence score and the
    /// dissenting outputs listed as disagreements.
    Consensus,
    /// Weighted combination using per-step weights; steps without an entry
    /// get weight 1.0.
    Weighted(HashMap<String, f64>),
}

impl AggregationStrategy {
    /// Resolve a strategy by name.
    ///
    /// `weights` is only consulted for `"weighted"`; omitting it there means
    /// uniform weights. Unrecognized names fail with
    /// [`SupervisorError::UnknownStrategy`].
    pub fn from_name(
        name: &str,
        weights: Option<HashMap<String, f64>>,
    ) -> SupervisorResult<Self> {
        match name {
            "merge" => Ok(Self::Merge),
            "consensus" => Ok(Self::Consensus),
            "weighted" => Ok(Self::Weighted(weights.unwrap_or_default())),
            other => Err(SupervisorError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Combine a workflow's step outputs according to the strategy.
///
/// The result is derived from the state and never mutated afterwards.
pub fn aggregate(
    state: &WorkflowState,
    strategy: &AggregationStrategy,
) -> SupervisorResult<AggregatedResult> {
    match strategy {
        AggregationStrategy::Merge => Ok(merge(state)),
        AggregationStrategy::Consensus => consensus(state),
        AggregationStrategy::Weighted(weights) => Ok(weighted(state, weights)),
    }
}

fn merge(state: &WorkflowState) -> AggregatedResult {
    let mut merged = Map::new();
    for record in &state.steps {
        merged.insert(record.step.clone(), record.result.output.clone());
    }
    AggregatedResult::Merge { merged }
}

fn consensus(state: &WorkflowState) -> SupervisorResult<AggregatedResult> {
    if state.steps.is_empty() {
        return Err(SupervisorError::Aggregation(
            "consensus requires at least one step result".to_string(),
        ));
    }

    // Count distinct outputs in step order; ties resolve to the value
    // observed first, keeping the result deterministic.
    let outputs: Vec<&Value> = state.steps.iter().map(|r| &r.result.output).collect();
    let mut distinct: Vec<(&Value, usize)> = Vec::new();
    for output in &outputs {
        match distinct.iter_mut().find(|(v, _)| v == output) {
            Some((_, count)) => *count += 1,
            None => distinct.push((output, 1)),
        }
    }

    let (majority, agreeing) = distinct
        .iter()
        .max_by_key(|(_, count)| *count)
        .map(|(v, count)| (*v, *count))
        .unwrap_or((outputs[0], 1));

    let disagreements: Vec<Value> = outputs
        .iter()
        .filter(|o| **o != majority)
        .map(|o| (*o).clone())
        .collect();

    Ok(AggregatedResult::Consensus {
        value: majority.clone(),
        confidence: agreeing as f64 / outputs.len() as f64,
        disagreements,
    })
}

fn weighted(state: &WorkflowState, weights: &HashMap<String, f64>) -> AggregatedResult {
    // Field name → (weighted numeric sum, weight sum) for numeric fields,
    // and field name → per-value weight tally for everything else. A field
    // only combines numerically when every contribution is a number.
    let mut numeric: HashMap<String, (f64, f64)> = HashMap::new();
    let mut votes: HashMap<String, Vec<(Value, f64)>> = HashMap::new();
    let mut field_order: Vec<String> = Vec::new();

    for record in &state.steps {
        let weight = weights.get(&record.step).copied().unwrap_or(1.0);
        let fields: Vec<(String, Value)> = match &record.result.output {
            // Scalar outputs are treated as a single "value" field.
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            other => vec![("value".to_string(), other.clone())],
        };

        for (field, value) in fields {
            if !field_order.contains(&field) {
                field_order.push(field.clone());
            }
            match value.as_f64() {
                Some(n) if !votes.contains_key(&field) => {
                    let entry = numeric.entry(field).or_insert((0.0, 0.0));
                    entry.0 += n * weight;
                    entry.1 += weight;
                }
                _ => {
                    // A non-numeric contribution turns the whole field into
                    // a weighted vote; fold in any numeric sums seen so far.
                    let tallies = votes.entry(field.clone()).or_default();
                    if let Some((sum, total)) = numeric.remove(&field) {
                        if total > 0.0 {
                            tallies.push((Value::from(sum / total), total));
                        }
                    }
                    match tallies.iter_mut().find(|(v, _)| *v == value) {
                        Some((_, w)) => *w += weight,
                        None => tallies.push((value, weight)),
                    }
                }
            }
        }
    }

    let mut combined = Map::new();
    for field in field_order {
        if let Some((sum, total)) = numeric.get(&field) {
            if *total > 0.0 {
                combined.insert(field, Value::from(sum / total));
            }
        } else if let Some(tallies) = votes.get(&field) {
            // Highest total weight wins; ties resolve to first observed.
            let mut best: Option<(&Value, f64)> = None;
            for (value, weight) in tallies {
                match best {
                    Some((_, w)) if *weight <= w => {}
                    _ => best = Some((value, *weight)),
                }
            }
            if let Some((value, _)) = best {
                combined.insert(field, value.clone());
            }
        }
    }

    AggregatedResult::Weighted { combined }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{StepRecord, TaskResult};
    use serde_json::json;

    fn state_with(outputs: Vec<(&str, Value)>) -> WorkflowState {
        let mut state = WorkflowState::new("test");
        for (step, output) in outputs {
            state.steps.push(StepRecord {
                step: step.to_string(),
                result: TaskResult {
                    agent: "agent".into(),
                    output,
                    latency_ms: 5,
                },
            });
        }
        state
    }

    #[test]
    fn unknown_strategy_name_fails() {
        let err = AggregationStrategy::from_name("majority-vote", None).unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownStrategy(name) if name == "majority-vote"));
    }

    #[test]
    fn merge_is_keyed_union() {
        let state = state_with(vec![("a", json!(1)), ("b", json!(2))]);
        let result = aggregate(&state, &AggregationStrategy::Merge).unwrap();
        match result {
            AggregatedResult::Merge { merged } => {
                assert_eq!(merged["a"], json!(1));
                assert_eq!(merged["b"], json!(2));
                assert_eq!(merged.len(), 2);
            }
            other => panic!("expected Merge, got {other:?}"),
        }
    }

    #[test]
    fn consensus_majority_and_disagreements() {
        let state = state_with(vec![
            ("s1", json!("high")),
            ("s2", json!("high")),
            ("s3", json!("low")),
        ]);
        let result = aggregate(&state, &AggregationStrategy::Consensus).unwrap();
        match result {
            AggregatedResult::Consensus {
                value,
                confidence,
                disagreements,
            } => {
                assert_eq!(value, json!("high"));
                assert!((confidence - 2.0 / 3.0).abs() < 1e-9);
                assert_eq!(disagreements, vec![json!("low")]);
            }
            other => panic!("expected Consensus, got {other:?}"),
        }
    }

    #[test]
    fn consensus_tie_resolves_to_first_observed() {
        let state = state_with(vec![("s1", json!("low")), ("s2", json!("high"))]);
        let result = aggregate(&state, &AggregationStrategy::Consensus).unwrap();
        match result {
            AggregatedResult::Consensus { value, confidence, .. } => {
                assert_eq!(value, json!("low"));
                assert!((confidence - 0.5).abs() < 1e-9);
            }
            other => panic!("expected Consensus, got {other:?}"),
        }
    }

    #[test]
    fn consensus_over_empty_state_fails() {
        let state = state_with(vec![]);
        let err = aggregate(&state, &AggregationStrategy::Consensus).unwrap_err();
        assert!(matches!(err, SupervisorError::Aggregation(_)));
    }

    #[test]
    fn weighted_numeric_average() {
        let state = state_with(vec![
            ("s1", json!({"risk": 10.0})),
            ("s2", json!({"risk": 20.0})),
        ]);
        let weights = HashMap::from([("s1".to_string(), 3.0), ("s2".to_string(), 1.0)]);
        let result = aggregate(&state, &AggregationStrategy::Weighted(weights)).unwrap();
        match result {
            AggregatedResult::Weighted { combined } => {
                // (10*3 + 20*1) / 4 = 12.5
                assert_eq!(combined["risk"], json!(12.5));
            }
            other => panic!("expected Weighted, got {other:?}"),
        }
    }

    #[test]
    fn weighted_categorical_vote() {
        let state = state_with(vec![
            ("s1", json!({"severity": "high"})),
            ("s2", json!({"severity": "low"})),
            ("s3", json!({"severity": "low"})),
        ]);
        let weights = HashMap::from([
            ("s1".to_string(), 5.0),
            ("s2".to_string(), 1.0),
            ("s3".to_string(), 1.0),
        ]);
        let result = aggregate(&state, &AggregationStrategy::Weighted(weights)).unwrap();
        match result {
            AggregatedResult::Weighted { combined } => {
                assert_eq!(combined["severity"], json!("high"));
            }
            other => panic!("expected Weighted, got {other:?}"),
        }
    }

    #[test]
    fn weighted_scalar_outputs_use_value_field() {
        let state = state_with(vec![("s1", json!(4.0)), ("s2", json!(8.0))]);
        let result =
            aggregate(&state, &AggregationStrategy::Weighted(HashMap::new())).unwrap();
        match result {
            AggregatedResult::Weighted { combined } => {
                assert_eq!(combined["value"], json!(6.0));
            }
            other => panic!("expected Weighted, got {other:?}"),
        }
    }
}
