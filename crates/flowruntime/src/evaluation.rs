use crate::SubmissionError;
use flowcore::{EvaluationMode, Flow, FlowRunInfo, InputRow, Value, ValueExt};
use serde_json::Map;
use std::collections::{BTreeSet, HashMap};

pub const LINE_NUMBER: &str = "line_number";
pub const VARIANT_ID: &str = "variant_id";
pub const VARIANT_IDS: &str = "variant_ids";

const RESERVED_KEYS: [&str; 3] = [LINE_NUMBER, VARIANT_ID, VARIANT_IDS];

/// One output object per input row of a variant run.
pub type LineOutputs = Vec<Map<String, Value>>;

/// Whether evaluation lines collect every variant's output into one line.
pub fn is_collection_mode(flow: &Flow, mode: EvaluationMode) -> bool {
    match mode {
        EvaluationMode::Auto => flow.inputs.contains_key(VARIANT_IDS),
        EvaluationMode::PerVariant => false,
        EvaluationMode::Collection => true,
    }
}

/// Turn a root run's column output back into per-row objects.
///
/// The root output only holds completed lines; `line_number` says where each
/// belongs. Rows that have no entry get every column set to `null`, so row
/// `i` of the result always lines up with input row `i`.
pub fn collect_variant_outputs(run: &FlowRunInfo, line_count: usize) -> LineOutputs {
    let columns = match run.output.as_ref().and_then(Value::as_object) {
        Some(columns) => columns,
        None => return vec![Map::new(); line_count],
    };
    let names: Vec<&String> = columns.keys().filter(|k| k.as_str() != LINE_NUMBER).collect();
    let line_numbers: Vec<Option<usize>> = columns
        .get(LINE_NUMBER)
        .and_then(Value::as_array)
        .map(|items| items.iter().map(|v| v.as_u64().map(|n| n as usize)).collect())
        .unwrap_or_default();

    let width = line_numbers
        .iter()
        .flatten()
        .map(|i| i + 1)
        .max()
        .unwrap_or(0)
        .max(line_count);
    let empty: Map<String, Value> = names.iter().map(|n| ((*n).clone(), Value::Null)).collect();
    let mut lines = vec![empty; width];

    for (position, line_number) in line_numbers.iter().enumerate() {
        let index = match line_number {
            Some(index) => *index,
            None => {
                tracing::warn!(run_id = %run.run_id, position, "Output row without a line number, skipped");
                continue;
            }
        };
        for name in &names {
            let value = columns[name.as_str()]
                .as_array()
                .and_then(|col| col.get(position))
                .cloned()
                .unwrap_or(Value::Null);
            lines[index].insert((*name).clone(), value);
        }
    }
    lines
}

/// Build the batch inputs for an evaluation flow run over variant outputs.
///
/// A row is skipped only when every variant produced nothing for it. In
/// per-variant mode a surviving row yields one line per variant, with null
/// outputs for a variant that failed on it.
pub fn construct_eval_batch_inputs(
    original_inputs: &[InputRow],
    variant_ids: &[String],
    variants_outputs: &HashMap<String, LineOutputs>,
    inputs_mapping: &HashMap<String, String>,
    collection_mode: bool,
) -> Result<Vec<InputRow>, SubmissionError> {
    let mut mapping = inputs_mapping.clone();
    for key in RESERVED_KEYS {
        if mapping.remove(key).is_some() {
            tracing::warn!(key, "Input mapping key is reserved and cannot be used");
        }
    }

    let mut outputs: Vec<&LineOutputs> = Vec::with_capacity(variant_ids.len());
    for variant in variant_ids {
        let lines = variants_outputs
            .get(variant)
            .ok_or_else(|| SubmissionError::VariantIdNotFound(variant.clone()))?;
        if lines.len() != original_inputs.len() {
            return Err(SubmissionError::InputOutputCountMismatch {
                variant: variant.clone(),
                inputs: original_inputs.len(),
                outputs: lines.len(),
            });
        }
        outputs.push(lines);
    }

    let output_names: BTreeSet<String> = outputs
        .first()
        .map(|lines| lines.iter().flat_map(|l| l.keys().cloned()).collect())
        .unwrap_or_default();
    if mapping.is_empty() {
        mapping.extend(
            output_names
                .iter()
                .map(|name| (name.clone(), format!("output.{}", name))),
        );
        if let Some(first) = original_inputs.first() {
            mapping.extend(first.keys().map(|k| (k.clone(), format!("data.{}", k))));
        }
    }

    let mut batch_inputs = Vec::new();
    for (index, data) in original_inputs.iter().enumerate() {
        let row: Vec<(&String, &Map<String, Value>)> = variant_ids
            .iter()
            .zip(outputs.iter().map(|lines| &lines[index]))
            .collect();
        let has_output = |line: &Map<String, Value>| !line.values().all(Value::is_null);
        if !row.iter().any(|(_, line)| has_output(line)) {
            tracing::info!(line = index, "Every variant failed on this line, not evaluating it");
            continue;
        }

        if collection_mode {
            let collected: Map<String, Value> = output_names
                .iter()
                .map(|name| {
                    let per_variant = row
                        .iter()
                        .map(|(_, line)| line.get(name).cloned().unwrap_or(Value::Null))
                        .collect();
                    (name.clone(), Value::Array(per_variant))
                })
                .collect();
            let mut item = apply_inputs_mapping(data, &collected, &mapping);
            item.insert(LINE_NUMBER.to_string(), Value::from(index));
            item.insert(
                VARIANT_IDS.to_string(),
                Value::Array(variant_ids.iter().cloned().map(Value::String).collect()),
            );
            batch_inputs.push(item);
        } else {
            for (variant, line) in row {
                let mut item = apply_inputs_mapping(data, line, &mapping);
                item.insert(VARIANT_ID.to_string(), Value::String(variant.clone()));
                item.insert(LINE_NUMBER.to_string(), Value::from(index));
                batch_inputs.push(item);
            }
        }
    }

    if batch_inputs.is_empty() {
        return Err(SubmissionError::NoValidOutputLine);
    }
    Ok(batch_inputs)
}

/// Map `data.<col>` / `output.<col>` (optionally wrapped in `${...}`) onto
/// evaluation inputs; any other value is passed through as a literal.
pub fn apply_inputs_mapping(
    data: &InputRow,
    output: &Map<String, Value>,
    mapping: &HashMap<String, String>,
) -> InputRow {
    mapping
        .iter()
        .map(|(input, source)| {
            let expr = source
                .strip_prefix("${")
                .and_then(|s| s.strip_suffix('}'))
                .unwrap_or(source);
            let value = match expr.split_once('.') {
                Some(("data", path)) => lookup(|col| data.get(col), path),
                Some(("output", path)) => lookup(|col| output.get(col), path),
                _ => Some(Value::String(source.clone())),
            };
            let value = value.unwrap_or_else(|| {
                tracing::warn!(input = %input, source = %source, "Mapped column not found, using null");
                Value::Null
            });
            (input.clone(), value)
        })
        .collect()
}

fn lookup<'a, F>(column: F, path: &str) -> Option<Value>
where
    F: Fn(&str) -> Option<&'a Value>,
{
    let (name, rest) = path.split_once('.').unwrap_or((path, ""));
    column(name).and_then(|v| v.property(rest)).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::{FlowInputDefinition, Status, ValueType};
    use serde_json::json;

    fn rows(n: usize) -> Vec<InputRow> {
        (0..n)
            .map(|i| InputRow::from([("question".to_string(), json!(format!("q{}", i)))]))
            .collect()
    }

    fn lines(values: &[Option<&str>]) -> LineOutputs {
        values
            .iter()
            .map(|v| {
                Map::from_iter([(
                    "answer".to_string(),
                    v.map_or(Value::Null, |s| Value::String(s.to_string())),
                )])
            })
            .collect()
    }

    #[test]
    fn variant_outputs_are_reindexed_by_line_number() {
        let mut run = FlowRunInfo::new("f", "run", "run", "", Status::Completed);
        run.output = Some(json!({"answer": ["a", "c"], "line_number": [0, 2]}));
        let lines = collect_variant_outputs(&run, 3);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["answer"], json!("a"));
        assert_eq!(lines[1]["answer"], Value::Null);
        assert_eq!(lines[2]["answer"], json!("c"));
    }

    #[test]
    fn rows_are_skipped_only_when_every_variant_is_empty() {
        let ids = vec!["v0".to_string(), "v1".to_string()];
        let outputs = HashMap::from([
            ("v0".to_string(), lines(&[Some("a"), None, Some("c")])),
            ("v1".to_string(), lines(&[None, None, Some("z")])),
        ]);

        let collected =
            construct_eval_batch_inputs(&rows(3), &ids, &outputs, &HashMap::new(), true).unwrap();
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0]["answer"], json!(["a", null]));
        assert_eq!(collected[0]["question"], json!("q0"));
        assert_eq!(collected[1][LINE_NUMBER], json!(2));
        assert_eq!(collected[1][VARIANT_IDS], json!(["v0", "v1"]));

        let per_variant =
            construct_eval_batch_inputs(&rows(3), &ids, &outputs, &HashMap::new(), false).unwrap();
        let tagged: Vec<_> = per_variant
            .iter()
            .map(|l| (l[LINE_NUMBER].clone(), l[VARIANT_ID].clone()))
            .collect();
        assert_eq!(
            tagged,
            vec![
                (json!(0), json!("v0")),
                (json!(0), json!("v1")),
                (json!(2), json!("v0")),
                (json!(2), json!("v1")),
            ]
        );
        assert_eq!(per_variant[1]["answer"], Value::Null);
    }

    #[test]
    fn per_variant_lines_keep_variants_with_empty_output() {
        let ids = vec!["v0".to_string(), "v1".to_string()];
        let outputs = HashMap::from([
            ("v0".to_string(), lines(&[Some("a"), Some("b")])),
            ("v1".to_string(), lines(&[Some("z"), None])),
        ]);
        let batch =
            construct_eval_batch_inputs(&rows(2), &ids, &outputs, &HashMap::new(), false).unwrap();
        assert_eq!(batch.len(), 4);
        let last = &batch[3];
        assert_eq!(last[LINE_NUMBER], json!(1));
        assert_eq!(last[VARIANT_ID], json!("v1"));
        assert_eq!(last["answer"], Value::Null);
        assert_eq!(last["question"], json!("q1"));
    }

    #[test]
    fn no_surviving_line_is_an_error() {
        let ids = vec!["v0".to_string()];
        let outputs = HashMap::from([("v0".to_string(), lines(&[None, None, None]))]);
        let err = construct_eval_batch_inputs(&rows(3), &ids, &outputs, &HashMap::new(), false)
            .unwrap_err();
        assert_eq!(err, SubmissionError::NoValidOutputLine);
    }

    #[test]
    fn explicit_mapping_drops_reserved_keys() {
        let ids = vec!["v0".to_string()];
        let outputs = HashMap::from([("v0".to_string(), lines(&[Some("a")]))]);
        let mapping = HashMap::from([
            ("prediction".to_string(), "${output.answer}".to_string()),
            ("q".to_string(), "data.question".to_string()),
            ("line_number".to_string(), "data.question".to_string()),
            ("threshold".to_string(), "0.5".to_string()),
        ]);
        let batch = construct_eval_batch_inputs(&rows(1), &ids, &outputs, &mapping, false).unwrap();
        assert_eq!(batch[0]["prediction"], json!("a"));
        assert_eq!(batch[0]["q"], json!("q0"));
        assert_eq!(batch[0]["threshold"], json!("0.5"));
        assert_eq!(batch[0][LINE_NUMBER], json!(0));
    }

    #[test]
    fn count_mismatch_is_reported() {
        let ids = vec!["v0".to_string()];
        let outputs = HashMap::from([("v0".to_string(), lines(&[Some("a")]))]);
        assert!(matches!(
            construct_eval_batch_inputs(&rows(2), &ids, &outputs, &HashMap::new(), false),
            Err(SubmissionError::InputOutputCountMismatch { .. })
        ));
    }

    #[test]
    fn auto_mode_sniffs_variant_ids_input() {
        let plain = Flow::new("eval");
        let collecting =
            Flow::new("eval").with_input(VARIANT_IDS, FlowInputDefinition::of(ValueType::List));
        assert!(!is_collection_mode(&plain, EvaluationMode::Auto));
        assert!(is_collection_mode(&collecting, EvaluationMode::Auto));
        assert!(is_collection_mode(&plain, EvaluationMode::Collection));
        assert!(!is_collection_mode(&collecting, EvaluationMode::PerVariant));
    }
}
