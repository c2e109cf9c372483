use crate::{Connection, Flow, FlowRunInfo, InputRow, Node, RequestError, RunInfo, Status, ToolDefinition, Value};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;

/// How a submission should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunMode {
    Flow = 0,
    SingleNode = 1,
    FromNode = 2,
    BulkTest = 3,
    Eval = 4,
}

impl TryFrom<i64> for RunMode {
    type Error = RequestError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RunMode::Flow),
            1 => Ok(RunMode::SingleNode),
            2 => Ok(RunMode::FromNode),
            3 => Ok(RunMode::BulkTest),
            4 => Ok(RunMode::Eval),
            other => Err(RequestError::InvalidRunMode(other)),
        }
    }
}

impl Serialize for RunMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// How evaluation inputs are shaped when an evaluation flow runs over variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    /// Collection mode if the evaluation flow declares a `variant_ids` input.
    #[default]
    Auto,
    /// One evaluation line per (row, variant).
    PerVariant,
    /// One evaluation line per row with every variant's output collected.
    Collection,
}

/// Submission data for Flow and BulkTest runs.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchFlowRequest {
    pub flow: Flow,
    #[serde(default)]
    pub batch_inputs: Vec<InputRow>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub baseline_variant_id: Option<String>,
    #[serde(default)]
    pub variants: HashMap<String, Vec<Node>>,
    #[serde(default)]
    pub variants_tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub variants_runs: HashMap<String, String>,
    #[serde(default)]
    pub bulk_test_id: Option<String>,
    #[serde(default)]
    pub eval_flow: Option<Flow>,
    #[serde(default)]
    pub eval_flow_run_id: Option<String>,
    #[serde(default)]
    pub eval_flow_inputs_mapping: HashMap<String, String>,
    #[serde(default)]
    pub eval_mode: EvaluationMode,
}

impl BatchFlowRequest {
    pub fn new(flow: Flow, batch_inputs: Vec<InputRow>) -> Self {
        Self {
            flow,
            batch_inputs,
            name: String::new(),
            description: String::new(),
            tags: HashMap::new(),
            baseline_variant_id: None,
            variants: HashMap::new(),
            variants_tools: Vec::new(),
            variants_runs: HashMap::new(),
            bulk_test_id: None,
            eval_flow: None,
            eval_flow_run_id: None,
            eval_flow_inputs_mapping: HashMap::new(),
            eval_mode: EvaluationMode::Auto,
        }
    }
}

/// Submission data for Eval runs over previously executed batch runs.
#[derive(Debug, Clone, Deserialize)]
pub struct EvalRequest {
    pub flow: Flow,
    #[serde(default)]
    pub bulk_test_inputs: Vec<InputRow>,
    #[serde(default)]
    pub bulk_test_flow_run_ids: Vec<String>,
    #[serde(default)]
    pub bulk_test_flow_id: String,
    #[serde(default)]
    pub bulk_test_id: Option<String>,
    #[serde(default)]
    pub inputs_mapping: HashMap<String, String>,
    #[serde(default)]
    pub eval_mode: EvaluationMode,
}

/// Submission data for SingleNode and FromNode runs.
#[derive(Debug, Clone, Deserialize)]
pub struct NodesRequest {
    pub flow: Flow,
    pub node_name: String,
    #[serde(default)]
    pub node_inputs: InputRow,
    #[serde(default)]
    pub variants: HashMap<String, Vec<Node>>,
    #[serde(default)]
    pub variants_tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone)]
pub enum SubmissionData {
    Batch(BatchFlowRequest),
    Eval(EvalRequest),
    Nodes(NodesRequest),
}

impl SubmissionData {
    pub fn flow(&self) -> &Flow {
        match self {
            SubmissionData::Batch(r) => &r.flow,
            SubmissionData::Eval(r) => &r.flow,
            SubmissionData::Nodes(r) => &r.flow,
        }
    }

    pub fn flow_mut(&mut self) -> &mut Flow {
        match self {
            SubmissionData::Batch(r) => &mut r.flow,
            SubmissionData::Eval(r) => &mut r.flow,
            SubmissionData::Nodes(r) => &mut r.flow,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreatedBy {
    #[serde(default)]
    pub user_object_id: String,
    #[serde(default)]
    pub user_tenant_id: String,
    #[serde(default)]
    pub user_name: String,
}

/// A request to execute a flow in one of the run modes.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "Value")]
pub struct SubmitFlowRequest {
    pub flow_id: String,
    pub flow_run_id: String,
    pub source_flow_run_id: String,
    pub run_mode: RunMode,
    pub submission_data: SubmissionData,
    pub connections: HashMap<String, Connection>,
    pub environment_variables: HashMap<String, String>,
    pub created_by: CreatedBy,
}

#[derive(Deserialize)]
struct RawSubmitFlowRequest {
    #[serde(default)]
    flow_id: String,
    #[serde(default)]
    flow_run_id: String,
    #[serde(default)]
    source_flow_run_id: String,
    #[serde(default)]
    run_mode: i64,
    #[serde(default)]
    submission_data: Value,
    #[serde(default)]
    connections: HashMap<String, Connection>,
    #[serde(default)]
    environment_variables: HashMap<String, Value>,
    #[serde(default)]
    created_by: CreatedBy,
}

impl SubmitFlowRequest {
    pub fn new(
        flow_id: impl Into<String>,
        flow_run_id: impl Into<String>,
        run_mode: RunMode,
        submission_data: SubmissionData,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            flow_run_id: flow_run_id.into(),
            source_flow_run_id: String::new(),
            run_mode,
            submission_data,
            connections: HashMap::new(),
            environment_variables: HashMap::new(),
            created_by: CreatedBy::default(),
        }
    }

    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connections.insert(connection.name.clone(), connection);
        self
    }

    /// Parse a raw request document.
    ///
    /// The flow id inside `submission_data` is forced to the request's
    /// `flow_id`; an attached evaluation flow must carry its own id.
    pub fn from_value(doc: Value) -> Result<Self, RequestError> {
        let raw: RawSubmitFlowRequest =
            serde_json::from_value(doc).map_err(|e| RequestError::Deserialize {
                class_name: "SubmitFlowRequest",
                message: e.to_string(),
            })?;
        let run_mode = RunMode::try_from(raw.run_mode)?;

        let mut data = match raw.submission_data {
            Value::String(s) => serde_json::from_str::<Value>(&s).map_err(|e| {
                RequestError::Deserialize {
                    class_name: "SubmissionData",
                    message: e.to_string(),
                }
            })?,
            other => other,
        };
        if let Some(flow) = data.get_mut("flow").and_then(Value::as_object_mut) {
            match flow.get("id").and_then(Value::as_str) {
                Some(id) if id == raw.flow_id => {}
                Some(id) => {
                    tracing::warn!(
                        submitted = id,
                        flow_id = %raw.flow_id,
                        "Flow id in submission data does not match the request, updating it"
                    );
                    flow.insert("id".to_string(), Value::String(raw.flow_id.clone()));
                }
                None => {
                    flow.insert("id".to_string(), Value::String(raw.flow_id.clone()));
                }
            }
        }
        if let Some(eval_flow) = data.get("eval_flow").filter(|v| !v.is_null()) {
            if eval_flow.get("id").and_then(Value::as_str).unwrap_or("").is_empty() {
                return Err(RequestError::MissingEvalFlowId);
            }
        }

        let mut connections = raw.connections;
        if let Some(embedded) = data.get("connections").filter(|v| v.is_object()) {
            let embedded: HashMap<String, Connection> = serde_json::from_value(embedded.clone())
                .map_err(|e| RequestError::Deserialize {
                    class_name: "Connection",
                    message: e.to_string(),
                })?;
            for (name, conn) in embedded {
                connections.entry(name).or_insert(conn);
            }
        }
        for (name, conn) in connections.iter_mut() {
            conn.name = name.clone();
        }

        let submission_data = match run_mode {
            RunMode::Flow | RunMode::BulkTest => {
                SubmissionData::Batch(deserialize_data("BatchFlowRequest", data)?)
            }
            RunMode::Eval => SubmissionData::Eval(deserialize_data("EvalRequest", data)?),
            RunMode::SingleNode | RunMode::FromNode => {
                SubmissionData::Nodes(deserialize_data("NodesRequest", data)?)
            }
        };

        let environment_variables = raw
            .environment_variables
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect();

        Ok(Self {
            flow_id: raw.flow_id,
            flow_run_id: raw.flow_run_id,
            source_flow_run_id: raw.source_flow_run_id,
            run_mode,
            submission_data,
            connections,
            environment_variables,
            created_by: raw.created_by,
        })
    }

    /// Every run id the request will create at the root level. Node runs
    /// create no flow run, so a nodes request has none.
    pub fn root_run_ids(&self) -> Vec<String> {
        let mut ids = match &self.submission_data {
            SubmissionData::Nodes(_) => return Vec::new(),
            SubmissionData::Eval(_) => vec![self.flow_run_id.clone()],
            SubmissionData::Batch(batch) => {
                let mut ids = vec![self.flow_run_id.clone()];
                let mut variant_runs: Vec<&String> = batch.variants_runs.values().collect();
                variant_runs.sort();
                ids.extend(variant_runs.into_iter().cloned());
                if batch.eval_flow.is_some() {
                    if let Some(eval_run_id) = &batch.eval_flow_run_id {
                        ids.push(eval_run_id.clone());
                    }
                }
                ids
            }
        };
        ids.retain(|id| !id.is_empty());
        ids
    }
}

impl TryFrom<Value> for SubmitFlowRequest {
    type Error = RequestError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        SubmitFlowRequest::from_value(value)
    }
}

fn deserialize_data<T: serde::de::DeserializeOwned>(
    class_name: &'static str,
    data: Value,
) -> Result<T, RequestError> {
    serde_json::from_value(data).map_err(|e| RequestError::Deserialize {
        class_name,
        message: e.to_string(),
    })
}

/// Overall outcome of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubmissionOutcome {
    Succeeded,
    PartiallyFailed,
    Failed,
}

/// Result document returned by the coordinator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubmissionResult {
    pub flow_runs: Vec<FlowRunInfo>,
    pub node_runs: Vec<RunInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Box<SubmissionResult>>,
}

impl SubmissionResult {
    /// Succeeded when every flow and node run completed (or was bypassed).
    pub fn outcome(&self) -> SubmissionOutcome {
        let flow_ok = self
            .flow_runs
            .iter()
            .all(|r| r.status == Status::Completed);
        let node_ok = self
            .node_runs
            .iter()
            .all(|r| matches!(r.status, Status::Completed | Status::Bypassed));
        let eval = self.evaluation.as_ref().map(|e| e.outcome());

        let any_completed_root = self
            .flow_runs
            .iter()
            .any(|r| r.is_root() && r.status == Status::Completed);
        match (flow_ok && node_ok, eval) {
            (true, None) | (true, Some(SubmissionOutcome::Succeeded)) => SubmissionOutcome::Succeeded,
            _ if any_completed_root || (self.flow_runs.is_empty() && !self.node_runs.is_empty()) => {
                SubmissionOutcome::PartiallyFailed
            }
            _ => SubmissionOutcome::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch_doc(run_mode: i64) -> Value {
        json!({
            "flow_id": "qa",
            "flow_run_id": "run_1",
            "run_mode": run_mode,
            "submission_data": {
                "flow": {"id": "other", "nodes": []},
                "batch_inputs": [{"q": "a"}],
                "variants_runs": {"v1": "run_v1"},
                "eval_flow": {"id": "eval", "nodes": []},
                "eval_flow_run_id": "run_eval"
            },
            "connections": {
                "conn": {"type": "CustomConnection", "value": {"k": "v"}}
            },
            "environment_variables": {"N": 3}
        })
    }

    #[test]
    fn parses_batch_request_and_normalizes_flow_id() {
        let req = SubmitFlowRequest::from_value(batch_doc(3)).unwrap();
        assert_eq!(req.run_mode, RunMode::BulkTest);
        assert_eq!(req.submission_data.flow().id, "qa");
        assert_eq!(req.connections["conn"].name, "conn");
        assert_eq!(req.environment_variables["N"], "3");
        assert_eq!(req.root_run_ids(), vec!["run_1", "run_v1", "run_eval"]);
    }

    #[test]
    fn unknown_run_mode_is_rejected() {
        match SubmitFlowRequest::from_value(batch_doc(9)) {
            Err(RequestError::InvalidRunMode(9)) => {}
            other => panic!("unexpected {:?}", other.map(|r| r.run_mode)),
        }
    }

    #[test]
    fn eval_flow_without_id_is_rejected() {
        let mut doc = batch_doc(3);
        doc["submission_data"]["eval_flow"] = json!({"nodes": []});
        assert!(matches!(
            SubmitFlowRequest::from_value(doc),
            Err(RequestError::MissingEvalFlowId)
        ));
    }

    #[test]
    fn nodes_request_has_no_root_runs() {
        let doc = json!({
            "flow_id": "qa",
            "flow_run_id": "run_2",
            "run_mode": 1,
            "submission_data": {
                "flow": {"id": "qa", "nodes": []},
                "node_name": "answer"
            }
        });
        let req = SubmitFlowRequest::from_value(doc).unwrap();
        assert!(matches!(req.submission_data, SubmissionData::Nodes(_)));
        assert!(req.root_run_ids().is_empty());
    }

    #[test]
    fn serde_entry_point_matches_from_value() {
        let req: SubmitFlowRequest = serde_json::from_value(batch_doc(0)).unwrap();
        assert_eq!(req.run_mode, RunMode::Flow);
    }
}
