use crate::{ErrorInfo, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle status shared by node runs and flow runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    NotStarted,
    Preparing,
    Running,
    Completed,
    Failed,
    Bypassed,
    Canceled,
    CancelRequested,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Failed | Status::Bypassed | Status::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::NotStarted => "NotStarted",
            Status::Preparing => "Preparing",
            Status::Running => "Running",
            Status::Completed => "Completed",
            Status::Failed => "Failed",
            Status::Bypassed => "Bypassed",
            Status::Canceled => "Canceled",
            Status::CancelRequested => "CancelRequested",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of a single node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub node: String,
    pub flow_run_id: String,
    pub run_id: String,
    pub parent_run_id: String,
    pub status: Status,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub metrics: HashMap<String, Value>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub variant_id: String,
    #[serde(default)]
    pub api_calls: Vec<Value>,
    #[serde(default)]
    pub cached_run_id: Option<String>,
    #[serde(default)]
    pub cached_flow_run_id: Option<String>,
}

impl RunInfo {
    pub fn start(
        node: impl Into<String>,
        flow_run_id: impl Into<String>,
        run_id: impl Into<String>,
        parent_run_id: impl Into<String>,
        index: Option<usize>,
        variant_id: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            flow_run_id: flow_run_id.into(),
            run_id: run_id.into(),
            parent_run_id: parent_run_id.into(),
            status: Status::Running,
            inputs: HashMap::new(),
            output: None,
            metrics: HashMap::new(),
            error: None,
            start_time: Utc::now(),
            end_time: None,
            index,
            variant_id: variant_id.into(),
            api_calls: Vec::new(),
            cached_run_id: None,
            cached_flow_run_id: None,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }
}

/// Record of a flow execution: a batch root, a line, or an evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRunInfo {
    pub run_id: String,
    pub flow_id: String,
    pub status: Status,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub inputs: Option<Value>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub metrics: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(default)]
    pub parent_run_id: String,
    #[serde(default)]
    pub root_run_id: String,
    #[serde(default)]
    pub source_run_id: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub variant_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub system_metrics: HashMap<String, Value>,
}

impl FlowRunInfo {
    pub fn new(
        flow_id: impl Into<String>,
        run_id: impl Into<String>,
        root_run_id: impl Into<String>,
        parent_run_id: impl Into<String>,
        status: Status,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            flow_id: flow_id.into(),
            status,
            error: None,
            inputs: None,
            output: None,
            metrics: HashMap::new(),
            request: None,
            parent_run_id: parent_run_id.into(),
            root_run_id: root_run_id.into(),
            source_run_id: None,
            start_time: Utc::now(),
            end_time: None,
            index: None,
            variant_id: String::new(),
            name: String::new(),
            description: String::new(),
            tags: HashMap::new(),
            system_metrics: HashMap::new(),
        }
    }

    /// A run that failed before it could start.
    pub fn create_with_error(
        flow_id: impl Into<String>,
        run_id: impl Into<String>,
        root_run_id: impl Into<String>,
        parent_run_id: impl Into<String>,
        index: Option<usize>,
        variant_id: impl Into<String>,
        error: ErrorInfo,
    ) -> Self {
        let mut run = Self::new(flow_id, run_id, root_run_id, parent_run_id, Status::Failed);
        run.index = index;
        run.variant_id = variant_id.into();
        run.error = Some(error);
        run.end_time = Some(run.start_time);
        run
    }

    pub fn is_root(&self) -> bool {
        self.run_id == self.root_run_id
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }
}
