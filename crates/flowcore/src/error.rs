use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Who is responsible for an error: the submitter or the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    User,
    System,
}

/// The layer that raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorTarget {
    Executor,
    FlowExecutor,
    Tool,
    Runtime,
    Storage,
    Unknown,
}

impl fmt::Display for ErrorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorTarget::Executor => "Executor",
            ErrorTarget::FlowExecutor => "FlowExecutor",
            ErrorTarget::Tool => "Tool",
            ErrorTarget::Runtime => "Runtime",
            ErrorTarget::Storage => "Storage",
            ErrorTarget::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Serializable error payload attached to run records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub kind: ErrorKind,
    pub target: ErrorTarget,
}

impl ErrorInfo {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        kind: ErrorKind,
        target: ErrorTarget,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            kind,
            target,
        }
    }

    /// Build the payload for any classified error.
    pub fn from_error<E: Classify + fmt::Display + ?Sized>(err: &E) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            kind: err.kind(),
            target: err.target(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Errors that know their code, kind and raising layer.
pub trait Classify {
    fn code(&self) -> &'static str;
    fn kind(&self) -> ErrorKind;
    fn target(&self) -> ErrorTarget;
}

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Flow definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Classify for FlowError {
    fn code(&self) -> &'static str {
        match self {
            FlowError::Definition(e) => e.code(),
            FlowError::Tool(e) => e.code(),
            FlowError::Io(_) => "FlowFileReadError",
            FlowError::Serialization(_) | FlowError::Yaml(_) => "InvalidFlowDocument",
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Tool(e) => e.kind(),
            _ => ErrorKind::User,
        }
    }

    fn target(&self) -> ErrorTarget {
        match self {
            FlowError::Tool(e) => e.target(),
            _ => ErrorTarget::Executor,
        }
    }
}

/// Errors raised by a tool invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Cancelled")]
    Cancelled,
}

impl Classify for ToolError {
    fn code(&self) -> &'static str {
        match self {
            ToolError::MissingInput(_) => "ToolInputMissing",
            ToolError::InvalidInputType { .. } => "ToolInputTypeMismatch",
            ToolError::Configuration(_) => "ToolConfigurationError",
            ToolError::ExecutionFailed(_) => "ToolExecutionError",
            ToolError::Timeout { .. } => "ToolTimeout",
            ToolError::Cancelled => "ToolCanceled",
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            ToolError::Timeout { .. } | ToolError::Cancelled => ErrorKind::System,
            _ => ErrorKind::User,
        }
    }

    fn target(&self) -> ErrorTarget {
        ErrorTarget::Tool
    }
}

/// Errors found while loading or checking a flow document.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("Node '{node}' has an invalid activate config: both 'when' and 'is' must be set")]
    InvalidActivateConfig { node: String },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node '{node}' references tool '{tool}' which is not in the flow")]
    ToolNotFound { node: String, tool: String },

    #[error("Node '{node}' references flow input '{input}' which is not defined")]
    InputNotFound { node: String, input: String },

    #[error("'{owner}' references node '{reference}' which is not in the flow")]
    ReferenceNotFound { owner: String, reference: String },

    #[error("Duplicate node name: {0}")]
    DuplicateNodeName(String),

    #[error("Cyclic dependency detected involving node '{0}'")]
    CyclicDependency(String),

    #[error("Node '{node}' cannot reference aggregation node '{aggregation}'")]
    AggregationReference { node: String, aggregation: String },

    #[error("Invalid flow: {0}")]
    Invalid(String),
}

impl Classify for DefinitionError {
    fn code(&self) -> &'static str {
        match self {
            DefinitionError::InvalidActivateConfig { .. } => "InvalidActivateConfig",
            DefinitionError::NodeNotFound(_) => "NodeNotFound",
            DefinitionError::ToolNotFound { .. } => "ToolNotFoundInFlow",
            DefinitionError::InputNotFound { .. } => "InputNotFound",
            DefinitionError::ReferenceNotFound { .. } => "NodeReferenceNotFound",
            DefinitionError::DuplicateNodeName(_) => "DuplicateNodeName",
            DefinitionError::CyclicDependency(_) => "NodeCircularDependency",
            DefinitionError::AggregationReference { .. } => "NodeReferenceError",
            DefinitionError::Invalid(_) => "FlowDefinitionError",
        }
    }

    fn kind(&self) -> ErrorKind {
        ErrorKind::User
    }

    fn target(&self) -> ErrorTarget {
        ErrorTarget::Executor
    }
}

/// Errors raised by a connection provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("Connection '{name}' is not found, available connection keys {available:?}.")]
    NotFound { name: String, available: Vec<String> },

    #[error("Failed to load connections: {0}")]
    Load(String),
}

impl Classify for ConnectionError {
    fn code(&self) -> &'static str {
        match self {
            ConnectionError::NotFound { .. } => "ConnectionNotFound",
            ConnectionError::Load(_) => "ConnectionLoadError",
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            ConnectionError::NotFound { .. } => ErrorKind::User,
            ConnectionError::Load(_) => ErrorKind::System,
        }
    }

    fn target(&self) -> ErrorTarget {
        ErrorTarget::Runtime
    }
}

/// Errors raised while parsing a submission document.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("Invalid run_mode value: {0}")]
    InvalidRunMode(i64),

    #[error("Failed to deserialize {class_name} due to {message}.")]
    Deserialize {
        class_name: &'static str,
        message: String,
    },

    #[error("Evaluation flow is submitted but its ID is not set.")]
    MissingEvalFlowId,
}

impl Classify for RequestError {
    fn code(&self) -> &'static str {
        match self {
            RequestError::InvalidRunMode(_) => "InvalidRunMode",
            RequestError::Deserialize { .. } => "FlowRequestDeserializeError",
            RequestError::MissingEvalFlowId => "MissingEvalFlowId",
        }
    }

    fn kind(&self) -> ErrorKind {
        ErrorKind::User
    }

    fn target(&self) -> ErrorTarget {
        ErrorTarget::Runtime
    }
}

/// Errors raised by a run storage backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Run info not found: {0}")]
    RunInfoNotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl Classify for StorageError {
    fn code(&self) -> &'static str {
        match self {
            StorageError::RunInfoNotFound(_) => "RunInfoNotFound",
            StorageError::Backend(_) => "RunStorageError",
        }
    }

    fn kind(&self) -> ErrorKind {
        ErrorKind::System
    }

    fn target(&self) -> ErrorTarget {
        ErrorTarget::Storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_info_carries_classification() {
        let err = DefinitionError::InvalidActivateConfig {
            node: "a".to_string(),
        };
        let info = ErrorInfo::from_error(&err);
        assert_eq!(info.code, "InvalidActivateConfig");
        assert_eq!(info.kind, ErrorKind::User);
        assert_eq!(info.target, ErrorTarget::Executor);
        assert!(info.message.contains("'a'"));
    }

    #[test]
    fn flow_error_delegates_to_inner_tool_error() {
        let err = FlowError::from(ToolError::Timeout { seconds: 3 });
        assert_eq!(err.code(), "ToolTimeout");
        assert_eq!(err.kind(), ErrorKind::System);
        assert_eq!(err.target(), ErrorTarget::Tool);
    }
}
