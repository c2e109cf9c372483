use flowcore::{
    Classify, ConnectionError, DefinitionError, ErrorInfo, ErrorKind, ErrorTarget, RequestError,
    StorageError, ToolError,
};
use thiserror::Error;

/// Errors raised while turning a node's tool reference into a callable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolResolveError {
    #[error(
        "Tools '{first}' and '{second}' both declare deprecated tool id '{deprecated}'; the mapping is ambiguous"
    )]
    DuplicateToolMapping {
        deprecated: String,
        first: String,
        second: String,
    },

    #[error("Node '{node}' references tool '{tool}' which is not defined in the flow")]
    ToolNotFound { node: String, tool: String },

    #[error("Package tool '{tool}' used by node '{node}' is not registered")]
    PackageToolNotFound { node: String, tool: String },

    #[error("Failed to load tool for node '{node}': {message}")]
    ModuleNotFound { node: String, message: String },

    #[error("Connection '{connection}' required by input '{input}' of node '{node}' is not found")]
    ConnectionNotFound {
        node: String,
        input: String,
        connection: String,
    },

    #[error("Node '{node}' has an invalid tool source: {message}")]
    InvalidSource { node: String, message: String },
}

impl Classify for ToolResolveError {
    fn code(&self) -> &'static str {
        match self {
            ToolResolveError::DuplicateToolMapping { .. } => "DuplicateToolMappingError",
            ToolResolveError::ToolNotFound { .. } => "ToolNotFoundInFlow",
            ToolResolveError::PackageToolNotFound { .. } => "PackageToolNotFoundError",
            ToolResolveError::ModuleNotFound { .. } => "ToolLoadError",
            ToolResolveError::ConnectionNotFound { .. } => "ConnectionNotFound",
            ToolResolveError::InvalidSource { .. } => "InvalidSource",
        }
    }

    fn kind(&self) -> ErrorKind {
        ErrorKind::User
    }

    fn target(&self) -> ErrorTarget {
        ErrorTarget::Executor
    }
}

/// Errors raised at node or line boundaries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("The value for flow input '{input}' is not provided in line {line}")]
    InputNotProvided { input: String, line: String },

    #[error("Flow input '{input}' has an invalid value: {message}")]
    InputTypeError { input: String, message: String },

    #[error("Node '{node}' depends on node '{upstream}' which did not complete")]
    UpstreamFailed { node: String, upstream: String },

    #[error("Node '{node}' failed to resolve '{reference}': {message}")]
    NodeReferenceError {
        node: String,
        reference: String,
        message: String,
    },

    #[error("Input '{input}' of node '{node}' is required but its upstream was bypassed")]
    RequiredInputBypassed { node: String, input: String },

    #[error("Flow output '{output}' references '{reference}' which is not available")]
    OutputReferenceNotFound { output: String, reference: String },

    #[error("Execution failure in '{node}': {source}")]
    Tool { node: String, source: ToolError },

    #[error("Line execution was canceled")]
    Canceled,

    /// A line failed while the runtime runs with `raise_ex`.
    #[error("Line {line} failed: {error}")]
    LineFailed { line: usize, error: ErrorInfo },

    #[error("Line execution task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Resolve(#[from] ToolResolveError),
}

impl Classify for ExecutionError {
    fn code(&self) -> &'static str {
        match self {
            ExecutionError::InputNotProvided { .. } => "InputNotFound",
            ExecutionError::InputTypeError { .. } => "InputTypeError",
            ExecutionError::UpstreamFailed { .. } => "UpstreamNodeFailed",
            ExecutionError::NodeReferenceError { .. } => "NodeReferenceError",
            ExecutionError::RequiredInputBypassed { .. } => "RequiredInputBypassed",
            ExecutionError::OutputReferenceNotFound { .. } => "OutputReferenceNotExist",
            ExecutionError::Tool { source, .. } => source.code(),
            ExecutionError::Canceled => "ExecutionCanceled",
            ExecutionError::LineFailed { .. } => "LineExecutionFailed",
            ExecutionError::Join(_) => "ExecutionTaskFailed",
            ExecutionError::Definition(e) => e.code(),
            ExecutionError::Resolve(e) => e.code(),
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::Tool { source, .. } => source.kind(),
            ExecutionError::LineFailed { error, .. } => error.kind,
            ExecutionError::Canceled | ExecutionError::Join(_) => ErrorKind::System,
            _ => ErrorKind::User,
        }
    }

    fn target(&self) -> ErrorTarget {
        match self {
            ExecutionError::Tool { .. } => ErrorTarget::Tool,
            ExecutionError::Definition(_) | ExecutionError::Resolve(_) => ErrorTarget::Executor,
            _ => ErrorTarget::FlowExecutor,
        }
    }
}

/// Errors returned by the coordinator for a whole submission.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubmissionError {
    #[error("Request type {0} is not supported")]
    RequestTypeNotSupported(String),

    #[error("Invalid run_mode value: {0}")]
    InvalidRunMode(i64),

    #[error(transparent)]
    Request(RequestError),

    #[error("Batch inputs are empty")]
    EmptyInput,

    #[error("Bulk test id is not set for a bulk test request")]
    BulkTestIdNotFound,

    #[error("Baseline variant id is not set for a bulk test request")]
    BaselineVariantIdNotFound,

    #[error("Evaluation flow run id is not set")]
    EvaluationFlowRunIdNotFound,

    #[error("Evaluation flow is not supported in Flow run mode")]
    EvaluationFlowNotSupported,

    #[error("Variant count {variants} does not match variant run count {runs}")]
    VariantCountNotMatchWithRunCount { variants: usize, runs: usize },

    #[error("Baseline variant '{0}' must not appear in variants")]
    BaselineVariantInVariants(String),

    #[error("Variant id is not set on run '{0}'")]
    VariantIdNotFound(String),

    #[error("Duplicate variant id '{0}' across referenced runs")]
    DuplicateVariantId(String),

    #[error("Bulk test inputs are missing for evaluation")]
    MissingBulkInputs,

    #[error("No valid output line is available for evaluation")]
    NoValidOutputLine,

    #[error("Evaluation input count {inputs} does not match output count {outputs} of variant '{variant}'")]
    InputOutputCountMismatch {
        variant: String,
        inputs: usize,
        outputs: usize,
    },

    #[error("Connection '{name}' is not found, available connection keys {available:?}.")]
    ConnectionNotFound { name: String, available: Vec<String> },

    #[error("Failed to resolve environment variable '{key}': {message}")]
    ResolveConnection { key: String, message: String },

    #[error("Run '{0}' is not found in run storage")]
    RunNotFound(String),

    #[error("Run storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Tool(#[from] ToolResolveError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl From<RequestError> for SubmissionError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::InvalidRunMode(mode) => SubmissionError::InvalidRunMode(mode),
            other => SubmissionError::Request(other),
        }
    }
}

impl From<ConnectionError> for SubmissionError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::NotFound { name, available } => {
                SubmissionError::ConnectionNotFound { name, available }
            }
            ConnectionError::Load(message) => SubmissionError::ResolveConnection {
                key: String::new(),
                message,
            },
        }
    }
}

impl From<StorageError> for SubmissionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RunInfoNotFound(id) => SubmissionError::RunNotFound(id),
            StorageError::Backend(message) => SubmissionError::Storage(message),
        }
    }
}

impl Classify for SubmissionError {
    fn code(&self) -> &'static str {
        match self {
            SubmissionError::RequestTypeNotSupported(_) => "RequestTypeNotSupported",
            SubmissionError::InvalidRunMode(_) => "InvalidRunMode",
            SubmissionError::Request(e) => e.code(),
            SubmissionError::EmptyInput => "EmptyInputError",
            SubmissionError::BulkTestIdNotFound => "BulkTestIdNotFound",
            SubmissionError::BaselineVariantIdNotFound => "BaselineVariantIdNotFound",
            SubmissionError::EvaluationFlowRunIdNotFound => "EvaluationFlowRunIdNotFound",
            SubmissionError::EvaluationFlowNotSupported => "EvaluationFlowNotSupported",
            SubmissionError::VariantCountNotMatchWithRunCount { .. } => {
                "VariantCountNotMatchWithRunCount"
            }
            SubmissionError::BaselineVariantInVariants(_) => "BaselineVariantInVariants",
            SubmissionError::VariantIdNotFound(_) => "VariantIdNotFound",
            SubmissionError::DuplicateVariantId(_) => "DuplicateVariantId",
            SubmissionError::MissingBulkInputs => "MissingBulkInputs",
            SubmissionError::NoValidOutputLine => "NoValidOutputLine",
            SubmissionError::InputOutputCountMismatch { .. } => {
                "NumberOfInputsAndOutputsNotEqual"
            }
            SubmissionError::ConnectionNotFound { .. } => "ConnectionNotFound",
            SubmissionError::ResolveConnection { .. } => "ResolveConnectionError",
            SubmissionError::RunNotFound(_) => "RunInfoNotFound",
            SubmissionError::Storage(_) => "RunStorageError",
            SubmissionError::Definition(e) => e.code(),
            SubmissionError::Tool(e) => e.code(),
            SubmissionError::Execution(e) => e.code(),
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            SubmissionError::NoValidOutputLine
            | SubmissionError::RunNotFound(_)
            | SubmissionError::Storage(_) => ErrorKind::System,
            SubmissionError::Execution(e) => e.kind(),
            _ => ErrorKind::User,
        }
    }

    fn target(&self) -> ErrorTarget {
        match self {
            SubmissionError::RunNotFound(_) | SubmissionError::Storage(_) => ErrorTarget::Storage,
            SubmissionError::Definition(e) => e.target(),
            SubmissionError::Tool(e) => e.target(),
            SubmissionError::Execution(e) => e.target(),
            _ => ErrorTarget::Runtime,
        }
    }
}
