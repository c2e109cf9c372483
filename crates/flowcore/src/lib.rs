//! Core contracts for the flow engine
//!
//! Flow documents, tool schemas, run records and submission documents.
//! Execution lives in `flowruntime`; this crate only describes things.

mod assignment;
mod connection;
mod error;
pub mod events;
mod flow;
mod run_info;
mod storage;
mod submission;
mod tool;
mod value;

pub use assignment::{FlowInputPrefix, InputAssignment};
pub use connection::{Connection, ConnectionProvider, SCRUBBED_VALUE};
pub use error::{
    Classify, ConnectionError, DefinitionError, ErrorInfo, ErrorKind, ErrorTarget, FlowError,
    RequestError, StorageError, ToolError,
};
pub use events::*;
pub use flow::{
    connection_names_for_node, parse_env_reference, ActivateCondition, Flow, FlowInputDefinition,
    FlowOutputDefinition, Node, NodeVariant, NodeVariants, ToolSource, ToolSourceType,
};
pub use run_info::{FlowRunInfo, RunInfo, Status};
pub use storage::RunStorage;
pub use submission::{
    BatchFlowRequest, CreatedBy, EvalRequest, EvaluationMode, NodesRequest, RunMode,
    SubmissionData, SubmissionOutcome, SubmissionResult, SubmitFlowRequest,
};
pub use tool::{
    InputDefinition, InputType, OutputDefinition, Tool, ToolContext, ToolDefinition, ToolOutput,
    ToolType, ValueType,
};
pub use value::{InputRow, Value, ValueExt};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
