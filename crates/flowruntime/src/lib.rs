//! Flow execution runtime
//!
//! Resolves tools, walks the node graph line by line, runs aggregation
//! nodes and evaluation flows, and records every run through the tracker.

mod cache;
mod connections;
mod coordinator;
mod dag;
mod error;
mod evaluation;
mod executor;
mod fn_tool;
mod node_executor;
mod registry;
mod resolver;
mod runtime;
mod storage;
mod tracker;
mod validation;

pub use cache::{fingerprint, CacheError, CacheInfo, CacheRecord, CacheStore, InMemoryCache};
pub use connections::{ConnectionManager, CONNECTIONS_ENV};
pub use coordinator::{resolve_environment, CoordinatorState, FlowExecutionCoordinator};
pub use dag::{DagManager, NodeGraph};
pub use error::{ExecutionError, SubmissionError, ToolResolveError};
pub use evaluation::{
    apply_inputs_mapping, collect_variant_outputs, construct_eval_batch_inputs,
    is_collection_mode, LineOutputs, LINE_NUMBER, VARIANT_ID, VARIANT_IDS,
};
pub use executor::{BatchResult, ExecutionContext, FlowExecutor, LineResult};
pub use fn_tool::{FnTool, FnToolFactory};
pub use node_executor::{NodeExecutor, NodeRunIdentity};
pub use registry::{find_deprecated_tools, ToolFactory, ToolRegistry};
pub use resolver::{required_connection_names, ResolvedNode, ToolResolver};
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use storage::InMemoryRunStorage;
pub use tracker::{RunOutcome, RunTracker};
pub use validation::{ensure_flow_inputs, validate_flow};
