use crate::{FlowRunInfo, RunInfo, Status, StorageError};
use async_trait::async_trait;

/// Persistence for run records
///
/// The executor never reads its own writes back through this trait except
/// for cancellation polling and Eval-mode lookups of prior runs.
#[async_trait]
pub trait RunStorage: Send + Sync {
    async fn persist_node_run(&self, run: &RunInfo) -> Result<(), StorageError>;

    async fn persist_flow_run(&self, run: &FlowRunInfo) -> Result<(), StorageError>;

    async fn update_flow_run_info(&self, run: &FlowRunInfo) -> Result<(), StorageError>;

    async fn get_flow_run(&self, run_id: &str, flow_id: &str) -> Result<FlowRunInfo, StorageError>;

    /// Mark a run `CancelRequested`; executors observe it on their next poll.
    async fn cancel_run(&self, run_id: &str) -> Result<(), StorageError>;

    async fn get_run_status(&self, run_id: &str) -> Result<Option<Status>, StorageError>;
}
