use async_trait::async_trait;
use flowcore::{FlowRunInfo, RunInfo, RunStorage, Status, StorageError};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Run storage kept in process memory.
#[derive(Default)]
pub struct InMemoryRunStorage {
    flow_runs: RwLock<HashMap<String, FlowRunInfo>>,
    node_runs: RwLock<HashMap<String, RunInfo>>,
}

impl InMemoryRunStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn node_runs_of(&self, flow_run_id: &str) -> Vec<RunInfo> {
        let mut runs: Vec<RunInfo> = self
            .node_runs
            .read()
            .await
            .values()
            .filter(|r| r.flow_run_id == flow_run_id || r.parent_run_id == flow_run_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| (a.index, a.start_time).cmp(&(b.index, b.start_time)));
        runs
    }

    pub async fn child_flow_runs(&self, root_run_id: &str) -> Vec<FlowRunInfo> {
        let mut runs: Vec<FlowRunInfo> = self
            .flow_runs
            .read()
            .await
            .values()
            .filter(|r| r.root_run_id == root_run_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| (!r.is_root(), r.index));
        runs
    }

    /// Register a run that has been accepted but not started.
    pub async fn register_pending(&self, flow_id: &str, run_id: &str) {
        let run = FlowRunInfo::new(flow_id, run_id, run_id, "", Status::NotStarted);
        self.flow_runs
            .write()
            .await
            .entry(run_id.to_string())
            .or_insert(run);
    }
}

#[async_trait]
impl RunStorage for InMemoryRunStorage {
    async fn persist_node_run(&self, run: &RunInfo) -> Result<(), StorageError> {
        self.node_runs
            .write()
            .await
            .insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn persist_flow_run(&self, run: &FlowRunInfo) -> Result<(), StorageError> {
        let mut runs = self.flow_runs.write().await;
        // A cancel request written while the run was live must survive the
        // executor's own non-terminal updates.
        let keep_cancel = runs
            .get(&run.run_id)
            .is_some_and(|existing| existing.status == Status::CancelRequested)
            && !run.status.is_terminal();
        let mut stored = run.clone();
        if keep_cancel {
            stored.status = Status::CancelRequested;
        }
        runs.insert(run.run_id.clone(), stored);
        Ok(())
    }

    async fn update_flow_run_info(&self, run: &FlowRunInfo) -> Result<(), StorageError> {
        let mut runs = self.flow_runs.write().await;
        match runs.get_mut(&run.run_id) {
            Some(existing) => {
                let keep_cancel =
                    existing.status == Status::CancelRequested && !run.status.is_terminal();
                *existing = run.clone();
                if keep_cancel {
                    existing.status = Status::CancelRequested;
                }
                Ok(())
            }
            None => Err(StorageError::RunInfoNotFound(run.run_id.clone())),
        }
    }

    async fn get_flow_run(&self, run_id: &str, flow_id: &str) -> Result<FlowRunInfo, StorageError> {
        self.flow_runs
            .read()
            .await
            .get(run_id)
            .filter(|r| flow_id.is_empty() || r.flow_id == flow_id)
            .cloned()
            .ok_or_else(|| StorageError::RunInfoNotFound(run_id.to_string()))
    }

    async fn cancel_run(&self, run_id: &str) -> Result<(), StorageError> {
        let mut runs = self.flow_runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| StorageError::RunInfoNotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            tracing::warn!(run_id, status = %run.status, "Cannot cancel a finished run");
            return Ok(());
        }
        run.status = Status::CancelRequested;
        Ok(())
    }

    async fn get_run_status(&self, run_id: &str) -> Result<Option<Status>, StorageError> {
        Ok(self.flow_runs.read().await.get(run_id).map(|r| r.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_request_survives_running_updates() {
        let storage = InMemoryRunStorage::new();
        let mut run = FlowRunInfo::new("flow", "run_1", "run_1", "", Status::Running);
        storage.persist_flow_run(&run).await.unwrap();

        storage.cancel_run("run_1").await.unwrap();
        storage.persist_flow_run(&run).await.unwrap();
        assert_eq!(
            storage.get_run_status("run_1").await.unwrap(),
            Some(Status::CancelRequested)
        );

        run.status = Status::Canceled;
        storage.persist_flow_run(&run).await.unwrap();
        assert_eq!(
            storage.get_run_status("run_1").await.unwrap(),
            Some(Status::Canceled)
        );
    }

    #[tokio::test]
    async fn missing_runs_are_reported() {
        let storage = InMemoryRunStorage::new();
        assert!(matches!(
            storage.get_flow_run("nope", "").await,
            Err(StorageError::RunInfoNotFound(_))
        ));
        assert!(storage.cancel_run("nope").await.is_err());
        assert_eq!(storage.get_run_status("nope").await.unwrap(), None);
    }
}
