use chrono::Utc;
use flowcore::{
    ErrorInfo, EventBus, ExecutionEvent, FlowRunInfo, RunInfo, RunStorage, Status, StorageError,
    Value,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How a run ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed {
        output: Option<Value>,
        metrics: HashMap<String, Value>,
    },
    Failed(ErrorInfo),
    Canceled(Option<ErrorInfo>),
}

impl RunOutcome {
    pub fn completed(output: Value) -> Self {
        RunOutcome::Completed {
            output: Some(output),
            metrics: HashMap::new(),
        }
    }

    fn status(&self) -> Status {
        match self {
            RunOutcome::Completed { .. } => Status::Completed,
            RunOutcome::Failed(_) => Status::Failed,
            RunOutcome::Canceled(_) => Status::Canceled,
        }
    }
}

/// Single shared store for run records during execution
///
/// Every node and flow run mutation goes through here so concurrent nodes
/// never race on the same record. Finished records are pushed to the
/// configured `RunStorage`.
pub struct RunTracker {
    storage: Arc<dyn RunStorage>,
    events: Arc<EventBus>,
    flow_runs: RwLock<HashMap<String, FlowRunInfo>>,
    node_runs: RwLock<HashMap<String, RunInfo>>,
}

impl RunTracker {
    pub fn new(storage: Arc<dyn RunStorage>, events: Arc<EventBus>) -> Self {
        Self {
            storage,
            events,
            flow_runs: RwLock::new(HashMap::new()),
            node_runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn RunStorage> {
        &self.storage
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    fn flows(&self) -> RwLockReadGuard<'_, HashMap<String, FlowRunInfo>> {
        self.flow_runs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn flows_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, FlowRunInfo>> {
        self.flow_runs.write().unwrap_or_else(|e| e.into_inner())
    }

    fn nodes(&self) -> RwLockReadGuard<'_, HashMap<String, RunInfo>> {
        self.node_runs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn nodes_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, RunInfo>> {
        self.node_runs.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a batch-level run whose root is itself.
    pub fn start_root_flow_run(&self, flow_id: &str, run_id: &str, variant_id: &str) -> FlowRunInfo {
        self.start_flow_run(flow_id, run_id, run_id, "", None, variant_id)
    }

    pub fn start_flow_run(
        &self,
        flow_id: &str,
        root_run_id: &str,
        run_id: &str,
        parent_run_id: &str,
        index: Option<usize>,
        variant_id: &str,
    ) -> FlowRunInfo {
        let mut run = FlowRunInfo::new(flow_id, run_id, root_run_id, parent_run_id, Status::Running);
        run.index = index;
        run.variant_id = variant_id.to_string();

        if let Some(previous) = self.flows_mut().insert(run_id.to_string(), run.clone()) {
            tracing::warn!(run_id, status = %previous.status, "Flow run restarted, replacing the earlier record");
        }
        self.events.emit(ExecutionEvent::FlowRunStarted {
            run_id: run_id.to_string(),
            flow_id: flow_id.to_string(),
            parent_run_id: Some(parent_run_id.to_string()).filter(|p| !p.is_empty()),
            index,
            variant_id: variant_id.to_string(),
            timestamp: Utc::now(),
        });
        run
    }

    pub fn update_flow_run<F: FnOnce(&mut FlowRunInfo)>(&self, run_id: &str, f: F) {
        match self.flows_mut().get_mut(run_id) {
            Some(run) => f(run),
            None => tracing::warn!(run_id, "Update for unknown flow run ignored"),
        }
    }

    /// Register a record built elsewhere, e.g. a line that failed before it could start.
    pub fn insert_flow_run(&self, run: FlowRunInfo) {
        self.flows_mut().insert(run.run_id.clone(), run);
    }

    pub fn start_node_run(
        &self,
        node: &str,
        flow_run_id: &str,
        parent_run_id: &str,
        run_id: &str,
        index: Option<usize>,
        variant_id: &str,
    ) -> RunInfo {
        let run = RunInfo::start(node, flow_run_id, run_id, parent_run_id, index, variant_id);
        self.nodes_mut().insert(run_id.to_string(), run.clone());
        self.events.emit(ExecutionEvent::NodeRunStarted {
            run_id: run_id.to_string(),
            node: node.to_string(),
            flow_run_id: flow_run_id.to_string(),
            timestamp: Utc::now(),
        });
        run
    }

    pub fn update_node_run<F: FnOnce(&mut RunInfo)>(&self, run_id: &str, f: F) {
        match self.nodes_mut().get_mut(run_id) {
            Some(run) => f(run),
            None => tracing::warn!(run_id, "Update for unknown node run ignored"),
        }
    }

    /// Record a node that was skipped by its activate condition or upstream bypass.
    pub fn bypass_node_run(
        &self,
        node: &str,
        flow_run_id: &str,
        parent_run_id: &str,
        run_id: &str,
        index: Option<usize>,
        variant_id: &str,
    ) -> RunInfo {
        let mut run = RunInfo::start(node, flow_run_id, run_id, parent_run_id, index, variant_id);
        run.status = Status::Bypassed;
        run.end_time = Some(run.start_time);
        self.nodes_mut().insert(run_id.to_string(), run.clone());
        tracing::info!(node, run_id, "Node bypassed");
        self.events.emit(ExecutionEvent::NodeRunBypassed {
            run_id: run_id.to_string(),
            node: node.to_string(),
            timestamp: Utc::now(),
        });
        run
    }

    /// Finalize a node run. A second call on a finished run is ignored.
    pub fn end_node_run(&self, run_id: &str, outcome: RunOutcome) -> Option<RunInfo> {
        let finished = {
            let mut nodes = self.nodes_mut();
            let run = match nodes.get_mut(run_id) {
                Some(run) => run,
                None => {
                    tracing::warn!(run_id, "End for unknown node run ignored");
                    return None;
                }
            };
            if run.status.is_terminal() {
                tracing::warn!(run_id, status = %run.status, "Node run already finalized");
                return None;
            }
            run.status = outcome.status();
            run.end_time = Some(Utc::now());
            match outcome {
                RunOutcome::Completed { output, metrics } => {
                    run.output = output;
                    run.metrics.extend(metrics);
                }
                RunOutcome::Failed(error) => run.error = Some(error),
                RunOutcome::Canceled(error) => run.error = error,
            }
            run.clone()
        };

        let event = match finished.status {
            Status::Completed => ExecutionEvent::NodeRunCompleted {
                run_id: finished.run_id.clone(),
                node: finished.node.clone(),
                cached: finished.cached_run_id.is_some(),
                duration_ms: finished.duration_ms(),
                timestamp: Utc::now(),
            },
            _ => ExecutionEvent::NodeRunFailed {
                run_id: finished.run_id.clone(),
                node: finished.node.clone(),
                error: finished.error.clone().unwrap_or_else(|| {
                    ErrorInfo::new(
                        "Canceled",
                        "node run canceled",
                        flowcore::ErrorKind::System,
                        flowcore::ErrorTarget::FlowExecutor,
                    )
                }),
                timestamp: Utc::now(),
            },
        };
        self.events.emit(event);
        Some(finished)
    }

    /// Finalize a flow run. A second call on a finished run is ignored.
    pub fn end_flow_run(&self, run_id: &str, outcome: RunOutcome) -> Option<FlowRunInfo> {
        let finished = {
            let mut flows = self.flows_mut();
            let run = match flows.get_mut(run_id) {
                Some(run) => run,
                None => {
                    tracing::warn!(run_id, "End for unknown flow run ignored");
                    return None;
                }
            };
            if run.status.is_terminal() {
                tracing::warn!(run_id, status = %run.status, "Flow run already finalized");
                return None;
            }
            run.status = outcome.status();
            run.end_time = Some(Utc::now());
            match outcome {
                RunOutcome::Completed { output, metrics } => {
                    run.output = output;
                    run.metrics.extend(metrics);
                }
                RunOutcome::Failed(error) => run.error = Some(error),
                RunOutcome::Canceled(error) => run.error = error,
            }
            run.clone()
        };
        self.events.emit(ExecutionEvent::FlowRunCompleted {
            run_id: finished.run_id.clone(),
            status: finished.status,
            duration_ms: finished.duration_ms(),
            timestamp: Utc::now(),
        });
        Some(finished)
    }

    /// Push the current node record to storage. Failures are logged only.
    pub async fn persist_node_run(&self, run_id: &str) {
        let run = match self.get_node_run(run_id) {
            Some(run) => run,
            None => return,
        };
        if let Err(e) = self.storage.persist_node_run(&run).await {
            tracing::error!(run_id, error = %e, "Failed to persist node run");
        }
    }

    pub async fn persist_flow_run(&self, run_id: &str) {
        let run = match self.get_flow_run(run_id) {
            Some(run) => run,
            None => return,
        };
        if let Err(e) = self.storage.persist_flow_run(&run).await {
            tracing::error!(run_id, error = %e, "Failed to persist flow run");
        }
    }

    pub fn get_flow_run(&self, run_id: &str) -> Option<FlowRunInfo> {
        self.flows().get(run_id).cloned()
    }

    pub fn get_node_run(&self, run_id: &str) -> Option<RunInfo> {
        self.nodes().get(run_id).cloned()
    }

    /// The root run followed by its line runs in index order.
    pub fn collect_flow_runs(&self, root_run_id: &str) -> Vec<FlowRunInfo> {
        let mut runs: Vec<FlowRunInfo> = self
            .flows()
            .values()
            .filter(|r| r.root_run_id == root_run_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| (!r.is_root(), r.index));
        runs
    }

    /// Node runs recorded under a root flow run, ordered by line then start time.
    pub fn collect_node_runs(&self, flow_run_id: &str) -> Vec<RunInfo> {
        let mut runs: Vec<RunInfo> = self
            .nodes()
            .values()
            .filter(|r| r.flow_run_id == flow_run_id)
            .cloned()
            .collect();
        sort_node_runs(&mut runs);
        runs
    }

    pub fn collect_child_node_runs(&self, parent_run_id: &str) -> Vec<RunInfo> {
        let mut runs: Vec<RunInfo> = self
            .nodes()
            .values()
            .filter(|r| r.parent_run_id == parent_run_id)
            .cloned()
            .collect();
        sort_node_runs(&mut runs);
        runs
    }

    /// `{"<node>.<status>": count}` over the node runs of a root run.
    pub fn status_summary(&self, root_run_id: &str) -> HashMap<String, Value> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        for run in self.nodes().values().filter(|r| r.flow_run_id == root_run_id) {
            let key = format!("{}.{}", run.node, run.status.as_str().to_lowercase());
            *counts.entry(key).or_default() += 1;
        }
        counts
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect()
    }

    /// End every listed root run, and anything beneath it, that is not terminal yet.
    pub async fn mark_runs_failed(&self, flow_id: &str, root_run_ids: &[String], error: &ErrorInfo) {
        for root in root_run_ids {
            let child_nodes: Vec<String> = self
                .nodes()
                .values()
                .filter(|r| &r.flow_run_id == root && !r.status.is_terminal())
                .map(|r| r.run_id.clone())
                .collect();
            for run_id in child_nodes {
                self.end_node_run(&run_id, RunOutcome::Failed(error.clone()));
                self.persist_node_run(&run_id).await;
            }

            let child_flows: Vec<String> = self
                .flows()
                .values()
                .filter(|r| &r.root_run_id == root && !r.is_root() && !r.status.is_terminal())
                .map(|r| r.run_id.clone())
                .collect();
            for run_id in child_flows {
                self.end_flow_run(&run_id, RunOutcome::Failed(error.clone()));
                self.persist_flow_run(&run_id).await;
            }

            if let Some(run) = self.get_flow_run(root) {
                if !run.status.is_terminal() {
                    tracing::warn!(run_id = %root, status = %run.status, "Marking root run as failed");
                    self.end_flow_run(root, RunOutcome::Failed(error.clone()));
                    self.persist_flow_run(root).await;
                }
                continue;
            }

            match self.storage.get_flow_run(root, flow_id).await {
                Ok(mut stored) if !stored.status.is_terminal() => {
                    tracing::warn!(run_id = %root, status = %stored.status, "Marking stored run as failed");
                    stored.status = Status::Failed;
                    stored.error = Some(error.clone());
                    stored.end_time = Some(Utc::now());
                    if let Err(e) = self.storage.update_flow_run_info(&stored).await {
                        tracing::error!(run_id = %root, error = %e, "Failed to update run");
                    }
                    self.insert_flow_run(stored);
                }
                Ok(stored) => self.insert_flow_run(stored),
                Err(StorageError::RunInfoNotFound(_)) => {
                    let run = FlowRunInfo::create_with_error(flow_id, root, root, "", None, "", error.clone());
                    self.insert_flow_run(run);
                    self.persist_flow_run(root).await;
                }
                Err(e) => {
                    tracing::error!(run_id = %root, error = %e, "Failed to load run while marking it failed");
                }
            }
        }
    }

    pub async fn is_cancel_requested(&self, run_id: &str) -> bool {
        match self.storage.get_run_status(run_id).await {
            Ok(Some(Status::CancelRequested)) => true,
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(run_id, error = %e, "Failed to read run status");
                false
            }
        }
    }

    /// Poll storage for a cancel request on any of `run_ids` and trip `token`.
    pub fn watch_cancellation(
        self: &Arc<Self>,
        run_ids: Vec<String>,
        token: CancellationToken,
        interval: Duration,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                for run_id in &run_ids {
                    if tracker.is_cancel_requested(run_id).await {
                        tracing::info!(run_id = %run_id, "Cancel requested, draining in-flight nodes");
                        token.cancel();
                        return;
                    }
                }
            }
        })
    }
}

fn sort_node_runs(runs: &mut [RunInfo]) {
    runs.sort_by(|a, b| {
        (a.index, a.start_time, &a.run_id).cmp(&(b.index, b.start_time, &b.run_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryRunStorage;
    use flowcore::{ErrorKind, ErrorTarget};
    use serde_json::json;

    fn tracker() -> (Arc<RunTracker>, Arc<InMemoryRunStorage>) {
        let storage = Arc::new(InMemoryRunStorage::new());
        let tracker = Arc::new(RunTracker::new(storage.clone(), Arc::new(EventBus::new(64))));
        (tracker, storage)
    }

    fn boom() -> ErrorInfo {
        ErrorInfo::new("Boom", "boom", ErrorKind::System, ErrorTarget::Runtime)
    }

    #[test]
    fn finalization_happens_once() {
        let (tracker, _) = tracker();
        tracker.start_node_run("a", "root", "root_0", "root_a_0", Some(0), "");
        assert!(tracker
            .end_node_run("root_a_0", RunOutcome::completed(json!(1)))
            .is_some());
        assert!(tracker
            .end_node_run("root_a_0", RunOutcome::Failed(boom()))
            .is_none());
        let run = tracker.get_node_run("root_a_0").unwrap();
        assert_eq!(run.status, Status::Completed);
        assert_eq!(run.output, Some(json!(1)));
    }

    #[test]
    fn collects_runs_in_line_order_and_summarizes() {
        let (tracker, _) = tracker();
        tracker.start_root_flow_run("f", "root", "");
        for i in [2usize, 0, 1] {
            let line = format!("root_{}", i);
            tracker.start_flow_run("f", "root", &line, "root", Some(i), "");
            let node_run = format!("{}_a_{}", line, i);
            tracker.start_node_run("a", "root", &line, &node_run, Some(i), "");
            let outcome = if i == 1 {
                RunOutcome::Failed(boom())
            } else {
                RunOutcome::completed(json!(i))
            };
            tracker.end_node_run(&node_run, outcome);
        }
        let runs = tracker.collect_flow_runs("root");
        let ids: Vec<_> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["root", "root_0", "root_1", "root_2"]);

        let nodes = tracker.collect_node_runs("root");
        assert_eq!(nodes.iter().map(|r| r.index).collect::<Vec<_>>(), vec![Some(0), Some(1), Some(2)]);

        let summary = tracker.status_summary("root");
        assert_eq!(summary["a.completed"], json!(2));
        assert_eq!(summary["a.failed"], json!(1));
    }

    #[tokio::test]
    async fn mark_runs_failed_covers_tracked_stored_and_unknown_runs() {
        let (tracker, storage) = tracker();
        tracker.start_root_flow_run("f", "live", "");
        tracker.start_flow_run("f", "live", "live_0", "live", Some(0), "");
        storage.register_pending("f", "pending").await;

        let ids = vec!["live".to_string(), "pending".to_string(), "never".to_string()];
        tracker.mark_runs_failed("f", &ids, &boom()).await;

        for id in ["live", "live_0", "pending", "never"] {
            let run = tracker.get_flow_run(id).unwrap();
            assert_eq!(run.status, Status::Failed, "{id}");
        }
        assert_eq!(
            storage.get_run_status("pending").await.unwrap(),
            Some(Status::Failed)
        );
        assert_eq!(
            storage.get_run_status("never").await.unwrap(),
            Some(Status::Failed)
        );
    }

    #[tokio::test]
    async fn cancellation_watch_trips_token() {
        let (tracker, storage) = tracker();
        tracker.start_root_flow_run("f", "root", "");
        tracker.persist_flow_run("root").await;
        storage.cancel_run("root").await.unwrap();

        let token = CancellationToken::new();
        let handle = tracker.watch_cancellation(
            vec!["root".to_string()],
            token.clone(),
            Duration::from_millis(10),
        );
        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
        handle.await.unwrap();
    }
}
