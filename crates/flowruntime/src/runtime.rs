use crate::cache::{CacheStore, InMemoryCache};
use crate::{
    ConnectionManager, FlowExecutionCoordinator, InMemoryRunStorage, RunTracker, SubmissionError,
    ToolRegistry,
};
use flowcore::{
    EventBus, ExecutionEvent, FlowRunInfo, RunStorage, StorageError, SubmissionResult,
    SubmitFlowRequest,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Main entry point for executing flow submissions
///
/// Owns the long-lived pieces (tool registry, run storage, cache, event bus,
/// process-wide connections). Every submission gets its own run tracker and
/// coordinator.
pub struct FlowRuntime {
    registry: Arc<ToolRegistry>,
    storage: Arc<dyn RunStorage>,
    events: Arc<EventBus>,
    cache: Arc<dyn CacheStore>,
    connections: Arc<ConnectionManager>,
    config: RuntimeConfig,
}

impl FlowRuntime {
    pub fn new(registry: ToolRegistry, config: RuntimeConfig) -> Self {
        let events = Arc::new(EventBus::new(config.event_buffer_size));
        Self {
            registry: Arc::new(registry),
            storage: Arc::new(InMemoryRunStorage::new()),
            events,
            cache: Arc::new(InMemoryCache::new()),
            connections: Arc::new(ConnectionManager::new()),
            config,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn RunStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    /// Connections that fill in whatever a request does not bring itself.
    pub fn with_connections(mut self, connections: ConnectionManager) -> Self {
        self.connections = Arc::new(connections);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<dyn RunStorage> {
        &self.storage
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Coordinator for one submission, with a fresh run tracker.
    pub fn coordinator(&self, cancellation: CancellationToken) -> FlowExecutionCoordinator {
        let tracker = Arc::new(RunTracker::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.events),
        ));
        FlowExecutionCoordinator::new(
            Arc::clone(&self.registry),
            Some(Arc::clone(&self.cache)),
            tracker,
            self.config.clone(),
        )
        .with_env_connections(Arc::clone(&self.connections))
        .with_cancellation(cancellation)
    }

    pub async fn submit(&self, request: SubmitFlowRequest) -> Result<SubmissionResult, SubmissionError> {
        self.submit_with_cancellation(request, CancellationToken::new())
            .await
    }

    /// Execute a submission; cancelling `token` drains in-flight nodes and
    /// finalizes the remaining runs as Canceled.
    pub async fn submit_with_cancellation(
        &self,
        request: SubmitFlowRequest,
        token: CancellationToken,
    ) -> Result<SubmissionResult, SubmissionError> {
        self.coordinator(token).execute(request).await
    }

    /// Ask a running submission to stop; the coordinator notices on its next poll.
    pub async fn cancel(&self, run_id: &str) -> Result<(), StorageError> {
        tracing::info!(run_id, "Cancel requested");
        self.storage.cancel_run(run_id).await
    }

    pub async fn get_flow_run(&self, run_id: &str) -> Result<FlowRunInfo, StorageError> {
        self.storage.get_flow_run(run_id, "").await
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.events
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Lines of a batch executing at once.
    pub worker_count: usize,
    /// Nodes of one line executing at once.
    pub node_concurrency: usize,
    /// Limit on a single tool call.
    pub line_timeout: Option<Duration>,
    pub event_buffer_size: usize,
    /// Base directory for script tools and prompt templates.
    pub working_dir: PathBuf,
    pub cache_enabled: bool,
    pub cancel_poll_interval: Duration,
    /// Fail the whole batch with the first failed line's error instead of
    /// recording the failure and carrying on.
    pub raise_ex: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_count: 16,
            node_concurrency: 16,
            line_timeout: Some(Duration::from_secs(600)),
            event_buffer_size: 1000,
            working_dir: PathBuf::from("."),
            cache_enabled: true,
            cancel_poll_interval: Duration::from_secs(1),
            raise_ex: false,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `PF_*` environment variables. Values that do
    /// not parse are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_parse::<usize>("PF_WORKER_COUNT") {
            config.worker_count = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("PF_NODE_CONCURRENCY") {
            config.node_concurrency = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("PF_LINE_TIMEOUT_SEC") {
            config.line_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Ok(dir) = std::env::var("PF_WORKING_DIR") {
            if !dir.is_empty() {
                config.working_dir = PathBuf::from(dir);
            }
        }
        if let Ok(flag) = std::env::var("PF_DISABLE_CACHE") {
            config.cache_enabled = !is_truthy(&flag);
        }
        if let Ok(flag) = std::env::var("PF_RAISE_EX") {
            config.raise_ex = is_truthy(&flag);
        }
        config
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_raise_ex(mut self, raise_ex: bool) -> Self {
        self.raise_ex = raise_ex;
        self
    }
}

fn is_truthy(flag: &str) -> bool {
    matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.worker_count, 16);
        assert_eq!(config.node_concurrency, 16);
        assert_eq!(config.line_timeout, Some(Duration::from_secs(600)));
        assert!(config.cache_enabled);
        assert!(!config.raise_ex);
    }

    #[test]
    fn env_overrides_are_applied() {
        std::env::set_var("PF_WORKER_COUNT", "4");
        std::env::set_var("PF_LINE_TIMEOUT_SEC", "0");
        std::env::set_var("PF_DISABLE_CACHE", "true");
        std::env::set_var("PF_NODE_CONCURRENCY", "many");
        std::env::set_var("PF_RAISE_EX", "yes");
        let config = RuntimeConfig::from_env();
        std::env::remove_var("PF_WORKER_COUNT");
        std::env::remove_var("PF_LINE_TIMEOUT_SEC");
        std::env::remove_var("PF_DISABLE_CACHE");
        std::env::remove_var("PF_NODE_CONCURRENCY");
        std::env::remove_var("PF_RAISE_EX");

        assert_eq!(config.worker_count, 4);
        assert_eq!(config.line_timeout, None);
        assert!(!config.cache_enabled);
        assert_eq!(config.node_concurrency, 16);
        assert!(config.raise_ex);
    }
}
