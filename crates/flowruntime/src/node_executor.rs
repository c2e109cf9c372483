use crate::cache::{fingerprint, CacheStore};
use crate::tracker::{RunOutcome, RunTracker};
use crate::{ExecutionError, ResolvedNode};
use flowcore::{ErrorInfo, RunInfo, ToolContext, ToolError, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Where a node run sits in the run lineage.
#[derive(Debug, Clone)]
pub struct NodeRunIdentity {
    pub node: String,
    pub run_id: String,
    pub flow_run_id: String,
    pub parent_run_id: String,
    pub index: Option<usize>,
    pub variant_id: String,
}

impl NodeRunIdentity {
    /// Identity of a node inside a line; the line run id is the parent.
    pub fn for_line(
        node: &str,
        flow_run_id: &str,
        line_run_id: &str,
        index: Option<usize>,
        variant_id: &str,
    ) -> Self {
        let run_id = match index {
            Some(i) => format!("{}_{}_{}", line_run_id, node, i),
            None => format!("{}_{}", line_run_id, node),
        };
        Self {
            node: node.to_string(),
            run_id,
            flow_run_id: flow_run_id.to_string(),
            parent_run_id: line_run_id.to_string(),
            index,
            variant_id: variant_id.to_string(),
        }
    }

    /// Identity of an aggregation node run for a whole batch.
    pub fn for_aggregation(node: &str, flow_run_id: &str, variant_id: &str) -> Self {
        Self {
            node: node.to_string(),
            run_id: format!("{}_{}_reduce", flow_run_id, node),
            flow_run_id: flow_run_id.to_string(),
            parent_run_id: flow_run_id.to_string(),
            index: None,
            variant_id: variant_id.to_string(),
        }
    }
}

/// Runs one resolved node and records the result through the tracker.
///
/// Tool failures end the node run as Failed and never propagate further.
#[derive(Clone)]
pub struct NodeExecutor {
    tracker: Arc<RunTracker>,
    cache: Option<Arc<dyn CacheStore>>,
    env: Arc<HashMap<String, String>>,
    timeout: Option<Duration>,
    cancellation: CancellationToken,
}

impl NodeExecutor {
    pub fn new(tracker: Arc<RunTracker>) -> Self {
        Self {
            tracker,
            cache: None,
            env: Arc::new(HashMap::new()),
            timeout: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cache(mut self, cache: Option<Arc<dyn CacheStore>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_env(mut self, env: Arc<HashMap<String, String>>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.tracker
    }

    /// Invoke the node's tool with already-resolved inputs.
    pub async fn execute(
        &self,
        resolved: &ResolvedNode,
        id: &NodeRunIdentity,
        inputs: HashMap<String, Value>,
    ) -> RunInfo {
        let started = self.tracker.start_node_run(
            &id.node,
            &id.flow_run_id,
            &id.parent_run_id,
            &id.run_id,
            id.index,
            &id.variant_id,
        );

        let mut recorded = inputs;
        recorded.extend(resolved.extra_inputs.clone());
        for (input, connection) in &resolved.connections {
            recorded.insert(input.clone(), Value::String(connection.name.clone()));
        }
        let recorded_copy = recorded.clone();
        self.tracker
            .update_node_run(&id.run_id, |run| run.inputs = recorded_copy);

        let cache_info = (resolved.node.enable_cache && self.cache.is_some())
            .then(|| fingerprint(&resolved.definition, &recorded));

        if let (Some(info), Some(cache)) = (&cache_info, &self.cache) {
            if let Some(hit) = cache.get(info) {
                tracing::info!(
                    node = %id.node,
                    run_id = %id.run_id,
                    cached_run_id = %hit.run_id,
                    "Cache hit, reusing earlier output"
                );
                self.tracker.update_node_run(&id.run_id, |run| {
                    run.cached_run_id = Some(hit.run_id.clone());
                    run.cached_flow_run_id = Some(hit.flow_run_id.clone());
                });
                return self
                    .finish(&id.run_id, RunOutcome::completed(hit.output), started)
                    .await;
            }
        }

        let mut invocation = recorded;
        for (input, connection) in &resolved.connections {
            invocation.insert(input.clone(), connection.to_value());
        }
        let ctx = ToolContext {
            node: id.node.clone(),
            run_id: id.run_id.clone(),
            inputs: invocation,
            env: Arc::clone(&self.env),
            events: self.tracker.events().create_emitter(&id.run_id, &id.node),
            cancellation: self.cancellation.child_token(),
        };

        let start = Instant::now();
        let result = match self.timeout {
            Some(limit) => match timeout(limit, resolved.tool.invoke(ctx)).await {
                Ok(result) => result,
                Err(_) => Err(ToolError::Timeout {
                    seconds: limit.as_secs(),
                }),
            },
            None => resolved.tool.invoke(ctx).await,
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                tracing::info!(node = %id.node, run_id = %id.run_id, duration_ms, "Node completed");
                let outcome = RunOutcome::Completed {
                    output: Some(output.value),
                    metrics: output.metrics,
                };
                let run = self.finish(&id.run_id, outcome, started).await;
                if let (Some(info), Some(cache)) = (&cache_info, &self.cache) {
                    if let Err(e) = cache.persist(info, &run) {
                        tracing::warn!(node = %id.node, error = %e, "Failed to write cache entry");
                    }
                }
                run
            }
            Err(ToolError::Cancelled) => {
                let err = ExecutionError::Tool {
                    node: id.node.clone(),
                    source: ToolError::Cancelled,
                };
                tracing::warn!(node = %id.node, run_id = %id.run_id, duration_ms, "Node canceled by its tool");
                self.finish(&id.run_id, RunOutcome::Canceled(Some(ErrorInfo::from_error(&err))), started)
                    .await
            }
            Err(source) => {
                let err = ExecutionError::Tool {
                    node: id.node.clone(),
                    source,
                };
                tracing::error!(node = %id.node, run_id = %id.run_id, duration_ms, error = %err, "Node failed");
                self.finish(&id.run_id, RunOutcome::Failed(ErrorInfo::from_error(&err)), started)
                    .await
            }
        }
    }

    /// Record a node that failed before its tool could be called.
    pub async fn fail_without_invocation(
        &self,
        id: &NodeRunIdentity,
        inputs: HashMap<String, Value>,
        err: &ExecutionError,
    ) -> RunInfo {
        let started = self.tracker.start_node_run(
            &id.node,
            &id.flow_run_id,
            &id.parent_run_id,
            &id.run_id,
            id.index,
            &id.variant_id,
        );
        self.tracker.update_node_run(&id.run_id, |run| run.inputs = inputs);
        tracing::warn!(node = %id.node, run_id = %id.run_id, error = %err, "Node not invoked");
        self.finish(&id.run_id, RunOutcome::Failed(ErrorInfo::from_error(err)), started)
            .await
    }

    pub async fn bypass(&self, id: &NodeRunIdentity) -> RunInfo {
        let run = self.tracker.bypass_node_run(
            &id.node,
            &id.flow_run_id,
            &id.parent_run_id,
            &id.run_id,
            id.index,
            &id.variant_id,
        );
        self.tracker.persist_node_run(&id.run_id).await;
        run
    }

    async fn finish(&self, run_id: &str, outcome: RunOutcome, started: RunInfo) -> RunInfo {
        let ended = self.tracker.end_node_run(run_id, outcome);
        self.tracker.persist_node_run(run_id).await;
        ended
            .or_else(|| self.tracker.get_node_run(run_id))
            .unwrap_or(started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FnTool, InMemoryCache, InMemoryRunStorage};
    use flowcore::{Connection, EventBus, Node, Status, ToolDefinition, ToolType};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn resolved(node: Node, tool: FnTool) -> ResolvedNode {
        ResolvedNode {
            node: Arc::new(node),
            definition: flowcore::Tool::definition(&tool).clone(),
            tool: Arc::new(tool),
            connections: HashMap::new(),
            extra_inputs: HashMap::new(),
        }
    }

    fn executor() -> NodeExecutor {
        let tracker = Arc::new(RunTracker::new(
            Arc::new(InMemoryRunStorage::new()),
            Arc::new(EventBus::new(64)),
        ));
        NodeExecutor::new(tracker)
    }

    #[tokio::test]
    async fn cached_node_invokes_tool_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let tool = FnTool::new(ToolDefinition::new("echo", ToolType::Python), move |inputs| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(inputs["q"].clone())
        });
        let node = resolved(Node::new("echo", "echo").cached(), tool);
        let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new());
        let executor = executor().with_cache(Some(cache));
        let inputs = HashMap::from([("q".to_string(), json!("hello"))]);

        let first_id = NodeRunIdentity::for_line("echo", "root", "root_0", Some(0), "");
        let first = executor.execute(&node, &first_id, inputs.clone()).await;
        let second_id = NodeRunIdentity::for_line("echo", "root", "root_1", Some(1), "");
        let second = executor.execute(&node, &second_id, inputs).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.status, Status::Completed);
        assert_eq!(second.output, first.output);
        assert_eq!(second.cached_run_id.as_deref(), Some("root_0_echo_0"));
        assert_eq!(second.cached_flow_run_id.as_deref(), Some("root"));
    }

    #[tokio::test]
    async fn tool_failure_is_recorded_not_raised() {
        let tool = FnTool::new(ToolDefinition::new("boom", ToolType::Python), |_| {
            Err(ToolError::ExecutionFailed("kaput".into()))
        });
        let node = resolved(Node::new("boom", "boom"), tool);
        let id = NodeRunIdentity::for_line("boom", "root", "root", None, "");
        let run = executor().execute(&node, &id, HashMap::new()).await;
        assert_eq!(run.run_id, "root_boom");
        assert_eq!(run.status, Status::Failed);
        let error = run.error.unwrap();
        assert!(error.message.contains("kaput"));
        assert!(run.end_time.is_some());
    }

    #[tokio::test]
    async fn tool_reported_cancellation_is_recorded_as_canceled() {
        let tool = FnTool::new(ToolDefinition::new("stop", ToolType::Python), |_| {
            Err(ToolError::Cancelled)
        });
        let node = resolved(Node::new("stop", "stop"), tool);
        let id = NodeRunIdentity::for_line("stop", "root", "root", None, "");
        let run = executor().execute(&node, &id, HashMap::new()).await;
        assert_eq!(run.status, Status::Canceled);
        assert_eq!(run.error.unwrap().code, "ToolCanceled");
    }

    #[tokio::test]
    async fn connections_are_recorded_by_name_and_passed_in_full() {
        let tool = FnTool::new(ToolDefinition::new("llm", ToolType::Llm), |inputs| {
            Ok(inputs["connection"]["api_key"].clone())
        });
        let mut node = resolved(Node::new("chat", "llm").with_connection("azure"), tool);
        node.connections.insert(
            "connection".to_string(),
            Connection::new("azure", "AzureOpenAIConnection").with_secret("api_key", "k"),
        );
        let id = NodeRunIdentity::for_line("chat", "root", "root_0", Some(0), "variant_1");
        let run = executor().execute(&node, &id, HashMap::new()).await;
        assert_eq!(run.output, Some(json!("k")));
        assert_eq!(run.inputs["connection"], json!("azure"));
        assert_eq!(run.variant_id, "variant_1");
    }

    #[tokio::test]
    async fn slow_tools_time_out() {
        struct Slow(ToolDefinition);

        #[async_trait::async_trait]
        impl flowcore::Tool for Slow {
            fn definition(&self) -> &ToolDefinition {
                &self.0
            }

            async fn invoke(
                &self,
                _ctx: ToolContext,
            ) -> Result<flowcore::ToolOutput, ToolError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null).into())
            }
        }

        let definition = ToolDefinition::new("slow", ToolType::Python);
        let node = ResolvedNode {
            node: Arc::new(Node::new("slow", "slow")),
            definition: definition.clone(),
            tool: Arc::new(Slow(definition)),
            connections: HashMap::new(),
            extra_inputs: HashMap::new(),
        };
        let executor = executor().with_timeout(Some(Duration::from_millis(20)));
        let id = NodeRunIdentity::for_line("slow", "root", "root", None, "");
        let run = executor.execute(&node, &id, HashMap::new()).await;
        assert_eq!(run.status, Status::Failed);
        assert_eq!(run.error.unwrap().code, "ToolTimeout");
    }
}
