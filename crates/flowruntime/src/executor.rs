use crate::cache::CacheStore;
use crate::dag::{DagManager, NodeGraph};
use crate::node_executor::{NodeExecutor, NodeRunIdentity};
use crate::tracker::{RunOutcome, RunTracker};
use crate::validation::{ensure_flow_inputs, validate_flow};
use crate::{ExecutionError, ResolvedNode, RuntimeConfig, ToolRegistry, ToolResolver};
use flowcore::{
    Connection, DefinitionError, ErrorInfo, ErrorKind, ErrorTarget, Flow, FlowRunInfo,
    InputAssignment, InputRow, Node, RunInfo, RunMode, Status, Value,
};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Everything a flow executor borrows from the runtime for one request.
#[derive(Clone)]
pub struct ExecutionContext {
    pub registry: Arc<ToolRegistry>,
    pub tracker: Arc<RunTracker>,
    pub cache: Option<Arc<dyn CacheStore>>,
    pub connections: Arc<HashMap<String, Connection>>,
    pub env: Arc<HashMap<String, String>>,
    pub config: RuntimeConfig,
    pub cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(registry: Arc<ToolRegistry>, tracker: Arc<RunTracker>, config: RuntimeConfig) -> Self {
        Self {
            registry,
            tracker,
            cache: None,
            connections: Arc::new(HashMap::new()),
            env: Arc::new(HashMap::new()),
            config,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_connections(mut self, connections: HashMap<String, Connection>) -> Self {
        self.connections = Arc::new(connections);
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Arc::new(env);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// Result of one line.
#[derive(Debug, Clone)]
pub struct LineResult {
    pub output: HashMap<String, Value>,

    /// Values aggregation nodes reference, keyed by reference expression.
    pub aggregation_inputs: HashMap<String, Value>,
    pub run_info: FlowRunInfo,
    pub node_run_infos: Vec<RunInfo>,
}

impl LineResult {
    fn without_nodes(run_info: FlowRunInfo) -> Self {
        Self {
            output: HashMap::new(),
            aggregation_inputs: HashMap::new(),
            run_info,
            node_run_infos: Vec::new(),
        }
    }

    pub fn index(&self) -> Option<usize> {
        self.run_info.index
    }

    pub fn is_completed(&self) -> bool {
        self.run_info.status == Status::Completed
    }
}

/// Result of a batch: the finalized root run, lines in index order, and
/// the aggregation node runs.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub root: FlowRunInfo,
    pub line_results: Vec<LineResult>,
    pub aggregation_runs: Vec<RunInfo>,
}

impl BatchResult {
    pub fn flow_runs(&self) -> Vec<FlowRunInfo> {
        std::iter::once(self.root.clone())
            .chain(self.line_results.iter().map(|l| l.run_info.clone()))
            .collect()
    }

    pub fn node_runs(&self) -> Vec<RunInfo> {
        self.line_results
            .iter()
            .flat_map(|l| l.node_run_infos.iter().cloned())
            .chain(self.aggregation_runs.iter().cloned())
            .collect()
    }
}

/// Executes one flow: single lines, batches with aggregation, or a subset
/// of nodes.
pub struct FlowExecutor {
    flow: Arc<Flow>,
    resolved: HashMap<String, Arc<ResolvedNode>>,
    line_nodes: Vec<Arc<Node>>,
    aggregation_nodes: Vec<Arc<Node>>,
    node_executor: NodeExecutor,
    tracker: Arc<RunTracker>,
    worker_count: usize,
    node_concurrency: usize,
    raise_ex: bool,
    cancellation: CancellationToken,
}

impl FlowExecutor {
    /// Validate the flow and resolve every node's tool.
    pub fn create(flow: Flow, ctx: &ExecutionContext) -> Result<Self, ExecutionError> {
        validate_flow(&flow)?;
        let nodes = flow.nodes.clone();
        Self::build(flow, nodes, ctx)
    }

    /// Executor for `SingleNode` / `FromNode` runs; only the nodes that will
    /// run are resolved.
    pub fn create_for_nodes(
        flow: Flow,
        mode: RunMode,
        node_name: &str,
        ctx: &ExecutionContext,
    ) -> Result<Self, ExecutionError> {
        let start = flow
            .get_node(node_name)
            .cloned()
            .ok_or_else(|| DefinitionError::NodeNotFound(node_name.to_string()))?;
        let nodes = match mode {
            RunMode::SingleNode if start.aggregation => {
                return Err(DefinitionError::Invalid(format!(
                    "aggregation node '{}' needs a batch and cannot run as a single node",
                    node_name
                ))
                .into())
            }
            RunMode::SingleNode => vec![start],
            RunMode::FromNode => {
                let downstream = NodeGraph::build(&flow.nodes, false)?.downstream_of(node_name)?;
                flow.nodes
                    .iter()
                    .filter(|n| downstream.contains(&n.name))
                    .cloned()
                    .collect()
            }
            other => {
                return Err(DefinitionError::Invalid(format!(
                    "run mode {:?} does not execute individual nodes",
                    other
                ))
                .into())
            }
        };
        Self::build(flow, nodes, ctx)
    }

    fn build(flow: Flow, nodes: Vec<Arc<Node>>, ctx: &ExecutionContext) -> Result<Self, ExecutionError> {
        let resolver = ToolResolver::new(
            ctx.registry.as_ref(),
            ctx.config.working_dir.as_path(),
            ctx.connections.as_ref(),
        );
        let mut resolved = HashMap::with_capacity(nodes.len());
        for node in &nodes {
            resolved.insert(node.name.clone(), Arc::new(resolver.resolve(&flow, node)?));
        }
        let (aggregation_nodes, line_nodes): (Vec<_>, Vec<_>) =
            nodes.into_iter().partition(|n| n.aggregation);

        let cache = if ctx.config.cache_enabled {
            ctx.cache.clone()
        } else {
            None
        };
        let node_executor = NodeExecutor::new(Arc::clone(&ctx.tracker))
            .with_cache(cache)
            .with_env(Arc::clone(&ctx.env))
            .with_timeout(ctx.config.line_timeout)
            .with_cancellation(ctx.cancellation.clone());

        tracing::debug!(
            flow_id = %flow.id,
            nodes = line_nodes.len(),
            aggregation_nodes = aggregation_nodes.len(),
            "Flow executor ready"
        );
        Ok(Self {
            flow: Arc::new(flow),
            resolved,
            line_nodes,
            aggregation_nodes,
            node_executor,
            tracker: Arc::clone(&ctx.tracker),
            worker_count: ctx.config.worker_count.max(1),
            node_concurrency: ctx.config.node_concurrency.max(1),
            raise_ex: ctx.config.raise_ex,
            cancellation: ctx.cancellation.clone(),
        })
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.tracker
    }

    /// Run one input row. With an index the line run is `{run_id}_{index}`
    /// under root `run_id`; without one the line is the root run itself.
    pub async fn exec_line(
        &self,
        inputs: InputRow,
        index: Option<usize>,
        run_id: &str,
        variant_id: &str,
    ) -> LineResult {
        let line_run_id = match index {
            Some(i) => format!("{}_{}", run_id, i),
            None => run_id.to_string(),
        };
        match index {
            Some(_) => {
                self.tracker
                    .start_flow_run(&self.flow.id, run_id, &line_run_id, run_id, index, variant_id);
            }
            None => {
                self.tracker
                    .start_root_flow_run(&self.flow.id, run_id, variant_id);
            }
        }
        let raw_inputs = row_to_value(&inputs);
        self.tracker
            .update_flow_run(&line_run_id, |run| run.inputs = Some(raw_inputs));
        tracing::info!(run_id = %line_run_id, line = ?index, variant_id, "Line started");

        let label = index.map_or_else(|| line_run_id.clone(), |i| i.to_string());
        let flow_inputs = match ensure_flow_inputs(&self.flow, &inputs, &label) {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::warn!(run_id = %line_run_id, error = %err, "Line inputs rejected");
                let outcome = RunOutcome::Failed(ErrorInfo::from_error(&err));
                return self
                    .finish_line(&line_run_id, outcome, LineResult::without_nodes)
                    .await;
            }
        };
        let resolved_inputs = row_to_value(&flow_inputs);
        self.tracker
            .update_flow_run(&line_run_id, |run| run.inputs = Some(resolved_inputs));

        let mut dag = DagManager::new(self.line_nodes.clone(), flow_inputs);
        let mut node_runs = Vec::new();
        self.run_dag(
            &mut dag,
            |node| NodeRunIdentity::for_line(node, run_id, &line_run_id, index, variant_id),
            &mut node_runs,
        )
        .await;

        let (output, failure) = self.collect_outputs(&dag, &node_runs);
        let aggregation_inputs = self.collect_aggregation_inputs(&dag);
        let stopped = dag.has_pending() || node_runs.iter().any(|r| r.status == Status::Canceled);
        let outcome = if self.cancellation.is_cancelled() && stopped {
            RunOutcome::Canceled(None)
        } else if let Some(error) = failure {
            RunOutcome::Failed(error)
        } else {
            RunOutcome::completed(Value::Object(
                output.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ))
        };
        self.finish_line(&line_run_id, outcome, move |run_info| LineResult {
            output,
            aggregation_inputs,
            run_info,
            node_run_infos: node_runs,
        })
        .await
    }

    async fn finish_line<F>(&self, line_run_id: &str, outcome: RunOutcome, build: F) -> LineResult
    where
        F: FnOnce(FlowRunInfo) -> LineResult,
    {
        self.tracker.end_flow_run(line_run_id, outcome);
        self.tracker.persist_flow_run(line_run_id).await;
        let run_info = self.tracker.get_flow_run(line_run_id).unwrap_or_else(|| {
            FlowRunInfo::new(&self.flow.id, line_run_id, line_run_id, "", Status::Failed)
        });
        tracing::info!(run_id = %line_run_id, status = %run_info.status, "Line finished");
        build(run_info)
    }

    /// Drive a DAG to completion, scheduling ready nodes as their upstreams settle.
    async fn run_dag<F>(&self, dag: &mut DagManager, identity: F, node_runs: &mut Vec<RunInfo>)
    where
        F: Fn(&str) -> NodeRunIdentity,
    {
        let mut running = FuturesUnordered::new();
        loop {
            let mut progressed = false;
            if !self.cancellation.is_cancelled() {
                for (node, upstream) in dag.pop_failed_dependents() {
                    let err = ExecutionError::UpstreamFailed {
                        node: node.name.clone(),
                        upstream,
                    };
                    let run = self
                        .node_executor
                        .fail_without_invocation(&identity(&node.name), HashMap::new(), &err)
                        .await;
                    node_runs.push(run);
                    progressed = true;
                }

                for node in dag.pop_bypassable() {
                    node_runs.push(self.node_executor.bypass(&identity(&node.name)).await);
                    progressed = true;
                }

                let capacity = self.node_concurrency.saturating_sub(running.len());
                for node in dag.pop_ready(capacity) {
                    progressed = true;
                    let id = identity(&node.name);
                    let resolved = match self.resolved.get(&node.name) {
                        Some(resolved) => Arc::clone(resolved),
                        None => {
                            let err = ExecutionError::Definition(DefinitionError::NodeNotFound(
                                node.name.clone(),
                            ));
                            dag.fail(&node.name);
                            node_runs.push(
                                self.node_executor
                                    .fail_without_invocation(&id, HashMap::new(), &err)
                                    .await,
                            );
                            continue;
                        }
                    };
                    match dag.resolve_inputs(&node, &resolved.definition) {
                        Ok(inputs) => {
                            let executor = self.node_executor.clone();
                            let task_id = id.clone();
                            let handle = tokio::spawn(async move {
                                executor.execute(&resolved, &task_id, inputs).await
                            });
                            running.push(async move { (id, handle.await) });
                        }
                        Err(err) => {
                            dag.fail(&node.name);
                            node_runs.push(
                                self.node_executor
                                    .fail_without_invocation(&id, HashMap::new(), &err)
                                    .await,
                            );
                        }
                    }
                }
            }

            if running.is_empty() {
                if progressed && !self.cancellation.is_cancelled() {
                    continue;
                }
                break;
            }

            if let Some((id, joined)) = running.next().await {
                let run = match joined {
                    Ok(run) => run,
                    Err(e) => {
                        let err = ExecutionError::Join(e.to_string());
                        tracing::error!(node = %id.node, run_id = %id.run_id, error = %err, "Node task failed");
                        self.tracker
                            .end_node_run(&id.run_id, RunOutcome::Failed(ErrorInfo::from_error(&err)));
                        self.tracker.persist_node_run(&id.run_id).await;
                        dag.fail(&id.node);
                        if let Some(run) = self.tracker.get_node_run(&id.run_id) {
                            node_runs.push(run);
                        }
                        continue;
                    }
                };
                match run.status {
                    Status::Completed => {
                        dag.complete(&id.node, run.output.clone().unwrap_or(Value::Null))
                    }
                    _ => dag.fail(&id.node),
                }
                node_runs.push(run);
            }
        }

        if dag.has_pending() && !self.cancellation.is_cancelled() {
            for node in dag.drain_pending() {
                let err = ExecutionError::NodeReferenceError {
                    node: node.name.clone(),
                    reference: node.dependencies().join(", "),
                    message: "upstream values were never provided".to_string(),
                };
                let run = self
                    .node_executor
                    .fail_without_invocation(&identity(&node.name), HashMap::new(), &err)
                    .await;
                node_runs.push(run);
            }
        }
    }

    /// Line outputs plus the error of the first output whose node failed.
    fn collect_outputs(
        &self,
        dag: &DagManager,
        node_runs: &[RunInfo],
    ) -> (HashMap<String, Value>, Option<ErrorInfo>) {
        let mut output = HashMap::new();
        let mut failure = None;
        let mut names: Vec<&String> = self.flow.outputs.keys().collect();
        names.sort();

        for name in names {
            let reference = &self.flow.outputs[name].reference;
            if let Some(node) = reference.referenced_node() {
                if self.flow.is_aggregation_node(node) {
                    continue;
                }
                if dag.is_bypassed(node) {
                    tracing::warn!(output = %name, node, "Flow output references a bypassed node, using null");
                    output.insert(name.clone(), Value::Null);
                    continue;
                }
                if dag.is_failed(node) {
                    if failure.is_none() {
                        failure = node_runs
                            .iter()
                            .find(|r| r.node == node)
                            .and_then(|r| r.error.clone())
                            .or_else(|| {
                                Some(ErrorInfo::from_error(&ExecutionError::OutputReferenceNotFound {
                                    output: name.clone(),
                                    reference: reference.to_string(),
                                }))
                            });
                    }
                    continue;
                }
            }
            match dag.resolve_assignment(name, reference) {
                Ok(value) => {
                    output.insert(name.clone(), value);
                }
                Err(_) if failure.is_some() => {}
                Err(_) => {
                    failure = Some(ErrorInfo::from_error(&ExecutionError::OutputReferenceNotFound {
                        output: name.clone(),
                        reference: reference.to_string(),
                    }));
                }
            }
        }
        (output, failure)
    }

    fn aggregation_references(&self) -> Vec<&InputAssignment> {
        self.aggregation_nodes
            .iter()
            .flat_map(|n| {
                n.inputs
                    .values()
                    .chain(n.activate.iter().map(|a| &a.condition))
            })
            .filter(|a| {
                a.referenced_node()
                    .is_some_and(|node| !self.flow.is_aggregation_node(node))
            })
            .collect()
    }

    fn collect_aggregation_inputs(&self, dag: &DagManager) -> HashMap<String, Value> {
        self.aggregation_references()
            .into_iter()
            .map(|a| {
                let value = dag.resolve_assignment("aggregation", a).unwrap_or(Value::Null);
                (a.to_string(), value)
            })
            .collect()
    }

    /// Run every line with at most `worker_count` in flight, then the
    /// aggregation nodes, then finalize the root run.
    ///
    /// Failed lines are recorded and the batch carries on, unless the
    /// executor was built with `raise_ex`: then the root fails with the
    /// first failed line's error, which is returned.
    pub async fn exec_batch(
        self: &Arc<Self>,
        batch_inputs: Vec<InputRow>,
        run_id: &str,
        variant_id: &str,
    ) -> Result<BatchResult, ExecutionError> {
        if self.tracker.get_flow_run(run_id).is_none() {
            self.tracker
                .start_root_flow_run(&self.flow.id, run_id, variant_id);
        }
        let total = batch_inputs.len();
        tracing::info!(run_id, lines = total, variant_id, "Batch started");

        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let mut lines = JoinSet::new();
        for (index, row) in batch_inputs.into_iter().enumerate() {
            let executor = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let run_id = run_id.to_string();
            let variant_id = variant_id.to_string();
            lines.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                if executor.cancellation.is_cancelled() {
                    return executor.cancel_line(index, &run_id, &variant_id).await;
                }
                executor.exec_line(row, Some(index), &run_id, &variant_id).await
            });
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = lines.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(run_id, error = %e, "Line task failed"),
            }
        }

        let seen: HashSet<usize> = results.iter().filter_map(LineResult::index).collect();
        for index in (0..total).filter(|i| !seen.contains(i)) {
            let err = ExecutionError::Join(format!("line {} did not report a result", index));
            let line_run_id = format!("{}_{}", run_id, index);
            let run = FlowRunInfo::create_with_error(
                &self.flow.id,
                &line_run_id,
                run_id,
                run_id,
                Some(index),
                variant_id,
                ErrorInfo::from_error(&err),
            );
            self.tracker.insert_flow_run(run.clone());
            self.tracker.persist_flow_run(&line_run_id).await;
            results.push(LineResult::without_nodes(run));
        }
        results.sort_by_key(LineResult::index);

        if self.raise_ex {
            if let Some(err) = first_line_error(&results) {
                tracing::error!(run_id, error = %err, "Line failed, failing the batch");
                self.tracker
                    .end_flow_run(run_id, RunOutcome::Failed(ErrorInfo::from_error(&err)));
                self.tracker.persist_flow_run(run_id).await;
                return Err(err);
            }
        }

        let aggregation_runs = self.exec_aggregation(&results, run_id, variant_id).await;
        let root = self.finalize_root(run_id, &results, &aggregation_runs).await;
        Ok(BatchResult {
            root,
            line_results: results,
            aggregation_runs,
        })
    }

    async fn cancel_line(&self, index: usize, run_id: &str, variant_id: &str) -> LineResult {
        let line_run_id = format!("{}_{}", run_id, index);
        self.tracker
            .start_flow_run(&self.flow.id, run_id, &line_run_id, run_id, Some(index), variant_id);
        self.finish_line(&line_run_id, RunOutcome::Canceled(None), LineResult::without_nodes)
            .await
    }

    /// Run aggregation nodes once over the completed lines, in line order.
    pub async fn exec_aggregation(
        &self,
        lines: &[LineResult],
        run_id: &str,
        variant_id: &str,
    ) -> Vec<RunInfo> {
        if self.aggregation_nodes.is_empty() || self.cancellation.is_cancelled() {
            return Vec::new();
        }
        let succeeded: Vec<&LineResult> = lines.iter().filter(|l| l.is_completed()).collect();
        if succeeded.is_empty() {
            tracing::warn!(run_id, "No line completed, skipping aggregation nodes");
            return Vec::new();
        }

        let line_inputs: Vec<Option<&serde_json::Map<String, Value>>> = succeeded
            .iter()
            .map(|l| l.run_info.inputs.as_ref().and_then(Value::as_object))
            .collect();
        let keys: BTreeSet<&String> = line_inputs.iter().flatten().flat_map(|m| m.keys()).collect();
        let flow_inputs: InputRow = keys
            .into_iter()
            .map(|key| {
                let column = line_inputs
                    .iter()
                    .map(|m| m.and_then(|m| m.get(key)).cloned().unwrap_or(Value::Null))
                    .collect();
                (key.clone(), Value::Array(column))
            })
            .collect();

        let references: HashMap<String, Value> = self
            .aggregation_references()
            .into_iter()
            .map(|a| {
                let key = a.to_string();
                let column = succeeded
                    .iter()
                    .map(|l| l.aggregation_inputs.get(&key).cloned().unwrap_or(Value::Null))
                    .collect();
                (key, Value::Array(column))
            })
            .collect();
        let seeds: HashMap<String, Value> = self
            .aggregation_references()
            .into_iter()
            .filter_map(InputAssignment::referenced_node)
            .map(|node| (node.to_string(), Value::Null))
            .collect();

        tracing::info!(run_id, lines = succeeded.len(), "Running aggregation nodes");
        let mut dag = DagManager::new(self.aggregation_nodes.clone(), flow_inputs)
            .with_completed(seeds)
            .with_references(references);
        let mut node_runs = Vec::new();
        self.run_dag(
            &mut dag,
            |node| NodeRunIdentity::for_aggregation(node, run_id, variant_id),
            &mut node_runs,
        )
        .await;
        node_runs
    }

    async fn finalize_root(
        &self,
        run_id: &str,
        lines: &[LineResult],
        aggregation_runs: &[RunInfo],
    ) -> FlowRunInfo {
        let completed: Vec<&LineResult> = lines.iter().filter(|l| l.is_completed()).collect();
        let failed = lines.len() - completed.len();

        let keys: BTreeSet<&String> = completed.iter().flat_map(|l| l.output.keys()).collect();
        let mut output = serde_json::Map::new();
        for key in keys {
            let column = completed
                .iter()
                .map(|l| l.output.get(key).cloned().unwrap_or(Value::Null))
                .collect();
            output.insert(key.clone(), Value::Array(column));
        }
        output.insert(
            "line_number".to_string(),
            Value::Array(completed.iter().filter_map(|l| l.index()).map(Value::from).collect()),
        );

        let metrics: HashMap<String, Value> = aggregation_runs
            .iter()
            .flat_map(|r| r.metrics.clone())
            .collect();
        let summary = self.tracker.status_summary(run_id);
        let total = lines.len();
        self.tracker.update_flow_run(run_id, |run| {
            run.system_metrics.extend(summary);
            run.system_metrics
                .insert("total_lines".to_string(), Value::from(total));
            run.system_metrics
                .insert("failed_lines".to_string(), Value::from(failed));
            if failed > 0 {
                run.error = Some(ErrorInfo::new(
                    "LineExecutionFailed",
                    format!("{} of {} lines failed", failed, total),
                    ErrorKind::User,
                    ErrorTarget::FlowExecutor,
                ));
            }
        });

        let outcome = if self.cancellation.is_cancelled() {
            RunOutcome::Canceled(None)
        } else {
            RunOutcome::Completed {
                output: Some(Value::Object(output)),
                metrics,
            }
        };
        self.tracker.end_flow_run(run_id, outcome);
        self.tracker.persist_flow_run(run_id).await;
        tracing::info!(run_id, total, failed, "Batch finished");
        self.tracker.get_flow_run(run_id).unwrap_or_else(|| {
            FlowRunInfo::new(&self.flow.id, run_id, run_id, "", Status::Failed)
        })
    }

    /// Run the nodes chosen at construction, seeded from `node_inputs`.
    ///
    /// Upstream outputs are looked up as `${node.output}`, `${node}` or the
    /// bare node name; flow inputs as `${flow.x}`, `${inputs.x}` or `x`.
    pub async fn exec_nodes(&self, node_inputs: &InputRow, run_id: &str, variant_id: &str) -> Vec<RunInfo> {
        let scheduled: HashSet<&str> = self.line_nodes.iter().map(|n| n.name.as_str()).collect();
        let mut seeds = HashMap::new();
        let mut flow_inputs = InputRow::new();
        for node in &self.line_nodes {
            for dep in node.dependencies() {
                if scheduled.contains(dep) {
                    continue;
                }
                let keys = [format!("${{{}.output}}", dep), format!("${{{}}}", dep), dep.to_string()];
                if let Some(value) = keys.iter().find_map(|k| node_inputs.get(k)) {
                    seeds.insert(dep.to_string(), value.clone());
                }
            }
            let assignments = node
                .inputs
                .values()
                .chain(node.activate.iter().map(|a| &a.condition));
            for input in assignments.filter_map(InputAssignment::referenced_flow_input) {
                let keys = [
                    format!("${{flow.{}}}", input),
                    format!("${{inputs.{}}}", input),
                    input.to_string(),
                ];
                let value = keys
                    .iter()
                    .find_map(|k| node_inputs.get(k))
                    .cloned()
                    .or_else(|| self.flow.inputs.get(input).and_then(|d| d.default.clone()));
                if let Some(value) = value {
                    flow_inputs.insert(input.to_string(), value);
                }
            }
        }

        tracing::info!(run_id, nodes = ?scheduled, "Executing nodes");
        let mut dag = DagManager::new(self.line_nodes.clone(), flow_inputs).with_completed(seeds);
        let mut node_runs = Vec::new();
        self.run_dag(
            &mut dag,
            |node| NodeRunIdentity::for_line(node, run_id, run_id, None, variant_id),
            &mut node_runs,
        )
        .await;
        node_runs
    }
}

fn first_line_error(lines: &[LineResult]) -> Option<ExecutionError> {
    let line = lines.iter().find(|l| l.run_info.status == Status::Failed)?;
    let error = line.run_info.error.clone().unwrap_or_else(|| {
        ErrorInfo::new(
            "LineExecutionFailed",
            "line failed without an error record",
            ErrorKind::System,
            ErrorTarget::FlowExecutor,
        )
    });
    Some(ExecutionError::LineFailed {
        line: line.index().unwrap_or_default(),
        error,
    })
}

fn row_to_value(row: &InputRow) -> Value {
    Value::Object(row.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FnToolFactory, InMemoryRunStorage};
    use flowcore::{EventBus, FlowInputDefinition, ToolDefinition, ToolError, ToolType, ValueType};
    use serde_json::json;

    fn context() -> ExecutionContext {
        let mut registry = ToolRegistry::new();
        registry.register_factory(Arc::new(
            FnToolFactory::new(ToolType::Python)
                .with_tool("upper", |inputs| {
                    let text = inputs["text"].as_str().unwrap_or_default();
                    Ok(json!(text.to_uppercase()))
                })
                .with_tool("fail_on_x", |inputs| {
                    if inputs["text"] == json!("x") {
                        Err(ToolError::ExecutionFailed("x is not allowed".into()))
                    } else {
                        Ok(inputs["text"].clone())
                    }
                })
                .with_tool("count", |inputs| {
                    let items = inputs["items"].as_array().cloned().unwrap_or_default();
                    Ok(json!(items.len()))
                }),
        ));
        let tracker = Arc::new(RunTracker::new(
            Arc::new(InMemoryRunStorage::new()),
            Arc::new(EventBus::new(256)),
        ));
        ExecutionContext::new(Arc::new(registry), tracker, RuntimeConfig::default())
    }

    fn flow() -> Flow {
        Flow::new("f")
            .with_input("text", FlowInputDefinition::of(ValueType::String))
            .with_tool(ToolDefinition::new("upper", ToolType::Python))
            .with_tool(ToolDefinition::new("fail_on_x", ToolType::Python))
            .with_tool(ToolDefinition::new("count", ToolType::Python))
            .with_node(Node::new("check", "fail_on_x").with_input("text", InputAssignment::flow_input("text")))
            .with_node(Node::new("shout", "upper").with_input("text", InputAssignment::node_output("check")))
            .with_node(Node::new("side", "upper").with_input("text", InputAssignment::flow_input("text")))
            .with_node(
                Node::new("total", "count")
                    .aggregation()
                    .with_input("items", InputAssignment::node_output("shout")),
            )
            .with_output("answer", InputAssignment::node_output("shout"))
            .with_output("echo", InputAssignment::node_output("side"))
    }

    fn row(text: &str) -> InputRow {
        InputRow::from([("text".to_string(), json!(text))])
    }

    #[tokio::test]
    async fn line_failure_spreads_along_edges_only() {
        let ctx = context();
        let executor = FlowExecutor::create(flow(), &ctx).unwrap();
        let line = executor.exec_line(row("x"), Some(0), "run", "").await;

        assert_eq!(line.run_info.run_id, "run_0");
        assert_eq!(line.run_info.status, Status::Failed);
        let status: HashMap<_, _> = line
            .node_run_infos
            .iter()
            .map(|r| (r.node.as_str(), r.status))
            .collect();
        assert_eq!(status["check"], Status::Failed);
        assert_eq!(status["shout"], Status::Failed);
        assert_eq!(status["side"], Status::Completed);
        let shout = line.node_run_infos.iter().find(|r| r.node == "shout").unwrap();
        assert_eq!(shout.error.as_ref().unwrap().code, "UpstreamNodeFailed");
        assert_eq!(shout.run_id, "run_0_shout_0");
    }

    #[tokio::test]
    async fn batch_keeps_positions_and_aggregates_completed_lines() {
        let ctx = context();
        let executor = Arc::new(FlowExecutor::create(flow(), &ctx).unwrap());
        let batch = executor
            .exec_batch(vec![row("a"), row("x"), row("c")], "run", "v0")
            .await
            .unwrap();

        let indexes: Vec<_> = batch.line_results.iter().map(LineResult::index).collect();
        assert_eq!(indexes, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(batch.root.status, Status::Completed);
        assert!(batch.root.error.is_some());
        assert_eq!(
            batch.root.output,
            Some(json!({"answer": ["A", "C"], "echo": ["A", "C"], "line_number": [0, 2]}))
        );

        assert_eq!(batch.aggregation_runs.len(), 1);
        let total = &batch.aggregation_runs[0];
        assert_eq!(total.run_id, "run_total_reduce");
        assert_eq!(total.output, Some(json!(2)));
        assert_eq!(total.inputs["items"], json!(["A", "C"]));
        assert_eq!(batch.root.system_metrics["check.failed"], json!(1));
        assert!(batch.flow_runs().iter().all(|r| r.variant_id == "v0"));
    }

    #[tokio::test]
    async fn canceled_batch_finalizes_every_line() {
        let ctx = context();
        ctx.cancellation.cancel();
        let executor = Arc::new(FlowExecutor::create(flow(), &ctx).unwrap());
        let batch = executor
            .exec_batch(vec![row("a"), row("b")], "run", "")
            .await
            .unwrap();
        assert_eq!(batch.root.status, Status::Canceled);
        assert!(batch
            .line_results
            .iter()
            .all(|l| l.run_info.status == Status::Canceled));
        assert!(batch.aggregation_runs.is_empty());
    }

    #[tokio::test]
    async fn from_node_runs_downstream_with_seeded_upstream() {
        let ctx = context();
        let executor =
            FlowExecutor::create_for_nodes(flow(), RunMode::FromNode, "shout", &ctx).unwrap();
        let inputs = InputRow::from([("${check.output}".to_string(), json!("seeded"))]);
        let runs = executor.exec_nodes(&inputs, "single", "").await;
        let names: HashSet<_> = runs.iter().map(|r| r.node.as_str()).collect();
        assert_eq!(names, HashSet::from(["shout"]));
        assert_eq!(runs[0].output, Some(json!("SEEDED")));
        assert_eq!(runs[0].run_id, "single_shout");
    }

    #[tokio::test]
    async fn raise_ex_fails_the_batch_with_the_first_failed_line() {
        let mut ctx = context();
        ctx.config.raise_ex = true;
        let executor = Arc::new(FlowExecutor::create(flow(), &ctx).unwrap());
        let err = executor
            .exec_batch(vec![row("a"), row("x"), row("x")], "run", "")
            .await
            .unwrap_err();

        match &err {
            ExecutionError::LineFailed { line, error } => {
                assert_eq!(*line, 1);
                assert_eq!(error.code, "ToolExecutionError");
            }
            other => panic!("unexpected error {:?}", other),
        }
        let root = ctx.tracker.get_flow_run("run").unwrap();
        assert_eq!(root.status, Status::Failed);
        assert_eq!(root.error.unwrap().code, "LineExecutionFailed");
        assert!(ctx.tracker.get_node_run("run_total_reduce").is_none());
    }

    #[tokio::test]
    async fn aggregation_node_cannot_run_alone() {
        let ctx = context();
        let err = FlowExecutor::create_for_nodes(flow(), RunMode::SingleNode, "total", &ctx)
            .err()
            .unwrap();
        assert!(matches!(err, ExecutionError::Definition(DefinitionError::Invalid(_))));
    }
}
