use crate::cache::CacheStore;
use crate::evaluation::{collect_variant_outputs, construct_eval_batch_inputs, is_collection_mode, LineOutputs};
use crate::executor::{ExecutionContext, FlowExecutor};
use crate::tracker::RunOutcome;
use crate::validation::validate_flow;
use crate::{
    required_connection_names, ConnectionManager, RunTracker, RuntimeConfig, SubmissionError,
    ToolRegistry,
};
use chrono::Utc;
use flowcore::{
    parse_env_reference, BatchFlowRequest, Connection, ErrorInfo, EvalRequest, EvaluationMode,
    ExecutionEvent, Flow, FlowRunInfo, InputRow, NodesRequest, RunMode, Status, SubmissionData,
    SubmissionOutcome, SubmissionResult, SubmitFlowRequest, Value,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Phase of a submission, logged on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorState {
    Received,
    Validating,
    Rejected,
    ExecutingBaseline,
    ExecutingVariant(String),
    ExecutingEvaluation,
    Finalizing,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl CoordinatorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CoordinatorState::Rejected
                | CoordinatorState::Succeeded
                | CoordinatorState::PartiallyFailed
                | CoordinatorState::Failed
        )
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::ExecutingVariant(id) => write!(f, "ExecutingVariant({})", id),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Root run metadata copied from the request onto each batch root.
struct RootRun<'a> {
    flow_id: &'a str,
    run_id: &'a str,
    parent_run_id: &'a str,
    source_run_id: &'a str,
    variant_id: &'a str,
    batch: &'a BatchFlowRequest,
}

/// Turns one `SubmitFlowRequest` into executed runs
///
/// Flow and BulkTest requests run the baseline first and then each variant
/// over the same inputs; an attached evaluation flow runs afterwards over
/// the collected outputs. Whatever happens, no root run of the request is
/// left non-terminal once `execute` returns.
pub struct FlowExecutionCoordinator {
    registry: Arc<ToolRegistry>,
    cache: Option<Arc<dyn CacheStore>>,
    tracker: Arc<RunTracker>,
    config: RuntimeConfig,
    env_connections: Arc<ConnectionManager>,
    cancellation: CancellationToken,
    state: Mutex<CoordinatorState>,
}

impl FlowExecutionCoordinator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        cache: Option<Arc<dyn CacheStore>>,
        tracker: Arc<RunTracker>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            tracker,
            config,
            env_connections: Arc::new(ConnectionManager::new()),
            cancellation: CancellationToken::new(),
            state: Mutex::new(CoordinatorState::Received),
        }
    }

    pub fn with_env_connections(mut self, connections: Arc<ConnectionManager>) -> Self {
        self.env_connections = connections;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.tracker
    }

    pub fn state(&self) -> CoordinatorState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn transition(&self, next: CoordinatorState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        tracing::info!(from = %*state, to = %next, "Coordinator state changed");
        *state = next;
    }

    pub async fn execute(&self, request: SubmitFlowRequest) -> Result<SubmissionResult, SubmissionError> {
        self.transition(CoordinatorState::Received);
        let root_run_ids = request.root_run_ids();
        tracing::info!(
            flow_id = %request.flow_id,
            flow_run_id = %request.flow_run_id,
            run_mode = ?request.run_mode,
            "Submission received"
        );

        let watcher = self.tracker.watch_cancellation(
            root_run_ids.clone(),
            self.cancellation.clone(),
            self.config.cancel_poll_interval,
        );
        let result = self.route(&request).await;
        watcher.abort();

        match result {
            Ok(result) => {
                self.transition(CoordinatorState::Finalizing);
                let state = match result.outcome() {
                    SubmissionOutcome::Succeeded => CoordinatorState::Succeeded,
                    SubmissionOutcome::PartiallyFailed => CoordinatorState::PartiallyFailed,
                    SubmissionOutcome::Failed => CoordinatorState::Failed,
                };
                self.transition(state);
                Ok(result)
            }
            Err(err) => {
                let error = ErrorInfo::from_error(&err);
                tracing::error!(flow_run_id = %request.flow_run_id, error = %err, "Submission failed");
                if self.state() == CoordinatorState::Validating {
                    self.transition(CoordinatorState::Rejected);
                } else {
                    self.transition(CoordinatorState::Failed);
                }
                self.tracker
                    .mark_runs_failed(&request.flow_id, &root_run_ids, &error)
                    .await;
                self.tracker.events().emit(ExecutionEvent::RequestRejected {
                    flow_run_id: request.flow_run_id.clone(),
                    error,
                    timestamp: Utc::now(),
                });
                Err(err)
            }
        }
    }

    async fn route(&self, request: &SubmitFlowRequest) -> Result<SubmissionResult, SubmissionError> {
        self.transition(CoordinatorState::Validating);
        let connections = self.ensure_connections(request)?;
        let env = resolve_environment(
            request.submission_data.flow(),
            &request.environment_variables,
            &connections,
        )?;

        let mut ctx = ExecutionContext::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.tracker),
            self.config.clone(),
        )
        .with_connections(connections)
        .with_env(env)
        .with_cancellation(self.cancellation.clone());
        if let Some(cache) = &self.cache {
            ctx = ctx.with_cache(Arc::clone(cache));
        }

        match &request.submission_data {
            SubmissionData::Batch(batch) => self.exec_batch_request(request, batch.clone(), &ctx).await,
            SubmissionData::Eval(eval) => self.exec_eval_request(request, eval, &ctx).await,
            SubmissionData::Nodes(nodes) => self.exec_nodes_request(request, nodes, &ctx).await,
        }
    }

    /// Request connections merged over the process-wide ones; every name the
    /// request's flows need must be present.
    fn ensure_connections(
        &self,
        request: &SubmitFlowRequest,
    ) -> Result<HashMap<String, Connection>, SubmissionError> {
        let mut connections = self.env_connections.to_map();
        connections.extend(request.connections.clone());

        let env = &request.environment_variables;
        let mut required: BTreeSet<String> =
            required_connection_names(request.submission_data.flow(), &self.registry, env)
                .into_iter()
                .collect();
        let variant_nodes = match &request.submission_data {
            SubmissionData::Batch(batch) => {
                if let Some(eval_flow) = &batch.eval_flow {
                    required.extend(required_connection_names(eval_flow, &self.registry, env));
                }
                batch.variants.values().flatten().collect::<Vec<_>>()
            }
            SubmissionData::Nodes(nodes) => nodes.variants.values().flatten().collect(),
            SubmissionData::Eval(_) => Vec::new(),
        };
        required.extend(variant_nodes.into_iter().filter_map(|n| n.connection.clone()));

        for name in required {
            if !connections.contains_key(&name) {
                let mut available: Vec<String> = connections.keys().cloned().collect();
                available.sort();
                return Err(SubmissionError::ConnectionNotFound { name, available });
            }
        }
        Ok(connections)
    }

    async fn exec_batch_request(
        &self,
        request: &SubmitFlowRequest,
        mut batch: BatchFlowRequest,
        ctx: &ExecutionContext,
    ) -> Result<SubmissionResult, SubmissionError> {
        if batch.batch_inputs.is_empty() {
            return Err(SubmissionError::EmptyInput);
        }
        match request.run_mode {
            RunMode::Flow => {
                if batch.eval_flow.is_some() {
                    return Err(SubmissionError::EvaluationFlowNotSupported);
                }
                batch.bulk_test_id = None;
                batch.baseline_variant_id = None;
                batch.variants.clear();
                batch.variants_runs.clear();
            }
            RunMode::BulkTest => {
                if batch.bulk_test_id.as_deref().unwrap_or("").is_empty() {
                    return Err(SubmissionError::BulkTestIdNotFound);
                }
                if batch.baseline_variant_id.as_deref().unwrap_or("").is_empty() {
                    return Err(SubmissionError::BaselineVariantIdNotFound);
                }
                if batch.eval_flow.is_some()
                    && batch.eval_flow_run_id.as_deref().unwrap_or("").is_empty()
                {
                    return Err(SubmissionError::EvaluationFlowRunIdNotFound);
                }
            }
            other => {
                return Err(SubmissionError::RequestTypeNotSupported(format!(
                    "batch submission in {:?} mode",
                    other
                )))
            }
        }

        let variant_keys: HashSet<&String> = batch.variants.keys().collect();
        let run_keys: HashSet<&String> = batch.variants_runs.keys().collect();
        if variant_keys != run_keys {
            return Err(SubmissionError::VariantCountNotMatchWithRunCount {
                variants: variant_keys.len(),
                runs: run_keys.len(),
            });
        }
        let baseline_variant_id = batch.baseline_variant_id.clone().unwrap_or_default();
        if batch.variants.contains_key(&baseline_variant_id) {
            return Err(SubmissionError::BaselineVariantInVariants(baseline_variant_id));
        }

        let mut baseline_flow = batch.flow.clone();
        baseline_flow.apply_default_node_variants();
        baseline_flow.id = request.flow_id.clone();
        validate_flow(&baseline_flow)?;

        let mut variant_ids: Vec<&String> = batch.variants.keys().collect();
        variant_ids.sort();
        let mut variant_flows = Vec::with_capacity(variant_ids.len());
        for variant_id in variant_ids {
            let flow = baseline_flow.with_variant_nodes(&batch.variants[variant_id], &batch.variants_tools);
            validate_flow(&flow)?;
            variant_flows.push((variant_id.clone(), batch.variants_runs[variant_id].clone(), flow));
        }
        if let Some(eval_flow) = &batch.eval_flow {
            validate_flow(eval_flow)?;
        }

        // Resolve every tool before the first line runs.
        let baseline = Arc::new(FlowExecutor::create(baseline_flow, ctx)?);
        let mut variants = Vec::with_capacity(variant_flows.len());
        for (variant_id, run_id, flow) in variant_flows {
            variants.push((variant_id, run_id, Arc::new(FlowExecutor::create(flow, ctx)?)));
        }

        let parent_run_id = batch.bulk_test_id.clone().unwrap_or_default();
        self.transition(CoordinatorState::ExecutingBaseline);
        let mut roots = vec![
            self.run_root(
                &baseline,
                RootRun {
                    flow_id: &request.flow_id,
                    run_id: &request.flow_run_id,
                    parent_run_id: &parent_run_id,
                    source_run_id: &request.source_flow_run_id,
                    variant_id: &baseline_variant_id,
                    batch: &batch,
                },
            )
            .await?,
        ];
        for (variant_id, run_id, executor) in &variants {
            if self.cancellation.is_cancelled() {
                tracing::warn!(variant_id = %variant_id, "Submission canceled, skipping variant");
                self.cancel_root(&request.flow_id, run_id, &parent_run_id, variant_id).await;
                continue;
            }
            self.transition(CoordinatorState::ExecutingVariant(variant_id.clone()));
            roots.push(
                self.run_root(
                    executor,
                    RootRun {
                        flow_id: &request.flow_id,
                        run_id,
                        parent_run_id: &parent_run_id,
                        source_run_id: &request.source_flow_run_id,
                        variant_id,
                        batch: &batch,
                    },
                )
                .await?,
            );
        }

        let root_ids: Vec<String> = std::iter::once(request.flow_run_id.clone())
            .chain(variants.iter().map(|(_, run_id, _)| run_id.clone()))
            .collect();
        let mut result = self.collect_result(&root_ids);

        let all_completed = roots.iter().all(|r| r.status == Status::Completed);
        match (&batch.eval_flow, all_completed) {
            (Some(eval_flow), true) => {
                let line_count = batch.batch_inputs.len();
                let variant_ids: Vec<String> = roots.iter().map(|r| r.variant_id.clone()).collect();
                let outputs: HashMap<String, LineOutputs> = roots
                    .iter()
                    .map(|r| (r.variant_id.clone(), collect_variant_outputs(r, line_count)))
                    .collect();
                let evaluation = self
                    .exec_eval(
                        EvalRun {
                            flow_id: &request.flow_id,
                            run_id: batch.eval_flow_run_id.as_deref().unwrap_or_default(),
                            source_run_id: &request.flow_run_id,
                            bulk_test_id: batch.bulk_test_id.as_deref(),
                            mapping: &batch.eval_flow_inputs_mapping,
                            mode: batch.eval_mode,
                        },
                        eval_flow.clone(),
                        &batch.batch_inputs,
                        &variant_ids,
                        &outputs,
                        ctx,
                    )
                    .await?;
                result.evaluation = Some(Box::new(evaluation));
            }
            (Some(_), false) => {
                tracing::warn!("Not every variant run completed, evaluation flow is skipped");
                if let Some(eval_run_id) = batch.eval_flow_run_id.as_deref() {
                    self.cancel_root(&request.flow_id, eval_run_id, &parent_run_id, "").await;
                }
            }
            (None, _) => {}
        }
        Ok(result)
    }

    async fn run_root(
        &self,
        executor: &Arc<FlowExecutor>,
        root: RootRun<'_>,
    ) -> Result<FlowRunInfo, SubmissionError> {
        self.tracker.start_flow_run(
            root.flow_id,
            root.run_id,
            root.run_id,
            root.parent_run_id,
            None,
            root.variant_id,
        );
        let source = Some(root.source_run_id.to_string()).filter(|s| !s.is_empty());
        self.tracker.update_flow_run(root.run_id, |run| {
            run.source_run_id = source;
            run.name = root.batch.name.clone();
            run.description = root.batch.description.clone();
            run.tags = root.batch.tags.clone();
        });
        self.tracker.persist_flow_run(root.run_id).await;

        let batch = executor
            .exec_batch(root.batch.batch_inputs.clone(), root.run_id, root.variant_id)
            .await?;
        Ok(batch.root)
    }

    /// Close a root run that will never start.
    async fn cancel_root(&self, flow_id: &str, run_id: &str, parent_run_id: &str, variant_id: &str) {
        if run_id.is_empty() {
            return;
        }
        self.tracker
            .start_flow_run(flow_id, run_id, run_id, parent_run_id, None, variant_id);
        self.tracker.end_flow_run(run_id, RunOutcome::Canceled(None));
        self.tracker.persist_flow_run(run_id).await;
    }

    async fn exec_eval_request(
        &self,
        request: &SubmitFlowRequest,
        eval: &EvalRequest,
        ctx: &ExecutionContext,
    ) -> Result<SubmissionResult, SubmissionError> {
        if eval.bulk_test_inputs.is_empty() {
            return Err(SubmissionError::MissingBulkInputs);
        }
        let storage = self.tracker.storage();
        let mut runs = Vec::with_capacity(eval.bulk_test_flow_run_ids.len());
        let mut variant_ids: Vec<String> = Vec::new();
        for run_id in &eval.bulk_test_flow_run_ids {
            let run = storage.get_flow_run(run_id, &eval.bulk_test_flow_id).await?;
            if run.variant_id.is_empty() {
                return Err(SubmissionError::VariantIdNotFound(run_id.clone()));
            }
            if variant_ids.contains(&run.variant_id) {
                return Err(SubmissionError::DuplicateVariantId(run.variant_id));
            }
            variant_ids.push(run.variant_id.clone());
            runs.push(run);
        }
        validate_flow(&eval.flow)?;

        let line_count = eval.bulk_test_inputs.len();
        let outputs: HashMap<String, LineOutputs> = runs
            .iter()
            .map(|r| (r.variant_id.clone(), collect_variant_outputs(r, line_count)))
            .collect();
        self.exec_eval(
            EvalRun {
                flow_id: &eval.bulk_test_flow_id,
                run_id: &request.flow_run_id,
                source_run_id: &request.source_flow_run_id,
                bulk_test_id: eval.bulk_test_id.as_deref(),
                mapping: &eval.inputs_mapping,
                mode: eval.eval_mode,
            },
            eval.flow.clone(),
            &eval.bulk_test_inputs,
            &variant_ids,
            &outputs,
            ctx,
        )
        .await
    }

    async fn exec_eval(
        &self,
        run: EvalRun<'_>,
        mut flow: Flow,
        inputs: &[InputRow],
        variant_ids: &[String],
        outputs: &HashMap<String, LineOutputs>,
        ctx: &ExecutionContext,
    ) -> Result<SubmissionResult, SubmissionError> {
        if inputs.is_empty() {
            return Err(SubmissionError::MissingBulkInputs);
        }
        self.transition(CoordinatorState::ExecutingEvaluation);
        let collection_mode = is_collection_mode(&flow, run.mode);
        let batch_inputs =
            construct_eval_batch_inputs(inputs, variant_ids, outputs, run.mapping, collection_mode)?;
        tracing::info!(
            run_id = run.run_id,
            lines = batch_inputs.len(),
            collection_mode,
            "Running evaluation flow"
        );

        // Evaluation runs are recorded under the evaluated flow's id.
        flow.id = run.flow_id.to_string();
        let executor = Arc::new(FlowExecutor::create(flow.clone(), ctx)?);
        let mut batch = BatchFlowRequest::new(flow, batch_inputs);
        batch.bulk_test_id = run.bulk_test_id.map(String::from);
        batch.eval_mode = run.mode;
        let parent_run_id = run.bulk_test_id.unwrap_or_default().to_string();
        self.run_root(
            &executor,
            RootRun {
                flow_id: run.flow_id,
                run_id: run.run_id,
                parent_run_id: &parent_run_id,
                source_run_id: run.source_run_id,
                variant_id: "",
                batch: &batch,
            },
        )
        .await?;
        Ok(self.collect_result(&[run.run_id.to_string()]))
    }

    async fn exec_nodes_request(
        &self,
        request: &SubmitFlowRequest,
        nodes: &NodesRequest,
        ctx: &ExecutionContext,
    ) -> Result<SubmissionResult, SubmissionError> {
        let mut flow = nodes.flow.clone();
        flow.apply_default_node_variants();
        flow.id = request.flow_id.clone();

        let mut variant_id = String::new();
        if !nodes.variants.is_empty() {
            if request.run_mode == RunMode::FromNode {
                return Err(SubmissionError::RequestTypeNotSupported(
                    "variants in FromNode mode".to_string(),
                ));
            }
            let mut candidates: Vec<&String> = nodes
                .variants
                .iter()
                .filter(|(_, variant_nodes)| variant_nodes.iter().any(|n| n.name == nodes.node_name))
                .map(|(id, _)| id)
                .collect();
            candidates.sort();
            match candidates.as_slice() {
                [] => tracing::warn!(node = %nodes.node_name, "No variant for node, running the baseline node"),
                [first, rest @ ..] => {
                    if !rest.is_empty() {
                        tracing::warn!(
                            node = %nodes.node_name,
                            variants = candidates.len(),
                            variant_id = %first,
                            "Node appears in several variants, only the first is executed"
                        );
                    }
                    flow = flow.with_variant_nodes(&nodes.variants[*first], &nodes.variants_tools);
                    variant_id = (*first).clone();
                }
            }
        }

        let executor = FlowExecutor::create_for_nodes(flow, request.run_mode, &nodes.node_name, ctx)?;
        self.transition(CoordinatorState::ExecutingBaseline);
        let node_runs = executor
            .exec_nodes(&nodes.node_inputs, &request.flow_run_id, &variant_id)
            .await;
        Ok(SubmissionResult {
            flow_runs: Vec::new(),
            node_runs,
            evaluation: None,
        })
    }

    fn collect_result(&self, root_run_ids: &[String]) -> SubmissionResult {
        let mut result = SubmissionResult::default();
        for root in root_run_ids {
            result.flow_runs.extend(self.tracker.collect_flow_runs(root));
            result.node_runs.extend(self.tracker.collect_node_runs(root));
        }
        for run in &mut result.flow_runs {
            run.request = None;
        }
        result
    }
}

struct EvalRun<'a> {
    flow_id: &'a str,
    run_id: &'a str,
    source_run_id: &'a str,
    bulk_test_id: Option<&'a str>,
    mapping: &'a HashMap<String, String>,
    mode: EvaluationMode,
}

/// Resolve the flow's environment variables, with declared keys overridable
/// by the request; `${conn.key}` values are read from connections.
pub fn resolve_environment(
    flow: &Flow,
    overrides: &HashMap<String, String>,
    connections: &HashMap<String, Connection>,
) -> Result<HashMap<String, String>, SubmissionError> {
    let mut env = HashMap::with_capacity(flow.environment_variables.len());
    for (key, declared) in &flow.environment_variables {
        let raw = match overrides.get(key) {
            Some(value) => value.clone(),
            None => match declared {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        };
        let value = match parse_env_reference(&raw) {
            Some((name, field)) => {
                let connection = connections.get(name).ok_or_else(|| SubmissionError::ResolveConnection {
                    key: key.clone(),
                    message: format!("connection '{}' is not provided", name),
                })?;
                match connection.get(field) {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => {
                        return Err(SubmissionError::ResolveConnection {
                            key: key.clone(),
                            message: format!("connection '{}' has no key '{}'", name, field),
                        })
                    }
                }
            }
            None => raw,
        };
        env.insert(key.clone(), value);
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn environment_reads_connection_values() {
        let mut flow = Flow::new("f");
        flow.environment_variables
            .insert("API_KEY".to_string(), json!("${azure.api_key}"));
        flow.environment_variables
            .insert("MODE".to_string(), json!("fast"));
        let connections = HashMap::from([(
            "azure".to_string(),
            Connection::new("azure", "AzureOpenAIConnection").with_secret("api_key", "k"),
        )]);

        let env = resolve_environment(&flow, &HashMap::new(), &connections).unwrap();
        assert_eq!(env["API_KEY"], "k");
        assert_eq!(env["MODE"], "fast");

        let overrides = HashMap::from([("MODE".to_string(), "slow".to_string())]);
        let env = resolve_environment(&flow, &overrides, &connections).unwrap();
        assert_eq!(env["MODE"], "slow");

        let err = resolve_environment(&flow, &HashMap::new(), &HashMap::new()).unwrap_err();
        assert!(matches!(err, SubmissionError::ResolveConnection { ref key, .. } if key == "API_KEY"));
    }

    #[test]
    fn state_display_names_variant() {
        assert_eq!(
            CoordinatorState::ExecutingVariant("v1".into()).to_string(),
            "ExecutingVariant(v1)"
        );
        assert!(CoordinatorState::PartiallyFailed.is_terminal());
        assert!(!CoordinatorState::ExecutingEvaluation.is_terminal());
    }
}
