use crate::ExecutionError;
use flowcore::{DefinitionError, InputAssignment, InputRow, Node, ToolDefinition, Value, ValueExt};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Reference graph over a set of nodes; edges run from dependency to dependent.
pub struct NodeGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl NodeGraph {
    /// Build the graph. References to nodes outside `nodes` are ignored
    /// unless `strict`, in which case they are reported.
    pub fn build(nodes: &[Arc<Node>], strict: bool) -> Result<Self, DefinitionError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for node in nodes {
            let idx = graph.add_node(node.name.clone());
            index.insert(node.name.clone(), idx);
        }
        for node in nodes {
            let to = index[&node.name];
            for dep in node.dependencies() {
                match index.get(dep) {
                    Some(from) => {
                        graph.add_edge(*from, to, ());
                    }
                    None if strict => {
                        return Err(DefinitionError::ReferenceNotFound {
                            owner: node.name.clone(),
                            reference: dep.to_string(),
                        })
                    }
                    None => {}
                }
            }
        }
        Ok(Self { graph, index })
    }

    /// Node names in dependency order.
    pub fn topological_order(&self) -> Result<Vec<String>, DefinitionError> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|i| self.graph[i].clone()).collect())
            .map_err(|cycle| DefinitionError::CyclicDependency(self.graph[cycle.node_id()].clone()))
    }

    /// `start` and every node reachable from it.
    pub fn downstream_of(&self, start: &str) -> Result<HashSet<String>, DefinitionError> {
        let idx = self
            .index
            .get(start)
            .ok_or_else(|| DefinitionError::NodeNotFound(start.to_string()))?;
        let mut dfs = Dfs::new(&self.graph, *idx);
        let mut reached = HashSet::new();
        while let Some(next) = dfs.next(&self.graph) {
            reached.insert(self.graph[next].clone());
        }
        Ok(reached)
    }
}

/// Scheduling state of one line (or one aggregation pass)
///
/// Nodes move from pending to exactly one of completed, bypassed or failed.
/// The executor pops failed dependents and bypassable nodes before asking
/// for ready ones.
pub struct DagManager {
    pending: Vec<Arc<Node>>,
    flow_inputs: InputRow,
    completed: HashMap<String, Value>,
    references: HashMap<String, Value>,
    bypassed: HashSet<String>,
    failed: HashSet<String>,
}

impl DagManager {
    pub fn new(nodes: Vec<Arc<Node>>, flow_inputs: InputRow) -> Self {
        Self {
            pending: nodes,
            flow_inputs,
            completed: HashMap::new(),
            references: HashMap::new(),
            bypassed: HashSet::new(),
            failed: HashSet::new(),
        }
    }

    /// Seed outputs of nodes that are not scheduled here.
    pub fn with_completed(mut self, outputs: HashMap<String, Value>) -> Self {
        self.completed.extend(outputs);
        self
    }

    /// Seed values for whole reference expressions (`${node.output.x}`),
    /// consulted before node outputs. Aggregation passes use this to hand
    /// over per-line values already gathered into lists.
    pub fn with_references(mut self, references: HashMap<String, Value>) -> Self {
        self.references.extend(references);
        self
    }

    pub fn flow_inputs(&self) -> &InputRow {
        &self.flow_inputs
    }

    pub fn completed_outputs(&self) -> &HashMap<String, Value> {
        &self.completed
    }

    pub fn is_bypassed(&self, node: &str) -> bool {
        self.bypassed.contains(node)
    }

    pub fn is_failed(&self, node: &str) -> bool {
        self.failed.contains(node)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn complete(&mut self, node: &str, output: Value) {
        self.completed.insert(node.to_string(), output);
    }

    pub fn fail(&mut self, node: &str) {
        self.failed.insert(node.to_string());
    }

    fn is_settled(&self, name: &str) -> bool {
        self.completed.contains_key(name) || self.bypassed.contains(name)
    }

    fn is_ready(&self, node: &Node) -> bool {
        node.dependencies().into_iter().all(|dep| self.is_settled(dep))
    }

    fn take_pending<F: Fn(&Self, &Node) -> bool>(&mut self, pick: F) -> Vec<Arc<Node>> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|n| pick(self, n.as_ref()));
        self.pending = kept;
        taken
    }

    /// Pending nodes that depend on a failed node, paired with that upstream.
    /// Failure spreads transitively in one call.
    pub fn pop_failed_dependents(&mut self) -> Vec<(Arc<Node>, String)> {
        let mut popped = Vec::new();
        loop {
            let batch = self.take_pending(|dag, node| {
                node.dependencies().into_iter().any(|d| dag.failed.contains(d))
            });
            if batch.is_empty() {
                return popped;
            }
            for node in batch {
                let upstream = node
                    .dependencies()
                    .into_iter()
                    .find(|d| self.failed.contains(*d))
                    .unwrap_or_default()
                    .to_string();
                self.failed.insert(node.name.clone());
                popped.push((node, upstream));
            }
        }
    }

    /// Ready nodes that must be skipped.
    pub fn pop_bypassable(&mut self) -> Vec<Arc<Node>> {
        let mut popped = Vec::new();
        loop {
            let batch = self.take_pending(|dag, node| dag.is_ready(node) && dag.is_bypassable(node));
            if batch.is_empty() {
                return popped;
            }
            for node in &batch {
                self.bypassed.insert(node.name.clone());
            }
            popped.extend(batch);
        }
    }

    /// Up to `limit` nodes whose dependencies have all settled.
    pub fn pop_ready(&mut self, limit: usize) -> Vec<Arc<Node>> {
        let mut ready = Vec::new();
        let mut kept = Vec::new();
        for node in std::mem::take(&mut self.pending) {
            if ready.len() < limit && self.is_ready(&node) && !self.is_bypassable(&node) {
                ready.push(node);
            } else {
                kept.push(node);
            }
        }
        self.pending = kept;
        ready
    }

    /// Drain whatever is still pending; used when nothing can make progress.
    pub fn drain_pending(&mut self) -> Vec<Arc<Node>> {
        let drained = std::mem::take(&mut self.pending);
        for node in &drained {
            self.failed.insert(node.name.clone());
        }
        drained
    }

    fn is_bypassable(&self, node: &Node) -> bool {
        if let Some(activate) = &node.activate {
            if let Some(upstream) = activate.condition.referenced_node() {
                if self.bypassed.contains(upstream) {
                    tracing::info!(
                        node = %node.name,
                        upstream,
                        "Bypassing node, its activate condition depends on a bypassed node"
                    );
                    return true;
                }
            }
            let actual = self
                .resolve_assignment(&node.name, &activate.condition)
                .unwrap_or(Value::Null);
            if actual != activate.condition_value {
                tracing::info!(
                    node = %node.name,
                    condition = %activate.condition,
                    expected = %activate.condition_value,
                    "Bypassing node, activate condition not met"
                );
                return true;
            }
            return false;
        }

        let deps: Vec<&str> = node
            .inputs
            .values()
            .filter_map(InputAssignment::referenced_node)
            .collect();
        let all_bypassed = !deps.is_empty() && deps.iter().all(|d| self.bypassed.contains(*d));
        if all_bypassed {
            tracing::info!(node = %node.name, upstream = ?deps, "Bypassing node, every upstream was bypassed");
        }
        all_bypassed
    }

    /// Resolve one assignment against flow inputs and settled node outputs.
    pub fn resolve_assignment(
        &self,
        owner: &str,
        assignment: &InputAssignment,
    ) -> Result<Value, ExecutionError> {
        match assignment {
            InputAssignment::Literal(value) => Ok(value.clone()),
            InputAssignment::FlowInput { name, .. } => {
                self.flow_inputs
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ExecutionError::InputNotProvided {
                        input: name.clone(),
                        line: owner.to_string(),
                    })
            }
            InputAssignment::NodeReference {
                node,
                section,
                property,
            } => {
                if let Some(value) = self.references.get(&assignment.to_string()) {
                    return Ok(value.clone());
                }
                if self.bypassed.contains(node) {
                    return Ok(Value::Null);
                }
                let output = self.completed.get(node).ok_or_else(|| {
                    ExecutionError::NodeReferenceError {
                        node: owner.to_string(),
                        reference: assignment.to_string(),
                        message: format!("node '{}' has no output", node),
                    }
                })?;
                if section != "output" {
                    return Err(ExecutionError::NodeReferenceError {
                        node: owner.to_string(),
                        reference: assignment.to_string(),
                        message: format!("unsupported section '{}'", section),
                    });
                }
                match property {
                    None => Ok(output.clone()),
                    Some(path) => output.property(path).cloned().ok_or_else(|| {
                        ExecutionError::NodeReferenceError {
                            node: owner.to_string(),
                            reference: assignment.to_string(),
                            message: format!("property '{}' not found", path),
                        }
                    }),
                }
            }
        }
    }

    /// Inputs for invoking `node`.
    ///
    /// An input fed by a bypassed node is omitted when the tool declares a
    /// default for it, rejected when the tool marks it required, and `null`
    /// otherwise.
    pub fn resolve_inputs(
        &self,
        node: &Node,
        definition: &ToolDefinition,
    ) -> Result<HashMap<String, Value>, ExecutionError> {
        let mut resolved = HashMap::with_capacity(node.inputs.len());
        for (name, assignment) in &node.inputs {
            let from_bypassed = assignment
                .referenced_node()
                .is_some_and(|upstream| self.bypassed.contains(upstream));
            if from_bypassed {
                let declared = definition.inputs.get(name);
                if declared.is_some_and(|d| d.default.is_some()) {
                    continue;
                }
                if declared.is_some_and(|d| d.required) {
                    return Err(ExecutionError::RequiredInputBypassed {
                        node: node.name.clone(),
                        input: name.clone(),
                    });
                }
                tracing::warn!(
                    node = %node.name,
                    input = %name,
                    reference = %assignment,
                    "Upstream node was bypassed and the input has no default, using null"
                );
                resolved.insert(name.clone(), Value::Null);
                continue;
            }
            resolved.insert(name.clone(), self.resolve_assignment(&node.name, assignment)?);
        }
        Ok(resolved)
    }
}
