use crate::{
    DefinitionError, FlowError, InputAssignment, ToolDefinition, ToolType, Value, ValueType,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Skip a node unless the value behind `condition` equals `condition_value`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivateCondition {
    #[serde(rename = "when")]
    pub condition: InputAssignment,
    #[serde(rename = "is")]
    pub condition_value: Value,
}

impl ActivateCondition {
    fn from_value(node: &str, raw: &Value) -> Result<Self, DefinitionError> {
        let invalid = || DefinitionError::InvalidActivateConfig {
            node: node.to_string(),
        };
        let map = raw.as_object().ok_or_else(invalid)?;
        match (map.get("when"), map.get("is")) {
            (Some(when), Some(is)) => Ok(Self {
                condition: InputAssignment::parse(when),
                condition_value: is.clone(),
            }),
            _ => Err(invalid()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSourceType {
    #[default]
    Code,
    Package,
    PackageWithPrompt,
}

/// Where a node's tool comes from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolSource {
    #[serde(rename = "type", default)]
    pub source_type: ToolSourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// One step of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode")]
pub struct Node {
    pub name: String,
    pub tool: String,
    pub inputs: HashMap<String, InputAssignment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    pub aggregation: bool,
    pub enable_cache: bool,
    pub use_variants: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ToolSource>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<ToolType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activate: Option<ActivateCondition>,
}

#[derive(Deserialize)]
struct RawNode {
    name: String,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    inputs: HashMap<String, Value>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    api: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    module: Option<String>,
    #[serde(default)]
    connection: Option<String>,
    #[serde(default)]
    aggregation: Option<bool>,
    #[serde(default)]
    reduce: Option<bool>,
    #[serde(default)]
    enable_cache: bool,
    #[serde(default)]
    use_variants: bool,
    #[serde(default)]
    source: Option<ToolSource>,
    #[serde(rename = "type", default)]
    tool_type: Option<ToolType>,
    #[serde(default)]
    activate: Option<Value>,
}

impl TryFrom<RawNode> for Node {
    type Error = DefinitionError;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let activate = match raw.activate {
            Some(Value::Null) | None => None,
            Some(ref value) => Some(ActivateCondition::from_value(&raw.name, value)?),
        };
        let tool = raw
            .tool
            .or_else(|| raw.source.as_ref().and_then(|s| s.tool.clone()))
            .unwrap_or_default();
        Ok(Node {
            inputs: raw
                .inputs
                .iter()
                .map(|(k, v)| (k.clone(), InputAssignment::parse(v)))
                .collect(),
            name: raw.name,
            tool,
            comment: raw.comment,
            api: raw.api,
            provider: raw.provider,
            module: raw.module,
            connection: raw.connection,
            aggregation: raw.aggregation.or(raw.reduce).unwrap_or(false),
            enable_cache: raw.enable_cache,
            use_variants: raw.use_variants,
            source: raw.source,
            tool_type: raw.tool_type,
            activate,
        })
    }
}

impl Node {
    pub fn new(name: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tool: tool.into(),
            inputs: HashMap::new(),
            comment: None,
            api: None,
            provider: None,
            module: None,
            connection: None,
            aggregation: false,
            enable_cache: false,
            use_variants: false,
            source: None,
            tool_type: None,
            activate: None,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, assignment: InputAssignment) -> Self {
        self.inputs.insert(name.into(), assignment);
        self
    }

    pub fn with_activate(mut self, condition: InputAssignment, value: impl Into<Value>) -> Self {
        self.activate = Some(ActivateCondition {
            condition,
            condition_value: value.into(),
        });
        self
    }

    pub fn with_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    pub fn aggregation(mut self) -> Self {
        self.aggregation = true;
        self
    }

    pub fn cached(mut self) -> Self {
        self.enable_cache = true;
        self
    }

    /// Names of nodes referenced by inputs or by the activate condition, deduplicated.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.inputs
            .values()
            .chain(self.activate.iter().map(|a| &a.condition))
            .filter_map(InputAssignment::referenced_node)
            .filter(|name| seen.insert(*name))
            .collect()
    }

    /// Node names referenced by inputs only.
    pub fn input_dependencies(&self) -> HashSet<&str> {
        self.inputs
            .values()
            .filter_map(InputAssignment::referenced_node)
            .collect()
    }

    pub fn references(&self, other: &str) -> bool {
        self.inputs
            .values()
            .any(|a| a.referenced_node() == Some(other))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeVariant {
    pub node: Node,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Alternate definitions of one node, keyed by variant id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeVariants {
    pub default_variant_id: String,
    #[serde(default)]
    pub variants: HashMap<String, NodeVariant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInputDefinition {
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
    #[serde(default)]
    pub is_chat_input: bool,
    #[serde(default)]
    pub is_chat_history: Option<bool>,
}

impl FlowInputDefinition {
    pub fn of(value_type: ValueType) -> Self {
        Self {
            value_type,
            default: None,
            description: None,
            enum_values: Vec::new(),
            is_chat_input: false,
            is_chat_history: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowOutputDefinition {
    #[serde(rename = "type", default = "default_output_type")]
    pub value_type: ValueType,
    pub reference: InputAssignment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub evaluation_only: bool,
    #[serde(default)]
    pub is_chat_output: bool,
}

fn default_output_type() -> ValueType {
    ValueType::String
}

impl FlowOutputDefinition {
    pub fn reference(reference: InputAssignment) -> Self {
        Self {
            value_type: ValueType::String,
            reference,
            description: None,
            evaluation_only: false,
            is_chat_output: false,
        }
    }
}

/// A declarative DAG of tool-invoking nodes.
///
/// Nodes and tools are held behind `Arc` so variant substitution can build
/// a new flow by swapping one slot instead of cloning the whole graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFlow")]
pub struct Flow {
    pub id: String,
    pub name: String,
    pub nodes: Vec<Arc<Node>>,
    pub inputs: HashMap<String, FlowInputDefinition>,
    pub outputs: HashMap<String, FlowOutputDefinition>,
    pub tools: Vec<Arc<ToolDefinition>>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub node_variants: HashMap<String, NodeVariants>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub environment_variables: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct RawFlow {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    inputs: Option<HashMap<String, FlowInputDefinition>>,
    #[serde(default)]
    outputs: Option<HashMap<String, FlowOutputDefinition>>,
    #[serde(default)]
    tools: Vec<ToolDefinition>,
    #[serde(default)]
    node_variants: Option<HashMap<String, NodeVariants>>,
    #[serde(default)]
    environment_variables: Option<HashMap<String, Value>>,
}

impl TryFrom<RawFlow> for Flow {
    type Error = DefinitionError;

    fn try_from(raw: RawFlow) -> Result<Self, Self::Error> {
        let name = raw.name.unwrap_or_else(|| "default_flow".to_string());
        Ok(Flow {
            id: raw.id.unwrap_or_else(|| name.clone()),
            name,
            nodes: raw.nodes.into_iter().map(Arc::new).collect(),
            inputs: raw.inputs.unwrap_or_default(),
            outputs: raw.outputs.unwrap_or_default(),
            tools: raw.tools.into_iter().map(Arc::new).collect(),
            node_variants: raw.node_variants.unwrap_or_default(),
            environment_variables: raw.environment_variables.unwrap_or_default(),
        })
    }
}

impl Flow {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            nodes: Vec::new(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            tools: Vec::new(),
            node_variants: HashMap::new(),
            environment_variables: HashMap::new(),
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(Arc::new(node));
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, def: FlowInputDefinition) -> Self {
        self.inputs.insert(name.into(), def);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, reference: InputAssignment) -> Self {
        self.outputs
            .insert(name.into(), FlowOutputDefinition::reference(reference));
        self
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    /// Parse a flow document.
    ///
    /// A malformed `activate` block surfaces as `DefinitionError` rather than
    /// a generic serde error.
    pub fn deserialize(doc: Value) -> Result<Flow, FlowError> {
        let raw_nodes = doc.get("nodes").cloned();
        if let Some(Value::Array(nodes)) = raw_nodes {
            for node in &nodes {
                if let (Some(name), Some(activate)) = (
                    node.get("name").and_then(Value::as_str),
                    node.get("activate").filter(|a| !a.is_null()),
                ) {
                    ActivateCondition::from_value(name, activate)?;
                }
            }
        }
        let raw: RawFlow = serde_json::from_value(doc)?;
        Ok(Flow::try_from(raw)?)
    }

    pub fn from_json(content: &str) -> Result<Flow, FlowError> {
        let doc: Value = serde_json::from_str(content)?;
        Flow::deserialize(doc)
    }

    pub fn from_yaml_str(content: &str) -> Result<Flow, FlowError> {
        let doc: Value = serde_yaml::from_str(content)?;
        Flow::deserialize(doc)
    }

    /// Load a flow file. Relative paths are resolved against `working_dir`.
    pub fn from_yaml(path: &Path, working_dir: Option<&Path>) -> Result<Flow, FlowError> {
        let full = match working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        };
        let content = std::fs::read_to_string(&full)?;
        tracing::debug!(path = %full.display(), "Loading flow document");
        Flow::from_yaml_str(&content)
    }

    pub fn serialize(&self) -> Result<Value, FlowError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn get_node(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn get_tool(&self, name: &str) -> Option<&Arc<ToolDefinition>> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn has_aggregation_node(&self) -> bool {
        self.nodes.iter().any(|n| n.aggregation)
    }

    pub fn is_aggregation_node(&self, name: &str) -> bool {
        self.get_node(name).is_some_and(|n| n.aggregation)
    }

    pub fn is_referenced_by_flow_output(&self, node: &str) -> bool {
        self.outputs
            .values()
            .any(|o| o.reference.referenced_node() == Some(node))
    }

    pub fn is_node_referenced_by(&self, node: &str, other: &Node) -> bool {
        other.references(node)
    }

    pub fn is_referenced_by_other_node(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n.references(node))
    }

    pub fn get_chat_input_name(&self) -> Option<&str> {
        self.inputs
            .iter()
            .find(|(_, def)| def.is_chat_input)
            .map(|(name, _)| name.as_str())
    }

    pub fn node_dependencies(&self, name: &str) -> Result<Vec<String>, DefinitionError> {
        let node = self
            .get_node(name)
            .ok_or_else(|| DefinitionError::NodeNotFound(name.to_string()))?;
        Ok(node.dependencies().into_iter().map(String::from).collect())
    }

    fn default_variant_of(&self, node: &Arc<Node>) -> Arc<Node> {
        if !node.use_variants {
            return Arc::clone(node);
        }
        let default = self.node_variants.get(&node.name).and_then(|variants| {
            variants
                .variants
                .get(&variants.default_variant_id)
                .map(|v| &v.node)
        });
        match default {
            Some(variant) => {
                let mut replacement = variant.clone();
                replacement.name = node.name.clone();
                Arc::new(replacement)
            }
            None => Arc::clone(node),
        }
    }

    /// Replace every `use_variants` node with its default variant.
    pub fn apply_default_node_variants(&mut self) -> &mut Self {
        let nodes = self
            .nodes
            .iter()
            .map(|node| self.default_variant_of(node))
            .collect();
        self.nodes = nodes;
        self
    }

    /// Swap one node in place and append the variant's tools.
    pub fn replace_with_variant(&mut self, variant_node: Node, variant_tools: &[ToolDefinition]) {
        if let Some(slot) = self.nodes.iter_mut().find(|n| n.name == variant_node.name) {
            *slot = Arc::new(variant_node);
        }
        self.tools
            .extend(variant_tools.iter().cloned().map(Arc::new));
    }

    /// A new flow with `variant_nodes` substituted; the original is untouched.
    pub fn with_variant_nodes(&self, variant_nodes: &[Node], variant_tools: &[ToolDefinition]) -> Flow {
        let mut flow = self.clone();
        for node in variant_nodes {
            flow.replace_with_variant(node.clone(), &[]);
        }
        flow.tools
            .extend(variant_tools.iter().cloned().map(Arc::new));
        flow
    }

    /// Apply `{"node.input": value}` overrides.
    pub fn apply_node_overrides(
        &mut self,
        overrides: &HashMap<String, Value>,
    ) -> Result<&mut Self, DefinitionError> {
        for (key, value) in overrides {
            let (node_name, input_name) = key
                .split_once('.')
                .ok_or_else(|| DefinitionError::Invalid(format!("invalid node override key '{}'", key)))?;
            let slot = self
                .nodes
                .iter_mut()
                .find(|n| n.name == node_name)
                .ok_or_else(|| DefinitionError::NodeNotFound(node_name.to_string()))?;
            let node = Arc::make_mut(slot);
            if node.connection.is_some() && input_name == "connection" {
                node.connection = value.as_str().map(String::from);
            } else {
                node.inputs
                    .insert(input_name.to_string(), InputAssignment::Literal(value.clone()));
            }
        }
        Ok(self)
    }

    /// Connection names referenced by environment variables and nodes.
    ///
    /// Only keys already declared in `environment_variables` are overridable.
    /// Nodes whose tool is not embedded in the flow are skipped here; the
    /// resolver reports their connections when it loads the package tool.
    pub fn get_connection_names(&self, env_overrides: &HashMap<String, String>) -> HashSet<String> {
        let mut names = HashSet::new();
        for (key, value) in &self.environment_variables {
            let value = match env_overrides.get(key) {
                Some(v) => Value::String(v.clone()),
                None => value.clone(),
            };
            if let Some(reference) = value.as_str().and_then(parse_env_reference) {
                names.insert(reference.0.to_string());
            }
        }

        for node in &self.nodes {
            let node = self.default_variant_of(node);
            if let Some(connection) = &node.connection {
                names.insert(connection.clone());
                continue;
            }
            if matches!(node.tool_type, Some(ToolType::Prompt) | Some(ToolType::Llm)) {
                continue;
            }
            if let Some(tool) = self.get_tool(&node.tool) {
                names.extend(connection_names_for_node(tool, &node).into_values());
            }
        }
        names.retain(|n| !n.is_empty());
        names
    }

    pub fn get_connection_input_names_for_node(&self, name: &str) -> Vec<String> {
        let node = match self.get_node(name) {
            Some(node) => self.default_variant_of(node),
            None => return Vec::new(),
        };
        if matches!(node.tool_type, Some(ToolType::Prompt) | Some(ToolType::Llm)) {
            return Vec::new();
        }
        match self.get_tool(&node.tool) {
            Some(tool) => {
                let mut inputs: Vec<String> = tool.connection_inputs().map(String::from).collect();
                inputs.sort();
                inputs
            }
            None => Vec::new(),
        }
    }
}

/// Literal assignments of a node's connection-typed inputs, keyed by input name.
pub fn connection_names_for_node(tool: &ToolDefinition, node: &Node) -> HashMap<String, String> {
    tool.connection_inputs()
        .filter_map(|input| {
            node.inputs
                .get(input)
                .and_then(InputAssignment::as_literal_str)
                .map(|name| (input.to_string(), name.to_string()))
        })
        .collect()
}

/// Split a `${connection.key}` environment value.
pub fn parse_env_reference(value: &str) -> Option<(&str, &str)> {
    value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .and_then(|inner| inner.split_once('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InputDefinition;
    use serde_json::json;

    const FLOW_YAML: &str = r#"
inputs:
  question:
    type: string
  count:
    type: int
    default: 1
outputs:
  answer:
    type: string
    reference: ${summarize.output}
nodes:
  - name: fetch
    type: python
    source:
      type: code
      path: fetch.py
    inputs:
      query: ${inputs.question}
      conn: my_search
  - name: summarize
    type: llm
    connection: azure_open_ai
    api: chat
    use_variants: true
    inputs:
      text: ${fetch.output.body}
  - name: score
    type: python
    tool: score.py
    reduce: true
    activate:
      when: ${fetch.output.ok}
      is: true
    inputs:
      answers: ${summarize}
tools:
  - name: fetch.py
    type: python
    inputs:
      query:
        type: [string]
      conn:
        type: [CustomConnection]
node_variants:
  summarize:
    default_variant_id: variant_1
    variants:
      variant_0:
        node:
          name: summarize_v0
          type: llm
          connection: azure_open_ai
          inputs:
            text: ${fetch.output.body}
      variant_1:
        node:
          name: summarize_v1
          type: llm
          connection: open_ai
          inputs:
            text: ${fetch.output.title}
environment_variables:
  SEARCH_KEY: ${my_search.api_key}
  PLAIN: value
"#;

    #[test]
    fn deserializes_a_flow_document() {
        let flow = Flow::from_yaml_str(FLOW_YAML).unwrap();
        assert_eq!(flow.id, "default_flow");
        assert_eq!(flow.nodes.len(), 3);

        let fetch = flow.get_node("fetch").unwrap();
        assert_eq!(fetch.inputs["query"], InputAssignment::parse_str("${inputs.question}"));
        assert_eq!(fetch.source.as_ref().unwrap().source_type, ToolSourceType::Code);

        let score = flow.get_node("score").unwrap();
        assert!(score.aggregation, "legacy reduce flag maps to aggregation");
        assert_eq!(score.activate.as_ref().unwrap().condition_value, json!(true));
        assert_eq!(score.dependencies(), vec!["summarize", "fetch"]);
        assert!(flow.has_aggregation_node());
        assert!(flow.is_referenced_by_flow_output("summarize"));
        assert!(flow.is_referenced_by_other_node("fetch"));
        assert!(!flow.is_referenced_by_other_node("score"));
    }

    #[test]
    fn activate_without_pair_is_rejected() {
        let doc = json!({
            "nodes": [{"name": "a", "tool": "t", "activate": {"when": "${flow.x}"}}]
        });
        match Flow::deserialize(doc) {
            Err(FlowError::Definition(DefinitionError::InvalidActivateConfig { node })) => {
                assert_eq!(node, "a")
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn default_variants_keep_the_original_name() {
        let mut flow = Flow::from_yaml_str(FLOW_YAML).unwrap();
        flow.apply_default_node_variants();
        let node = flow.get_node("summarize").unwrap();
        assert_eq!(node.connection.as_deref(), Some("open_ai"));
        assert_eq!(node.inputs["text"], InputAssignment::parse_str("${fetch.output.title}"));

        let snapshot = flow.clone();
        flow.apply_default_node_variants();
        assert_eq!(flow, snapshot);
    }

    #[test]
    fn variant_substitution_leaves_other_nodes_shared() {
        let flow = Flow::from_yaml_str(FLOW_YAML).unwrap();
        let mut variant = Node::new("summarize", "");
        variant.connection = Some("other".to_string());
        let tool = ToolDefinition::new("extra", ToolType::Python);

        let replaced = flow.with_variant_nodes(&[variant], &[tool]);
        assert_eq!(
            replaced.get_node("summarize").unwrap().connection.as_deref(),
            Some("other")
        );
        assert!(Arc::ptr_eq(
            flow.get_node("fetch").unwrap(),
            replaced.get_node("fetch").unwrap()
        ));
        assert_eq!(replaced.tools.len(), flow.tools.len() + 1);
        assert_eq!(
            flow.get_node("summarize").unwrap().connection.as_deref(),
            Some("azure_open_ai")
        );
    }

    #[test]
    fn collects_connection_names() {
        let flow = Flow::from_yaml_str(FLOW_YAML).unwrap();
        let names = flow.get_connection_names(&HashMap::new());
        let expected: HashSet<String> = ["my_search", "open_ai"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(names, expected);

        let overrides = HashMap::from([("SEARCH_KEY".to_string(), "${bing.key}".to_string())]);
        assert!(flow.get_connection_names(&overrides).contains("bing"));
        assert_eq!(flow.get_connection_input_names_for_node("fetch"), vec!["conn"]);
    }

    #[test]
    fn node_overrides_update_connection_or_inputs() {
        let mut flow = Flow::from_yaml_str(FLOW_YAML).unwrap();
        let overrides = HashMap::from([
            ("summarize.connection".to_string(), json!("backup")),
            ("fetch.limit".to_string(), json!(5)),
        ]);
        flow.apply_node_overrides(&overrides).unwrap();
        assert_eq!(
            flow.get_node("summarize").unwrap().connection.as_deref(),
            Some("backup")
        );
        assert_eq!(
            flow.get_node("fetch").unwrap().inputs["limit"],
            InputAssignment::Literal(json!(5))
        );

        let missing = HashMap::from([("nope.x".to_string(), json!(1))]);
        assert_eq!(
            flow.apply_node_overrides(&missing).unwrap_err(),
            DefinitionError::NodeNotFound("nope".to_string())
        );
    }

    #[test]
    fn serialized_flow_loads_back() {
        let flow = Flow::new("f")
            .with_input("x", FlowInputDefinition::of(ValueType::Int))
            .with_tool(
                ToolDefinition::new("double", ToolType::Python)
                    .with_input("x", InputDefinition::of(ValueType::Int)),
            )
            .with_node(
                Node::new("a", "double").with_input("x", InputAssignment::flow_input("x")),
            )
            .with_output("y", InputAssignment::node_output("a"));
        let back = Flow::deserialize(flow.serialize().unwrap()).unwrap();
        assert_eq!(back, flow);
    }
}
