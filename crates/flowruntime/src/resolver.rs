use crate::{ToolRegistry, ToolResolveError};
use flowcore::{
    connection_names_for_node, Connection, Flow, Node, Tool, ToolDefinition, ToolSourceType,
    ToolType, Value,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// A node bound to its callable.
#[derive(Clone)]
pub struct ResolvedNode {
    pub node: Arc<Node>,
    pub definition: ToolDefinition,
    pub tool: Arc<dyn Tool>,

    /// Connection-typed inputs by input name.
    pub connections: HashMap<String, Connection>,

    /// Inputs supplied by the resolver rather than the flow author.
    pub extra_inputs: HashMap<String, Value>,
}

impl std::fmt::Debug for ResolvedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedNode")
            .field("node", &self.node.name)
            .field("tool", &self.definition.name)
            .field("connections", &self.connections.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Maps nodes to tools using flow-embedded definitions and the registry.
pub struct ToolResolver<'a> {
    registry: &'a ToolRegistry,
    working_dir: &'a Path,
    connections: &'a HashMap<String, Connection>,
}

impl<'a> ToolResolver<'a> {
    pub fn new(
        registry: &'a ToolRegistry,
        working_dir: &'a Path,
        connections: &'a HashMap<String, Connection>,
    ) -> Self {
        Self {
            registry,
            working_dir,
            connections,
        }
    }

    pub fn resolve(&self, flow: &Flow, node: &Arc<Node>) -> Result<ResolvedNode, ToolResolveError> {
        let source_type = node.source.as_ref().map(|s| s.source_type);
        let (definition, tool, extra_inputs) = match source_type {
            Some(ToolSourceType::Package) => {
                let (definition, tool) = self.resolve_package(node)?;
                (definition, tool, HashMap::new())
            }
            Some(ToolSourceType::PackageWithPrompt) => {
                let (definition, tool) = self.resolve_package(node)?;
                let path = node
                    .source
                    .as_ref()
                    .and_then(|s| s.path.as_deref())
                    .ok_or_else(|| ToolResolveError::InvalidSource {
                        node: node.name.clone(),
                        message: "package_with_prompt requires a prompt path".to_string(),
                    })?;
                let prompt = self.read_source(node, path)?;
                let extra = HashMap::from([("prompt".to_string(), Value::String(prompt))]);
                (definition, tool, extra)
            }
            Some(ToolSourceType::Code) | None => {
                let (definition, tool) = self.resolve_code(flow, node)?;
                (definition, tool, HashMap::new())
            }
        };

        let connections = self.resolve_connections(node, &definition)?;
        tracing::debug!(
            node = %node.name,
            tool = %definition.name,
            tool_type = %definition.tool_type,
            "Resolved tool"
        );
        Ok(ResolvedNode {
            node: Arc::clone(node),
            definition,
            tool,
            connections,
            extra_inputs,
        })
    }

    fn resolve_package(&self, node: &Node) -> Result<(ToolDefinition, Arc<dyn Tool>), ToolResolveError> {
        let id = node
            .source
            .as_ref()
            .and_then(|s| s.tool.as_deref())
            .unwrap_or(&node.tool);
        let tool = self
            .registry
            .package_tool(id)
            .ok_or_else(|| ToolResolveError::PackageToolNotFound {
                node: node.name.clone(),
                tool: id.to_string(),
            })?;
        Ok((tool.definition().clone(), Arc::clone(tool)))
    }

    fn resolve_code(
        &self,
        flow: &Flow,
        node: &Node,
    ) -> Result<(ToolDefinition, Arc<dyn Tool>), ToolResolveError> {
        let source_path = node.source.as_ref().and_then(|s| s.path.clone());
        let mut definition = match flow.get_tool(&node.tool) {
            Some(def) => def.as_ref().clone(),
            None => match source_path {
                Some(path) => {
                    let tool_type = node.tool_type.unwrap_or(ToolType::Python);
                    ToolDefinition::new(path.clone(), tool_type).with_source(path)
                }
                None if !node.tool.is_empty() && self.registry.package_tool(&node.tool).is_some() => {
                    return self.resolve_package(node);
                }
                None => {
                    return Err(ToolResolveError::ToolNotFound {
                        node: node.name.clone(),
                        tool: node.tool.clone(),
                    })
                }
            },
        };

        if matches!(
            definition.tool_type,
            ToolType::Prompt | ToolType::Llm | ToolType::CustomLlm
        ) && definition.code.is_none()
        {
            if let Some(source) = definition.source.clone() {
                definition.code = Some(self.read_source(node, &source)?);
            }
        }

        let factory = self
            .registry
            .factory(definition.tool_type)
            .ok_or_else(|| ToolResolveError::ModuleNotFound {
                node: node.name.clone(),
                message: format!("no tool factory registered for type '{}'", definition.tool_type),
            })?;
        let tool = factory
            .create(&definition, self.working_dir)
            .map_err(|e| ToolResolveError::ModuleNotFound {
                node: node.name.clone(),
                message: e.to_string(),
            })?;
        Ok((definition, tool))
    }

    fn read_source(&self, node: &Node, path: &str) -> Result<String, ToolResolveError> {
        let full = self.working_dir.join(path);
        std::fs::read_to_string(&full).map_err(|e| ToolResolveError::ModuleNotFound {
            node: node.name.clone(),
            message: format!("cannot read '{}': {}", full.display(), e),
        })
    }

    fn resolve_connections(
        &self,
        node: &Node,
        definition: &ToolDefinition,
    ) -> Result<HashMap<String, Connection>, ToolResolveError> {
        let mut resolved = HashMap::new();
        let mut wanted: Vec<(String, String)> = connection_names_for_node(definition, node)
            .into_iter()
            .collect();
        if let Some(connection) = &node.connection {
            wanted.push(("connection".to_string(), connection.clone()));
        }
        for (input, name) in wanted {
            let connection = self.connections.get(&name).cloned().ok_or_else(|| {
                ToolResolveError::ConnectionNotFound {
                    node: node.name.clone(),
                    input: input.clone(),
                    connection: name.clone(),
                }
            })?;
            resolved.insert(input, connection);
        }
        Ok(resolved)
    }
}

/// Connection names a flow needs, including those of registry package tools.
pub fn required_connection_names(
    flow: &Flow,
    registry: &ToolRegistry,
    env_overrides: &HashMap<String, String>,
) -> HashSet<String> {
    let mut names = flow.get_connection_names(env_overrides);
    for node in &flow.nodes {
        if node.connection.is_some() || flow.get_tool(&node.tool).is_some() {
            continue;
        }
        let id = node
            .source
            .as_ref()
            .and_then(|s| s.tool.as_deref())
            .unwrap_or(&node.tool);
        if let Some(tool) = registry.package_tool(id) {
            names.extend(connection_names_for_node(tool.definition(), node).into_values());
        }
    }
    names.retain(|n| !n.is_empty());
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FnTool, FnToolFactory};
    use flowcore::{InputAssignment, InputDefinition, ToolSource, ValueType};
    use serde_json::json;
    use std::io::Write;

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register_factory(Arc::new(
            FnToolFactory::new(ToolType::Python).with_tool("search.py", |_| Ok(json!("hit"))),
        ));
        let def = ToolDefinition::new("pkg.search", ToolType::Python)
            .with_input("conn", InputDefinition::connection("CustomConnection"))
            .with_input("query", InputDefinition::of(ValueType::String))
            .with_deprecated("legacy.search");
        registry
            .register_package_tool(Arc::new(FnTool::new(def, |_| Ok(json!("pkg")))))
            .unwrap();
        registry
    }

    fn connections() -> HashMap<String, Connection> {
        HashMap::from([(
            "bing".to_string(),
            Connection::new("bing", "CustomConnection").with_secret("key", "s3cret"),
        )])
    }

    #[test]
    fn resolves_flow_embedded_code_tool() {
        let registry = registry();
        let conns = connections();
        let flow = Flow::new("f")
            .with_tool(ToolDefinition::new("search.py", ToolType::Python))
            .with_node(Node::new("a", "search.py"));
        let resolver = ToolResolver::new(&registry, Path::new("."), &conns);
        let resolved = resolver.resolve(&flow, &flow.nodes[0]).unwrap();
        assert_eq!(resolved.definition.name, "search.py");
        assert!(resolved.connections.is_empty());
    }

    #[test]
    fn resolves_package_tool_through_alias_and_binds_connection() {
        let registry = registry();
        let conns = connections();
        let mut node = Node::new("a", "")
            .with_input("conn", InputAssignment::literal("bing"))
            .with_input("query", InputAssignment::flow_input("q"));
        node.source = Some(ToolSource {
            source_type: ToolSourceType::Package,
            tool: Some("legacy.search".to_string()),
            path: None,
        });
        let flow = Flow::new("f").with_node(node);
        let resolver = ToolResolver::new(&registry, Path::new("."), &conns);
        let resolved = resolver.resolve(&flow, &flow.nodes[0]).unwrap();
        assert_eq!(resolved.definition.name, "pkg.search");
        assert_eq!(resolved.connections["conn"].secrets["key"], "s3cret");

        let names = required_connection_names(&flow, &registry, &HashMap::new());
        assert!(names.contains("bing"));
    }

    #[test]
    fn missing_connection_and_tool_are_reported() {
        let registry = registry();
        let conns = HashMap::new();
        let resolver = ToolResolver::new(&registry, Path::new("."), &conns);

        let flow = Flow::new("f").with_node(Node::new("a", "nowhere.py"));
        assert!(matches!(
            resolver.resolve(&flow, &flow.nodes[0]),
            Err(ToolResolveError::ToolNotFound { .. })
        ));

        let flow = Flow::new("f")
            .with_tool(ToolDefinition::new("search.py", ToolType::Python))
            .with_node(Node::new("a", "search.py").with_connection("azure"));
        match resolver.resolve(&flow, &flow.nodes[0]) {
            Err(ToolResolveError::ConnectionNotFound { connection, .. }) => {
                assert_eq!(connection, "azure")
            }
            other => panic!("unexpected {:?}", other.map(|r| r.definition.name)),
        }
    }

    #[test]
    fn missing_factory_or_template_is_module_not_found() {
        let registry = registry();
        let conns = HashMap::new();
        let dir = tempfile::tempdir().unwrap();
        let resolver = ToolResolver::new(&registry, dir.path(), &conns);

        let mut node = Node::new("p", "");
        node.tool_type = Some(ToolType::Prompt);
        node.source = Some(ToolSource {
            source_type: ToolSourceType::Code,
            tool: None,
            path: Some("missing.jinja2".to_string()),
        });
        let flow = Flow::new("f").with_node(node);
        assert!(matches!(
            resolver.resolve(&flow, &flow.nodes[0]),
            Err(ToolResolveError::ModuleNotFound { .. })
        ));

        let mut file = std::fs::File::create(dir.path().join("missing.jinja2")).unwrap();
        writeln!(file, "Hello {{{{ name }}}}").unwrap();
        match resolver.resolve(&flow, &flow.nodes[0]) {
            Err(ToolResolveError::ModuleNotFound { message, .. }) => {
                assert!(message.contains("no tool factory"))
            }
            other => panic!("unexpected {:?}", other.map(|r| r.definition.name)),
        }
    }
}
