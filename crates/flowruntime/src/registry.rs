use crate::ToolResolveError;
use flowcore::{Tool, ToolDefinition, ToolError, ToolType};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Builds tools of one type from a flow-embedded or generated definition
pub trait ToolFactory: Send + Sync {
    fn tool_type(&self) -> ToolType;

    /// Create a callable for `definition`; scripts and templates are read
    /// relative to `working_dir`.
    fn create(
        &self,
        definition: &ToolDefinition,
        working_dir: &Path,
    ) -> Result<Arc<dyn Tool>, ToolError>;

    fn description(&self) -> &str {
        ""
    }
}

/// Registry of tool factories and package tools
///
/// Built once at process start and shared by reference; nothing registers
/// itself implicitly.
pub struct ToolRegistry {
    factories: HashMap<ToolType, Arc<dyn ToolFactory>>,
    package_tools: HashMap<String, Arc<dyn Tool>>,
    deprecated: HashMap<String, String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            package_tools: HashMap::new(),
            deprecated: HashMap::new(),
        }
    }

    pub fn register_factory(&mut self, factory: Arc<dyn ToolFactory>) {
        let tool_type = factory.tool_type();
        tracing::info!("Registering tool factory: {}", tool_type);
        self.factories.insert(tool_type, factory);
    }

    /// Register a package tool under its definition name.
    ///
    /// Every deprecated id it declares becomes an alias; an alias already
    /// claimed by a different tool is rejected.
    pub fn register_package_tool(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolResolveError> {
        let definition = tool.definition();
        let name = definition.name.clone();
        for alias in &definition.deprecated_tools {
            if let Some(existing) = self.deprecated.get(alias) {
                if existing != &name {
                    return Err(ToolResolveError::DuplicateToolMapping {
                        deprecated: alias.clone(),
                        first: existing.clone(),
                        second: name,
                    });
                }
            }
        }
        for alias in &definition.deprecated_tools {
            self.deprecated.insert(alias.clone(), name.clone());
        }
        tracing::info!("Registering package tool: {}", name);
        if self.package_tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "Package tool registered twice, keeping the latest");
        }
        Ok(())
    }

    pub fn factory(&self, tool_type: ToolType) -> Option<&Arc<dyn ToolFactory>> {
        self.factories.get(&tool_type)
    }

    /// Look up a package tool, following deprecated aliases.
    pub fn package_tool(&self, id: &str) -> Option<&Arc<dyn Tool>> {
        self.package_tools.get(id).or_else(|| {
            self.deprecated.get(id).and_then(|current| {
                tracing::warn!(
                    deprecated = id,
                    current = %current,
                    "Tool id is deprecated, use the current id instead"
                );
                self.package_tools.get(current)
            })
        })
    }

    pub fn resolve_alias<'a>(&'a self, id: &'a str) -> &'a str {
        self.deprecated.get(id).map(String::as_str).unwrap_or(id)
    }

    pub fn list_package_tools(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDefinition> = self
            .package_tools
            .values()
            .map(|t| t.definition().clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn list_tool_types(&self) -> Vec<ToolType> {
        self.factories.keys().copied().collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the deprecated-id → current-id table for a set of definitions.
pub fn find_deprecated_tools(
    definitions: &[ToolDefinition],
) -> Result<HashMap<String, String>, ToolResolveError> {
    let mut mapping: HashMap<String, String> = HashMap::new();
    for def in definitions {
        for alias in &def.deprecated_tools {
            match mapping.get(alias) {
                Some(existing) if existing != &def.name => {
                    return Err(ToolResolveError::DuplicateToolMapping {
                        deprecated: alias.clone(),
                        first: existing.clone(),
                        second: def.name.clone(),
                    });
                }
                _ => {
                    mapping.insert(alias.clone(), def.name.clone());
                }
            }
        }
    }
    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FnTool;
    use serde_json::json;

    fn package_tool(name: &str, aliases: &[&str]) -> Arc<dyn Tool> {
        let mut def = ToolDefinition::new(name, ToolType::Python);
        for alias in aliases {
            def = def.with_deprecated(*alias);
        }
        Arc::new(FnTool::new(def, |_| Ok(json!(null))))
    }

    #[test]
    fn aliases_resolve_to_the_current_tool() {
        let mut registry = ToolRegistry::new();
        registry
            .register_package_tool(package_tool("pkg.tools.parse", &["old.parse"]))
            .unwrap();
        let tool = registry.package_tool("old.parse").unwrap();
        assert_eq!(tool.definition().name, "pkg.tools.parse");
        assert_eq!(registry.resolve_alias("old.parse"), "pkg.tools.parse");
        assert!(registry.package_tool("missing").is_none());
    }

    #[test]
    fn conflicting_aliases_are_rejected() {
        let mut registry = ToolRegistry::new();
        registry
            .register_package_tool(package_tool("a.tool", &["legacy"]))
            .unwrap();
        let err = registry
            .register_package_tool(package_tool("b.tool", &["legacy"]))
            .unwrap_err();
        assert_eq!(
            err,
            ToolResolveError::DuplicateToolMapping {
                deprecated: "legacy".to_string(),
                first: "a.tool".to_string(),
                second: "b.tool".to_string(),
            }
        );
    }

    #[test]
    fn find_deprecated_tools_detects_duplicates() {
        let defs = vec![
            ToolDefinition::new("x", ToolType::Python).with_deprecated("old"),
            ToolDefinition::new("y", ToolType::Python).with_deprecated("old"),
        ];
        assert!(matches!(
            find_deprecated_tools(&defs),
            Err(ToolResolveError::DuplicateToolMapping { .. })
        ));
        assert_eq!(
            find_deprecated_tools(&defs[..1]).unwrap()["old"],
            "x".to_string()
        );
    }
}
