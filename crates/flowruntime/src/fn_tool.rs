use crate::registry::ToolFactory;
use async_trait::async_trait;
use flowcore::{Tool, ToolContext, ToolDefinition, ToolError, ToolOutput, ToolType, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

type ToolFn = dyn Fn(&HashMap<String, Value>) -> Result<Value, ToolError> + Send + Sync;

/// A tool backed by a plain closure.
///
/// Used for in-process package tools and for tests that must not reach a
/// network or an interpreter.
#[derive(Clone)]
pub struct FnTool {
    definition: ToolDefinition,
    func: Arc<ToolFn>,
}

impl FnTool {
    pub fn new<F>(definition: ToolDefinition, func: F) -> Self
    where
        F: Fn(&HashMap<String, Value>) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        Self {
            definition,
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        (self.func)(&ctx.inputs).map(ToolOutput::new)
    }
}

/// Factory that hands out closures by tool name for one tool type.
pub struct FnToolFactory {
    tool_type: ToolType,
    tools: HashMap<String, Arc<ToolFn>>,
}

impl FnToolFactory {
    pub fn new(tool_type: ToolType) -> Self {
        Self {
            tool_type,
            tools: HashMap::new(),
        }
    }

    pub fn with_tool<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&HashMap<String, Value>) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        self.tools.insert(name.into(), Arc::new(func));
        self
    }
}

impl ToolFactory for FnToolFactory {
    fn tool_type(&self) -> ToolType {
        self.tool_type
    }

    fn create(
        &self,
        definition: &ToolDefinition,
        _working_dir: &Path,
    ) -> Result<Arc<dyn Tool>, ToolError> {
        let func = self.tools.get(&definition.name).ok_or_else(|| {
            ToolError::Configuration(format!("no function registered for '{}'", definition.name))
        })?;
        Ok(Arc::new(FnTool {
            definition: definition.clone(),
            func: Arc::clone(func),
        }))
    }

    fn description(&self) -> &str {
        "In-process closures"
    }
}
