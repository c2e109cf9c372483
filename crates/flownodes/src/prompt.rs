use async_trait::async_trait;
use flowcore::{Tool, ToolContext, ToolDefinition, ToolError, ToolOutput, ToolType, Value};
use flowruntime::ToolFactory;
use minijinja::Environment;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Template text for a prompt or llm tool: inline `code`, else the `source` file.
pub(crate) fn load_template(definition: &ToolDefinition, working_dir: &Path) -> Result<String, ToolError> {
    if let Some(code) = &definition.code {
        return Ok(code.clone());
    }
    let source = definition.source.as_deref().ok_or_else(|| {
        ToolError::Configuration(format!("tool '{}' has neither code nor source", definition.name))
    })?;
    let path = working_dir.join(source);
    std::fs::read_to_string(&path)
        .map_err(|e| ToolError::Configuration(format!("cannot read '{}': {}", path.display(), e)))
}

/// Fail early on templates that do not parse.
pub(crate) fn check_template(name: &str, template: &str) -> Result<(), ToolError> {
    Environment::new()
        .template_from_str(template)
        .map(|_| ())
        .map_err(|e| ToolError::Configuration(format!("invalid template in '{}': {}", name, e)))
}

pub(crate) fn render(template: &str, inputs: &HashMap<String, Value>) -> Result<String, ToolError> {
    Environment::new()
        .render_str(template, inputs)
        .map_err(|e| ToolError::ExecutionFailed(format!("template rendering failed: {}", e)))
}

/// Renders a jinja template with the node inputs
pub struct PromptTool {
    definition: ToolDefinition,
    template: String,
}

#[async_trait]
impl Tool for PromptTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        render(&self.template, &ctx.inputs).map(ToolOutput::new)
    }
}

pub struct PromptToolFactory;

impl ToolFactory for PromptToolFactory {
    fn tool_type(&self) -> ToolType {
        ToolType::Prompt
    }

    fn create(&self, definition: &ToolDefinition, working_dir: &Path) -> Result<Arc<dyn Tool>, ToolError> {
        let template = load_template(definition, working_dir)?;
        check_template(&definition.name, &template)?;
        Ok(Arc::new(PromptTool {
            definition: definition.clone(),
            template,
        }))
    }

    fn description(&self) -> &str {
        "Jinja prompt templates"
    }
}
