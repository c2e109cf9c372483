//! Built-in tools
//!
//! Factories for python scripts, prompt templates and chat-completion
//! calls, plus a few package tools.

mod llm;
mod prompt;
mod python;
mod transform;

pub use llm::{parse_chat, LlmTool, LlmToolFactory};
pub use prompt::{PromptTool, PromptToolFactory};
pub use python::{PythonTool, PythonToolFactory, PYTHON_ENV};
pub use transform::{JsonParseTool, JsonStringifyTool, JSON_PARSE, JSON_STRINGIFY};

use flowruntime::{ToolRegistry, ToolResolveError};
use std::sync::Arc;

/// Register every built-in factory and package tool
pub fn register_all(registry: &mut ToolRegistry) -> Result<(), ToolResolveError> {
    registry.register_factory(Arc::new(PythonToolFactory::new()));
    registry.register_factory(Arc::new(PromptToolFactory));
    registry.register_factory(Arc::new(LlmToolFactory::new()));
    registry.register_package_tool(Arc::new(JsonParseTool::new()))?;
    registry.register_package_tool(Arc::new(JsonStringifyTool::new()))?;
    Ok(())
}
