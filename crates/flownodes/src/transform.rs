use async_trait::async_trait;
use flowcore::{
    InputDefinition, Tool, ToolContext, ToolDefinition, ToolError, ToolOutput, ToolType, Value,
    ValueExt, ValueType,
};

pub const JSON_PARSE: &str = "flownodes.tools.json_parse";
pub const JSON_STRINGIFY: &str = "flownodes.tools.json_stringify";

/// Parse a JSON string into a value
pub struct JsonParseTool {
    definition: ToolDefinition,
}

impl JsonParseTool {
    pub fn new() -> Self {
        let definition = ToolDefinition::new(JSON_PARSE, ToolType::Python)
            .with_description("Parse a JSON string")
            .with_input("json", InputDefinition::of(ValueType::String).required())
            .with_deprecated("transform.json_parse");
        Self { definition }
    }
}

impl Default for JsonParseTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for JsonParseTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let input = ctx.require_str("json")?;
        let parsed: Value = serde_json::from_str(input)
            .map_err(|e| ToolError::ExecutionFailed(format!("JSON parse error: {}", e)))?;
        Ok(ToolOutput::new(parsed))
    }
}

/// Serialize any value to a JSON string
pub struct JsonStringifyTool {
    definition: ToolDefinition,
}

impl JsonStringifyTool {
    pub fn new() -> Self {
        let definition = ToolDefinition::new(JSON_STRINGIFY, ToolType::Python)
            .with_description("Convert a value to a JSON string")
            .with_input("value", InputDefinition::of(ValueType::Object).required())
            .with_input(
                "pretty",
                InputDefinition::of(ValueType::Bool).with_default(Value::Bool(false)),
            )
            .with_deprecated("transform.json_stringify");
        Self { definition }
    }
}

impl Default for JsonStringifyTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for JsonStringifyTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let value = ctx.require_input("value")?;
        let pretty = ctx.inputs.get("pretty").and_then(Value::as_bool).unwrap_or(false);
        let encoded = if pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
        .map_err(|e| ToolError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;
        tracing::debug!(node = %ctx.node, kind = value.type_name(), "Stringified value");
        Ok(ToolOutput::new(encoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::EventEmitter;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn context(inputs: HashMap<String, Value>) -> ToolContext {
        ToolContext {
            node: "t".to_string(),
            run_id: "run".to_string(),
            inputs,
            env: Arc::new(HashMap::new()),
            events: EventEmitter::detached("t"),
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn parse_and_stringify() {
        let parsed = JsonParseTool::new()
            .invoke(context(HashMap::from([("json".to_string(), json!(r#"{"a":[1,2]}"#))])))
            .await
            .unwrap();
        assert_eq!(parsed.value, json!({"a": [1, 2]}));

        let encoded = JsonStringifyTool::new()
            .invoke(context(HashMap::from([("value".to_string(), json!({"a": 1}))])))
            .await
            .unwrap();
        assert_eq!(encoded.value, json!(r#"{"a":1}"#));
    }

    #[tokio::test]
    async fn invalid_json_fails() {
        let err = JsonParseTool::new()
            .invoke(context(HashMap::from([("json".to_string(), json!("{nope"))])))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));

        let err = JsonParseTool::new()
            .invoke(context(HashMap::from([("json".to_string(), json!(3))])))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInputType { .. }));
    }
}
