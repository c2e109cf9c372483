use crate::{events::EventEmitter, ToolError, Value, ValueExt};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Kind of callable a tool wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    Llm,
    Python,
    CustomLlm,
    Prompt,
    Csharp,
    Action,
}

impl fmt::Display for ToolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ToolType::Llm => "llm",
            ToolType::Python => "python",
            ToolType::CustomLlm => "custom_llm",
            ToolType::Prompt => "prompt",
            ToolType::Csharp => "csharp",
            ToolType::Action => "action",
        };
        f.write_str(name)
    }
}

/// Plain value types a tool or flow input can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Int,
    Double,
    Bool,
    String,
    Secret,
    PromptTemplate,
    List,
    Object,
}

impl ValueType {
    pub fn parse(name: &str) -> Option<Self> {
        let ty = match name.to_ascii_lowercase().as_str() {
            "int" => ValueType::Int,
            "double" | "float" => ValueType::Double,
            "bool" => ValueType::Bool,
            "string" => ValueType::String,
            "secret" => ValueType::Secret,
            "prompt_template" => ValueType::PromptTemplate,
            "list" => ValueType::List,
            "object" => ValueType::Object,
            _ => return None,
        };
        Some(ty)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Int => "int",
            ValueType::Double => "double",
            ValueType::Bool => "bool",
            ValueType::String => "string",
            ValueType::Secret => "secret",
            ValueType::PromptTemplate => "prompt_template",
            ValueType::List => "list",
            ValueType::Object => "object",
        }
    }

    /// Coerce a raw batch value into this type.
    ///
    /// Strings are parsed for numeric, bool, list and object types so that
    /// CSV/JSONL style rows can feed typed flow inputs.
    pub fn convert(&self, value: &Value) -> Result<Value, String> {
        let mismatch = || {
            format!(
                "value {} of type {} cannot be converted to {}",
                value,
                value.type_name(),
                self.as_str()
            )
        };
        match (self, value) {
            (ValueType::Int, Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::from(i))
                } else {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0)
                        .map(|f| Value::from(f as i64))
                        .ok_or_else(mismatch)
                }
            }
            (ValueType::Int, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| mismatch()),
            (ValueType::Double, Value::Number(n)) => {
                n.as_f64().map(Value::from).ok_or_else(mismatch)
            }
            (ValueType::Double, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| mismatch()),
            (ValueType::Bool, Value::Bool(_)) => Ok(value.clone()),
            (ValueType::Bool, Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            (ValueType::String | ValueType::Secret | ValueType::PromptTemplate, Value::String(_)) => {
                Ok(value.clone())
            }
            (ValueType::String | ValueType::Secret | ValueType::PromptTemplate, Value::Null) => {
                Err(mismatch())
            }
            (ValueType::String | ValueType::Secret | ValueType::PromptTemplate, other) => {
                Ok(Value::String(other.to_string()))
            }
            (ValueType::List, Value::Array(_)) => Ok(value.clone()),
            (ValueType::Object, Value::Object(_)) => Ok(value.clone()),
            (ValueType::List, Value::String(s)) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Array(_)) => Ok(parsed),
                _ => Err(mismatch()),
            },
            (ValueType::Object, Value::String(s)) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Object(_)) => Ok(parsed),
                _ => Err(mismatch()),
            },
            _ => Err(mismatch()),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of a tool input: a plain value or a connection class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InputType {
    Value(ValueType),
    Connection(String),
}

impl InputType {
    pub fn parse(name: &str) -> Self {
        match ValueType::parse(name) {
            Some(ty) => InputType::Value(ty),
            None => InputType::Connection(name.to_string()),
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputType::Value(ty) => write!(f, "{}", ty),
            InputType::Connection(class) => f.write_str(class),
        }
    }
}

impl Serialize for InputType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InputType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(InputType::parse(&raw))
    }
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(item) => vec![item],
        OneOrMany::Many(items) => items,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDefinition {
    #[serde(rename = "type", deserialize_with = "one_or_many")]
    pub types: Vec<InputType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
    /// Reject `null` for this input when its upstream was bypassed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
}

impl InputDefinition {
    pub fn of(ty: ValueType) -> Self {
        Self {
            types: vec![InputType::Value(ty)],
            default: None,
            description: None,
            enum_values: Vec::new(),
            required: false,
        }
    }

    pub fn connection(class: impl Into<String>) -> Self {
        Self {
            types: vec![InputType::Connection(class.into())],
            default: None,
            description: None,
            enum_values: Vec::new(),
            required: false,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// An input is connection-typed when any declared type is not a plain value type.
    pub fn is_connection(&self) -> bool {
        self.types
            .iter()
            .any(|t| matches!(t, InputType::Connection(_)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDefinition {
    #[serde(rename = "type", default, deserialize_with = "one_or_many")]
    pub types: Vec<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_property: bool,
}

/// Schema and source of a callable tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    #[serde(default)]
    pub inputs: HashMap<String, InputDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<HashMap<String, OutputDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connection_type: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deprecated_tools: Vec<String>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, tool_type: ToolType) -> Self {
        Self {
            name: name.into(),
            tool_type,
            inputs: HashMap::new(),
            outputs: None,
            description: None,
            module: None,
            class_name: None,
            source: None,
            code: None,
            function: None,
            connection_type: Vec::new(),
            deprecated_tools: Vec::new(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, def: InputDefinition) -> Self {
        self.inputs.insert(name.into(), def);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_deprecated(mut self, alias: impl Into<String>) -> Self {
        self.deprecated_tools.push(alias.into());
        self
    }

    pub fn connection_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .filter(|(_, def)| def.is_connection())
            .map(|(name, _)| name.as_str())
    }
}

/// Core trait every invocable tool implements
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> &ToolDefinition;

    async fn invoke(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError>;
}

/// Invocation context handed to a tool
#[derive(Clone)]
pub struct ToolContext {
    pub node: String,
    pub run_id: String,

    /// Resolved inputs; connection inputs carry the full connection object.
    pub inputs: HashMap<String, Value>,

    /// Flow environment variables with connection placeholders resolved.
    pub env: Arc<HashMap<String, String>>,

    pub events: EventEmitter,

    pub cancellation: CancellationToken,
}

impl ToolContext {
    pub fn require_input(&self, name: &str) -> Result<&Value, ToolError> {
        match self.inputs.get(name) {
            Some(Value::Null) | None => Err(ToolError::MissingInput(name.to_string())),
            Some(v) => Ok(v),
        }
    }

    pub fn require_str(&self, name: &str) -> Result<&str, ToolError> {
        let value = self.require_input(name)?;
        value.as_str().ok_or_else(|| ToolError::InvalidInputType {
            field: name.to_string(),
            expected: "string".to_string(),
            actual: value.type_name().to_string(),
        })
    }

    pub fn get_input_or(&self, name: &str, default: Value) -> Value {
        self.inputs.get(name).cloned().unwrap_or(default)
    }
}

/// Result of a tool invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub value: Value,

    /// Metrics logged by the tool, surfaced on the run record.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, Value>,
}

impl ToolOutput {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            metrics: HashMap::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        ToolOutput::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_batch_strings_to_declared_types() {
        assert_eq!(ValueType::Int.convert(&json!("3")).unwrap(), json!(3));
        assert_eq!(ValueType::Double.convert(&json!("1.5")).unwrap(), json!(1.5));
        assert_eq!(ValueType::Bool.convert(&json!("True")).unwrap(), json!(true));
        assert_eq!(ValueType::List.convert(&json!("[1,2]")).unwrap(), json!([1, 2]));
        assert_eq!(ValueType::String.convert(&json!(7)).unwrap(), json!("7"));
        assert!(ValueType::Int.convert(&json!("abc")).is_err());
        assert!(ValueType::Object.convert(&json!("[1]")).is_err());
    }

    #[test]
    fn tool_definition_parses_connection_inputs() {
        let def: ToolDefinition = serde_json::from_value(json!({
            "name": "chat",
            "type": "llm",
            "inputs": {
                "connection": {"type": ["AzureOpenAIConnection", "OpenAIConnection"]},
                "temperature": {"type": ["double"], "default": 1.0},
                "prompt": {"type": "prompt_template"}
            }
        }))
        .unwrap();

        assert_eq!(def.tool_type, ToolType::Llm);
        assert!(def.inputs["connection"].is_connection());
        assert!(!def.inputs["temperature"].is_connection());
        assert_eq!(def.inputs["temperature"].default, Some(json!(1.0)));
        assert_eq!(def.connection_inputs().collect::<Vec<_>>(), vec!["connection"]);
    }
}
