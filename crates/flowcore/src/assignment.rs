use crate::Value;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Which prefix a flow-input reference was written with.
///
/// Both forms are accepted; the prefix is kept so a document survives a
/// load/save cycle unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlowInputPrefix {
    #[default]
    Flow,
    Inputs,
}

impl FlowInputPrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowInputPrefix::Flow => "flow.",
            FlowInputPrefix::Inputs => "inputs.",
        }
    }
}

/// Where a node input gets its value from.
#[derive(Debug, Clone, PartialEq)]
pub enum InputAssignment {
    Literal(Value),
    FlowInput {
        name: String,
        prefix: FlowInputPrefix,
    },
    NodeReference {
        node: String,
        section: String,
        property: Option<String>,
    },
}

impl InputAssignment {
    pub fn literal(value: impl Into<Value>) -> Self {
        InputAssignment::Literal(value.into())
    }

    pub fn flow_input(name: impl Into<String>) -> Self {
        InputAssignment::FlowInput {
            name: name.into(),
            prefix: FlowInputPrefix::Flow,
        }
    }

    pub fn node_output(node: impl Into<String>) -> Self {
        InputAssignment::NodeReference {
            node: node.into(),
            section: "output".to_string(),
            property: None,
        }
    }

    /// Parse a raw document value. Only strings shaped `${...}` are references.
    pub fn parse(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::parse_str(s),
            other => InputAssignment::Literal(other.clone()),
        }
    }

    pub fn parse_str(raw: &str) -> Self {
        let inner = match raw
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
        {
            Some(inner) if !inner.is_empty() => inner,
            _ => return InputAssignment::Literal(Value::String(raw.to_string())),
        };

        for prefix in [FlowInputPrefix::Flow, FlowInputPrefix::Inputs] {
            if let Some(name) = inner.strip_prefix(prefix.as_str()) {
                return InputAssignment::FlowInput {
                    name: name.to_string(),
                    prefix,
                };
            }
        }

        let (node, port) = match inner.split_once('.') {
            Some((node, port)) => (node, port),
            None => {
                return InputAssignment::NodeReference {
                    node: inner.to_string(),
                    section: "output".to_string(),
                    property: None,
                }
            }
        };
        let (section, property) = match port.split_once('.') {
            Some((section, property)) => (section, Some(property.to_string())),
            None => (port, None),
        };
        InputAssignment::NodeReference {
            node: node.to_string(),
            section: section.to_string(),
            property,
        }
    }

    /// Document form: literals are emitted as-is, references as `${...}`.
    pub fn to_value(&self) -> Value {
        match self {
            InputAssignment::Literal(v) => v.clone(),
            _ => Value::String(self.to_string()),
        }
    }

    pub fn is_reference(&self) -> bool {
        !matches!(self, InputAssignment::Literal(_))
    }

    pub fn referenced_node(&self) -> Option<&str> {
        match self {
            InputAssignment::NodeReference { node, .. } => Some(node),
            _ => None,
        }
    }

    pub fn referenced_flow_input(&self) -> Option<&str> {
        match self {
            InputAssignment::FlowInput { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn as_literal_str(&self) -> Option<&str> {
        match self {
            InputAssignment::Literal(Value::String(s)) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for InputAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputAssignment::Literal(Value::String(s)) => f.write_str(s),
            InputAssignment::Literal(v) => write!(f, "{}", v),
            InputAssignment::FlowInput { name, prefix } => {
                write!(f, "${{{}{}}}", prefix.as_str(), name)
            }
            InputAssignment::NodeReference {
                node,
                section,
                property: Some(property),
            } => write!(f, "${{{}.{}.{}}}", node, section, property),
            InputAssignment::NodeReference { node, section, .. } => {
                write!(f, "${{{}.{}}}", node, section)
            }
        }
    }
}

impl Serialize for InputAssignment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for InputAssignment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(InputAssignment::parse(&value))
    }
}
