use crate::{ConnectionError, Value};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// Placeholder written wherever a secret would otherwise appear.
pub const SCRUBBED_VALUE: &str = "******";

/// A named connection: a type tag plus config and secret key-values.
///
/// Documents use the `{type, value: {...}, secret_keys: [...]}` shape; keys
/// listed in `secret_keys` are split into `secrets`.
#[derive(Clone, PartialEq, Deserialize)]
#[serde(from = "RawConnection")]
pub struct Connection {
    pub name: String,
    pub connection_type: String,
    pub configs: HashMap<String, Value>,
    pub secrets: HashMap<String, String>,
}

#[derive(Deserialize)]
struct RawConnection {
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    connection_type: String,
    #[serde(default)]
    value: HashMap<String, Value>,
    #[serde(default)]
    secret_keys: Vec<String>,
}

impl From<RawConnection> for Connection {
    fn from(raw: RawConnection) -> Self {
        let mut configs = HashMap::new();
        let mut secrets = HashMap::new();
        for (key, value) in raw.value {
            if raw.secret_keys.contains(&key) {
                let secret = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                secrets.insert(key, secret);
            } else {
                configs.insert(key, value);
            }
        }
        Self {
            name: raw.name,
            connection_type: raw.connection_type,
            configs,
            secrets,
        }
    }
}

impl Connection {
    pub fn new(name: impl Into<String>, connection_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_type: connection_type.into(),
            configs: HashMap::new(),
            secrets: HashMap::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.configs.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(key.into(), value.into());
        self
    }

    /// Look up a key in configs, then secrets.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.configs
            .get(key)
            .cloned()
            .or_else(|| self.secrets.get(key).map(|s| Value::String(s.clone())))
    }

    /// Full unscrubbed object handed to a tool at invocation time.
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.configs {
            map.insert(key.clone(), value.clone());
        }
        for (key, secret) in &self.secrets {
            map.insert(key.clone(), Value::String(secret.clone()));
        }
        Value::Object(map)
    }
}

impl Serialize for Connection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut value: HashMap<&str, Value> = self
            .configs
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        for key in self.secrets.keys() {
            value.insert(key, Value::String(SCRUBBED_VALUE.to_string()));
        }
        let mut secret_keys: Vec<&String> = self.secrets.keys().collect();
        secret_keys.sort();

        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("name", &self.name)?;
        map.serialize_entry("type", &self.connection_type)?;
        map.serialize_entry("value", &value)?;
        map.serialize_entry("secret_keys", &secret_keys)?;
        map.end()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secrets: HashMap<&str, &str> = self
            .secrets
            .keys()
            .map(|k| (k.as_str(), SCRUBBED_VALUE))
            .collect();
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("connection_type", &self.connection_type)
            .field("configs", &self.configs)
            .field("secrets", &secrets)
            .finish()
    }
}

/// Source of named connections
pub trait ConnectionProvider: Send + Sync {
    fn get(&self, name: &str) -> Result<Connection, ConnectionError>;

    fn list(&self) -> Vec<Connection>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Connection {
        serde_json::from_value(json!({
            "type": "OpenAIConnection",
            "value": {"api_base": "https://example.invalid/v1", "api_key": "sk-secret"},
            "secret_keys": ["api_key"]
        }))
        .unwrap()
    }

    #[test]
    fn secrets_are_split_and_scrubbed() {
        let conn = sample();
        assert_eq!(conn.secrets["api_key"], "sk-secret");
        assert!(!conn.configs.contains_key("api_key"));

        let debug = format!("{:?}", conn);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains(SCRUBBED_VALUE));

        let serialized = serde_json::to_string(&conn).unwrap();
        assert!(!serialized.contains("sk-secret"));
    }

    #[test]
    fn invocation_value_keeps_secrets() {
        let value = sample().to_value();
        assert_eq!(value["api_key"], json!("sk-secret"));
        assert_eq!(value["api_base"], json!("https://example.invalid/v1"));
    }
}
