use flowcore::{Connection, ConnectionError, ConnectionProvider};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

/// Environment variable naming a JSON file of process-wide connections.
pub const CONNECTIONS_ENV: &str = "PROMPTFLOW_CONNECTIONS";

/// In-memory connection provider
///
/// Holds the connections known to the process. Requests may bring their own;
/// these only fill the gaps.
#[derive(Default)]
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, Connection>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(connections: HashMap<String, Connection>) -> Self {
        let connections = connections
            .into_iter()
            .map(|(name, mut conn)| {
                conn.name = name.clone();
                (name, conn)
            })
            .collect();
        Self {
            connections: RwLock::new(connections),
        }
    }

    /// Load `{name: {type, value, secret_keys}}` from the file named by
    /// `PROMPTFLOW_CONNECTIONS`. An unset variable yields an empty manager.
    pub fn from_env() -> Result<Self, ConnectionError> {
        match std::env::var(CONNECTIONS_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(Path::new(&path)),
            _ => Ok(Self::new()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConnectionError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConnectionError::Load(format!("{}: {}", path.display(), e)))?;
        let connections: HashMap<String, Connection> = serde_json::from_str(&content)
            .map_err(|e| ConnectionError::Load(format!("{}: {}", path.display(), e)))?;
        tracing::info!(count = connections.len(), path = %path.display(), "Loaded connections");
        Ok(Self::from_map(connections))
    }

    pub fn insert(&self, connection: Connection) {
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(connection.name.clone(), connection);
    }

    pub fn to_map(&self) -> HashMap<String, Connection> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl ConnectionProvider for ConnectionManager {
    fn get(&self, name: &str) -> Result<Connection, ConnectionError> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| ConnectionError::NotFound {
                name: name.to_string(),
                available: self.names(),
            })
    }

    fn list(&self) -> Vec<Connection> {
        let mut all: Vec<Connection> = self.to_map().into_values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_connection_file_and_names_entries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"azure_open_ai": {{"type": "AzureOpenAIConnection",
                "value": {{"api_base": "https://x", "api_key": "k"}},
                "secret_keys": ["api_key"]}}}}"#
        )
        .unwrap();

        let manager = ConnectionManager::from_file(file.path()).unwrap();
        let conn = manager.get("azure_open_ai").unwrap();
        assert_eq!(conn.name, "azure_open_ai");
        assert_eq!(conn.connection_type, "AzureOpenAIConnection");
        assert_eq!(conn.secrets["api_key"], "k");
        assert_eq!(manager.list().len(), 1);
    }

    #[test]
    fn missing_connection_lists_available_names() {
        let manager = ConnectionManager::new();
        manager.insert(Connection::new("b", "CustomConnection"));
        manager.insert(Connection::new("a", "CustomConnection"));
        match manager.get("c") {
            Err(ConnectionError::NotFound { name, available }) => {
                assert_eq!(name, "c");
                assert_eq!(available, vec!["a", "b"]);
            }
            other => panic!("unexpected {:?}", other.map(|c| c.name)),
        }
    }
}
