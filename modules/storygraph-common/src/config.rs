use std::env;
use std::time::Duration;

use tracing::info;

use crate::error::StoryGraphError;

const DEFAULT_OP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_CONNECTIONS: usize = 10;
const DEFAULT_FETCH_SIZE: usize = 500;

/// Store configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Neo4j
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub neo4j_database: Option<String>,

    // Store behaviour
    pub op_timeout: Duration,
    pub max_connections: usize,
    pub fetch_size: usize,
}

impl Config {
    /// Config with defaults for everything but the connection credentials.
    pub fn new(uri: &str, user: &str, password: &str) -> Self {
        Self {
            neo4j_uri: uri.to_string(),
            neo4j_user: user.to_string(),
            neo4j_password: password.to_string(),
            neo4j_database: None,
            op_timeout: Duration::from_secs(DEFAULT_OP_TIMEOUT_SECS),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            fetch_size: DEFAULT_FETCH_SIZE,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, StoryGraphError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any source keyed by the environment variable names,
    /// e.g. command-line flags layered over the environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StoryGraphError> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| StoryGraphError::Config(format!("{key} is required")))
        };

        let mut config = Self::new(
            &required("NEO4J_URI")?,
            &required("NEO4J_USER")?,
            &required("NEO4J_PASSWORD")?,
        );
        config.neo4j_database = lookup("NEO4J_DATABASE").filter(|v| !v.is_empty());

        if let Some(secs) = parse_var::<u64>(&lookup, "STORYGRAPH_OP_TIMEOUT_SECS")? {
            if secs == 0 {
                return Err(StoryGraphError::Config(
                    "STORYGRAPH_OP_TIMEOUT_SECS must be greater than zero".to_string(),
                ));
            }
            config.op_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "STORYGRAPH_MAX_CONNECTIONS")? {
            config.max_connections = n.max(1);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "STORYGRAPH_FETCH_SIZE")? {
            config.fetch_size = n.max(1);
        }

        Ok(config)
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Log the effective configuration without credentials.
    pub fn log_redacted(&self) {
        info!(
            neo4j_uri = %self.neo4j_uri,
            neo4j_user = %self.neo4j_user,
            neo4j_database = self.neo4j_database.as_deref().unwrap_or("<default>"),
            op_timeout_secs = self.op_timeout.as_secs(),
            max_connections = self.max_connections,
            fetch_size = self.fetch_size,
            "Store configuration loaded"
        );
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, StoryGraphError> {
    match lookup(key).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| StoryGraphError::Config(format!("{key} must be a number, got {raw:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const CREDS: [(&str, &str); 3] = [
        ("NEO4J_URI", "bolt://localhost:7687"),
        ("NEO4J_USER", "neo4j"),
        ("NEO4J_PASSWORD", "secret"),
    ];

    #[test]
    fn defaults_apply_when_optional_vars_missing() {
        let config = Config::from_lookup(lookup(&CREDS)).unwrap();
        assert_eq!(config.neo4j_uri, "bolt://localhost:7687");
        assert_eq!(config.op_timeout, Duration::from_secs(10));
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.fetch_size, 500);
        assert!(config.neo4j_database.is_none());
    }

    #[test]
    fn missing_password_is_a_config_error() {
        let err = Config::from_lookup(lookup(&CREDS[..2])).unwrap_err();
        assert!(matches!(err, StoryGraphError::Config(ref m) if m.contains("NEO4J_PASSWORD")));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut vars = CREDS.to_vec();
        vars.push(("STORYGRAPH_OP_TIMEOUT_SECS", "3"));
        vars.push(("STORYGRAPH_MAX_CONNECTIONS", "4"));
        vars.push(("NEO4J_DATABASE", "stories"));
        let config = Config::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.op_timeout, Duration::from_secs(3));
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.neo4j_database.as_deref(), Some("stories"));
    }

    #[test]
    fn invalid_numbers_and_zero_timeout_rejected() {
        let mut vars = CREDS.to_vec();
        vars.push(("STORYGRAPH_FETCH_SIZE", "lots"));
        assert!(Config::from_lookup(lookup(&vars)).is_err());

        let mut vars = CREDS.to_vec();
        vars.push(("STORYGRAPH_OP_TIMEOUT_SECS", "0"));
        assert!(Config::from_lookup(lookup(&vars)).is_err());
    }
}
