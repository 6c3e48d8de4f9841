use serde::{Deserialize, Serialize};
use std::env;

/// Configuration for the graph store connection and engine defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bolt URI of the graph store
    pub store_uri: String,

    /// Graph store username
    pub store_username: String,

    /// Graph store password
    pub store_password: String,

    /// Database name within the store
    pub database: String,

    /// Rows fetched per round trip when streaming results
    pub fetch_size: usize,

    /// Maximum connections in the pool
    pub max_connections: usize,

    /// Depth bound for time-travel traversal when the caller omits one
    pub default_traversal_depth: u32,

    /// Hop bound for checkpoint expansion when the caller omits one
    pub default_checkpoint_hops: u32,

    /// Page size for list operations when the caller omits a limit
    pub default_page_limit: usize,
}

impl Config {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self, env::VarError> {
        Ok(Self {
            store_uri: env::var("GRAPH_STORE_URI")?,
            store_username: env::var("GRAPH_STORE_USERNAME")?,
            store_password: env::var("GRAPH_STORE_PASSWORD")?,
            database: env::var("GRAPH_STORE_DATABASE").unwrap_or_else(|_| "neo4j".to_string()),
            fetch_size: env::var("GRAPH_STORE_FETCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(500),
            max_connections: env::var("GRAPH_STORE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(16),
            default_traversal_depth: env::var("HISTORY_TRAVERSAL_DEPTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            default_checkpoint_hops: env::var("HISTORY_CHECKPOINT_HOPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            default_page_limit: env::var("HISTORY_PAGE_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        })
    }

    /// Create a new configuration for testing
    pub fn for_testing() -> Self {
        Self {
            store_uri: "bolt://localhost:7687".to_string(),
            store_username: "neo4j".to_string(),
            store_password: "neo4j".to_string(),
            database: "neo4j".to_string(),
            fetch_size: 50,
            max_connections: 4,
            default_traversal_depth: 3,
            default_checkpoint_hops: 2,
            default_page_limit: 20,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_uri: "bolt://localhost:7687".to_string(),
            store_username: "neo4j".to_string(),
            store_password: "".to_string(),
            database: "neo4j".to_string(),
            fetch_size: 500,
            max_connections: 16,
            default_traversal_depth: 3,
            default_checkpoint_hops: 2,
            default_page_limit: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_config_from_env() {
        env::set_var("GRAPH_STORE_URI", "bolt://graph-store:7687");
        env::set_var("GRAPH_STORE_USERNAME", "history");
        env::set_var("GRAPH_STORE_PASSWORD", "secret");
        env::set_var("GRAPH_STORE_DATABASE", "temporal");
        env::set_var("GRAPH_STORE_FETCH_SIZE", "100");
        env::set_var("HISTORY_TRAVERSAL_DEPTH", "5");

        let config = Config::from_env().unwrap();
        assert_eq!(config.store_uri, "bolt://graph-store:7687");
        assert_eq!(config.database, "temporal");
        assert_eq!(config.fetch_size, 100);
        assert_eq!(config.default_traversal_depth, 5);

        env::remove_var("GRAPH_STORE_FETCH_SIZE");
        env::remove_var("HISTORY_TRAVERSAL_DEPTH");
    }

    #[test]
    fn test_config_defaults() {
        env::set_var("GRAPH_STORE_URI", "bolt://graph-store:7687");
        env::set_var("GRAPH_STORE_USERNAME", "history");
        env::set_var("GRAPH_STORE_PASSWORD", "secret");
        env::remove_var("GRAPH_STORE_MAX_CONNECTIONS");
        env::remove_var("HISTORY_CHECKPOINT_HOPS");
        env::remove_var("HISTORY_PAGE_LIMIT");

        let config = Config::from_env().unwrap();
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.default_checkpoint_hops, 2);
        assert_eq!(config.default_page_limit, 20);
    }

    #[test]
    fn test_config_for_testing() {
        let config = Config::for_testing();
        assert_eq!(config.store_uri, "bolt://localhost:7687");
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.default_traversal_depth, 3);
    }
}
