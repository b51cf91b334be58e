//! Stack configuration: connection parameters and service names
//!
//! Connection parameters are resolved exactly once (normally from the
//! environment file the deployment installer writes) and passed into adapters
//! and coordinators as plain data. No component re-reads the environment
//! mid-run.

use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Connection parameters for the vector store (Qdrant HTTP API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    /// Base URL, e.g. `http://localhost:6333`
    pub url: String,
    /// Optional API key sent as `api-key` header
    pub api_key: Option<String>,
}

/// Connection parameters for the relational store (Postgres).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Logical databases to capture; discovered config, not hard-coded
    pub databases: Vec<String>,
}

/// Connection parameters for the graph store (Neo4j HTTP API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Base URL of the HTTP API, e.g. `http://localhost:7474`
    pub url: String,
    pub user: String,
    pub password: String,
    /// Target database name
    pub database: String,
}

/// Names of the compose services the coordinators start and stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Directory holding the compose project
    pub compose_dir: PathBuf,
    /// Write-path services frozen during relational/graph capture (API, UI) —
    /// never the data stores themselves, which must stay reachable for their
    /// own dump tools
    pub write_path: Vec<String>,
    pub vector_service: String,
    pub relational_service: String,
    pub graph_service: String,
}

/// One HTTP endpoint the verifier probes in api-only mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub name: String,
    pub url: String,
}

/// Fully resolved configuration for one coordinator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    pub vector: VectorConfig,
    pub relational: RelationalConfig,
    pub graph: GraphConfig,
    pub services: ServicesConfig,
    /// Endpoints checked by `verify --api-only`
    pub api_endpoints: Vec<ApiEndpoint>,
    /// Directory archives are written to and restored from
    pub backup_dir: PathBuf,
}

impl StackConfig {
    /// Resolve configuration from the environment, applying the deployment's
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let databases: Vec<String> = env_or("MEMVAULT_PG_DATABASES", "mem0")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let port: u16 = env_or("MEMVAULT_PG_PORT", "5432")
            .parse()
            .map_err(|_| VaultError::validation("MEMVAULT_PG_PORT is not a valid port"))?;

        let config = Self {
            vector: VectorConfig {
                url: env_or("MEMVAULT_QDRANT_URL", "http://localhost:6333"),
                api_key: env::var("QDRANT_API_KEY").ok(),
            },
            relational: RelationalConfig {
                host: env_or("MEMVAULT_PG_HOST", "localhost"),
                port,
                user: env_or("MEMVAULT_PG_USER", "postgres"),
                password: env_or("MEMVAULT_PG_PASSWORD", "postgres"),
                databases,
            },
            graph: GraphConfig {
                url: env_or("MEMVAULT_NEO4J_URL", "http://localhost:7474"),
                user: env_or("MEMVAULT_NEO4J_USER", "neo4j"),
                password: env_or("MEMVAULT_NEO4J_PASSWORD", "password"),
                database: env_or("MEMVAULT_NEO4J_DATABASE", "neo4j"),
            },
            services: ServicesConfig {
                compose_dir: PathBuf::from(env_or("MEMVAULT_COMPOSE_DIR", ".")),
                write_path: env_or("MEMVAULT_WRITE_PATH_SERVICES", "mem0-api,mem0-webui")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                vector_service: env_or("MEMVAULT_QDRANT_SERVICE", "mem0-qdrant"),
                relational_service: env_or("MEMVAULT_PG_SERVICE", "mem0-postgres"),
                graph_service: env_or("MEMVAULT_NEO4J_SERVICE", "mem0-neo4j"),
            },
            api_endpoints: vec![
                ApiEndpoint {
                    name: "mem0-api".to_string(),
                    url: env_or("MEMVAULT_API_URL", "http://localhost:8000/docs"),
                },
                ApiEndpoint {
                    name: "mem0-webui".to_string(),
                    url: env_or("MEMVAULT_WEBUI_URL", "http://localhost:3000"),
                },
            ],
            backup_dir: PathBuf::from(env_or("MEMVAULT_BACKUP_DIR", "./backups")),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate that the configuration is internally complete.
    pub fn validate(&self) -> Result<()> {
        if self.vector.url.is_empty() {
            return Err(VaultError::validation("vector store URL cannot be empty"));
        }
        if self.relational.host.is_empty() {
            return Err(VaultError::validation("relational host cannot be empty"));
        }
        if self.relational.databases.is_empty() {
            return Err(VaultError::validation(
                "at least one relational database must be configured",
            ));
        }
        if self.graph.url.is_empty() {
            return Err(VaultError::validation("graph store URL cannot be empty"));
        }
        Ok(())
    }
}
