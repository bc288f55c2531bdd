use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{RecordbaseError, Result};

fn default_schema() -> String {
    "public".to_string()
}

fn default_history_limit() -> usize {
    200
}

fn default_editing_ttl() -> i64 {
    60
}

/// Runtime settings. Loaded from YAML or from `RECORDBASE_*` variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub database_url: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Metadata model file.
    pub metadata: PathBuf,
    /// SQLite file of applied patch ids. In memory when unset.
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    #[serde(default)]
    pub log_queries: bool,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_editing_ttl")]
    pub editing_ttl_minutes: i64,
}

impl Config {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from a variable lookup. `RECORDBASE_DATABASE_URL` and
    /// `RECORDBASE_METADATA` are required.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |name: &str| {
            lookup(name).ok_or_else(|| RecordbaseError::Other(format!("{name} is not set")))
        };
        let database_url = required("RECORDBASE_DATABASE_URL")?;
        let metadata = PathBuf::from(required("RECORDBASE_METADATA")?);
        let schema = lookup("RECORDBASE_SCHEMA")
            .or_else(|| lookup("PGSCHEMA"))
            .unwrap_or_else(default_schema);
        let log_queries = lookup("RECORDBASE_LOG_QUERIES")
            .or_else(|| lookup("LOG_QUERIES"))
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let history_limit = lookup("RECORDBASE_HISTORY_LIMIT")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_history_limit);
        let editing_ttl_minutes = lookup("RECORDBASE_EDITING_TTL_MINUTES")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_editing_ttl);
        Ok(Config {
            database_url,
            schema,
            metadata,
            ledger_path: lookup("RECORDBASE_LEDGER").map(PathBuf::from),
            log_queries,
            history_limit,
            editing_ttl_minutes,
        })
    }
}
