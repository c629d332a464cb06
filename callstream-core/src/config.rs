//! Service configuration.
//!
//! The core recognizes exactly one option: the store connection string.
//! Retry policy, grace interval, missing-cap, and bus buffering are fixed
//! constants, deliberately not tunable.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::CoreError;
use crate::store::{CallStore, MemoryStore, SqliteStore, StoreError};

pub const STORE_CONNECTION_ENV: &str = "STORE_CONNECTION";

/// Where call and packet rows live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConnection {
    Memory,
    Sqlite(PathBuf),
}

impl StoreConnection {
    /// Read `STORE_CONNECTION` from the environment, defaulting to memory.
    pub fn from_env() -> Result<Self, CoreError> {
        match std::env::var(STORE_CONNECTION_ENV) {
            Ok(raw) => Self::parse(&raw),
            Err(_) => Ok(StoreConnection::Memory),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        if raw.is_empty() || raw == "memory" || raw == "memory://" {
            return Ok(StoreConnection::Memory);
        }
        if let Some(path) = raw.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(CoreError::InvalidInput(
                    "sqlite:// connection needs a path".to_string(),
                ));
            }
            return Ok(StoreConnection::Sqlite(PathBuf::from(path)));
        }
        Err(CoreError::InvalidInput(format!(
            "unrecognized store connection '{raw}' (expected memory:// or sqlite://<path>)"
        )))
    }

    /// Build the configured store backend.
    pub fn build(&self) -> Result<Arc<dyn CallStore>, StoreError> {
        match self {
            StoreConnection::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreConnection::Sqlite(path) => Ok(Arc::new(SqliteStore::open(path)?)),
        }
    }
}

impl fmt::Display for StoreConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreConnection::Memory => write!(f, "memory://"),
            StoreConnection::Sqlite(path) => write!(f, "sqlite://{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_memory_forms() {
        assert_eq!(StoreConnection::parse("").unwrap(), StoreConnection::Memory);
        assert_eq!(
            StoreConnection::parse("memory").unwrap(),
            StoreConnection::Memory
        );
        assert_eq!(
            StoreConnection::parse("memory://").unwrap(),
            StoreConnection::Memory
        );
    }

    #[test]
    fn parses_sqlite_paths() {
        let parsed = StoreConnection::parse("sqlite:///var/lib/calls.db").unwrap();
        assert_eq!(
            parsed,
            StoreConnection::Sqlite(PathBuf::from("/var/lib/calls.db"))
        );
        assert_eq!(parsed.to_string(), "sqlite:///var/lib/calls.db");
    }

    #[test]
    fn rejects_unknown_schemes() {
        assert!(StoreConnection::parse("postgres://x").is_err());
        assert!(StoreConnection::parse("sqlite://").is_err());
    }
}
