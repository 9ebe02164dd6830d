use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Process-wide settings, resolved once at startup into an immutable value.
/// Never re-read mid-process.
#[derive(Debug, Clone)]
pub struct WorkflowEngineConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub log_filter: String,
}

fn parse_env<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
        Err(_) => Ok(default),
    }
}

impl WorkflowEngineConfig {
    /// Resolves configuration from the process environment, mirroring the
    /// fallback-chain idiom this codebase uses elsewhere for connecting to
    /// Postgres, minus any CLI argument layer (there is no CLI surface in
    /// this crate — the embedding binary owns that).
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("PAYFLOW_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("PAYFLOW_DATABASE_URL"))?;
        let max_connections = parse_env("PAYFLOW_PG_MAX_CONNECTIONS", 10u32)?;
        let acquire_timeout_secs = parse_env("PAYFLOW_PG_ACQUIRE_TIMEOUT_SECS", 5u64)?;
        let log_filter =
            env::var("RUST_LOG").unwrap_or_else(|_| "payflow=info,info".to_string());

        Ok(Self {
            database_url,
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
            log_filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_falls_back_to_default_when_unset() {
        env::remove_var("PAYFLOW_TEST_UNSET_VAR");
        let value: u32 = parse_env("PAYFLOW_TEST_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn parse_env_rejects_unparseable_value() {
        env::set_var("PAYFLOW_TEST_BAD_VAR", "not-a-number");
        let result: Result<u32, ConfigError> = parse_env("PAYFLOW_TEST_BAD_VAR", 42);
        assert!(result.is_err());
        env::remove_var("PAYFLOW_TEST_BAD_VAR");
    }
}
