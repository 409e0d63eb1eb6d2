use std::env;
use std::time::Duration;

use crate::fuota_store::DEFAULT_LEASE_TTL;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("DATABASE_URL is not set and --database-url was not given")]
    MissingDatabaseUrl,
    #[error("invalid {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Storage backend picked from the database URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseBackend {
    Postgres(String),
    /// SQLite database path, `:memory:` included.
    Sqlite(String),
}

impl DatabaseBackend {
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "DATABASE_URL",
                value: url.to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Ok(Self::Postgres(url.to_string()));
        }

        let path = url.strip_prefix("sqlite://").unwrap_or(url);
        Ok(Self::Sqlite(path.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Sqlite(_) => "sqlite",
        }
    }
}

pub struct Config {
    pub database: DatabaseBackend,
    /// Lease lifetime for backends without row locks. `FUOTA_LEASE_TTL_SECS`, default 60.
    pub lease_ttl: Duration,
}

impl Config {
    /// Reads configuration from the process environment. `database_url` wins over `DATABASE_URL`.
    pub fn from_env(database_url: Option<&str>) -> Result<Self, ConfigError> {
        Self::from_lookup(database_url, |name| env::var(name).ok())
    }

    pub fn from_lookup<F>(database_url: Option<&str>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = match database_url {
            Some(url) => url.to_string(),
            None => lookup("DATABASE_URL").ok_or(ConfigError::MissingDatabaseUrl)?,
        };
        let database = DatabaseBackend::from_url(&url)?;

        let lease_ttl = match lookup("FUOTA_LEASE_TTL_SECS") {
            None => DEFAULT_LEASE_TTL,
            Some(raw) => {
                let secs = raw
                    .trim()
                    .parse::<u64>()
                    .map_err(|err| ConfigError::InvalidValue {
                        name: "FUOTA_LEASE_TTL_SECS",
                        value: raw.clone(),
                        reason: err.to_string(),
                    })?;
                if secs == 0 {
                    return Err(ConfigError::InvalidValue {
                        name: "FUOTA_LEASE_TTL_SECS",
                        value: raw,
                        reason: "must be at least 1".to_string(),
                    });
                }
                Duration::from_secs(secs)
            }
        };

        Ok(Self {
            database,
            lease_ttl,
        })
    }
}
