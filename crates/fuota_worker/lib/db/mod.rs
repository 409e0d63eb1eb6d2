
use std::error::Error;

use diesel::connection::SimpleConnection;
use diesel::pg::PgConnection;
use diesel::sqlite::SqliteConnection;
use diesel::{Connection, ConnectionError};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

/// Postgres schema. Row locks provide the selector's leases.
pub const POSTGRES_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
/// SQLite parity schema. Same tables plus the `lease_owner`/`lease_expires_at` columns.
pub const SQLITE_MIGRATIONS: EmbeddedMigrations = embed_migrations!("sqlite_migrations");

pub type MigrationError = Box<dyn Error + Send + Sync>;

/// Applies the embedded migration set that matches the connection's backend.
pub trait RunMigrations {
    /// Returns the versions that were applied, oldest first.
    fn run_migrations(&mut self) -> Result<Vec<String>, MigrationError>;
}

impl RunMigrations for PgConnection {
    fn run_migrations(&mut self) -> Result<Vec<String>, MigrationError> {
        let applied = self.run_pending_migrations(POSTGRES_MIGRATIONS)?;
        Ok(applied.iter().map(ToString::to_string).collect())
    }
}

impl RunMigrations for SqliteConnection {
    fn run_migrations(&mut self) -> Result<Vec<String>, MigrationError> {
        let applied = self.run_pending_migrations(SQLITE_MIGRATIONS)?;
        Ok(applied.iter().map(ToString::to_string).collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SqliteOpenError {
    #[error("failed to open sqlite database {path:?}")]
    Connect {
        path: String,
        #[source]
        source: ConnectionError,
    },
    #[error("failed to configure sqlite database {path:?}")]
    Configure {
        path: String,
        #[source]
        source: diesel::result::Error,
    },
}

/// Opens a SQLite database with foreign keys enforced and a busy timeout for concurrent writers.
pub fn establish_sqlite(path: &str) -> Result<SqliteConnection, SqliteOpenError> {
    let mut conn =
        SqliteConnection::establish(path).map_err(|source| SqliteOpenError::Connect {
            path: path.to_string(),
            source,
        })?;

    conn.batch_execute(
        r#"
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        "#,
    )
    .map_err(|source| SqliteOpenError::Configure {
        path: path.to_string(),
        source,
    })?;

    Ok(conn)
}
