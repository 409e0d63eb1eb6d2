use crate::{
    cli::{Cli, Command, SelectionArgs},
    config::{Config, ConfigError, DatabaseBackend},
    db::{establish_sqlite, MigrationError, RunMigrations, SqliteOpenError},
    fuota_store::{
        get_pending_fragmentation_sessions_with, list_exhausted_fragmentation_sessions,
        list_pending_fragmentation_sessions, FragmentationSession, FuotaDb, FuotaStoreError,
        LeaseStrategy, PendingOptions, Timestamp,
    },
    logging::{format_error_report, init_logging},
};
use diesel::pg::PgConnection;
use diesel::{Connection, ConnectionError};
use std::io::{self, Write};
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to connect to postgres")]
    Connection(#[source] ConnectionError),
    #[error(transparent)]
    Sqlite(#[from] SqliteOpenError),
    #[error("failed to run migrations")]
    Migration(#[source] MigrationError),
    #[error(transparent)]
    Store(#[from] FuotaStoreError),
    #[error("failed to write output")]
    Output(#[from] io::Error),
    #[error("failed to encode output")]
    Json(#[from] serde_json::Error),
    #[error("claim needs sqlite: postgres row locks end when the command commits")]
    ClaimUnsupported,
}

/// Runs one CLI command and returns the process exit code.
///
/// 0 on success, 2 for configuration errors, 1 for everything else.
pub fn run(cli: &Cli) -> i32 {
    let mode = cli.command.name();
    let logging_context = init_logging("fuota_worker", mode, &cli.log_level);
    let run_span = tracing::info_span!(
        "command_run",
        service = %logging_context.service,
        environment = %logging_context.environment,
        mode = %logging_context.mode,
        run_id = %logging_context.run_id,
        build_version = %logging_context.build_version,
        build_commit = %logging_context.build_commit
    );
    let _run_guard = run_span.enter();

    let config = match Config::from_env(cli.database_url.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return 2;
        }
    };
    info!(
        event = "command_starting",
        command = mode,
        backend = config.database.name(),
        "starting command"
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match execute(&cli.command, &config, &mut out) {
        Ok(rows) => {
            info!(
                event = "command_complete",
                command = mode,
                rows,
                "command completed"
            );
            0
        }
        Err(err) => {
            let error_report = format_error_report(&err);
            error!(
                event = "command_failed",
                command = mode,
                error = %err,
                error_debug = ?err,
                error_report = %error_report,
                "command failed"
            );
            eprintln!("{mode} failed: {err}");
            eprintln!("{error_report}");
            1
        }
    }
}

/// Opens the configured database and runs `command` against it.
pub fn execute<W>(command: &Command, config: &Config, out: &mut W) -> Result<usize, CommandError>
where
    W: Write,
{
    match &config.database {
        DatabaseBackend::Postgres(url) => {
            let mut conn = PgConnection::establish(url).map_err(CommandError::Connection)?;
            run_command(&mut conn, command, config, out)
        }
        DatabaseBackend::Sqlite(path) => {
            let mut conn = establish_sqlite(path)?;
            run_command(&mut conn, command, config, out)
        }
    }
}

/// Runs `command` on an open connection, writing one JSON document per line to `out`.
///
/// Returns the number of rows (or applied migrations) written.
pub fn run_command<C, W>(
    conn: &mut C,
    command: &Command,
    config: &Config,
    out: &mut W,
) -> Result<usize, CommandError>
where
    C: FuotaDb + RunMigrations,
    W: Write,
{
    match command {
        Command::Migrate => {
            let applied = conn.run_migrations().map_err(CommandError::Migration)?;
            for version in &applied {
                info!(event = "migration_applied", version = %version, "applied migration");
            }
            serde_json::to_writer(&mut *out, &serde_json::json!({ "applied": applied }))?;
            writeln!(out)?;
            Ok(applied.len())
        }
        Command::Pending(SelectionArgs {
            limit,
            max_retry_count,
        }) => {
            let sessions = list_pending_fragmentation_sessions(
                conn,
                *limit,
                *max_retry_count,
                Timestamp::now(),
            )?;
            write_json_lines(out, &sessions)
        }
        Command::Exhausted(SelectionArgs {
            limit,
            max_retry_count,
        }) => {
            let sessions = list_exhausted_fragmentation_sessions(conn, *limit, *max_retry_count)?;
            write_json_lines(out, &sessions)
        }
        Command::Claim(SelectionArgs {
            limit,
            max_retry_count,
        }) => {
            ensure_claim_supported(conn.lease_strategy())?;
            let options = PendingOptions {
                now: Timestamp::now(),
                lease_ttl: config.lease_ttl,
            };
            let sessions = conn.atomically(|conn| {
                get_pending_fragmentation_sessions_with(conn, *limit, *max_retry_count, &options)
            })?;
            write_json_lines(out, &sessions)
        }
    }
}

/// `claim` prints a batch after its transaction commits, so only leases that outlive the
/// transaction are meaningful.
fn ensure_claim_supported(strategy: LeaseStrategy) -> Result<(), CommandError> {
    match strategy {
        LeaseStrategy::Optimistic => Ok(()),
        LeaseStrategy::SkipLocked => Err(CommandError::ClaimUnsupported),
    }
}

fn write_json_lines<W>(
    out: &mut W,
    sessions: &[FragmentationSession],
) -> Result<usize, CommandError>
where
    W: Write,
{
    for session in sessions {
        serde_json::to_writer(&mut *out, session)?;
        writeln!(out)?;
    }
    out.flush()?;
    Ok(sessions.len())
}
