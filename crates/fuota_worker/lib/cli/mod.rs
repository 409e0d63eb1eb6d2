use crate::build_info;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    about = "Operational tooling for the FUOTA session store",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    #[arg(long = "database-url", global = true)]
    /// Overrides DATABASE_URL. `postgres://` URLs use Postgres, anything else is a SQLite path.
    pub database_url: Option<String>,

    #[arg(long = "log-level", global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Apply pending schema migrations
    Migrate,
    /// Print due, dispatchable fragmentation sessions without leasing them
    Pending(SelectionArgs),
    /// Print fragmentation sessions whose retry budget is spent
    Exhausted(SelectionArgs),
    /// Lease a batch of pending fragmentation sessions and print it (SQLite only)
    ///
    /// The printed batch stays leased until the lease TTL. Postgres leases are row locks that end
    /// when the command commits, so the command refuses a Postgres database.
    Claim(SelectionArgs),
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct SelectionArgs {
    #[arg(long, default_value_t = 10)]
    pub limit: i64,
    #[arg(long = "max-retry-count", default_value_t = 5)]
    pub max_retry_count: i32,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Migrate => "migrate",
            Command::Pending(_) => "pending",
            Command::Exhausted(_) => "exhausted",
            Command::Claim(_) => "claim",
        }
    }
}

pub fn parse_args() -> Cli {
    Cli::parse()
}
