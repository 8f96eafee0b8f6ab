//! Route Query - read-only lookups in the route ledger
//!
//! Prints matching ledger records as a JSON array on stdout. Exits non-zero
//! when nothing matches, so scripts can tell "no such route" apart.
//!
//! Usage:
//!   route-query --config config/tracker.toml
//!   route-query --field user_id --value 780870559455
//!   route-query --ledger /var/lib/tracker/routes.log --field route_id --value 12

use clap::Parser;
use route_tracker::infra::Config;
use route_tracker::io::Ledger;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Route Query - look up completed routes
#[derive(Parser, Debug)]
#[command(name = "route-query", version, about, long_about = None)]
struct Args {
    /// Path to TOML configuration file (used to locate the ledger)
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/tracker.toml")]
    config: String,

    /// Ledger file; overrides the one derived from the config
    #[arg(short, long)]
    ledger: Option<PathBuf>,

    /// Record field to filter on, e.g. route_id or user_id
    #[arg(short, long, requires = "value")]
    field: Option<String>,

    /// Value the field must equal (compared as text)
    #[arg(short, long, requires = "field")]
    value: Option<String>,

    /// Pretty-print the JSON output
    #[arg(short, long)]
    pretty: bool,
}

fn main() -> ExitCode {
    // Logs go to stderr so stdout stays pure JSON
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %format!("{e:#}"), "route_query_failed");
            ExitCode::from(2)
        }
    }
}

/// Returns whether anything matched
fn run(args: &Args) -> anyhow::Result<bool> {
    let ledger_path = match &args.ledger {
        Some(path) => path.clone(),
        None => Config::load_from_path(&args.config).ledger_path(),
    };
    let ledger = Ledger::new(ledger_path);

    let records = match (&args.field, &args.value) {
        (Some(field), Some(value)) => ledger.query(field, value)?,
        _ => ledger.raw_records()?,
    };
    info!(ledger = %ledger.path().display(), matches = %records.len(), "route_query");

    let output = if args.pretty {
        serde_json::to_string_pretty(&records)?
    } else {
        serde_json::to_string(&records)?
    };
    println!("{output}");
    Ok(!records.is_empty())
}
