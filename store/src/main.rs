//! storectl: inspect a durable store file from the command line.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use store::Db;

#[derive(Parser)]
#[command(name = "storectl", about = "Inspect and maintain a durable store file")]
struct Cli {
    /// Path to the SQLite store file.
    #[arg(long, default_value = "store.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the run and step table for a run id.
    ShowRun { run_id: String },
    /// Print the audit log for a run id.
    Audit { run_id: String },
    /// Force a WAL checkpoint-and-truncate.
    Checkpoint,
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db = Db::open(&cli.db)?;

    match cli.command {
        Command::ShowRun { run_id } => {
            let state = db.get_run_state(&run_id)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Command::Audit { run_id } => {
            let events = db.audit_events(&run_id)?;
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        Command::Checkpoint => {
            db.checkpoint_and_truncate()?;
            println!("checkpoint complete");
        }
    }

    db.close()?;
    Ok(())
}
