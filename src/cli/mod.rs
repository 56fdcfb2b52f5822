pub mod emulator;
pub mod init;
pub mod receipt;
pub mod stats;
pub mod sync;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "freebean", about = "Sync freee deals and journals into a Beancount ledger.")]
pub struct Cli {
    /// Log level written to stderr: off, error, warn, info, debug, trace
    #[arg(long = "log-level", global = true, default_value = "warn")]
    pub log_level: LevelFilter,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write settings, create the data directory, history database and account mapping.
    Init {
        /// Path for freebean data (default: ~/Documents/freebean)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Fetch deals and journals from freee and append them to the ledger.
    Sync {
        /// First issue date to fetch (YYYY-MM-DD)
        #[arg(long)]
        from: String,
        /// Last issue date to fetch (YYYY-MM-DD)
        #[arg(long)]
        to: String,
        /// Print the entries that would be written without touching the ledger or history
        #[arg(long = "dry-run")]
        dry_run: bool,
    },
    /// Show sync history statistics.
    Stats,
    /// Upload a receipt to freee and record it as attached.
    Receipt {
        /// Receipt file (PDF or image)
        file: String,
        /// Transaction date the receipt belongs to (YYYY-MM-DD)
        #[arg(long)]
        date: String,
        /// Free-text description sent with the upload
        #[arg(long)]
        description: Option<String>,
        /// Deal reference number
        #[arg(long = "ref")]
        ref_number: Option<String>,
        /// freee deal ID the receipt belongs to
        #[arg(long = "deal-id")]
        deal_id: Option<i64>,
    },
    /// Run a local freee API emulator.
    Emulator {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,
        /// Emulator database (default: <data_dir>/emulator.db)
        #[arg(long)]
        db: Option<String>,
        /// Bearer token the emulator accepts (default: access_token from settings)
        #[arg(long)]
        token: Option<String>,
        /// Days either side of a deal's issue date a bank line may fall and still be linked
        #[arg(
            long = "match-tolerance-days",
            default_value = "0",
            value_parser = clap::value_parser!(i64).range(0..=crate::emulator::matching::MAX_TOLERANCE_DAYS)
        )]
        match_tolerance_days: i64,
    },
}
