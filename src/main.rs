mod cli;
mod client;
mod converter;
mod db;
mod emulator;
mod error;
mod fmt;
mod ledger;
mod mapper;
mod models;
mod settings;
mod sync;
#[cfg(test)]
mod test_support;

use std::io::stderr;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as log_fmt, Layer};

use cli::{Cli, Commands};

fn setup_logging(level: LevelFilter) {
    // stdout carries dry-run previews and reports, so logs go to stderr
    let terminal_log = log_fmt::layer()
        .with_target(false)
        .with_writer(stderr)
        .with_filter(level);

    tracing_subscriber::registry().with(terminal_log).init();
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.log_level);

    let result = match cli.command {
        Commands::Init { data_dir } => cli::init::run(data_dir),
        Commands::Sync { from, to, dry_run } => cli::sync::run(&from, &to, dry_run),
        Commands::Stats => cli::stats::run(),
        Commands::Receipt {
            file,
            date,
            description,
            ref_number,
            deal_id,
        } => cli::receipt::run(&file, &date, description.as_deref(), ref_number.as_deref(), deal_id),
        Commands::Emulator {
            addr,
            db,
            token,
            match_tolerance_days,
        } => cli::emulator::run(&addr, db, token, match_tolerance_days),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
