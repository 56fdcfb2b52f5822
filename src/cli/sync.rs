use colored::Colorize;
use tracing::info;

use crate::client::FreeeClient;
use crate::converter::Converter;
use crate::db::{open_history, open_history_read_only};
use crate::error::{FreebeanError, Result};
use crate::ledger::LedgerRepo;
use crate::mapper::AccountMapper;
use crate::models::parse_date;
use crate::settings::load_effective_settings;
use crate::sync::{SyncOptions, SyncReport, Syncer};

pub fn run(from: &str, to: &str, dry_run: bool) -> Result<()> {
    let from = parse_date(from)?;
    let to = parse_date(to)?;
    if from > to {
        return Err(FreebeanError::Config(format!("--from {from} is after --to {to}")));
    }

    let settings = load_effective_settings()?;
    let client = FreeeClient::from_settings(&settings)?;

    let mapping_path = settings.mapping_path();
    let mapper = if mapping_path.exists() {
        AccountMapper::load(&mapping_path)?
    } else {
        info!(path = %mapping_path.display(), "no mapping file, using built-in mapping");
        AccountMapper::builtin()?
    };
    info!(accounts = mapper.len(), "loaded account mapping");

    // a dry run must not create or migrate the history file
    let conn = if dry_run {
        open_history_read_only(&settings.history_db_path())?
    } else {
        open_history(&settings.history_db_path())?
    };
    let ledger = LedgerRepo::new(settings.ledger_root());
    let converter = Converter::new(&mapper, &settings.currency)?;
    let syncer = Syncer::new(&client, &conn, &ledger, converter);

    let mut stdout = std::io::stdout().lock();
    let report = syncer.run(&SyncOptions { from, to, dry_run }, &mut stdout)?;
    drop(stdout);

    print_report(&report, dry_run);
    Ok(())
}

fn print_report(report: &SyncReport, dry_run: bool) {
    println!(
        "Fetched {} deals and {} journals ({} already synced).",
        report.deals_fetched, report.journals_fetched, report.already_synced
    );
    if report.duplicates > 0 {
        println!("{}", format!("{} entries were returned twice by the API and kept once.", report.duplicates).yellow());
    }
    if dry_run {
        println!("{}", format!("Dry run: {} entries previewed, nothing written.", report.previewed).yellow());
    } else {
        println!("{}", format!("Wrote {} entries.", report.written).green());
        for file in &report.files {
            println!("  {}", file.display());
        }
    }
    if report.warnings > 0 {
        println!("{}", format!("{} mapping warnings, see log output.", report.warnings).yellow());
    }
    if report.failed > 0 {
        println!("{}", format!("{} items failed and were skipped.", report.failed).red());
    }
}
