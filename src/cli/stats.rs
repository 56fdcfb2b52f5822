use colored::Colorize;
use comfy_table::{Cell, Table};

use crate::db::{get_connection, get_metadata, get_monthly_summary, get_stats, init_db};
use crate::error::Result;
use crate::fmt::yen;
use crate::settings::load_effective_settings;

pub fn run() -> Result<()> {
    let settings = load_effective_settings()?;
    let db_path = settings.history_db_path();

    println!("Data dir:   {}", settings.data_dir);
    println!("Ledger:     {}", settings.ledger_root().display());
    println!("History:    {}", db_path.display());

    if !db_path.exists() {
        println!();
        println!("No sync history yet. Run `freebean init` and `freebean sync`.");
        return Ok(());
    }

    let conn = get_connection(&db_path)?;
    init_db(&conn)?;
    let stats = get_stats(&conn)?;

    let mut table = Table::new();
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec![Cell::new("Deals synced"), Cell::new(stats.total_deals)]);
    table.add_row(vec![Cell::new("Journals synced"), Cell::new(stats.total_journals)]);
    table.add_row(vec![Cell::new("Documents attached"), Cell::new(stats.total_documents)]);
    table.add_row(vec![
        Cell::new("Last sync"),
        Cell::new(stats.last_sync.as_deref().unwrap_or("never")),
    ]);
    if let Some(range) = get_metadata(&conn, "last_sync_range") {
        table.add_row(vec![Cell::new("Last range"), Cell::new(range)]);
    }
    println!();
    println!("{table}");

    let months = get_monthly_summary(&conn)?;
    if months.is_empty() {
        println!("{}", "Nothing synced yet.".yellow());
        return Ok(());
    }

    let mut by_month = Table::new();
    by_month.set_header(vec!["Month", "Deals", "Journals", "Amount"]);
    for m in &months {
        by_month.add_row(vec![
            Cell::new(&m.month),
            Cell::new(m.deals),
            Cell::new(m.journals),
            Cell::new(yen(m.amount)),
        ]);
    }
    println!("{by_month}");
    Ok(())
}
