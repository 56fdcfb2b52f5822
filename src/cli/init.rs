use std::path::PathBuf;

use crate::db::open_history;
use crate::error::Result;
use crate::mapper::DEFAULT_MAPPING;
use crate::settings::{load_settings, save_settings, shellexpand_path, Settings};

pub fn run(data_dir: Option<String>) -> Result<()> {
    let mut settings = load_settings();
    let defaults = Settings::default();

    if let Some(dir) = data_dir {
        settings.data_dir = shellexpand_path(&dir);
    } else if settings.data_dir == defaults.data_dir && settings.company_id.is_none() {
        // First run
        println!("Data directory [{}]: ", settings.data_dir);
        let mut input = String::new();
        std::io::stdin().read_line(&mut input).ok();
        let chosen = input.trim();
        if !chosen.is_empty() {
            settings.data_dir = shellexpand_path(chosen);
        }
    }

    save_settings(&settings)?;

    let resolved = PathBuf::from(&settings.data_dir);
    std::fs::create_dir_all(&resolved)?;
    std::fs::create_dir_all(settings.ledger_root())?;
    open_history(&settings.history_db_path())?;

    let mapping = settings.mapping_path();
    if !mapping.exists() {
        std::fs::write(&mapping, DEFAULT_MAPPING)?;
        println!("Wrote default account mapping to {}", mapping.display());
    }

    println!("Initialized freebean at {}", resolved.display());
    if settings.company_id.is_none() {
        println!("Set company_id and access_token in {} before syncing.", crate::settings::settings_path().display());
    }
    Ok(())
}
