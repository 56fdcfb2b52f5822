use std::path::PathBuf;

use crate::emulator::matching::MatchPolicy;
use crate::emulator::server::{self, AppState, EmulatorConfig};
use crate::emulator::store::EmulatorStore;
use crate::error::{FreebeanError, Result};
use crate::settings::load_effective_settings;

const DEFAULT_TOKEN: &str = "emulator-token";

pub fn run(addr: &str, db: Option<String>, token: Option<String>, match_tolerance_days: i64) -> Result<()> {
    let settings = load_effective_settings()?;
    let db_path = db
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&settings.data_dir).join("emulator.db"));
    let store = EmulatorStore::open(&db_path)?.with_policy(MatchPolicy {
        date_tolerance_days: match_tolerance_days,
    });

    let access_token = token
        .or_else(|| settings.access_token.clone())
        .unwrap_or_else(|| DEFAULT_TOKEN.to_string());
    let config = EmulatorConfig {
        access_token,
        client_id: settings.client_id.clone(),
        client_secret: settings.client_secret.clone(),
    };

    println!("freee emulator on http://{addr} (store {})", db_path.display());
    let runtime = tokio::runtime::Runtime::new()?;
    runtime
        .block_on(server::serve(addr, AppState::new(store, config)))
        .map_err(|e| FreebeanError::Other(format!("{e:#}")))
}
