use assert_cmd::Command;
use predicates::prelude::*;

const FREEE_VARS: &[&str] = &[
    "FREEE_ACCESS_TOKEN",
    "FREEE_COMPANY_ID",
    "FREEE_CLIENT_ID",
    "FREEE_CLIENT_SECRET",
    "FREEE_API_BASE_URL",
    "FREEBEAN_LEDGER_DIR",
];

fn freebean(home: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("freebean").unwrap();
    cmd.env("HOME", home.path());
    for var in FREEE_VARS {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn sync_without_company_fails_before_any_io() {
    let home = tempfile::tempdir().unwrap();
    freebean(&home)
        .args(["sync", "--from", "2024-01-01", "--to", "2024-01-31"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("company_id"));
    assert!(!home.path().join("Documents").exists());
}

#[test]
fn sync_requires_date_range() {
    let home = tempfile::tempdir().unwrap();
    freebean(&home)
        .args(["sync", "--to", "2024-01-31"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--from"));
}

#[test]
fn sync_rejects_malformed_date() {
    let home = tempfile::tempdir().unwrap();
    freebean(&home)
        .args(["sync", "--from", "2024/01/01", "--to", "2024-01-31"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid date"));
}

#[test]
fn stats_on_empty_store() {
    let home = tempfile::tempdir().unwrap();
    freebean(&home)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("No sync history yet"));
}

#[test]
fn init_then_stats_shows_empty_history() {
    let home = tempfile::tempdir().unwrap();
    let data = home.path().join("books");
    freebean(&home)
        .args(["init", "--data-dir", data.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized freebean"));
    assert!(data.join("freebean.db").exists());
    assert!(data.join("account_mapping.json").exists());
    assert!(home.path().join(".config/freebean/settings.json").exists());

    freebean(&home)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("Deals synced"))
        .stdout(predicate::str::contains("Nothing synced yet"));
}

#[test]
fn sync_with_env_credentials_passes_validation() {
    let home = tempfile::tempdir().unwrap();
    // Nothing listens on port 9, so the run fails at the network step instead of configuration.
    freebean(&home)
        .env("FREEE_COMPANY_ID", "1")
        .env("FREEE_ACCESS_TOKEN", "token")
        .env("FREEE_API_BASE_URL", "http://127.0.0.1:9")
        .args(["--log-level", "off", "sync", "--from", "2024-01-01", "--to", "2024-01-31"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("fetching deals failed at offset 0"))
        .stderr(predicate::str::contains("Configuration error").not());
}

#[test]
fn emulator_rejects_out_of_range_match_tolerance() {
    let home = tempfile::tempdir().unwrap();
    freebean(&home)
        .args(["emulator", "--match-tolerance-days", "100000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--match-tolerance-days"));
    freebean(&home)
        .args(["emulator", "--match-tolerance-days", "-1"])
        .assert()
        .failure();
}
