use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Write;
use std::path::PathBuf;

use chrono::NaiveDate;
use rusqlite::Connection;
use tracing::{debug, error, info, info_span, warn};

use crate::client::FreeeClient;
use crate::converter::{format_transaction, Conversion, Converter};
use crate::db::{self, SyncRecord};
use crate::error::{FreebeanError, Result};
use crate::ledger::LedgerRepo;
use crate::models::{Deal, Journal, SyncType, YearMonth};

/// Where remote transactions come from. Implemented by the HTTP client.
pub trait TransactionSource {
    fn fetch_all_deals(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Deal>>;
    fn fetch_all_journals(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Journal>>;
}

impl TransactionSource for FreeeClient {
    fn fetch_all_deals(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Deal>> {
        FreeeClient::fetch_all_deals(self, from, to)
    }

    fn fetch_all_journals(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Journal>> {
        FreeeClient::fetch_all_journals(self, from, to)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub deals_fetched: usize,
    pub journals_fetched: usize,
    pub already_synced: usize,
    pub duplicates: usize,
    pub written: usize,
    pub previewed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub files: BTreeSet<PathBuf>,
}

enum SyncItem {
    Deal(Deal),
    Journal(Journal),
}

impl SyncItem {
    fn sync_type(&self) -> SyncType {
        match self {
            Self::Deal(_) => SyncType::Deal,
            Self::Journal(_) => SyncType::Journal,
        }
    }

    fn freee_id(&self) -> i64 {
        match self {
            Self::Deal(d) => d.id,
            Self::Journal(j) => j.id,
        }
    }

    fn issue_date(&self) -> &str {
        match self {
            Self::Deal(d) => &d.issue_date,
            Self::Journal(j) => &j.issue_date,
        }
    }

    fn amount(&self) -> i64 {
        match self {
            Self::Deal(d) => d.amount,
            Self::Journal(j) => j.amount(),
        }
    }
}

/// Drives one sync: fetch, filter already-synced ids, group by month, then write or preview.
pub struct Syncer<'a, S: TransactionSource> {
    source: &'a S,
    conn: &'a Connection,
    ledger: &'a LedgerRepo,
    converter: Converter<'a>,
}

impl<'a, S: TransactionSource> Syncer<'a, S> {
    pub fn new(source: &'a S, conn: &'a Connection, ledger: &'a LedgerRepo, converter: Converter<'a>) -> Self {
        Self {
            source,
            conn,
            ledger,
            converter,
        }
    }

    /// Run a sync. In dry-run mode nothing is written to the ledger or the history store;
    /// every candidate is rendered to `preview` instead.
    pub fn run(&self, opts: &SyncOptions, preview: &mut dyn Write) -> Result<SyncReport> {
        let span = info_span!("sync", from = %opts.from, to = %opts.to, dry_run = opts.dry_run);
        let _guard = span.enter();
        let mut report = SyncReport::default();

        let deals = self.source.fetch_all_deals(opts.from, opts.to)?;
        let journals = self.source.fetch_all_journals(opts.from, opts.to)?;
        report.deals_fetched = deals.len();
        report.journals_fetched = journals.len();
        info!(deals = deals.len(), journals = journals.len(), "fetched remote transactions");

        let synced_deals = db::get_synced_ids(self.conn, SyncType::Deal)?;
        let synced_journals = db::get_synced_ids(self.conn, SyncType::Journal)?;
        let mut queued: HashSet<(SyncType, i64)> = HashSet::new();
        let mut candidates = Vec::new();
        for item in deals
            .into_iter()
            .map(SyncItem::Deal)
            .chain(journals.into_iter().map(SyncItem::Journal))
        {
            let synced = match &item {
                SyncItem::Deal(d) => synced_deals.contains(&d.id),
                SyncItem::Journal(j) => synced_journals.contains(&j.id),
            };
            if synced {
                report.already_synced += 1;
            } else if !queued.insert((item.sync_type(), item.freee_id())) {
                // offset paging can return a row twice when the remote list shifts between pages
                warn!(sync_type = %item.sync_type(), freee_id = item.freee_id(), "fetched twice, keeping the first copy");
                report.duplicates += 1;
            } else {
                candidates.push(item);
            }
        }

        let months = self.group_by_month(candidates, &mut report);

        for (month, items) in &months {
            if opts.dry_run {
                self.preview_month(*month, items, preview, &mut report)?;
            } else {
                self.write_month(*month, items, &mut report);
            }
        }

        if !opts.dry_run {
            db::set_metadata(self.conn, "last_sync_range", &format!("{}..{}", opts.from, opts.to))?;
        }

        info!(
            written = report.written,
            previewed = report.previewed,
            skipped = report.already_synced,
            failed = report.failed,
            "sync finished"
        );
        Ok(report)
    }

    fn group_by_month(
        &self,
        items: Vec<SyncItem>,
        report: &mut SyncReport,
    ) -> BTreeMap<YearMonth, Vec<SyncItem>> {
        let mut months: BTreeMap<YearMonth, Vec<SyncItem>> = BTreeMap::new();
        for item in items {
            match YearMonth::from_issue_date(item.issue_date()) {
                Ok(month) => months.entry(month).or_default().push(item),
                Err(e) => {
                    error!(sync_type = %item.sync_type(), freee_id = item.freee_id(), error = %e, "skipping item");
                    report.failed += 1;
                }
            }
        }
        for items in months.values_mut() {
            items.sort_by(|a, b| {
                a.issue_date()
                    .cmp(b.issue_date())
                    .then(a.sync_type().as_str().cmp(b.sync_type().as_str()))
                    .then(a.freee_id().cmp(&b.freee_id()))
            });
        }
        months
    }

    fn convert(&self, item: &SyncItem, report: &mut SyncReport) -> Result<Conversion> {
        let conversion = match item {
            SyncItem::Deal(deal) => self.converter.convert_deal(deal)?,
            SyncItem::Journal(journal) => self.converter.convert_journal(journal)?,
        };
        for warning in &conversion.warnings {
            warn!(sync_type = %item.sync_type(), freee_id = item.freee_id(), "{warning}");
        }
        report.warnings += conversion.warnings.len();
        let imbalance = conversion.transaction.total();
        if imbalance != 0 {
            debug!(sync_type = %item.sync_type(), freee_id = item.freee_id(), imbalance, "postings do not sum to zero");
        }
        Ok(conversion)
    }

    fn preview_month(
        &self,
        month: YearMonth,
        items: &[SyncItem],
        preview: &mut dyn Write,
        report: &mut SyncReport,
    ) -> Result<()> {
        writeln!(preview, ";; ---- {month} -> {}", self.ledger.month_path(month).display())?;
        for item in items {
            match self.convert(item, report) {
                Ok(conversion) => {
                    writeln!(preview, "{}", format_transaction(&conversion.transaction))?;
                    report.previewed += 1;
                }
                Err(e) => {
                    error!(sync_type = %item.sync_type(), freee_id = item.freee_id(), error = %e, "conversion failed");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    fn write_month(&self, month: YearMonth, items: &[SyncItem], report: &mut SyncReport) {
        let path = match self.ledger.ensure_month_file(month) {
            Ok(path) => path,
            Err(e) => {
                error!(%month, error = %e, "cannot prepare month file, skipping month");
                report.failed += items.len();
                return;
            }
        };

        for item in items {
            match self.write_item(month, item, report) {
                Ok(()) => {
                    report.written += 1;
                    report.files.insert(path.clone());
                }
                Err(e @ FreebeanError::DuplicateSync { .. }) => {
                    warn!(error = %e, "history already had this item");
                    report.failed += 1;
                }
                Err(e) => {
                    error!(sync_type = %item.sync_type(), freee_id = item.freee_id(), error = %e, "skipping item");
                    report.failed += 1;
                }
            }
        }
    }

    /// History is recorded before the append inside one transaction, so an item is either
    /// both appended and recorded or neither.
    fn write_item(&self, month: YearMonth, item: &SyncItem, report: &mut SyncReport) -> Result<()> {
        let conversion = self.convert(item, report)?;
        let text = format_transaction(&conversion.transaction);
        let tx = self.conn.unchecked_transaction()?;
        db::record_sync(
            &tx,
            &SyncRecord {
                sync_type: item.sync_type(),
                freee_id: item.freee_id(),
                issue_date: item.issue_date().to_string(),
                amount: item.amount(),
                beancount_file: self.ledger.month_path(month).display().to_string(),
            },
        )?;
        self.ledger.append_transaction(month, &text)?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::db::{get_connection, get_stats, init_db};
    use crate::mapper::AccountMapper;
    use crate::models::{DealType, Detail, EntryType, JournalDetail};

    struct FakeSource {
        deals: Vec<Deal>,
        journals: Vec<Journal>,
        fail: bool,
        calls: Cell<usize>,
    }

    impl FakeSource {
        fn new(deals: Vec<Deal>, journals: Vec<Journal>) -> Self {
            Self { deals, journals, fail: false, calls: Cell::new(0) }
        }
    }

    impl TransactionSource for FakeSource {
        fn fetch_all_deals(&self, _from: NaiveDate, _to: NaiveDate) -> Result<Vec<Deal>> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return Err(FreebeanError::Api { status: 401, message: "expired".into() });
            }
            Ok(self.deals.clone())
        }

        fn fetch_all_journals(&self, _from: NaiveDate, _to: NaiveDate) -> Result<Vec<Journal>> {
            Ok(self.journals.clone())
        }
    }

    fn deal(id: i64, issue_date: &str, amount: i64) -> Deal {
        Deal {
            id,
            company_id: 1,
            issue_date: issue_date.to_string(),
            deal_type: DealType::Expense,
            amount,
            due_date: None,
            due_amount: None,
            ref_number: None,
            partner_id: None,
            partner_code: None,
            details: vec![Detail {
                id: None,
                account_item_name: "消耗品費".to_string(),
                tax_code: 0,
                amount,
                vat: 0,
                description: Some(format!("item {id}")),
            }],
            payments: Vec::new(),
        }
    }

    fn journal(id: i64, issue_date: &str) -> Journal {
        let line = |entry_type, name: &str| JournalDetail {
            id: None,
            entry_type,
            account_item_name: name.to_string(),
            tax_code: 0,
            amount: 50000,
            vat: 0,
            description: None,
        };
        Journal {
            id,
            company_id: 1,
            issue_date: issue_date.to_string(),
            details: vec![line(EntryType::Debit, "普通預金"), line(EntryType::Credit, "元入金")],
        }
    }

    fn setup() -> (tempfile::TempDir, Connection, LedgerRepo, AccountMapper) {
        let dir = tempfile::tempdir().unwrap();
        let conn = get_connection(&dir.path().join("history.db")).unwrap();
        init_db(&conn).unwrap();
        let ledger = LedgerRepo::new(dir.path().join("ledger"));
        (dir, conn, ledger, AccountMapper::builtin().unwrap())
    }

    fn opts(dry_run: bool) -> SyncOptions {
        SyncOptions {
            from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
            dry_run,
        }
    }

    fn run_sync(
        source: &FakeSource,
        conn: &Connection,
        ledger: &LedgerRepo,
        mapper: &AccountMapper,
        dry_run: bool,
    ) -> (Result<SyncReport>, String) {
        let converter = Converter::new(mapper, "JPY").unwrap();
        let syncer = Syncer::new(source, conn, ledger, converter);
        let mut preview = Vec::new();
        let result = syncer.run(&opts(dry_run), &mut preview);
        (result, String::from_utf8(preview).unwrap())
    }

    fn snapshot(dir: &Path) -> Vec<(PathBuf, String)> {
        fn walk(dir: &Path, out: &mut Vec<(PathBuf, String)>) {
            let Ok(entries) = std::fs::read_dir(dir) else { return };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, out);
                } else {
                    out.push((path.clone(), std::fs::read_to_string(&path).unwrap_or_default()));
                }
            }
        }
        let mut out = Vec::new();
        walk(dir, &mut out);
        out.sort();
        out
    }

    #[test]
    fn test_same_month_grouped_into_one_file() {
        let (_dir, conn, ledger, mapper) = setup();
        let source = FakeSource::new(
            vec![deal(2, "2024-03-28", 700), deal(1, "2024-03-05", 300), deal(3, "2024-04-01", 10)],
            vec![],
        );
        let (result, _) = run_sync(&source, &conn, &ledger, &mapper, false);
        let report = result.unwrap();
        assert_eq!(report.written, 3);
        assert_eq!(report.files.len(), 2);

        let march = std::fs::read_to_string(ledger.month_path(YearMonth { year: 2024, month: 3 })).unwrap();
        let first = march.find("item 1").unwrap();
        let second = march.find("item 2").unwrap();
        assert!(first < second, "entries should be ordered by issue date");
        assert!(!march.contains("item 3"));
    }

    #[test]
    fn test_second_run_is_idempotent() {
        let (dir, conn, ledger, mapper) = setup();
        let source = FakeSource::new(vec![deal(1, "2024-03-05", 300)], vec![journal(9, "2024-03-31")]);

        let (first, _) = run_sync(&source, &conn, &ledger, &mapper, false);
        assert_eq!(first.unwrap().written, 2);
        let before = snapshot(&dir.path().join("ledger"));

        let (second, _) = run_sync(&source, &conn, &ledger, &mapper, false);
        let second = second.unwrap();
        assert_eq!(second.written, 0);
        assert_eq!(second.already_synced, 2);
        assert_eq!(snapshot(&dir.path().join("ledger")), before);

        let stats = get_stats(&conn).unwrap();
        assert_eq!(stats.total_deals, 1);
        assert_eq!(stats.total_journals, 1);
    }

    #[test]
    fn test_dry_run_leaves_everything_untouched() {
        let (dir, conn, ledger, mapper) = setup();
        let source = FakeSource::new(vec![deal(1, "2024-03-05", 300)], vec![journal(9, "2024-03-31")]);

        let (result, preview) = run_sync(&source, &conn, &ledger, &mapper, true);
        let report = result.unwrap();
        assert_eq!(report.previewed, 2);
        assert_eq!(report.written, 0);
        assert!(preview.contains("2024-03-05 * \"item 1\""));
        assert!(preview.contains("Equity:Capital"));

        assert!(snapshot(&dir.path().join("ledger")).is_empty());
        assert!(db::get_synced_ids(&conn, SyncType::Deal).unwrap().is_empty());
        assert!(db::get_metadata(&conn, "last_sync_range").is_none());
    }

    #[test]
    fn test_malformed_date_skips_only_that_item() {
        let (_dir, conn, ledger, mapper) = setup();
        let source = FakeSource::new(vec![deal(1, "2024-3", 300), deal(2, "2024-03-05", 400)], vec![]);
        let (result, _) = run_sync(&source, &conn, &ledger, &mapper, false);
        let report = result.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.written, 1);
        let ids = db::get_synced_ids(&conn, SyncType::Deal).unwrap();
        assert!(ids.contains(&2) && !ids.contains(&1));
    }

    #[test]
    fn test_unwritable_month_does_not_stop_other_months() {
        let (dir, conn, ledger, mapper) = setup();
        let root = dir.path().join("ledger");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("2024"), "not a directory").unwrap();
        let source = FakeSource::new(vec![deal(1, "2023-12-30", 300), deal(2, "2024-01-05", 400)], vec![]);
        let (result, _) = run_sync(&source, &conn, &ledger, &mapper, false);
        let report = result.unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.failed, 1);
        assert!(db::get_synced_ids(&conn, SyncType::Deal).unwrap().contains(&1));
    }

    #[test]
    fn test_fetch_error_aborts_run() {
        let (dir, conn, ledger, mapper) = setup();
        let mut source = FakeSource::new(vec![deal(1, "2024-03-05", 300)], vec![]);
        source.fail = true;
        let (result, _) = run_sync(&source, &conn, &ledger, &mapper, false);
        assert!(matches!(result, Err(FreebeanError::Api { status: 401, .. })));
        assert_eq!(source.calls.get(), 1);
        assert!(snapshot(&dir.path().join("ledger")).is_empty());
    }

    #[test]
    fn test_unmapped_accounts_counted_as_warnings() {
        let (_dir, conn, ledger, mapper) = setup();
        let mut d = deal(1, "2024-05-01", 100);
        d.details[0].account_item_name = "未知の科目".into();
        let source = FakeSource::new(vec![d], vec![]);
        let (result, _) = run_sync(&source, &conn, &ledger, &mapper, false);
        let report = result.unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.warnings, 1);
        let text = std::fs::read_to_string(ledger.month_path(YearMonth { year: 2024, month: 5 })).unwrap();
        assert!(text.contains("Expenses:Unmapped:未知の科目"));
    }

    #[test]
    fn test_item_fetched_twice_is_written_once() {
        let (_dir, conn, ledger, mapper) = setup();
        let source = FakeSource::new(vec![deal(5, "2024-06-10", 900), deal(5, "2024-06-10", 900)], vec![]);
        let (result, _) = run_sync(&source, &conn, &ledger, &mapper, false);
        let report = result.unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.failed, 0);

        let text = std::fs::read_to_string(ledger.month_path(YearMonth { year: 2024, month: 6 })).unwrap();
        assert_eq!(text.matches("\"item 5\"").count(), 1);
        assert_eq!(get_stats(&conn).unwrap().total_deals, 1);
    }

    #[test]
    fn test_end_to_end_against_emulator() {
        use crate::emulator::server::{router, AppState, EmulatorConfig};
        use crate::emulator::store::{EmulatorStore, NewDeal};

        let store = EmulatorStore::open_in_memory().unwrap();
        for day in 1..=28 {
            for n in 0..5 {
                store
                    .create_deal(NewDeal {
                        company_id: 1,
                        issue_date: format!("2024-02-{day:02}"),
                        deal_type: DealType::Expense,
                        due_date: None,
                        ref_number: Some(format!("R{day}-{n}")),
                        partner_id: None,
                        partner_code: None,
                        details: vec![Detail {
                            id: None,
                            account_item_name: "通信費".into(),
                            tax_code: 136,
                            amount: 1000,
                            vat: 100,
                            description: None,
                        }],
                        payments: Vec::new(),
                    })
                    .unwrap();
            }
        }
        let base = crate::test_support::spawn_router(router(AppState::new(
            store,
            EmulatorConfig::with_token("emulator-token"),
        )));

        let client = FreeeClient::new(&base, 1, "emulator-token", Duration::from_secs(10)).unwrap();
        let (_dir, conn, ledger, mapper) = setup();
        let converter = Converter::new(&mapper, "JPY").unwrap();
        let syncer = Syncer::new(&client, &conn, &ledger, converter);
        let mut preview = Vec::new();

        let report = syncer.run(&opts(false), &mut preview).unwrap();
        assert_eq!(report.deals_fetched, 140);
        assert_eq!(report.written, 140);
        assert_eq!(report.files.len(), 1);

        let again = syncer.run(&opts(false), &mut preview).unwrap();
        assert_eq!(again.written, 0);
        assert_eq!(again.already_synced, 140);

        let text = std::fs::read_to_string(ledger.month_path(YearMonth { year: 2024, month: 2 })).unwrap();
        assert_eq!(text.matches("Liabilities:ConsumptionTax:Standard").count(), 140);
        assert_eq!(text.matches("\n2024-02-").count(), 140);
    }
}
