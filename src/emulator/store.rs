use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::info;

use super::matching::{self, row_to_wallet_txn, MatchPolicy, WALLET_TXN_COLUMNS};
use crate::error::{FreebeanError, Result};
use crate::models::{
    parse_date, AccountItem, Company, Deal, DealType, Detail, EntrySide, EntryType, Journal,
    JournalDetail, Payment, Receipt, WalletTxn, WalletTxnStatus, WalletType, Walletable,
};

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS companies (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    display_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS account_items (
    id INTEGER PRIMARY KEY,
    company_id INTEGER NOT NULL REFERENCES companies(id),
    name TEXT NOT NULL,
    account_category TEXT NOT NULL,
    default_tax_code INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS walletables (
    id INTEGER PRIMARY KEY,
    company_id INTEGER NOT NULL REFERENCES companies(id),
    name TEXT NOT NULL,
    type TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS deals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    company_id INTEGER NOT NULL,
    issue_date TEXT NOT NULL,
    body TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_deals_company_date ON deals(company_id, issue_date);

CREATE TABLE IF NOT EXISTS journals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    company_id INTEGER NOT NULL,
    issue_date TEXT NOT NULL,
    body TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_journals_company_date ON journals(company_id, issue_date);

CREATE TABLE IF NOT EXISTS wallet_txns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    company_id INTEGER NOT NULL,
    date TEXT NOT NULL,
    amount INTEGER NOT NULL,
    entry_side TEXT NOT NULL,
    walletable_type TEXT NOT NULL,
    walletable_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'unbooked',
    deal_id INTEGER,
    description TEXT
);

CREATE INDEX IF NOT EXISTS idx_wallet_txns_match ON wallet_txns(company_id, status, amount, date);

CREATE TABLE IF NOT EXISTS receipts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    company_id INTEGER NOT NULL,
    description TEXT,
    issue_date TEXT,
    file_name TEXT NOT NULL,
    content_type TEXT NOT NULL,
    size INTEGER NOT NULL,
    sha256 TEXT NOT NULL,
    data BLOB NOT NULL,
    created_at TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS sequences (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
";

pub const DEFAULT_COMPANY_ID: i64 = 1;

const SEED_ACCOUNT_ITEMS: &[(&str, &str, i64)] = &[
    ("現金", "assets", 0),
    ("普通預金", "assets", 0),
    ("売掛金", "assets", 0),
    ("買掛金", "liabilities", 0),
    ("未払金", "liabilities", 0),
    ("元入金", "equity", 0),
    ("売上高", "income", 129),
    ("雑収入", "income", 129),
    ("仕入高", "expenses", 136),
    ("消耗品費", "expenses", 136),
    ("通信費", "expenses", 136),
    ("旅費交通費", "expenses", 136),
    ("地代家賃", "expenses", 136),
    ("水道光熱費", "expenses", 136),
    ("支払手数料", "expenses", 136),
    ("会議費", "expenses", 136),
    ("新聞図書費", "expenses", 163),
];

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct NewDeal {
    pub company_id: i64,
    pub issue_date: String,
    #[serde(rename = "type")]
    pub deal_type: DealType,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub ref_number: Option<String>,
    #[serde(default)]
    pub partner_id: Option<i64>,
    #[serde(default)]
    pub partner_code: Option<String>,
    pub details: Vec<Detail>,
    #[serde(default)]
    pub payments: Vec<Payment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewJournal {
    pub company_id: i64,
    pub issue_date: String,
    pub details: Vec<JournalDetail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewWalletTxn {
    pub company_id: i64,
    pub date: String,
    pub amount: i64,
    pub entry_side: EntrySide,
    pub walletable_type: WalletType,
    pub walletable_id: i64,
    #[serde(default)]
    pub description: Option<String>,
}

/// Fields a PUT may change on a wallet txn.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalletTxnUpdate {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<WalletTxnStatus>,
}

#[derive(Debug, Clone)]
pub struct NewReceipt {
    pub company_id: i64,
    pub description: Option<String>,
    pub issue_date: Option<String>,
    pub file_name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// List filters shared by the collection endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub company_id: Option<i64>,
    #[serde(default, alias = "start_date")]
    pub issue_date_from: Option<String>,
    #[serde(default, alias = "end_date")]
    pub issue_date_to: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

pub const DEFAULT_LIMIT: u32 = 20;
pub const MAX_LIMIT: u32 = 100;

impl ListQuery {
    #[cfg(test)]
    pub fn for_company(company_id: i64) -> Self {
        Self {
            company_id: Some(company_id),
            ..Self::default()
        }
    }

    fn company(&self) -> Result<i64> {
        self.company_id
            .ok_or_else(|| FreebeanError::Invalid("company_id is required".to_string()))
    }

    fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    fn date_range(&self) -> Result<(Option<String>, Option<String>)> {
        let check = |raw: &Option<String>| -> Result<Option<String>> {
            match raw {
                Some(s) => Ok(Some(parse_date(s)?.format("%Y-%m-%d").to_string())),
                None => Ok(None),
            }
        };
        Ok((check(&self.issue_date_from)?, check(&self.issue_date_to)?))
    }
}

/// A created deal and whatever it was linked to.
#[derive(Debug, Clone)]
pub struct DealCreation {
    pub deal: Deal,
    pub linked_wallet_txns: Vec<i64>,
    pub unmatched_payments: usize,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// SQLite-backed state of the emulated API. Writes are serialized through one connection.
pub struct EmulatorStore {
    conn: Mutex<Connection>,
    policy: MatchPolicy,
}

impl EmulatorStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        seed(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            policy: MatchPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: MatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    // -- companies and masters ----------------------------------------------

    pub fn list_companies(&self) -> Result<Vec<Company>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, name, display_name FROM companies ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Company {
                id: row.get(0)?,
                name: row.get(1)?,
                display_name: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn get_company(&self, id: i64) -> Result<Company> {
        self.list_companies()?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| FreebeanError::NotFound(format!("company {id}")))
    }

    pub fn list_account_items(&self, company_id: i64) -> Result<Vec<AccountItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, company_id, name, account_category, default_tax_code
             FROM account_items WHERE company_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([company_id], |row| {
            Ok(AccountItem {
                id: row.get(0)?,
                company_id: row.get(1)?,
                name: row.get(2)?,
                account_category: row.get(3)?,
                default_tax_code: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn list_walletables(&self, company_id: i64) -> Result<Vec<Walletable>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, company_id, name, type FROM walletables WHERE company_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([company_id], |row| {
            let kind: String = row.get(3)?;
            Ok(Walletable {
                id: row.get(0)?,
                company_id: row.get(1)?,
                name: row.get(2)?,
                walletable_type: kind.parse().unwrap_or(WalletType::Other),
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // -- deals ----------------------------------------------------------------

    /// Store a deal and run matching inside the same write transaction.
    pub fn create_deal(&self, new: NewDeal) -> Result<DealCreation> {
        validate_deal(&new)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_company(&tx, new.company_id)?;

        tx.execute(
            "INSERT INTO deals (company_id, issue_date, body) VALUES (?1, ?2, '{}')",
            params![new.company_id, new.issue_date],
        )?;
        let id = tx.last_insert_rowid();
        let deal = build_deal(&tx, id, new)?;
        tx.execute(
            "UPDATE deals SET body = ?1 WHERE id = ?2",
            params![serde_json::to_string(&deal)?, id],
        )?;

        let outcome = matching::link_deal(&tx, &deal, self.policy)?;
        tx.commit()?;
        info!(
            deal_id = id,
            amount = deal.amount,
            linked = outcome.linked.len(),
            unmatched_payments = outcome.unmatched_payments,
            "created deal"
        );
        Ok(DealCreation {
            deal,
            linked_wallet_txns: outcome.linked,
            unmatched_payments: outcome.unmatched_payments,
        })
    }

    pub fn get_deal(&self, id: i64) -> Result<Deal> {
        let conn = self.conn.lock();
        load_body(&conn, "deals", id)
    }

    pub fn list_deals(&self, query: &ListQuery) -> Result<Vec<Deal>> {
        let conn = self.conn.lock();
        list_bodies(&conn, "deals", query)
    }

    /// Replace a deal's contents. Existing links are kept; matching does not re-run.
    pub fn update_deal(&self, id: i64, new: NewDeal) -> Result<Deal> {
        validate_deal(&new)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Deal = load_body(&tx, "deals", id)?;
        if existing.company_id != new.company_id {
            return Err(FreebeanError::Invalid("company_id cannot change".to_string()));
        }
        let deal = build_deal(&tx, id, new)?;
        tx.execute(
            "UPDATE deals SET issue_date = ?1, body = ?2 WHERE id = ?3",
            params![deal.issue_date, serde_json::to_string(&deal)?, id],
        )?;
        tx.commit()?;
        Ok(deal)
    }

    /// Delete a deal and release any feed lines linked to it.
    pub fn delete_deal(&self, id: i64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute("DELETE FROM deals WHERE id = ?1", [id])?;
        if removed == 0 {
            return Err(FreebeanError::NotFound(format!("deal {id}")));
        }
        let released = tx.execute(
            "UPDATE wallet_txns SET status = 'unbooked', deal_id = NULL WHERE deal_id = ?1",
            [id],
        )?;
        tx.commit()?;
        info!(deal_id = id, released, "deleted deal");
        Ok(())
    }

    // -- journals ---------------------------------------------------------------

    pub fn create_journal(&self, new: NewJournal) -> Result<Journal> {
        validate_journal(&new)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_company(&tx, new.company_id)?;
        tx.execute(
            "INSERT INTO journals (company_id, issue_date, body) VALUES (?1, ?2, '{}')",
            params![new.company_id, new.issue_date],
        )?;
        let id = tx.last_insert_rowid();
        let mut details = new.details;
        for detail in &mut details {
            detail.id = Some(next_sequence(&tx, "journal_detail")?);
        }
        let journal = Journal {
            id,
            company_id: new.company_id,
            issue_date: new.issue_date,
            details,
        };
        tx.execute(
            "UPDATE journals SET body = ?1 WHERE id = ?2",
            params![serde_json::to_string(&journal)?, id],
        )?;
        tx.commit()?;
        Ok(journal)
    }

    pub fn get_journal(&self, id: i64) -> Result<Journal> {
        let conn = self.conn.lock();
        load_body(&conn, "journals", id)
    }

    pub fn list_journals(&self, query: &ListQuery) -> Result<Vec<Journal>> {
        let conn = self.conn.lock();
        list_bodies(&conn, "journals", query)
    }

    // -- wallet txns ------------------------------------------------------------

    pub fn create_wallet_txn(&self, new: NewWalletTxn) -> Result<WalletTxn> {
        parse_date(&new.date)?;
        if new.amount <= 0 {
            return Err(FreebeanError::Invalid("amount must be positive".to_string()));
        }
        let conn = self.conn.lock();
        require_company(&conn, new.company_id)?;
        conn.execute(
            "INSERT INTO wallet_txns (company_id, date, amount, entry_side, walletable_type,
                                      walletable_id, status, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'unbooked', ?7)",
            params![
                new.company_id,
                new.date,
                new.amount,
                new.entry_side.as_str(),
                new.walletable_type.as_str(),
                new.walletable_id,
                new.description
            ],
        )?;
        get_wallet_txn(&conn, conn.last_insert_rowid())
    }

    pub fn get_wallet_txn(&self, id: i64) -> Result<WalletTxn> {
        let conn = self.conn.lock();
        get_wallet_txn(&conn, id)
    }

    pub fn list_wallet_txns(&self, query: &ListQuery) -> Result<Vec<WalletTxn>> {
        let company_id = query.company()?;
        let (from, to) = query.date_range()?;
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {WALLET_TXN_COLUMNS} FROM wallet_txns
             WHERE company_id = ?1 AND (?2 IS NULL OR date >= ?2) AND (?3 IS NULL OR date <= ?3)
             ORDER BY id LIMIT ?4 OFFSET ?5"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![company_id, from, to, query.limit(), query.offset.unwrap_or(0)],
            row_to_wallet_txn,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn update_wallet_txn(&self, id: i64, update: WalletTxnUpdate) -> Result<WalletTxn> {
        if let Some(date) = &update.date {
            parse_date(date)?;
        }
        let conn = self.conn.lock();
        let mut txn = get_wallet_txn(&conn, id)?;
        if let Some(date) = update.date {
            txn.date = date;
        }
        if let Some(amount) = update.amount {
            txn.amount = amount;
        }
        if update.description.is_some() {
            txn.description = update.description;
        }
        if let Some(status) = update.status {
            txn.status = status;
            if status == WalletTxnStatus::Unbooked {
                txn.deal_id = None;
            }
        }
        conn.execute(
            "UPDATE wallet_txns SET date = ?1, amount = ?2, description = ?3, status = ?4, deal_id = ?5
             WHERE id = ?6",
            params![txn.date, txn.amount, txn.description, txn.status.as_str(), txn.deal_id, id],
        )?;
        Ok(txn)
    }

    pub fn delete_wallet_txn(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        if conn.execute("DELETE FROM wallet_txns WHERE id = ?1", [id])? == 0 {
            return Err(FreebeanError::NotFound(format!("wallet txn {id}")));
        }
        Ok(())
    }

    // -- receipts ---------------------------------------------------------------

    pub fn create_receipt(&self, new: NewReceipt) -> Result<Receipt> {
        if new.data.is_empty() {
            return Err(FreebeanError::Invalid("receipt file is empty".to_string()));
        }
        if let Some(date) = &new.issue_date {
            parse_date(date)?;
        }
        let sha256 = hex::encode(Sha256::digest(&new.data));
        let conn = self.conn.lock();
        require_company(&conn, new.company_id)?;
        conn.execute(
            "INSERT INTO receipts (company_id, description, issue_date, file_name, content_type,
                                   size, sha256, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.company_id,
                new.description,
                new.issue_date,
                new.file_name,
                new.content_type,
                new.data.len() as i64,
                sha256,
                new.data
            ],
        )?;
        get_receipt(&conn, conn.last_insert_rowid())
    }

    pub fn get_receipt(&self, id: i64) -> Result<Receipt> {
        let conn = self.conn.lock();
        get_receipt(&conn, id)
    }

    pub fn list_receipts(&self, query: &ListQuery) -> Result<Vec<Receipt>> {
        let company_id = query.company()?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE company_id = ?1 ORDER BY id LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(
            params![company_id, query.limit(), query.offset.unwrap_or(0)],
            row_to_receipt,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn delete_receipt(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        if conn.execute("DELETE FROM receipts WHERE id = ?1", [id])? == 0 {
            return Err(FreebeanError::NotFound(format!("receipt {id}")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn seed(conn: &Connection) -> Result<()> {
    let companies: i64 = conn.query_row("SELECT COUNT(*) FROM companies", [], |row| row.get(0))?;
    if companies > 0 {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO companies (id, name, display_name) VALUES (?1, ?2, ?3)",
        params![DEFAULT_COMPANY_ID, "freebean-emulator", "Emulator Company"],
    )?;
    for (name, category, tax_code) in SEED_ACCOUNT_ITEMS {
        conn.execute(
            "INSERT INTO account_items (company_id, name, account_category, default_tax_code)
             VALUES (?1, ?2, ?3, ?4)",
            params![DEFAULT_COMPANY_ID, name, category, tax_code],
        )?;
    }
    for (name, kind) in [("普通預金口座", WalletType::BankAccount), ("法人カード", WalletType::CreditCard)] {
        conn.execute(
            "INSERT INTO walletables (company_id, name, type) VALUES (?1, ?2, ?3)",
            params![DEFAULT_COMPANY_ID, name, kind.as_str()],
        )?;
    }
    info!(company_id = DEFAULT_COMPANY_ID, "seeded emulator store");
    Ok(())
}

fn require_company(conn: &Connection, company_id: i64) -> Result<()> {
    let exists = conn
        .query_row("SELECT 1 FROM companies WHERE id = ?1", [company_id], |_| Ok(()))
        .optional()?;
    exists.ok_or_else(|| FreebeanError::Invalid(format!("unknown company_id {company_id}")))
}

fn next_sequence(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO sequences (name, value) VALUES (?1, 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1",
        [name],
    )?;
    Ok(conn.query_row("SELECT value FROM sequences WHERE name = ?1", [name], |row| row.get(0))?)
}

fn validate_deal(new: &NewDeal) -> Result<()> {
    parse_date(&new.issue_date)?;
    if let Some(due) = &new.due_date {
        parse_date(due)?;
    }
    if new.details.is_empty() {
        return Err(FreebeanError::Invalid("a deal needs at least one detail".to_string()));
    }
    if new.details.iter().any(|d| d.amount < 0 || d.vat < 0) {
        return Err(FreebeanError::Invalid("detail amounts must not be negative".to_string()));
    }
    for payment in &new.payments {
        parse_date(&payment.date)?;
    }
    Ok(())
}

fn validate_journal(new: &NewJournal) -> Result<()> {
    parse_date(&new.issue_date)?;
    if new.details.is_empty() {
        return Err(FreebeanError::Invalid("a journal needs at least one detail".to_string()));
    }
    let side_total = |side: EntryType| -> i64 {
        new.details
            .iter()
            .filter(|d| d.entry_type == side)
            .map(|d| d.amount + d.vat)
            .sum()
    };
    let (debit, credit) = (side_total(EntryType::Debit), side_total(EntryType::Credit));
    if debit != credit {
        return Err(FreebeanError::Invalid(format!(
            "journal does not balance: debit {debit}, credit {credit}"
        )));
    }
    Ok(())
}

/// Assign fresh detail/payment ids and compute the total.
fn build_deal(conn: &Connection, id: i64, new: NewDeal) -> Result<Deal> {
    let mut details = new.details;
    for detail in &mut details {
        detail.id = Some(next_sequence(conn, "deal_detail")?);
    }
    let mut payments = new.payments;
    for payment in &mut payments {
        payment.id = Some(next_sequence(conn, "payment")?);
    }
    let amount = details.iter().map(|d| d.amount + d.vat).sum();
    let paid: i64 = payments.iter().map(|p| p.amount).sum();
    Ok(Deal {
        id,
        company_id: new.company_id,
        issue_date: new.issue_date,
        deal_type: new.deal_type,
        amount,
        due_amount: new.due_date.as_ref().map(|_| amount - paid),
        due_date: new.due_date,
        ref_number: new.ref_number,
        partner_id: new.partner_id,
        partner_code: new.partner_code,
        details,
        payments,
    })
}

fn load_body<T: serde::de::DeserializeOwned>(conn: &Connection, table: &str, id: i64) -> Result<T> {
    let body: Option<String> = conn
        .query_row(&format!("SELECT body FROM {table} WHERE id = ?1"), [id], |row| row.get(0))
        .optional()?;
    let body = body.ok_or_else(|| FreebeanError::NotFound(format!("{} {id}", table.trim_end_matches('s'))))?;
    Ok(serde_json::from_str(&body)?)
}

fn list_bodies<T: serde::de::DeserializeOwned>(conn: &Connection, table: &str, query: &ListQuery) -> Result<Vec<T>> {
    let company_id = query.company()?;
    let (from, to) = query.date_range()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT body FROM {table}
         WHERE company_id = ?1 AND (?2 IS NULL OR issue_date >= ?2) AND (?3 IS NULL OR issue_date <= ?3)
         ORDER BY id LIMIT ?4 OFFSET ?5"
    ))?;
    let bodies = stmt
        .query_map(
            params![company_id, from, to, query.limit(), query.offset.unwrap_or(0)],
            |row| row.get::<_, String>(0),
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    bodies
        .iter()
        .map(|body| serde_json::from_str(body).map_err(FreebeanError::from))
        .collect()
}

fn get_wallet_txn(conn: &Connection, id: i64) -> Result<WalletTxn> {
    conn.query_row(
        &format!("SELECT {WALLET_TXN_COLUMNS} FROM wallet_txns WHERE id = ?1"),
        [id],
        row_to_wallet_txn,
    )
    .optional()?
    .ok_or_else(|| FreebeanError::NotFound(format!("wallet txn {id}")))
}

const RECEIPT_COLUMNS: &str =
    "id, company_id, description, issue_date, file_name, content_type, size, sha256, created_at";

fn row_to_receipt(row: &rusqlite::Row) -> rusqlite::Result<Receipt> {
    Ok(Receipt {
        id: row.get(0)?,
        company_id: row.get(1)?,
        description: row.get(2)?,
        issue_date: row.get(3)?,
        file_name: row.get(4)?,
        content_type: row.get(5)?,
        size: row.get(6)?,
        sha256: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn get_receipt(conn: &Connection, id: i64) -> Result<Receipt> {
    conn.query_row(
        &format!("SELECT {RECEIPT_COLUMNS} FROM receipts WHERE id = ?1"),
        [id],
        row_to_receipt,
    )
    .optional()?
    .ok_or_else(|| FreebeanError::NotFound(format!("receipt {id}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn detail(name: &str, amount: i64, vat: i64) -> Detail {
        Detail {
            id: None,
            account_item_name: name.to_string(),
            tax_code: if vat > 0 { 136 } else { 0 },
            amount,
            vat,
            description: None,
        }
    }

    fn new_deal(issue_date: &str, details: Vec<Detail>) -> NewDeal {
        NewDeal {
            company_id: DEFAULT_COMPANY_ID,
            issue_date: issue_date.to_string(),
            deal_type: DealType::Expense,
            due_date: None,
            ref_number: None,
            partner_id: None,
            partner_code: None,
            details,
            payments: Vec::new(),
        }
    }

    fn feed_line(store: &EmulatorStore, date: &str, amount: i64) -> WalletTxn {
        store
            .create_wallet_txn(NewWalletTxn {
                company_id: DEFAULT_COMPANY_ID,
                date: date.to_string(),
                amount,
                entry_side: EntrySide::Expense,
                walletable_type: WalletType::BankAccount,
                walletable_id: 1,
                description: None,
            })
            .unwrap()
    }

    #[test]
    fn test_seeded_masters() {
        let store = EmulatorStore::open_in_memory().unwrap();
        assert_eq!(store.list_companies().unwrap().len(), 1);
        let items = store.list_account_items(DEFAULT_COMPANY_ID).unwrap();
        assert!(items.iter().any(|i| i.name == "消耗品費"));
        let wallets = store.list_walletables(DEFAULT_COMPANY_ID).unwrap();
        assert_eq!(wallets.len(), 2);
        assert!(matches!(store.get_company(42), Err(FreebeanError::NotFound(_))));
    }

    #[test]
    fn test_reopen_does_not_reseed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emulator.db");
        drop(EmulatorStore::open(&path).unwrap());
        let store = EmulatorStore::open(&path).unwrap();
        assert_eq!(store.list_walletables(DEFAULT_COMPANY_ID).unwrap().len(), 2);
    }

    #[test]
    fn test_create_deal_assigns_ids_and_total() {
        let store = EmulatorStore::open_in_memory().unwrap();
        let created = store
            .create_deal(new_deal("2024-03-05", vec![detail("消耗品費", 1000, 100), detail("通信費", 500, 50)]))
            .unwrap();
        let deal = created.deal;
        assert_eq!(deal.amount, 1650);
        let ids: Vec<_> = deal.details.iter().map(|d| d.id.unwrap()).collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert_eq!(store.get_deal(deal.id).unwrap(), deal);
    }

    #[test]
    fn test_create_deal_rejects_bad_input() {
        let store = EmulatorStore::open_in_memory().unwrap();
        assert!(matches!(
            store.create_deal(new_deal("2024-03-05", vec![])),
            Err(FreebeanError::Invalid(_))
        ));
        assert!(matches!(
            store.create_deal(new_deal("2024/03/05", vec![detail("消耗品費", 1, 0)])),
            Err(FreebeanError::InvalidDate(_))
        ));
        let mut other = new_deal("2024-03-05", vec![detail("消耗品費", 1, 0)]);
        other.company_id = 99;
        assert!(matches!(store.create_deal(other), Err(FreebeanError::Invalid(_))));
    }

    #[test]
    fn test_create_deal_links_matching_feed_line() {
        let store = EmulatorStore::open_in_memory().unwrap();
        let line = feed_line(&store, "2024-03-05", 1100);
        let created = store
            .create_deal(new_deal("2024-03-05", vec![detail("消耗品費", 1000, 100)]))
            .unwrap();
        assert_eq!(created.linked_wallet_txns, vec![line.id]);
        let line = store.get_wallet_txn(line.id).unwrap();
        assert_eq!(line.status, WalletTxnStatus::Settled);
        assert_eq!(line.deal_id, Some(created.deal.id));
    }

    #[test]
    fn test_concurrent_creations_never_double_link() {
        let store = Arc::new(EmulatorStore::open_in_memory().unwrap());
        let line = feed_line(&store, "2024-03-05", 1100);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .create_deal(new_deal("2024-03-05", vec![detail("消耗品費", 1000, 100)]))
                        .unwrap()
                        .linked_wallet_txns
                        .len()
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1);
        assert_eq!(store.get_wallet_txn(line.id).unwrap().status, WalletTxnStatus::Settled);
    }

    #[test]
    fn test_delete_deal_releases_feed_line() {
        let store = EmulatorStore::open_in_memory().unwrap();
        let line = feed_line(&store, "2024-03-05", 1100);
        let created = store
            .create_deal(new_deal("2024-03-05", vec![detail("消耗品費", 1000, 100)]))
            .unwrap();
        store.delete_deal(created.deal.id).unwrap();

        let line = store.get_wallet_txn(line.id).unwrap();
        assert_eq!(line.status, WalletTxnStatus::Unbooked);
        assert_eq!(line.deal_id, None);
        assert!(matches!(store.get_deal(created.deal.id), Err(FreebeanError::NotFound(_))));
        assert!(matches!(store.delete_deal(created.deal.id), Err(FreebeanError::NotFound(_))));
    }

    #[test]
    fn test_update_deal_keeps_id() {
        let store = EmulatorStore::open_in_memory().unwrap();
        let created = store
            .create_deal(new_deal("2024-03-05", vec![detail("消耗品費", 1000, 0)]))
            .unwrap();
        let updated = store
            .update_deal(created.deal.id, new_deal("2024-03-06", vec![detail("通信費", 2000, 0)]))
            .unwrap();
        assert_eq!(updated.id, created.deal.id);
        assert_eq!(updated.amount, 2000);
        let listed = store
            .list_deals(&ListQuery {
                issue_date_from: Some("2024-03-06".into()),
                ..ListQuery::for_company(DEFAULT_COMPANY_ID)
            })
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn test_list_deals_filters_and_paginates() {
        let store = EmulatorStore::open_in_memory().unwrap();
        for day in 1..=25 {
            store
                .create_deal(new_deal(&format!("2024-01-{day:02}"), vec![detail("消耗品費", 100, 0)]))
                .unwrap();
        }
        let query = ListQuery::for_company(DEFAULT_COMPANY_ID);
        assert_eq!(store.list_deals(&query).unwrap().len(), DEFAULT_LIMIT as usize);

        let page = store
            .list_deals(&ListQuery {
                limit: Some(10),
                offset: Some(20),
                ..query.clone()
            })
            .unwrap();
        assert_eq!(page.len(), 5);

        let ranged = store
            .list_deals(&ListQuery {
                issue_date_from: Some("2024-01-10".into()),
                issue_date_to: Some("2024-01-12".into()),
                ..query
            })
            .unwrap();
        assert_eq!(ranged.len(), 3);

        assert!(matches!(store.list_deals(&ListQuery::default()), Err(FreebeanError::Invalid(_))));
    }

    #[test]
    fn test_journal_must_balance() {
        let store = EmulatorStore::open_in_memory().unwrap();
        let line = |entry_type, amount| JournalDetail {
            id: None,
            entry_type,
            account_item_name: "普通預金".into(),
            tax_code: 0,
            amount,
            vat: 0,
            description: None,
        };
        let unbalanced = NewJournal {
            company_id: DEFAULT_COMPANY_ID,
            issue_date: "2024-03-31".into(),
            details: vec![line(EntryType::Debit, 100), line(EntryType::Credit, 90)],
        };
        assert!(matches!(store.create_journal(unbalanced), Err(FreebeanError::Invalid(_))));

        let journal = store
            .create_journal(NewJournal {
                company_id: DEFAULT_COMPANY_ID,
                issue_date: "2024-03-31".into(),
                details: vec![line(EntryType::Debit, 100), line(EntryType::Credit, 100)],
            })
            .unwrap();
        assert_eq!(store.get_journal(journal.id).unwrap().amount(), 100);
        assert_eq!(store.list_journals(&ListQuery::for_company(DEFAULT_COMPANY_ID)).unwrap().len(), 1);
    }

    #[test]
    fn test_wallet_txn_update_and_delete() {
        let store = EmulatorStore::open_in_memory().unwrap();
        let line = feed_line(&store, "2024-03-05", 1100);
        let updated = store
            .update_wallet_txn(
                line.id,
                WalletTxnUpdate {
                    status: Some(WalletTxnStatus::Passed),
                    ..WalletTxnUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.status, WalletTxnStatus::Passed);
        assert_eq!(store.list_wallet_txns(&ListQuery::for_company(DEFAULT_COMPANY_ID)).unwrap().len(), 1);
        store.delete_wallet_txn(line.id).unwrap();
        assert!(matches!(store.get_wallet_txn(line.id), Err(FreebeanError::NotFound(_))));
    }

    #[test]
    fn test_receipt_checksum() {
        let store = EmulatorStore::open_in_memory().unwrap();
        let receipt = store
            .create_receipt(NewReceipt {
                company_id: DEFAULT_COMPANY_ID,
                description: Some("lunch".into()),
                issue_date: Some("2024-03-05".into()),
                file_name: "r.pdf".into(),
                content_type: "application/pdf".into(),
                data: b"abc".to_vec(),
            })
            .unwrap();
        assert_eq!(receipt.size, 3);
        assert_eq!(
            receipt.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(store.list_receipts(&ListQuery::for_company(DEFAULT_COMPANY_ID)).unwrap().len(), 1);
        store.delete_receipt(receipt.id).unwrap();
        assert!(matches!(store.get_receipt(receipt.id), Err(FreebeanError::NotFound(_))));
    }
}
