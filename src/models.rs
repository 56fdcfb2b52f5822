use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{FreebeanError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealType {
    Income,
    Expense,
}

impl DealType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Income => "income",
            Self::Expense => "expense",
        }
    }

    /// Income deals post to the credit side, expense deals to the debit side.
    pub fn sign(&self) -> i64 {
        match self {
            Self::Income => -1,
            Self::Expense => 1,
        }
    }

    pub fn entry_side(&self) -> EntrySide {
        match self {
            Self::Income => EntrySide::Income,
            Self::Expense => EntrySide::Expense,
        }
    }
}

impl FromStr for DealType {
    type Err = FreebeanError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "income" => Ok(Self::Income),
            "expense" => Ok(Self::Expense),
            other => Err(FreebeanError::Other(format!("unknown deal type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySide {
    Income,
    Expense,
}

impl EntrySide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Income => "income",
            Self::Expense => "expense",
        }
    }
}

impl FromStr for EntrySide {
    type Err = FreebeanError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "income" => Ok(Self::Income),
            "expense" => Ok(Self::Expense),
            other => Err(FreebeanError::Other(format!("unknown entry side: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Debit,
    Credit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletType {
    BankAccount,
    CreditCard,
    Wallet,
    #[serde(other)]
    Other,
}

impl WalletType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BankAccount => "bank_account",
            Self::CreditCard => "credit_card",
            Self::Wallet => "wallet",
            Self::Other => "other",
        }
    }
}

impl FromStr for WalletType {
    type Err = FreebeanError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "bank_account" => Self::BankAccount,
            "credit_card" => Self::CreditCard,
            "wallet" => Self::Wallet,
            _ => Self::Other,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletTxnStatus {
    Settled,
    Unbooked,
    Passed,
}

impl WalletTxnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Settled => "settled",
            Self::Unbooked => "unbooked",
            Self::Passed => "passed",
        }
    }
}

impl FromStr for WalletTxnStatus {
    type Err = FreebeanError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "settled" => Ok(Self::Settled),
            "unbooked" => Ok(Self::Unbooked),
            "passed" => Ok(Self::Passed),
            other => Err(FreebeanError::Other(format!("unknown wallet txn status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncType {
    Deal,
    Journal,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deal => "deal",
            Self::Journal => "journal",
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Remote transactions
// ---------------------------------------------------------------------------

/// One line item of a deal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub account_item_name: String,
    #[serde(default)]
    pub tax_code: i64,
    pub amount: i64,
    #[serde(default)]
    pub vat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub date: String,
    pub amount: i64,
    #[serde(rename = "from_walletable_type")]
    pub wallet_type: WalletType,
    #[serde(rename = "from_walletable_id")]
    pub wallet_id: i64,
}

/// A booked income or expense transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: i64,
    pub company_id: i64,
    pub issue_date: String,
    #[serde(rename = "type")]
    pub deal_type: DealType,
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_code: Option<String>,
    #[serde(default)]
    pub details: Vec<Detail>,
    #[serde(default)]
    pub payments: Vec<Payment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub entry_type: EntryType,
    pub account_item_name: String,
    #[serde(default)]
    pub tax_code: i64,
    pub amount: i64,
    #[serde(default)]
    pub vat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A manual double-entry journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journal {
    pub id: i64,
    pub company_id: i64,
    pub issue_date: String,
    #[serde(default)]
    pub details: Vec<JournalDetail>,
}

impl Journal {
    /// Total of the debit side.
    pub fn amount(&self) -> i64 {
        self.details
            .iter()
            .filter(|d| d.entry_type == EntryType::Debit)
            .map(|d| d.amount + d.vat)
            .sum()
    }
}

/// A bank or credit card feed line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTxn {
    pub id: i64,
    pub company_id: i64,
    pub date: String,
    pub amount: i64,
    pub entry_side: EntrySide,
    pub walletable_type: WalletType,
    pub walletable_id: i64,
    pub status: WalletTxnStatus,
    #[serde(default)]
    pub deal_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountItem {
    pub id: i64,
    pub company_id: i64,
    pub name: String,
    pub account_category: String,
    pub default_tax_code: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Walletable {
    pub id: i64,
    pub company_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub walletable_type: WalletType,
}

/// Metadata of an uploaded receipt file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub id: i64,
    pub company_id: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub issue_date: Option<String>,
    pub file_name: String,
    pub content_type: String,
    pub size: i64,
    pub sha256: String,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| FreebeanError::InvalidDate(raw.to_string()))
}

/// Month partition key, rendered as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn from_issue_date(raw: &str) -> Result<Self> {
        parse_date(raw).map(Self::of)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}
