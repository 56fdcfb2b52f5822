use chrono::NaiveDate;
use regex::Regex;

use crate::error::{FreebeanError, Result};
use crate::mapper::AccountMapper;
use crate::models::{parse_date, Deal, DealType, EntryType, Journal};

/// Amounts are right-aligned so that they end at this column.
pub const AMOUNT_COLUMN: usize = 60;

const INCOME_LABEL: &str = "収入";
const EXPENSE_LABEL: &str = "支出";
const JOURNAL_LABEL: &str = "振替伝票";

#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    pub account: String,
    pub amount: i64,
    pub currency: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerTransaction {
    pub date: NaiveDate,
    pub flag: char,
    pub payee: Option<String>,
    pub narration: String,
    pub tags: Vec<String>,
    pub postings: Vec<Posting>,
}

impl LedgerTransaction {
    pub fn total(&self) -> i64 {
        self.postings.iter().map(|p| p.amount).sum()
    }
}

/// A converted transaction plus anything the caller should warn about.
#[derive(Debug, Clone)]
pub struct Conversion {
    pub transaction: LedgerTransaction,
    pub warnings: Vec<String>,
}

pub struct Converter<'a> {
    mapper: &'a AccountMapper,
    currency: String,
    tag_invalid: Regex,
}

impl<'a> Converter<'a> {
    pub fn new(mapper: &'a AccountMapper, currency: &str) -> Result<Self> {
        Ok(Self {
            mapper,
            currency: currency.to_string(),
            tag_invalid: Regex::new(r"[^A-Za-z0-9\-_/.]+")
                .map_err(|e| FreebeanError::Other(e.to_string()))?,
        })
    }

    pub fn convert_deal(&self, deal: &Deal) -> Result<Conversion> {
        let date = parse_date(&deal.issue_date)?;
        let sign = deal.deal_type.sign();
        let mut warnings = Vec::new();
        let mut postings = Vec::new();

        let multi_line = deal.details.len() > 1;
        for detail in &deal.details {
            let comment = if multi_line { non_empty(&detail.description) } else { None };
            postings.push(self.posting(
                self.account_for(&detail.account_item_name, &mut warnings),
                detail.amount * sign,
                comment,
            ));
            if detail.vat > 0 {
                postings.push(self.posting(
                    self.tax_account_for(detail.tax_code, &mut warnings),
                    detail.vat * sign,
                    None,
                ));
            }
        }

        if deal.payments.is_empty() {
            postings.push(self.posting(
                self.mapper.default_bank_account().to_string(),
                deal.amount * -sign,
                None,
            ));
        } else {
            for payment in &deal.payments {
                postings.push(self.posting(
                    self.mapper.wallet_account(payment.wallet_type).to_string(),
                    payment.amount * -sign,
                    None,
                ));
            }
        }

        let narration = match deal.details.as_slice() {
            [only] if non_empty(&only.description).is_some() => {
                only.description.clone().unwrap_or_default()
            }
            details => {
                let label = match deal.deal_type {
                    DealType::Income => INCOME_LABEL,
                    DealType::Expense => EXPENSE_LABEL,
                };
                let names: Vec<&str> = details.iter().map(|d| d.account_item_name.as_str()).collect();
                format!("{label}: {}", names.join(", "))
            }
        };

        let tags = deal
            .ref_number
            .as_deref()
            .map(|r| self.tag_invalid.replace_all(r.trim(), "-").trim_matches('-').to_string())
            .filter(|t| !t.is_empty())
            .into_iter()
            .collect();

        Ok(Conversion {
            transaction: LedgerTransaction {
                date,
                flag: '*',
                payee: deal.partner_code.clone().filter(|p| !p.is_empty()),
                narration,
                tags,
                postings,
            },
            warnings,
        })
    }

    pub fn convert_journal(&self, journal: &Journal) -> Result<Conversion> {
        let date = parse_date(&journal.issue_date)?;
        let mut warnings = Vec::new();
        let mut postings = Vec::new();

        for detail in &journal.details {
            let sign = match detail.entry_type {
                EntryType::Debit => 1,
                EntryType::Credit => -1,
            };
            postings.push(self.posting(
                self.account_for(&detail.account_item_name, &mut warnings),
                detail.amount * sign,
                None,
            ));
            if detail.vat > 0 {
                postings.push(self.posting(
                    self.tax_account_for(detail.tax_code, &mut warnings),
                    detail.vat * sign,
                    None,
                ));
            }
        }

        let narration = journal
            .details
            .iter()
            .find_map(|d| non_empty(&d.description))
            .unwrap_or_else(|| JOURNAL_LABEL.to_string());

        Ok(Conversion {
            transaction: LedgerTransaction {
                date,
                flag: '*',
                payee: None,
                narration,
                tags: Vec::new(),
                postings,
            },
            warnings,
        })
    }

    fn posting(&self, account: String, amount: i64, comment: Option<String>) -> Posting {
        Posting {
            account,
            amount,
            currency: self.currency.clone(),
            comment,
        }
    }

    fn account_for(&self, name: &str, warnings: &mut Vec<String>) -> String {
        match self.mapper.resolve(name) {
            Some(account) => account.to_string(),
            None => {
                let fallback = self.mapper.fallback_account(name);
                warnings.push(format!("unmapped account item '{name}', using {fallback}"));
                fallback
            }
        }
    }

    fn tax_account_for(&self, tax_code: i64, warnings: &mut Vec<String>) -> String {
        match self.mapper.resolve_tax(tax_code) {
            Some(account) => account.to_string(),
            None => {
                let fallback = self.mapper.standard_tax_account().to_string();
                warnings.push(format!("unmapped tax code {tax_code}, using {fallback}"));
                fallback
            }
        }
    }
}

fn non_empty(text: &Option<String>) -> Option<String> {
    text.as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Ledger text
// ---------------------------------------------------------------------------

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

pub fn format_amount(amount: i64) -> String {
    if amount < 0 {
        format!("-{}", amount.unsigned_abs())
    } else {
        amount.to_string()
    }
}

pub fn format_posting(posting: &Posting) -> String {
    let amount = format_amount(posting.amount);
    let used = 2 + posting.account.chars().count() + amount.len();
    let pad = AMOUNT_COLUMN.saturating_sub(used).max(2);
    let mut line = format!(
        "  {}{}{} {}",
        posting.account,
        " ".repeat(pad),
        amount,
        posting.currency
    );
    if let Some(comment) = &posting.comment {
        line.push_str(" ; ");
        line.push_str(comment);
    }
    line
}

/// Render a transaction as a ledger block, one line per posting, each ending in a newline.
pub fn format_transaction(txn: &LedgerTransaction) -> String {
    let mut header = format!("{} {}", txn.date.format("%Y-%m-%d"), txn.flag);
    if let Some(payee) = &txn.payee {
        header.push(' ');
        header.push_str(&quote(payee));
    }
    header.push(' ');
    header.push_str(&quote(&txn.narration));
    for tag in &txn.tags {
        header.push_str(" #");
        header.push_str(tag);
    }

    let mut out = header;
    out.push('\n');
    for posting in &txn.postings {
        out.push_str(&format_posting(posting));
        out.push('\n');
    }
    out
}
