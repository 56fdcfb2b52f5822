use chrono::Duration;
use rusqlite::{params, Connection, Row};
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{parse_date, Deal, EntrySide, Payment, WalletTxn, WalletTxnStatus};

/// Widest match window accepted from configuration.
pub const MAX_TOLERANCE_DAYS: i64 = 366;

/// How far apart a deal's issue date and a feed line's date may be and still match.
/// Zero means the dates must be equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchPolicy {
    pub date_tolerance_days: i64,
}

/// Wallet txns linked while creating one deal.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LinkOutcome {
    pub linked: Vec<i64>,
    pub unmatched_payments: usize,
}

pub(crate) const WALLET_TXN_COLUMNS: &str = "id, company_id, date, amount, entry_side, \
     walletable_type, walletable_id, status, deal_id, description";

pub(crate) fn row_to_wallet_txn(row: &Row) -> rusqlite::Result<WalletTxn> {
    let parse_err = |idx: usize, e: crate::error::FreebeanError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    };
    let entry_side: String = row.get(4)?;
    let walletable_type: String = row.get(5)?;
    let status: String = row.get(7)?;
    Ok(WalletTxn {
        id: row.get(0)?,
        company_id: row.get(1)?,
        date: row.get(2)?,
        amount: row.get(3)?,
        entry_side: entry_side.parse().map_err(|e| parse_err(4, e))?,
        walletable_type: walletable_type.parse().map_err(|e| parse_err(5, e))?,
        walletable_id: row.get(6)?,
        status: status.parse().map_err(|e| parse_err(7, e))?,
        deal_id: row.get(8)?,
        description: row.get(9)?,
    })
}

/// Unbooked feed lines that could belong to a deal, best candidate first.
/// Ordered by distance from `issue_date`, then by id.
pub fn find_candidates(
    conn: &Connection,
    company_id: i64,
    entry_side: EntrySide,
    issue_date: &str,
    amount: i64,
    policy: MatchPolicy,
) -> Result<Vec<WalletTxn>> {
    let date = parse_date(issue_date)?;
    let window = Duration::days(policy.date_tolerance_days.clamp(0, MAX_TOLERANCE_DAYS));
    let earliest = date.checked_sub_signed(window).unwrap_or(date).format("%Y-%m-%d").to_string();
    let latest = date.checked_add_signed(window).unwrap_or(date).format("%Y-%m-%d").to_string();

    let sql = format!(
        "SELECT {WALLET_TXN_COLUMNS} FROM wallet_txns
         WHERE company_id = ?1 AND status = 'unbooked' AND deal_id IS NULL
           AND entry_side = ?2 AND amount = ?3 AND date BETWEEN ?4 AND ?5
         ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![company_id, entry_side.as_str(), amount, earliest, latest],
        row_to_wallet_txn,
    )?;
    let mut candidates = rows.collect::<std::result::Result<Vec<_>, _>>()?;

    candidates.sort_by_key(|txn| {
        let distance = parse_date(&txn.date)
            .map(|d| (d - date).num_days().abs())
            .unwrap_or(i64::MAX);
        (distance, txn.id)
    });
    Ok(candidates)
}

/// The unbooked feed line an explicit payment refers to: same wallet, date and amount.
pub fn find_payment_match(conn: &Connection, company_id: i64, payment: &Payment) -> Result<Option<WalletTxn>> {
    let sql = format!(
        "SELECT {WALLET_TXN_COLUMNS} FROM wallet_txns
         WHERE company_id = ?1 AND walletable_type = ?2 AND walletable_id = ?3
           AND date = ?4 AND amount = ?5 AND status = 'unbooked' AND deal_id IS NULL
         ORDER BY id LIMIT 1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map(
        params![
            company_id,
            payment.wallet_type.as_str(),
            payment.wallet_id,
            payment.date,
            payment.amount
        ],
        row_to_wallet_txn,
    )?;
    Ok(rows.next().transpose()?)
}

/// Compare-and-swap: settles the feed line only if it is still unbooked and unlinked.
/// Returns false when something else got there first.
pub fn try_link(conn: &Connection, wallet_txn_id: i64, deal_id: i64) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE wallet_txns SET status = ?1, deal_id = ?2
         WHERE id = ?3 AND status = 'unbooked' AND deal_id IS NULL",
        params![WalletTxnStatus::Settled.as_str(), deal_id, wallet_txn_id],
    )?;
    Ok(changed == 1)
}

/// Link a freshly created deal to feed lines.
///
/// With explicit payments each payment is resolved exactly, and a payment with no matching
/// line is counted in `unmatched_payments`. Without payments the closest candidate is linked;
/// when several lines are equally close the lowest id wins and the rest stay unbooked.
pub fn link_deal(conn: &Connection, deal: &Deal, policy: MatchPolicy) -> Result<LinkOutcome> {
    let mut outcome = LinkOutcome::default();

    if deal.payments.is_empty() {
        let side = deal.deal_type.entry_side();
        let candidates = find_candidates(conn, deal.company_id, side, &deal.issue_date, deal.amount, policy)?;
        if candidates.len() > 1 {
            debug!(deal_id = deal.id, candidates = candidates.len(), "several feed lines match, taking the first");
        }
        for candidate in candidates {
            if try_link(conn, candidate.id, deal.id)? {
                outcome.linked.push(candidate.id);
                break;
            }
        }
        return Ok(outcome);
    }

    for payment in &deal.payments {
        let linked = match find_payment_match(conn, deal.company_id, payment)? {
            Some(txn) => try_link(conn, txn.id, deal.id)?.then_some(txn.id),
            None => None,
        };
        match linked {
            Some(id) => outcome.linked.push(id),
            None => {
                warn!(
                    deal_id = deal.id,
                    wallet_type = payment.wallet_type.as_str(),
                    wallet_id = payment.wallet_id,
                    date = %payment.date,
                    amount = payment.amount,
                    "no wallet txn for payment"
                );
                outcome.unmatched_payments += 1;
            }
        }
    }
    Ok(outcome)
}
