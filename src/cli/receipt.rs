use std::path::Path;

use colored::Colorize;

use crate::client::FreeeClient;
use crate::db::{is_document_attached, open_history, record_document_attachment, DocumentAttachment};
use crate::error::{FreebeanError, Result};
use crate::models::parse_date;
use crate::settings::{load_effective_settings, shellexpand_path};

pub fn run(
    file: &str,
    date: &str,
    description: Option<&str>,
    ref_number: Option<&str>,
    deal_id: Option<i64>,
) -> Result<()> {
    let issue_date = parse_date(date)?;
    let document_path = shellexpand_path(file);
    let path = Path::new(&document_path);
    if !path.is_file() {
        return Err(FreebeanError::NotFound(format!("receipt file {document_path}")));
    }

    let settings = load_effective_settings()?;
    let client = FreeeClient::from_settings(&settings)?;
    let conn = open_history(&settings.history_db_path())?;

    if is_document_attached(&conn, &document_path)? {
        return Err(FreebeanError::Other(format!("{document_path} is already attached")));
    }

    let receipt = client.upload_receipt(path, issue_date, description)?;
    record_document_attachment(
        &conn,
        &DocumentAttachment {
            transaction_date: issue_date.format("%Y-%m-%d").to_string(),
            ref_number: ref_number.map(str::to_string),
            deal_id,
            document_path: document_path.clone(),
        },
    )?;

    println!(
        "{} {} as receipt {} ({} bytes, sha256 {})",
        "Uploaded".green(),
        document_path,
        receipt.id,
        receipt.size,
        receipt.sha256
    );
    Ok(())
}
