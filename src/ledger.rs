use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use crate::error::Result;
use crate::models::YearMonth;

/// Month-partitioned ledger files under a root directory: `<root>/<YYYY>/<YYYY-MM>.beancount`.
#[derive(Debug, Clone)]
pub struct LedgerRepo {
    root: PathBuf,
}

impl LedgerRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn month_path(&self, month: YearMonth) -> PathBuf {
        self.root
            .join(format!("{:04}", month.year))
            .join(format!("{month}.beancount"))
    }

    fn header(month: YearMonth) -> String {
        format!(
            ";; freee transactions for {month}\n\
             ;; Appended by freebean sync. Entries below are generated, edit the source in freee.\n\n"
        )
    }

    /// Create the month file with its header if it does not exist yet.
    pub fn ensure_month_file(&self, month: YearMonth) -> Result<PathBuf> {
        let path = self.month_path(month);
        if path.exists() {
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => file.write_all(Self::header(month).as_bytes())?,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        Ok(path)
    }

    /// Append a formatted transaction followed by a blank line. The month file's directory
    /// must already exist.
    pub fn append_transaction(&self, month: YearMonth, text: &str) -> Result<PathBuf> {
        let path = self.month_path(month);
        let mut file = OpenOptions::new().append(true).create(true).open(&path)?;
        file.write_all(text.as_bytes())?;
        if !text.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.write_all(b"\n")?;
        Ok(path)
    }
}
