use thiserror::Error;

use crate::models::SyncType;

#[derive(Error, Debug)]
pub enum FreebeanError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("freee API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("fetching {resource} failed at offset {offset}: {source}")]
    Page {
        resource: &'static str,
        offset: u32,
        #[source]
        source: Box<FreebeanError>,
    },

    #[error("{sync_type} {freee_id} is already recorded in sync history")]
    DuplicateSync { sync_type: SyncType, freee_id: i64 },

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, FreebeanError>;
