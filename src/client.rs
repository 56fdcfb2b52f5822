use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use base64::Engine;
use chrono::NaiveDate;
use reqwest::blocking::{multipart, Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{FreebeanError, Result};
use crate::models::{Deal, Journal, Receipt};
use crate::settings::Settings;

pub const PAGE_SIZE: u32 = 100;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for rate limiting (429) and server errors (5xx).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// Request pages at offsets 0, 100, 200, ... until a page comes back short. A failed page
/// aborts the whole fetch with the offset attached.
pub fn paginate<T>(
    resource: &'static str,
    mut fetch_page: impl FnMut(u32) -> Result<Vec<T>>,
) -> Result<Vec<T>> {
    let mut all = Vec::new();
    let mut offset = 0u32;
    loop {
        let page = fetch_page(offset).map_err(|e| FreebeanError::Page {
            resource,
            offset,
            source: Box::new(e),
        })?;
        let count = page.len();
        all.extend(page);
        if count < PAGE_SIZE as usize {
            break;
        }
        offset += PAGE_SIZE;
    }
    Ok(all)
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DealsResponse {
    #[serde(default)]
    deals: Vec<Deal>,
}

#[derive(Debug, Deserialize)]
struct JournalsResponse {
    #[serde(default)]
    journals: Vec<Journal>,
}

#[derive(Debug, Deserialize)]
struct ReceiptResponse {
    receipt: Receipt,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

fn api_error(resp: Response) -> FreebeanError {
    let status = resp.status().as_u16();
    let body: Option<ErrorBody> = resp.json().ok();
    let message = body
        .and_then(|b| match (b.error, b.error_description) {
            (Some(e), Some(d)) => Some(format!("{e}: {d}")),
            (e, d) => d.or(e),
        })
        .unwrap_or_else(|| format!("HTTP {status}"));
    FreebeanError::Api { status, message }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct FreeeClient {
    http: Client,
    base_url: String,
    token_url: String,
    company_id: i64,
    access_token: String,
    retry: RetryPolicy,
}

impl FreeeClient {
    pub fn new(base_url: &str, company_id: i64, access_token: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        let base_url = base_url.trim_end_matches('/').to_string();
        Ok(Self {
            http,
            token_url: format!("{base_url}/oauth/token"),
            base_url,
            company_id,
            access_token: access_token.to_string(),
            retry: RetryPolicy::default(),
        })
    }

    /// Build a client from validated settings. Exchanges client credentials for a token when
    /// no access token is configured.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        settings.validate()?;
        let company_id = settings
            .company_id
            .ok_or_else(|| FreebeanError::Config("company_id is not set".to_string()))?;
        let mut client = Self::new(
            &settings.api_base_url,
            company_id,
            settings.access_token.as_deref().unwrap_or_default(),
            Duration::from_secs(settings.request_timeout_secs),
        )?
        .with_token_url(&settings.token_url)
        .with_retry(RetryPolicy {
            max_retries: settings.max_retries,
            ..RetryPolicy::default()
        });

        if client.access_token.is_empty() {
            if let (Some(id), Some(secret)) = (&settings.client_id, &settings.client_secret) {
                client.get_access_token(id, secret)?;
            }
        }
        Ok(client)
    }

    pub fn with_token_url(mut self, token_url: &str) -> Self {
        self.token_url = token_url.to_string();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[cfg(test)]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    fn send(&self, build: impl Fn(&Client) -> RequestBuilder) -> Result<Response> {
        let mut attempt = 0u32;
        loop {
            match build(&self.http).send() {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if is_retryable(resp.status()) && attempt < self.retry.max_retries => {
                    let delay = retry_after(&resp)
                        .unwrap_or_else(|| self.retry.delay_for(attempt))
                        .min(self.retry.max_delay);
                    warn!(status = resp.status().as_u16(), attempt, ?delay, "retrying freee request");
                    sleep(delay);
                }
                Ok(resp) => return Err(api_error(resp)),
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(error = %e, attempt, ?delay, "retrying freee request");
                    sleep(delay);
                }
                Err(e) => return Err(e.into()),
            }
            attempt += 1;
        }
    }

    /// Client-credentials exchange. Replaces the stored token on success.
    pub fn get_access_token(&mut self, client_id: &str, client_secret: &str) -> Result<TokenResponse> {
        let basic = base64::engine::general_purpose::STANDARD
            .encode(format!("{client_id}:{client_secret}"));
        let url = self.token_url.clone();
        let resp = self.send(|http| {
            http.post(&url)
                .header("Authorization", format!("Basic {basic}"))
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body("grant_type=client_credentials")
        })?;
        let token: TokenResponse = resp.json()?;
        info!(expires_in = ?token.expires_in, "obtained freee access token");
        self.access_token = token.access_token.clone();
        Ok(token)
    }

    fn list_query(&self, from: NaiveDate, to: NaiveDate, offset: u32) -> Vec<(&'static str, String)> {
        vec![
            ("company_id", self.company_id.to_string()),
            ("issue_date_from", from.format("%Y-%m-%d").to_string()),
            ("issue_date_to", to.format("%Y-%m-%d").to_string()),
            ("limit", PAGE_SIZE.to_string()),
            ("offset", offset.to_string()),
        ]
    }

    pub fn fetch_deals_page(&self, from: NaiveDate, to: NaiveDate, offset: u32) -> Result<Vec<Deal>> {
        let url = format!("{}/api/1/deals", self.base_url);
        let query = self.list_query(from, to, offset);
        let resp = self.send(|http| http.get(&url).bearer_auth(&self.access_token).query(&query))?;
        let body: DealsResponse = resp.json()?;
        debug!(offset, count = body.deals.len(), "fetched deals page");
        Ok(body.deals)
    }

    pub fn fetch_journals_page(&self, from: NaiveDate, to: NaiveDate, offset: u32) -> Result<Vec<Journal>> {
        let url = format!("{}/api/1/journals", self.base_url);
        let query = self.list_query(from, to, offset);
        let resp = self.send(|http| http.get(&url).bearer_auth(&self.access_token).query(&query))?;
        let body: JournalsResponse = resp.json()?;
        debug!(offset, count = body.journals.len(), "fetched journals page");
        Ok(body.journals)
    }

    pub fn fetch_all_deals(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Deal>> {
        paginate("deals", |offset| self.fetch_deals_page(from, to, offset))
    }

    pub fn fetch_all_journals(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Journal>> {
        paginate("journals", |offset| self.fetch_journals_page(from, to, offset))
    }

    /// Upload a receipt file as multipart form data.
    pub fn upload_receipt(
        &self,
        path: &Path,
        issue_date: NaiveDate,
        description: Option<&str>,
    ) -> Result<Receipt> {
        let bytes = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "receipt".to_string());
        let url = format!("{}/api/1/receipts", self.base_url);
        let resp = self.send(|http| {
            let mut form = multipart::Form::new()
                .text("company_id", self.company_id.to_string())
                .text("issue_date", issue_date.format("%Y-%m-%d").to_string())
                .part(
                    "receipt",
                    multipart::Part::bytes(bytes.clone()).file_name(file_name.clone()),
                );
            if let Some(text) = description {
                form = form.text("description", text.to_string());
            }
            http.post(&url).bearer_auth(&self.access_token).multipart(form)
        })?;
        let body: ReceiptResponse = resp.json()?;
        Ok(body.receipt)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    use super::*;
    use crate::test_support::spawn_router;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_paginate_stops_on_short_page() {
        let mut offsets = Vec::new();
        let items = paginate("deals", |offset| {
            offsets.push(offset);
            let n = if offset < 200 { 100 } else { 37 };
            Ok((0..n).map(|i| offset + i).collect())
        })
        .unwrap();
        assert_eq!(offsets, vec![0, 100, 200]);
        assert_eq!(items.len(), 237);
        assert_eq!(items[236], 236);
    }

    #[test]
    fn test_paginate_stops_on_empty_page() {
        let mut calls = 0;
        let items: Vec<u32> = paginate("deals", |offset| {
            calls += 1;
            Ok(if offset == 0 { (0..100).collect() } else { Vec::new() })
        })
        .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(items.len(), 100);
    }

    #[test]
    fn test_paginate_reports_failing_offset() {
        let err = paginate::<u32>("journals", |offset| {
            if offset == 100 {
                Err(FreebeanError::Api { status: 500, message: "boom".into() })
            } else {
                Ok((0..100).collect())
            }
        })
        .unwrap_err();
        match err {
            FreebeanError::Page { resource, offset, .. } => {
                assert_eq!(resource, "journals");
                assert_eq!(offset, 100);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_delay_for_is_bounded() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(10), Duration::from_secs(8));
        assert_eq!(policy.delay_for(40), Duration::from_secs(8));
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_retries_server_errors_then_succeeds() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/api/1/deals",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        (AxumStatus::SERVICE_UNAVAILABLE, Json(serde_json::json!({"error": "busy"})))
                    } else {
                        (AxumStatus::OK, Json(serde_json::json!({"deals": []})))
                    }
                }
            }),
        );
        let base = spawn_router(router);
        let client = FreeeClient::new(&base, 1, "t", Duration::from_secs(5))
            .unwrap()
            .with_retry(fast_retry(3));
        let deals = client.fetch_all_deals(date("2024-01-01"), date("2024-01-31")).unwrap();
        assert!(deals.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_client_error_fails_fast_with_message() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/api/1/journals",
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    (
                        AxumStatus::BAD_REQUEST,
                        Json(serde_json::json!({"error": "invalid_request", "error_description": "bad date"})),
                    )
                }
            }),
        );
        let base = spawn_router(router);
        let client = FreeeClient::new(&base, 1, "t", Duration::from_secs(5))
            .unwrap()
            .with_retry(fast_retry(3));
        let err = client
            .fetch_all_journals(date("2024-01-01"), date("2024-01-31"))
            .unwrap_err();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let text = err.to_string();
        assert!(text.contains("offset 0"), "{text}");
        assert!(text.contains("bad date"), "{text}");
    }

    #[test]
    fn test_get_access_token_replaces_token() {
        let router = Router::new().route(
            "/oauth/token",
            post(|| async {
                Json(serde_json::json!({"access_token": "fresh", "token_type": "bearer", "expires_in": 21600}))
            }),
        );
        let base = spawn_router(router);
        let mut client = FreeeClient::new(&base, 1, "", Duration::from_secs(5)).unwrap();
        let token = client.get_access_token("id", "secret").unwrap();
        assert_eq!(token.expires_in, Some(21600));
        assert_eq!(client.access_token(), "fresh");
    }
}
