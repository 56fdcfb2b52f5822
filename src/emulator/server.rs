use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::{FormRejection, JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Multipart, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::store::{EmulatorStore, ListQuery, NewDeal, NewJournal, NewReceipt, NewWalletTxn, WalletTxnUpdate};
use crate::error::{self, FreebeanError};

/// Credentials the emulator accepts.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    pub access_token: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl EmulatorConfig {
    pub fn with_token(token: &str) -> Self {
        Self {
            access_token: token.to_string(),
            client_id: None,
            client_secret: None,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<EmulatorStore>,
    pub config: Arc<EmulatorConfig>,
}

impl AppState {
    pub fn new(store: EmulatorStore, config: EmulatorConfig) -> Self {
        Self {
            store: Arc::new(store),
            config: Arc::new(config),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error body in the `{error, error_description}` shape the real API uses.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    description: String,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, description: impl Into<String>) -> Self {
        Self {
            status,
            error,
            description: description.into(),
        }
    }

    fn unauthorized(description: &str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", description)
    }
}

impl From<FreebeanError> for ApiError {
    fn from(e: FreebeanError) -> Self {
        match &e {
            FreebeanError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "not_found", e.to_string()),
            FreebeanError::Invalid(_) | FreebeanError::InvalidDate(_) | FreebeanError::Json(_) => {
                Self::new(StatusCode::BAD_REQUEST, "bad_request", e.to_string())
            }
            _ => {
                warn!(error = %e, "emulator request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_server_error", e.to_string())
            }
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", e.body_text())
    }
}

macro_rules! rejection_to_api_error {
    ($($rejection:ty),+) => {
        $(impl From<$rejection> for ApiError {
            fn from(rejection: $rejection) -> Self {
                let status = rejection.status();
                let error = if status == StatusCode::UNSUPPORTED_MEDIA_TYPE {
                    "unsupported_media_type"
                } else {
                    "bad_request"
                };
                Self::new(status, error, rejection.body_text())
            }
        })+
    };
}

rejection_to_api_error!(JsonRejection, PathRejection, QueryRejection, FormRejection, MultipartRejection);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.error, "error_description": self.description }));
        (self.status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// Extractors whose rejections come back as `ApiError` bodies instead of axum's plain text.

#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
struct ApiJson<T>(T);

#[derive(FromRequest)]
#[from_request(via(Form), rejection(ApiError))]
struct ApiForm<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(Path), rejection(ApiError))]
struct ApiPath<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(Query), rejection(ApiError))]
struct ApiQuery<T>(T);

/// Run a store call on the blocking pool. SQLite calls block on the store mutex and disk.
async fn with_store<T, F>(state: &AppState, f: F) -> ApiResult<T>
where
    F: FnOnce(&EmulatorStore) -> error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(&state.store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_server_error", e.to_string()))?
        .map_err(ApiError::from)
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

async fn require_bearer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match token {
        Some(token) if token == state.config.access_token => next.run(request).await,
        Some(_) => ApiError::unauthorized("invalid access token").into_response(),
        None => ApiError::unauthorized("missing bearer token").into_response(),
    }
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();
    let response = next.run(request).await;
    info!(
        method = %method,
        uri = %uri,
        status = %response.status(),
        latency_ms = %start.elapsed().as_millis(),
        "emulator request"
    );
    response
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/companies", get(list_companies))
        .route("/companies/:id", get(get_company))
        .route("/account_items", get(list_account_items))
        .route("/walletables", get(list_walletables))
        .route("/deals", get(list_deals).post(create_deal))
        .route("/deals/:id", get(get_deal).put(update_deal).delete(delete_deal))
        .route("/journals", get(list_journals).post(create_journal))
        .route("/journals/:id", get(get_journal))
        .route("/wallet_txns", get(list_wallet_txns).post(create_wallet_txn))
        .route(
            "/wallet_txns/:id",
            get(get_wallet_txn).put(update_wallet_txn).delete(delete_wallet_txn),
        )
        .route("/receipts", get(list_receipts).post(create_receipt))
        .route("/receipts/:id", get(get_receipt).delete(delete_receipt))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/health", get(health))
        .route("/oauth/token", post(issue_token))
        .nest("/api/1", api)
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

/// Bind `addr` and serve until the process is stopped.
pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %listener.local_addr()?, "freee emulator listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    grant_type: String,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let encoded = headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (id, secret) = text.split_once(':')?;
    Some((id.to_string(), secret.to_string()))
}


async fn issue_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiForm(req): ApiForm<TokenRequest>,
) -> ApiResult<Json<Value>> {
    if req.grant_type != "client_credentials" {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "unsupported_grant_type",
            format!("grant_type {} is not supported", req.grant_type),
        ));
    }
    let (id, secret) = match basic_credentials(&headers) {
        Some(pair) => (Some(pair.0), Some(pair.1)),
        None => (req.client_id, req.client_secret),
    };
    let (Some(id), Some(secret)) = (id, secret) else {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "invalid_client", "client credentials missing"));
    };
    let config = &state.config;
    let id_ok = config.client_id.as_deref().map_or(true, |want| want == id);
    let secret_ok = config.client_secret.as_deref().map_or(true, |want| want == secret);
    if !id_ok || !secret_ok {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "invalid_client", "client authentication failed"));
    }
    Ok(Json(json!({
        "access_token": config.access_token,
        "token_type": "bearer",
        "expires_in": 21600,
    })))
}

#[derive(Debug, Deserialize)]
struct CompanyQuery {
    company_id: Option<i64>,
}

impl CompanyQuery {
    fn required(&self) -> ApiResult<i64> {
        self.company_id
            .ok_or_else(|| FreebeanError::Invalid("company_id is required".to_string()).into())
    }
}

async fn list_companies(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let companies = with_store(&state, |store| store.list_companies()).await?;
    Ok(Json(json!({ "companies": companies })))
}

async fn get_company(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> ApiResult<Json<Value>> {
    let company = with_store(&state, move |store| store.get_company(id)).await?;
    Ok(Json(json!({ "company": company })))
}

async fn list_account_items(
    State(state): State<AppState>,
    ApiQuery(q): ApiQuery<CompanyQuery>,
) -> ApiResult<Json<Value>> {
    let company_id = q.required()?;
    let items = with_store(&state, move |store| store.list_account_items(company_id)).await?;
    Ok(Json(json!({ "account_items": items })))
}

async fn list_walletables(
    State(state): State<AppState>,
    ApiQuery(q): ApiQuery<CompanyQuery>,
) -> ApiResult<Json<Value>> {
    let company_id = q.required()?;
    let walletables = with_store(&state, move |store| store.list_walletables(company_id)).await?;
    Ok(Json(json!({ "walletables": walletables })))
}

// -- deals --------------------------------------------------------------------

async fn list_deals(State(state): State<AppState>, ApiQuery(q): ApiQuery<ListQuery>) -> ApiResult<Json<Value>> {
    let deals = with_store(&state, move |store| store.list_deals(&q)).await?;
    Ok(Json(json!({ "deals": deals })))
}

async fn create_deal(
    State(state): State<AppState>,
    ApiJson(new): ApiJson<NewDeal>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let created = with_store(&state, move |store| store.create_deal(new)).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "deal": created.deal,
            "linked_wallet_txn_ids": created.linked_wallet_txns,
            "unmatched_payments": created.unmatched_payments,
        })),
    ))
}

async fn get_deal(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> ApiResult<Json<Value>> {
    let deal = with_store(&state, move |store| store.get_deal(id)).await?;
    Ok(Json(json!({ "deal": deal })))
}

async fn update_deal(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(new): ApiJson<NewDeal>,
) -> ApiResult<Json<Value>> {
    let deal = with_store(&state, move |store| store.update_deal(id, new)).await?;
    Ok(Json(json!({ "deal": deal })))
}

async fn delete_deal(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> ApiResult<StatusCode> {
    with_store(&state, move |store| store.delete_deal(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- journals -------------------------------------------------------------------

async fn list_journals(
    State(state): State<AppState>,
    ApiQuery(q): ApiQuery<ListQuery>,
) -> ApiResult<Json<Value>> {
    let journals = with_store(&state, move |store| store.list_journals(&q)).await?;
    Ok(Json(json!({ "journals": journals })))
}

async fn create_journal(
    State(state): State<AppState>,
    ApiJson(new): ApiJson<NewJournal>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let journal = with_store(&state, move |store| store.create_journal(new)).await?;
    Ok((StatusCode::CREATED, Json(json!({ "journal": journal }))))
}

async fn get_journal(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> ApiResult<Json<Value>> {
    let journal = with_store(&state, move |store| store.get_journal(id)).await?;
    Ok(Json(json!({ "journal": journal })))
}

// -- wallet txns ------------------------------------------------------------------

async fn list_wallet_txns(
    State(state): State<AppState>,
    ApiQuery(q): ApiQuery<ListQuery>,
) -> ApiResult<Json<Value>> {
    let txns = with_store(&state, move |store| store.list_wallet_txns(&q)).await?;
    Ok(Json(json!({ "wallet_txns": txns })))
}

async fn create_wallet_txn(
    State(state): State<AppState>,
    ApiJson(new): ApiJson<NewWalletTxn>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let txn = with_store(&state, move |store| store.create_wallet_txn(new)).await?;
    Ok((StatusCode::CREATED, Json(json!({ "wallet_txn": txn }))))
}

async fn get_wallet_txn(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> ApiResult<Json<Value>> {
    let txn = with_store(&state, move |store| store.get_wallet_txn(id)).await?;
    Ok(Json(json!({ "wallet_txn": txn })))
}

async fn update_wallet_txn(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(update): ApiJson<WalletTxnUpdate>,
) -> ApiResult<Json<Value>> {
    let txn = with_store(&state, move |store| store.update_wallet_txn(id, update)).await?;
    Ok(Json(json!({ "wallet_txn": txn })))
}

async fn delete_wallet_txn(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> ApiResult<StatusCode> {
    with_store(&state, move |store| store.delete_wallet_txn(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- receipts -----------------------------------------------------------------------

async fn list_receipts(
    State(state): State<AppState>,
    ApiQuery(q): ApiQuery<ListQuery>,
) -> ApiResult<Json<Value>> {
    let receipts = with_store(&state, move |store| store.list_receipts(&q)).await?;
    Ok(Json(json!({ "receipts": receipts })))
}

async fn create_receipt(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let mut multipart = multipart?;
    let mut company_id = None;
    let mut issue_date = None;
    let mut description = None;
    let mut file = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "company_id" => {
                let raw = field.text().await?;
                let id = raw
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| FreebeanError::Invalid(format!("company_id is not a number: {raw}")))?;
                company_id = Some(id);
            }
            "issue_date" => issue_date = Some(field.text().await?),
            "description" => description = Some(field.text().await?),
            "receipt" => {
                let file_name = field.file_name().unwrap_or("receipt").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field.bytes().await?.to_vec();
                file = Some((file_name, content_type, data));
            }
            _ => {}
        }
    }

    let company_id = company_id.ok_or_else(|| FreebeanError::Invalid("company_id is required".to_string()))?;
    let (file_name, content_type, data) =
        file.ok_or_else(|| FreebeanError::Invalid("receipt file part is required".to_string()))?;
    let new = NewReceipt {
        company_id,
        description,
        issue_date,
        file_name,
        content_type,
        data,
    };
    let receipt = with_store(&state, move |store| store.create_receipt(new)).await?;
    Ok((StatusCode::CREATED, Json(json!({ "receipt": receipt }))))
}

async fn get_receipt(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> ApiResult<Json<Value>> {
    let receipt = with_store(&state, move |store| store.get_receipt(id)).await?;
    Ok(Json(json!({ "receipt": receipt })))
}

async fn delete_receipt(State(state): State<AppState>, ApiPath(id): ApiPath<i64>) -> ApiResult<StatusCode> {
    with_store(&state, move |store| store.delete_receipt(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
