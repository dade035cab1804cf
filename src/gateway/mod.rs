//! Axum HTTP gateway over the ledger and webhook processor.
//!
//! - Request body size limits (64KB max)
//! - Request timeouts
//! - Per-client rate limits on consume and signup
//! - Admin routes gated by a hashed token

pub mod rate_limit;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::billing::secret::constant_time_eq;
use crate::billing::{AccountRef, LedgerError, LedgerService, Tier};
use crate::config::{Config, StoreBackend};
use crate::metrics::LedgerMetrics;
use crate::notify::{self, smtp::SmtpSettings, LogNotifier, Notifier, SmtpNotifier, Template};
use crate::store::{
    AccountStore, InMemoryAccountStore, InMemoryEventStore, ProcessedEventStore, SqliteStore,
};
use crate::webhook::{WebhookError, WebhookProcessor, WebhookSettings};

pub use rate_limit::{client_key_from_headers, GatewayRateLimiter, RATE_LIMIT_WINDOW_SECS};

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;

/// Header carrying the extension's API key.
const API_KEY_HEADER: &str = "X-Api-Key";
/// Header carrying the admin token.
const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";
/// Payment provider signature header.
const SIGNATURE_HEADER: &str = "Stripe-Signature";

fn hash_admin_token(value: &str) -> String {
    use sha2::{Digest, Sha256};

    hex::encode(Sha256::digest(value.as_bytes()))
}

// ══════════════════════════════════════════════════════════════════
// SERVICES
// ══════════════════════════════════════════════════════════════════

/// Process-wide handles, built once at startup and shared by every request.
pub struct Services {
    pub metrics: Arc<LedgerMetrics>,
    pub ledger: Arc<LedgerService>,
    pub webhooks: Arc<WebhookProcessor>,
    pub notifier: Arc<dyn Notifier>,
}

impl Services {
    /// Open the configured store and notifier.
    pub fn from_config(config: &Config) -> Result<Self> {
        let (accounts, events): (Arc<dyn AccountStore>, Arc<dyn ProcessedEventStore>) =
            match config.store.backend {
                StoreBackend::Sqlite => {
                    let db_path = config.db_path();
                    if let Some(parent) = db_path.parent() {
                        std::fs::create_dir_all(parent).with_context(|| {
                            format!("Failed to create data directory {}", parent.display())
                        })?;
                    }
                    let store = Arc::new(SqliteStore::open(&db_path).with_context(|| {
                        format!("Failed to open ledger database {}", db_path.display())
                    })?);
                    tracing::info!(path = %db_path.display(), "sqlite ledger store opened");
                    let accounts: Arc<dyn AccountStore> = store.clone();
                    let events: Arc<dyn ProcessedEventStore> = store;
                    (accounts, events)
                }
                StoreBackend::Memory => {
                    tracing::warn!("in-memory store: all balances are lost on exit");
                    let accounts: Arc<dyn AccountStore> = Arc::new(InMemoryAccountStore::new());
                    let events: Arc<dyn ProcessedEventStore> = Arc::new(InMemoryEventStore::new());
                    (accounts, events)
                }
            };

        let notifier: Arc<dyn Notifier> = if config.notify.enabled {
            let settings = SmtpSettings {
                host: config.notify.smtp_host.clone().unwrap_or_default(),
                port: config.notify.smtp_port,
                username: config.notify.smtp_username.clone(),
                password: config.notify.smtp_password.clone(),
                from: config.notify.from.clone(),
            };
            Arc::new(SmtpNotifier::new(settings)?)
        } else {
            Arc::new(LogNotifier)
        };

        Self::new(config, accounts, events, notifier)
    }

    /// Wire services over explicit stores and notifier.
    pub fn new(
        config: &Config,
        accounts: Arc<dyn AccountStore>,
        events: Arc<dyn ProcessedEventStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let metrics = Arc::new(LedgerMetrics::new().context("Failed to register metrics")?);
        let ledger = Arc::new(LedgerService::new(
            accounts,
            config.ledger.retry_policy(),
            metrics.clone(),
        ));
        let webhooks = Arc::new(WebhookProcessor::new(
            ledger.clone(),
            events,
            notifier.clone(),
            WebhookSettings {
                secret: config.webhook.secret.clone().unwrap_or_default(),
                tolerance_secs: config.webhook.tolerance_secs,
                price_map: config.webhook.price_map.clone(),
                public_url: config.gateway.base_url(),
            },
            metrics.clone(),
        ));
        Ok(Self {
            metrics,
            ledger,
            webhooks,
            notifier,
        })
    }

    /// Release held transports. Call once, after the server has drained.
    pub async fn shutdown(&self) {
        self.notifier.shutdown().await;
        tracing::info!("services shut down");
    }
}

// ══════════════════════════════════════════════════════════════════
// STATE & ROUTER
// ══════════════════════════════════════════════════════════════════

/// Token cost of each client action.
#[derive(Debug, Clone, Copy)]
pub struct ActionCosts {
    pub scan: u64,
    pub ai_scan: u64,
}

impl ActionCosts {
    fn for_action(self, action: &str) -> Option<u64> {
        match action {
            "scan" => Some(self.scan),
            "ai_scan" => Some(self.ai_scan),
            _ => None,
        }
    }
}

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<LedgerService>,
    pub webhooks: Arc<WebhookProcessor>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Arc<LedgerMetrics>,
    pub rate_limiter: Arc<GatewayRateLimiter>,
    /// SHA-256 hash of the admin token (hex-encoded), never plaintext.
    pub admin_token_hash: Option<Arc<str>>,
    /// False when no webhook secret is configured.
    pub webhook_enabled: bool,
    pub costs: ActionCosts,
    /// Base URL for links in outgoing mail.
    pub public_url: Arc<str>,
    /// Where clients out of tokens are sent.
    pub upgrade_url: Arc<str>,
}

impl AppState {
    pub fn new(services: &Services, config: &Config) -> Self {
        let admin_token_hash = config
            .gateway
            .admin_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| Arc::<str>::from(hash_admin_token(t)));
        let webhook_enabled = config
            .webhook
            .secret
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());

        Self {
            ledger: services.ledger.clone(),
            webhooks: services.webhooks.clone(),
            notifier: services.notifier.clone(),
            metrics: services.metrics.clone(),
            rate_limiter: Arc::new(GatewayRateLimiter::new(
                config.gateway.consume_per_minute,
                config.gateway.signup_per_minute,
            )),
            admin_token_hash,
            webhook_enabled,
            costs: ActionCosts {
                scan: config.ledger.scan_cost,
                ai_scan: config.ledger.ai_scan_cost,
            },
            public_url: Arc::from(config.gateway.base_url()),
            upgrade_url: Arc::from(config.gateway.pricing_url()),
        }
    }
}

/// All routes with middleware.
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-api-key"),
            header::HeaderName::from_static("x-admin-token"),
        ])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/api/tokens", get(handle_get_tokens))
        .route("/api/tokens/consume", post(handle_consume))
        .route("/api/tokens/refresh-status", get(handle_refresh_status))
        .route("/api/auth/signup", post(handle_signup))
        .route("/api/verify-email", get(handle_verify_email))
        .route("/api/auth/verify-email", post(handle_verify_email_post))
        .route("/api/is-email-verified", get(handle_is_email_verified))
        .route("/api/webhooks/stripe", post(handle_payment_webhook))
        .route("/api/admin/credit", post(handle_admin_credit))
        .route("/api/admin/tier", post(handle_admin_tier))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
}

/// Run the HTTP gateway until Ctrl+C / SIGTERM, then tear down services.
pub async fn run_gateway(config: Config) -> Result<()> {
    let services = Services::from_config(&config)?;
    let state = AppState::new(&services, &config);
    if !state.webhook_enabled {
        tracing::warn!("no webhook secret configured; payment webhooks will be refused");
    }
    if state.admin_token_hash.is_none() {
        tracing::info!("no admin token configured; admin routes disabled");
    }

    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;

    println!("Token ledger gateway listening on http://{local}");
    println!("  GET  /api/tokens                   balance (X-Api-Key)");
    println!("  POST /api/tokens/consume           {{\"action\": \"scan\"|\"ai_scan\"}}");
    println!("  GET  /api/tokens/refresh-status    refill cycle (?email=)");
    println!("  POST /api/auth/signup              {{\"email\": \"...\"}}");
    println!("  POST /api/webhooks/stripe          payment events");
    println!("  GET  /health, /metrics");
    println!("  Press Ctrl+C to stop.\n");

    let app = router(
        state,
        Duration::from_secs(config.gateway.request_timeout_secs.max(1)),
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    services.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received, draining connections");
}

// ══════════════════════════════════════════════════════════════════
// RESPONSES
// ══════════════════════════════════════════════════════════════════

/// Concrete return type for JSON handlers.
type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(serde_json::json!({"error": message.into()})))
}

fn ledger_error_response(err: &LedgerError) -> ApiResponse {
    let status = match err {
        LedgerError::AccountNotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::AccountExists(_) => StatusCode::CONFLICT,
        LedgerError::InsufficientBalance { .. } => StatusCode::FORBIDDEN,
        LedgerError::ConcurrentUpdateExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        LedgerError::Store(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        LedgerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };

    let message = if matches!(err, LedgerError::Store(_)) {
        tracing::error!(error = %err, "store failure");
        "internal storage error".to_string()
    } else {
        err.to_string()
    };
    let mut body = serde_json::json!({"error": message, "code": err.code()});
    if err.is_retryable() {
        body["retry_after"] = serde_json::json!(1);
    }
    (status, Json(body))
}

/// API-key lookups that miss are authentication failures, not 404s.
fn api_key_error_response(err: &LedgerError) -> ApiResponse {
    match err {
        LedgerError::AccountNotFound(_) => error_response(StatusCode::UNAUTHORIZED, "Invalid API key"),
        other => ledger_error_response(other),
    }
}

fn api_key_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(ToOwned::to_owned)
}

// ══════════════════════════════════════════════════════════════════
// HANDLERS
// ══════════════════════════════════════════════════════════════════

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            format!("metrics unavailable: {e}"),
        ),
    }
}

/// GET /api/tokens: refill if due, then report balance
async fn handle_get_tokens(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let Some(api_key) = api_key_from_headers(&headers) else {
        return error_response(StatusCode::UNAUTHORIZED, "Missing X-Api-Key header");
    };
    let account = AccountRef::api_key(api_key);

    let refill = match state.ledger.refill_if_due(&account, Utc::now()).await {
        Ok(r) => r,
        Err(e) => return api_key_error_response(&e),
    };
    match state.ledger.get_balance(&account).await {
        Ok(view) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "tokens": view.balance,
                "tier": view.tier,
                "refilled": refill.refilled,
            })),
        ),
        Err(e) => api_key_error_response(&e),
    }
}

/// Consume request body
#[derive(Debug, Default, Deserialize)]
pub struct ConsumeBody {
    /// `scan` (default) or `ai_scan`.
    pub action: Option<String>,
    /// Accepted when the header is absent.
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
}

/// POST /api/tokens/consume: debit the cost of one action
async fn handle_consume(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ConsumeBody>, JsonRejection>,
) -> ApiResponse {
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, format!("Invalid request: {e}"));
        }
    };
    let body_key = body
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(ToOwned::to_owned);
    let Some(api_key) = api_key_from_headers(&headers).or(body_key) else {
        return error_response(StatusCode::UNAUTHORIZED, "Missing X-Api-Key header");
    };

    if !state.rate_limiter.allow_consume(&api_key) {
        tracing::warn!("consume rate limit exceeded");
        let err = serde_json::json!({
            "error": "Too many requests. Please retry later.",
            "retry_after": RATE_LIMIT_WINDOW_SECS,
        });
        return (StatusCode::TOO_MANY_REQUESTS, Json(err));
    }

    let action = body.action.as_deref().unwrap_or("scan");
    let Some(cost) = state.costs.for_action(action) else {
        return error_response(StatusCode::BAD_REQUEST, format!("Unknown action '{action}'"));
    };

    let account = AccountRef::api_key(api_key);
    match state.ledger.consume(&account, cost, Utc::now()).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "tokensRemaining": outcome.remaining,
                "tokenCost": cost,
                "tier": outcome.tier,
            })),
        ),
        Err(LedgerError::InsufficientBalance { have, need }) => (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "error": "Insufficient tokens",
                "tokensNeeded": need,
                "tokensRemaining": have,
                "upgradeUrl": state.upgrade_url.as_ref(),
            })),
        ),
        Err(e) => api_key_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct EmailQuery {
    pub email: String,
}

/// GET /api/tokens/refresh-status?email=
async fn handle_refresh_status(
    State(state): State<AppState>,
    query: Result<Query<EmailQuery>, QueryRejection>,
) -> ApiResponse {
    let Ok(Query(query)) = query else {
        return error_response(StatusCode::BAD_REQUEST, "Missing email parameter");
    };
    match state
        .ledger
        .refill_status(&AccountRef::email(&query.email), Utc::now())
        .await
    {
        Ok(status) => (StatusCode::OK, Json(serde_json::json!(status))),
        Err(e) => ledger_error_response(&e),
    }
}

/// Signup request body
#[derive(Debug, Deserialize)]
pub struct SignupBody {
    pub email: String,
}

/// POST /api/auth/signup: create a free account and mail a verification link
async fn handle_signup(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SignupBody>, JsonRejection>,
) -> ApiResponse {
    let client_key = client_key_from_headers(&headers);
    if !state.rate_limiter.allow_signup(&client_key) {
        tracing::warn!("signup rate limit exceeded for key: {client_key}");
        let err = serde_json::json!({
            "error": "Too many signup requests. Please retry later.",
            "retry_after": RATE_LIMIT_WINDOW_SECS,
        });
        return (StatusCode::TOO_MANY_REQUESTS, Json(err));
    }

    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, format!("Invalid request: {e}"));
        }
    };

    match state.ledger.register(&body.email, Utc::now()).await {
        Ok(reg) => {
            let link =
                notify::verification_link(&state.public_url, &reg.email, &reg.verification_token);
            notify::dispatch(
                state.notifier.clone(),
                reg.email.clone(),
                Template::EmailVerification { link },
            );
            (
                StatusCode::CREATED,
                Json(serde_json::json!({
                    "status": "registered",
                    "accountId": reg.account_id,
                    "apiKey": reg.api_key,
                    "tokens": reg.balance,
                    "tier": reg.tier,
                })),
            )
        }
        Err(e) => ledger_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    pub email: String,
    pub token: String,
}

/// GET /api/verify-email?email=&token=: the mailed link
async fn handle_verify_email(
    State(state): State<AppState>,
    query: Result<Query<VerifyQuery>, QueryRejection>,
) -> ApiResponse {
    let Ok(Query(query)) = query else {
        return error_response(StatusCode::BAD_REQUEST, "Missing email or token parameter");
    };
    verify_response(&state, &query).await
}

/// POST /api/auth/verify-email {email, token}: the extension's key retrieval
async fn handle_verify_email_post(
    State(state): State<AppState>,
    body: Result<Json<VerifyQuery>, JsonRejection>,
) -> ApiResponse {
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, format!("Invalid request: {e}"));
        }
    };
    verify_response(&state, &body).await
}

/// A matching token marks the email verified and releases the API key.
async fn verify_response(state: &AppState, request: &VerifyQuery) -> ApiResponse {
    match state
        .ledger
        .verify_email(&request.email, &request.token, Utc::now())
        .await
    {
        Ok(verified) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "verified": true,
                "accountId": verified.account_id,
                "email": verified.email,
                "apiKey": verified.api_key,
            })),
        ),
        Err(e) => ledger_error_response(&e),
    }
}

/// GET /api/is-email-verified?email=
async fn handle_is_email_verified(
    State(state): State<AppState>,
    query: Result<Query<EmailQuery>, QueryRejection>,
) -> ApiResponse {
    let Ok(Query(query)) = query else {
        return error_response(StatusCode::BAD_REQUEST, "Missing email parameter");
    };
    let verified = match state.ledger.is_email_verified(&query.email).await {
        Ok(v) => v,
        Err(e) => return ledger_error_response(&e),
    };
    match state.ledger.get_balance(&AccountRef::email(&query.email)).await {
        Ok(view) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "verified": verified,
                "tokens": view.balance,
                "tier": view.tier,
            })),
        ),
        Err(e) => ledger_error_response(&e),
    }
}

/// POST /api/webhooks/stripe: signed payment events (raw body)
async fn handle_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResponse {
    if !state.webhook_enabled {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Webhook not configured");
    }
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    match state.webhooks.process(&body, signature, Utc::now()).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "received": true,
                "status": outcome.stage().as_str(),
            })),
        ),
        Err(e) => webhook_error_response(&e),
    }
}

fn webhook_error_response(err: &WebhookError) -> ApiResponse {
    match err {
        WebhookError::SignatureInvalid(_) | WebhookError::MalformedEvent(_) => {
            error_response(StatusCode::BAD_REQUEST, format!("Webhook Error: {err}"))
        }
        // Redelivery cannot fix an unknown package; acknowledge and reconcile by hand.
        WebhookError::Ledger(LedgerError::UnknownEntitlement(_)) => (
            StatusCode::OK,
            Json(serde_json::json!({"received": true, "status": "unresolved"})),
        ),
        e if e.is_retryable() => {
            let body = serde_json::json!({"error": "Temporarily unavailable", "retry_after": 1});
            (StatusCode::SERVICE_UNAVAILABLE, Json(body))
        }
        WebhookError::Ledger(e) if !matches!(e, LedgerError::Store(_)) => {
            error_response(StatusCode::BAD_REQUEST, format!("Webhook Error: {err}"))
        }
        _ => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
    }
}

/// Authenticate admin requests by hashing `X-Admin-Token` (or a bearer token)
/// and comparing against the stored hash.
fn authenticate_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiResponse> {
    let Some(ref expected_hash) = state.admin_token_hash else {
        return Err(error_response(StatusCode::FORBIDDEN, "Admin API disabled"));
    };
    let token = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .map(str::trim)
        .unwrap_or("");

    if token.is_empty()
        || !constant_time_eq(hash_admin_token(token).as_bytes(), expected_hash.as_bytes())
    {
        tracing::warn!("admin authentication failed");
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "admin authentication required",
        ));
    }
    Ok(())
}

/// Admin credit request body
#[derive(Debug, Deserialize)]
pub struct AdminCreditBody {
    /// `id:`, `email:`, `key:` prefixed, or a bare email/id.
    pub account: String,
    pub amount: u64,
    #[serde(default)]
    pub purchased: bool,
}

/// POST /api/admin/credit
async fn handle_admin_credit(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AdminCreditBody>, JsonRejection>,
) -> ApiResponse {
    if let Err(resp) = authenticate_admin(&state, &headers) {
        return resp;
    }
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, format!("Invalid request: {e}"));
        }
    };

    let account = AccountRef::parse(&body.account);
    match state
        .ledger
        .credit(&account, body.amount, body.purchased, Utc::now())
        .await
    {
        Ok(view) => {
            tracing::info!(account = %account, amount = body.amount, "admin credit applied");
            (StatusCode::OK, Json(serde_json::json!(view)))
        }
        Err(e) => ledger_error_response(&e),
    }
}

/// Admin tier change body
#[derive(Debug, Deserialize)]
pub struct AdminTierBody {
    pub account: String,
    pub tier: String,
}

/// POST /api/admin/tier
async fn handle_admin_tier(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AdminTierBody>, JsonRejection>,
) -> ApiResponse {
    if let Err(resp) = authenticate_admin(&state, &headers) {
        return resp;
    }
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, format!("Invalid request: {e}"));
        }
    };
    let tier: Tier = match body.tier.parse() {
        Ok(t) => t,
        Err(e) => return ledger_error_response(&e),
    };

    let account = AccountRef::parse(&body.account);
    match state.ledger.upgrade_tier(&account, tier, Utc::now()).await {
        Ok(view) => (StatusCode::OK, Json(serde_json::json!(view))),
        Err(e) => ledger_error_response(&e),
    }
}

// ══════════════════════════════════════════════════════════════════
// TESTS
// ══════════════════════════════════════════════════════════════════
