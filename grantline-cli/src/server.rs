use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Request as HttpRequest, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;

use grantline_core::clock::{Clock, SystemClock};
use grantline_core::config::OperatorConfig;
use grantline_core::infrastructure::{Selector, Stores};
use grantline_core::infrastructure_in_memory::InMemoryStore;
use grantline_core::notifier::Notifier;
use grantline_core::operator::Operator;
use grantline_core::token::TrustAnchors;
use grantline_core::types::{Entitlement, ObjectKey, Request, RequestPhase};
use grantline_core::LicensingError;

use crate::handlers::*;

const MAX_IN_FLIGHT: usize = 256;

#[derive(Clone)]
pub struct AppState {
    stores: Stores,
    trust: Arc<TrustAnchors>,
    /// Verifies offers on behalf of HTTP clients
    notifier: Arc<Notifier>,
}

pub async fn run(
    listen: SocketAddr,
    trust_anchor_paths: &[PathBuf],
    workers: usize,
    resync_ms: u64,
) -> anyhow::Result<()> {
    let trust = Arc::new(
        TrustAnchors::from_pem_files(trust_anchor_paths).context("cannot load trust anchors")?,
    );
    tracing::info!(anchors = trust.len(), "trust anchors loaded");

    let config = OperatorConfig {
        workers,
        resync_interval_ms: Some(resync_ms),
        ..OperatorConfig::default()
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (_, stores) = InMemoryStore::shared();
    tracing::info!("storage backend: in-memory (state is lost on exit)");

    let operator = Operator::spawn(stores.clone(), trust.clone(), clock.clone(), &config);
    let notifier = Arc::new(Notifier::new(stores.clone(), trust.clone(), clock, config.retry.clone()));
    let state = AppState {
        stores,
        trust,
        notifier,
    };

    let app = Router::new()
        // Health is always open (no auth)
        .route("/health", get(health))
        .route("/secrets", post(create_secret))
        .route("/secrets/{ns}/{name}", delete(delete_secret))
        .route("/entitlements", get(list_entitlements))
        .route("/entitlements/{ns}/{name}", get(get_entitlement))
        .route("/requests", post(create_request))
        .route("/requests/{ns}/{name}", get(get_request).delete(delete_request))
        .route("/requests/{ns}/{name}/acknowledge", post(acknowledge_request))
        .layer(middleware::from_fn(auth_middleware))
        .layer(ConcurrencyLimitLayer::new(MAX_IN_FLIGHT))
        .layer(CorsLayer::permissive())
        .with_state(state);

    if std::env::var("GRANTLINE_API_KEY").is_ok_and(|key| !key.is_empty()) {
        tracing::info!("API key authentication enabled");
    } else {
        tracing::warn!("no GRANTLINE_API_KEY set, server is open (dev mode)");
    }

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("cannot bind {listen}"))?;
    tracing::info!("grantline control plane listening on http://{}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("server error")?;

    operator.shutdown().await;
    Ok(())
}

// ─── Auth Middleware ────────────────────────────────────────────────────────

async fn auth_middleware(
    headers: HeaderMap,
    request: HttpRequest,
    next: Next,
) -> Result<Response, StatusCode> {
    // No key configured: dev mode
    let expected_key = match std::env::var("GRANTLINE_API_KEY") {
        Ok(key) if !key.is_empty() => key,
        _ => return Ok(next.run(request).await),
    };

    if request.uri().path() == "/health" {
        return Ok(next.run(request).await);
    }

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if token == expected_key {
        Ok(next.run(request).await)
    } else {
        tracing::warn!("unauthorized request to {}", request.uri().path());
        Err(StatusCode::UNAUTHORIZED)
    }
}

// ─── Error Mapping ──────────────────────────────────────────────────────────

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn status_for(err: &LicensingError) -> StatusCode {
    match err {
        LicensingError::NotFound { .. } => StatusCode::NOT_FOUND,
        LicensingError::AlreadyExists { .. } | LicensingError::Conflict { .. } => {
            StatusCode::CONFLICT
        }
        LicensingError::InvalidToken(_) | LicensingError::Key(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure<T: serde::Serialize>(err: LicensingError) -> ApiResult<T> {
    (status_for(&err), Json(ApiResponse::err(err.to_string())))
}

fn bad_request<T: serde::Serialize>(msg: String) -> ApiResult<T> {
    (StatusCode::BAD_REQUEST, Json(ApiResponse::err(msg)))
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let all = Selector::all();
    Json(ApiResponse::ok(HealthResponse {
        status: "ok".to_string(),
        trust_anchors: state.trust.len(),
        entitlements: state.stores.entitlements.list(&all).map_or(0, |v| v.len()),
        requests: state.stores.requests.list(&all).map_or(0, |v| v.len()),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

async fn create_secret(
    State(state): State<AppState>,
    Json(req): Json<CreateSecretRequest>,
) -> ApiResult<SecretInfo> {
    if let Err(e) = req.validate() {
        return bad_request(e);
    }
    // Reject tokens no anchor verifies; the reconciler would only ignore them.
    if let Err(e) = state.trust.verify(req.license.trim().as_bytes()) {
        return failure(e);
    }

    match state.stores.secrets.create(req.into_secret()) {
        Ok(secret) => {
            tracing::info!(secret = %secret.metadata.key(), "license secret stored");
            (StatusCode::CREATED, Json(ApiResponse::ok(SecretInfo::from(&secret))))
        }
        Err(e) => failure(e),
    }
}

async fn delete_secret(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<String> {
    let key = ObjectKey::new(ns, name);
    match state.stores.secrets.delete(&key) {
        Ok(()) => {
            tracing::info!(secret = %key, "license secret deleted");
            (StatusCode::OK, Json(ApiResponse::ok(format!("secret '{key}' deleted"))))
        }
        Err(e) => failure(e),
    }
}

async fn list_entitlements(State(state): State<AppState>) -> ApiResult<Vec<EntitlementSummary>> {
    match state.stores.entitlements.list(&Selector::all()) {
        Ok(pools) => (
            StatusCode::OK,
            Json(ApiResponse::ok(pools.iter().map(EntitlementSummary::from).collect())),
        ),
        Err(e) => failure(e),
    }
}

async fn get_entitlement(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<Entitlement> {
    match state.stores.entitlements.get(&ObjectKey::new(ns, name)) {
        Ok(pool) => (StatusCode::OK, Json(ApiResponse::ok(pool))),
        Err(e) => failure(e),
    }
}

async fn create_request(
    State(state): State<AppState>,
    Json(req): Json<CreateLicenseRequest>,
) -> ApiResult<Request> {
    if let Err(e) = req.validate() {
        return bad_request(e);
    }
    match state.stores.requests.create(req.into_request()) {
        Ok(request) => {
            tracing::info!(
                request = %request.metadata.key(),
                entitlement = %request.spec.entitlement,
                unit = %request.spec.unit,
                amount = request.spec.amount,
                "license request created"
            );
            (StatusCode::CREATED, Json(ApiResponse::ok(request)))
        }
        Err(e) => failure(e),
    }
}

async fn get_request(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<Request> {
    match state.stores.requests.get(&ObjectKey::new(ns, name)) {
        Ok(request) => (StatusCode::OK, Json(ApiResponse::ok(request))),
        Err(e) => failure(e),
    }
}

async fn delete_request(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<String> {
    let key = ObjectKey::new(ns, name);
    match state.stores.requests.delete(&key) {
        Ok(()) => {
            tracing::info!(request = %key, "license request deleted");
            (StatusCode::OK, Json(ApiResponse::ok(format!("request '{key}' deleted"))))
        }
        Err(e) => failure(e),
    }
}

/// Verifies the offered grant and moves the request to Acknowledged.
async fn acknowledge_request(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<AcknowledgeResponse> {
    let key = ObjectKey::new(ns, name);
    let request = match state.stores.requests.get(&key) {
        Ok(request) => request,
        Err(e) => return failure(e),
    };
    if request.status.phase != RequestPhase::Offer {
        return (
            StatusCode::CONFLICT,
            Json(ApiResponse::err(format!(
                "request '{key}' is in phase {}, not Offer",
                request.status.phase
            ))),
        );
    }

    let notifier = state.notifier.clone();
    let stores = state.stores.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let verdict = notifier.acknowledge(&request)?;
        Ok::<_, LicensingError>((verdict, stores.requests.get(&key)?))
    })
    .await;

    match outcome {
        Ok(Ok((verdict, request))) => {
            let accepted = verdict.is_ok() && request.status.phase == RequestPhase::Acknowledged;
            (
                StatusCode::OK,
                Json(ApiResponse::ok(AcknowledgeResponse {
                    accepted,
                    reason: verdict.err(),
                    request,
                })),
            )
        }
        Ok(Err(e)) => failure(e),
        Err(e) => failure(LicensingError::Runtime(e.to_string())),
    }
}
