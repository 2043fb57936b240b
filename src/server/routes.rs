/// REST routes: unlock, setup, decryption/export, admin.
///
/// Handlers translate between HTTP and the core services. Error codes
/// are stable strings; unlock outcomes stay opaque booleans so nothing
/// here distinguishes "no such user" from "wrong credential".
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use webauthn_rs::prelude::{
    CreationChallengeResponse, PublicKeyCredential, RegisterPublicKeyCredential,
    RequestChallengeResponse,
};

use super::AppState;
use crate::error::CoreError;
use crate::ratelimit::client_key;

const SESSION_HEADER: &str = "x-session-token";
const SESSION_COOKIE: &str = "coldproxy_session";

// ─── Error lifting ───────────────────────────────────────

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
}

/// An HTTP-shaped error: status plus a stable code string.
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str) -> Self {
        Self { status, code }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    fn invalid_webauthn() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_webauthn")
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        let (status, code) = match e {
            CoreError::Locked => (StatusCode::UNAUTHORIZED, "unauthorized"),
            CoreError::AccountLocked => (StatusCode::LOCKED, "account_locked"),
            CoreError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "invalid_pin"),
            CoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            CoreError::Conflict(_) => (StatusCode::CONFLICT, "invalid_request"),
            CoreError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "too_many_requests"),
            CoreError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            CoreError::ServiceUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            CoreError::WebAuthn(_) => (StatusCode::BAD_REQUEST, "invalid_webauthn"),
            CoreError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            CoreError::DecryptFailed
            | CoreError::Tampered(_)
            | CoreError::Encryption(_)
            | CoreError::KeyDerivation(_)
            | CoreError::Storage(_)
            | CoreError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_server_error"),
        };
        Self::new(status, code)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.code })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ─── Session plumbing ────────────────────────────────────

fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    let cookies = headers
        .get(axum::http::header::COOKIE)?
        .to_str()
        .ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE && !value.is_empty()).then(|| value.to_string())
    })
}

fn resolve_session(state: &AppState, headers: &HeaderMap) -> String {
    state
        .sessions
        .resolve_token(session_token(headers).as_deref())
}

fn with_session<T: Serialize>(token: String, body: T) -> impl IntoResponse {
    ([(SESSION_HEADER, token)], Json(body))
}

fn session_user(state: &AppState, token: &str) -> ApiResult<String> {
    state
        .sessions
        .user_id(token)
        .ok_or_else(ApiError::unauthorized)
}

fn guard_kill_switch(state: &AppState) -> ApiResult<()> {
    if state.kill_switch.load(Ordering::Relaxed) {
        Err(CoreError::ServiceUnavailable.into())
    } else {
        Ok(())
    }
}

// ─── Health ──────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

// ─── Unlock ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PinUnlockRequest {
    user_id: String,
    pin: String,
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

/// POST /unlock/pin
async fn unlock_pin(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PinUnlockRequest>,
) -> ApiResult<impl IntoResponse> {
    state.unlock_limiter.check(&client_key(&headers))?;
    guard_kill_switch(&state)?;

    let success = state.unlock.unlock_with_pin(&req.user_id, &req.pin).await?;

    let token = resolve_session(&state, &headers);
    if success {
        state.sessions.set_user(&token, &req.user_id);
    }
    Ok(with_session(token, SuccessResponse { success }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebauthnChallengeRequest {
    user_id: String,
}

#[derive(Serialize)]
struct WebauthnChallengeResponse {
    options: RequestChallengeResponse,
}

/// POST /unlock/webauthn/challenge
async fn webauthn_challenge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<WebauthnChallengeRequest>,
) -> ApiResult<impl IntoResponse> {
    state.unlock_limiter.check(&client_key(&headers))?;
    guard_kill_switch(&state)?;

    let (options, ceremony) = state.unlock.start_webauthn_unlock(&req.user_id).await?;

    let token = resolve_session(&state, &headers);
    state
        .sessions
        .put_webauthn_unlock(&token, &req.user_id, ceremony);

    Ok(with_session(token, WebauthnChallengeResponse { options }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebauthnFinishRequest {
    user_id: String,
    assertion_response: PublicKeyCredential,
}

/// POST /unlock/webauthn/finish
async fn webauthn_finish(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<WebauthnFinishRequest>,
) -> ApiResult<impl IntoResponse> {
    state.unlock_limiter.check(&client_key(&headers))?;
    guard_kill_switch(&state)?;

    let token = resolve_session(&state, &headers);
    let ceremony = state
        .sessions
        .take_webauthn_unlock(&token, &req.user_id)
        .ok_or_else(ApiError::invalid_webauthn)?;

    let success = state
        .unlock
        .unlock_with_webauthn(&req.user_id, &req.assertion_response, &ceremony)
        .await?;

    if success {
        state.sessions.set_user(&token, &req.user_id);
        state.sessions.mark_user_verified(&token);
    }
    Ok(with_session(token, SuccessResponse { success }))
}

/// POST /logout
async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<SuccessResponse>> {
    let token = resolve_session(&state, &headers);
    if let Some(user_id) = state.sessions.user_id(&token) {
        state.unlock.logout(&user_id);
    }
    state.sessions.remove(&token);
    Ok(Json(SuccessResponse { success: true }))
}

pub fn unlock_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/unlock/pin", post(unlock_pin))
        .route("/unlock/webauthn/challenge", post(webauthn_challenge))
        .route("/unlock/webauthn/finish", post(webauthn_finish))
        .route("/logout", post(logout))
}

// ─── Setup ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetPinRequest {
    user_id: String,
    pin: String,
}

/// POST /setup/pin
async fn set_pin(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetPinRequest>,
) -> ApiResult<(StatusCode, Json<SuccessResponse>)> {
    state.setup.set_pin(&req.user_id, &req.pin).await?;
    Ok((StatusCode::CREATED, Json(SuccessResponse { success: true })))
}

#[derive(Serialize)]
struct RegistrationChallengeResponse {
    options: CreationChallengeResponse,
}

/// POST /setup/webauthn/challenge
async fn registration_challenge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<WebauthnChallengeRequest>,
) -> ApiResult<impl IntoResponse> {
    let (options, ceremony) = state
        .setup
        .start_webauthn_registration(&req.user_id)
        .await?;

    let token = resolve_session(&state, &headers);
    state
        .sessions
        .put_webauthn_reg(&token, &req.user_id, ceremony);

    Ok(with_session(token, RegistrationChallengeResponse { options }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationFinishRequest {
    user_id: String,
    attestation_response: RegisterPublicKeyCredential,
}

/// POST /setup/webauthn/finish
async fn registration_finish(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RegistrationFinishRequest>,
) -> ApiResult<impl IntoResponse> {
    let token = resolve_session(&state, &headers);
    let ceremony = state
        .sessions
        .take_webauthn_reg(&token, &req.user_id)
        .ok_or_else(ApiError::invalid_webauthn)?;

    state
        .setup
        .finish_webauthn_registration(&req.user_id, &req.attestation_response, &ceremony)
        .await?;

    Ok(with_session(token, SuccessResponse { success: true }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecoveryCodeResponse {
    recovery_code: String,
}

/// POST /setup/recovery — issue a recovery code for the session user.
async fn issue_recovery_code(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<RecoveryCodeResponse>> {
    let token = resolve_session(&state, &headers);
    let user_id = session_user(&state, &token)?;

    let recovery_code = state.setup.generate_recovery_code(&user_id).await?;
    Ok(Json(RecoveryCodeResponse { recovery_code }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecoverRequest {
    user_id: String,
    recovery_code: String,
}

/// POST /recover — unlock via recovery code; drops credential wrappers.
async fn recover(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RecoverRequest>,
) -> ApiResult<impl IntoResponse> {
    state.unlock_limiter.check(&client_key(&headers))?;
    guard_kill_switch(&state)?;

    let success = state
        .setup
        .recover_master_key(&req.user_id, &req.recovery_code)
        .await?;

    let token = resolve_session(&state, &headers);
    if success {
        state.sessions.set_user(&token, &req.user_id);
    }
    Ok(with_session(token, SuccessResponse { success }))
}

pub fn setup_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/setup/pin", post(set_pin))
        .route("/setup/webauthn/challenge", post(registration_challenge))
        .route("/setup/webauthn/finish", post(registration_finish))
        .route("/setup/recovery", post(issue_recovery_code))
        .route("/recover", post(recover))
}

// ─── Decrypt / export ────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DecryptResponse {
    id: String,
    /// Plaintext body, base64-encoded.
    body: String,
}

/// GET /decrypt/{id}
async fn decrypt_interaction(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<DecryptResponse>> {
    guard_kill_switch(&state)?;

    let token = resolve_session(&state, &headers);
    let user_id = session_user(&state, &token)?;

    let body = state.encryptor.read_interaction(&id, &user_id).await?;
    Ok(Json(DecryptResponse {
        id,
        body: STANDARD.encode(body),
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportedInteraction {
    id: String,
    created_at: String,
    model: Option<String>,
    tokens: Option<i64>,
    cost_usd: Option<f64>,
    truncated: bool,
    /// Plaintext body, base64-encoded.
    body: String,
}

/// GET /export — decrypt everything the session user owns.
async fn export(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ExportedInteraction>>> {
    state.export_limiter.check(&client_key(&headers))?;
    guard_kill_switch(&state)?;

    let token = resolve_session(&state, &headers);
    state.sessions.require_fresh_webauthn(&token)?;
    let user_id = session_user(&state, &token)?;

    let interactions = state.encryptor.export_user(&user_id).await?;

    let body = interactions
        .into_iter()
        .map(|(header, plaintext)| ExportedInteraction {
            id: header.id,
            created_at: header.created_at.to_rfc3339(),
            model: header.model,
            tokens: header.tokens,
            cost_usd: header.cost_usd,
            truncated: header.truncated,
            body: STANDARD.encode(plaintext),
        })
        .collect();

    Ok(Json(body))
}

pub fn data_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/decrypt/{id}", get(decrypt_interaction))
        .route("/export", get(export))
}

// ─── Admin ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct KillSwitchRequest {
    enabled: bool,
}

/// POST /api/admin/kill-switch — requires fresh WebAuthn.
async fn kill_switch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<KillSwitchRequest>,
) -> ApiResult<Json<SuccessResponse>> {
    let token = resolve_session(&state, &headers);
    state.sessions.require_fresh_webauthn(&token)?;

    state.kill_switch.store(req.enabled, Ordering::Relaxed);
    tracing::warn!(enabled = req.enabled, "kill switch toggled");
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Debug, Deserialize)]
struct RotateKeyRequest {
    pin: String,
}

/// POST /rotate-key — requires fresh WebAuthn and the current PIN.
async fn rotate_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RotateKeyRequest>,
) -> ApiResult<Json<SuccessResponse>> {
    let token = resolve_session(&state, &headers);
    state.sessions.require_fresh_webauthn(&token)?;
    let user_id = session_user(&state, &token)?;

    state.setup.rotate_master_key(&user_id, &req.pin).await?;
    Ok(Json(SuccessResponse { success: true }))
}

pub fn admin_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/admin/kill-switch", post(kill_switch))
        .route("/rotate-key", post(rotate_key))
}
