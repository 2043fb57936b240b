/// HTTP surface for the confidential storage core.
///
/// The router is thin glue: it keys rate limits, resolves session
/// tokens, honors the kill switch, and lifts core result variants to
/// stable error codes. All policy lives in the services.
pub mod routes;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use webauthn_rs::prelude::Url;
use webauthn_rs::{Webauthn, WebauthnBuilder};

use crate::capture::InteractionEncryptor;
use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::ratelimit::RateLimiter;
use crate::session::SessionStore;
use crate::setup::SetupService;
use crate::store::Database;
use crate::unlock::UnlockService;

/// Shared application state available to all handlers.
pub struct AppState {
    pub db: Database,
    pub unlock: Arc<UnlockService>,
    pub setup: Arc<SetupService>,
    pub encryptor: Arc<InteractionEncryptor>,
    pub sessions: SessionStore,
    pub unlock_limiter: RateLimiter,
    pub export_limiter: RateLimiter,
    pub kill_switch: AtomicBool,
}

impl AppState {
    pub fn new(db: Database, config: &CoreConfig) -> Result<Self> {
        let webauthn = Arc::new(build_webauthn(config)?);
        let unlock = Arc::new(UnlockService::new(db.clone(), webauthn.clone(), config));
        let setup = Arc::new(SetupService::new(
            db.clone(),
            unlock.clone(),
            webauthn,
            config,
        ));
        let encryptor = Arc::new(InteractionEncryptor::new(db.clone(), unlock.clone(), config));

        Ok(Self {
            db,
            unlock,
            setup,
            encryptor,
            sessions: SessionStore::new(config.fresh_uv_window),
            unlock_limiter: RateLimiter::new(config.unlock_rate),
            export_limiter: RateLimiter::new(config.export_rate),
            kill_switch: AtomicBool::new(config.kill_switch),
        })
    }
}

pub fn build_webauthn(config: &CoreConfig) -> Result<Webauthn> {
    let origin = Url::parse(&config.rp_origin)
        .map_err(|e| CoreError::InvalidRequest(format!("rp origin: {e}")))?;

    WebauthnBuilder::new(&config.rp_id, &origin)
        .map_err(|e| CoreError::WebAuthn(e.to_string()))?
        .rp_name("coldproxy")
        .build()
        .map_err(|e| CoreError::WebAuthn(e.to_string()))
}

/// Build the Axum application with all routes and middleware.
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health_routes())
        .merge(routes::unlock_routes())
        .merge(routes::setup_routes())
        .merge(routes::data_routes())
        .merge(routes::admin_routes())
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Start the API server.
pub async fn serve(state: Arc<AppState>, addr: &str) -> Result<()> {
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(CoreError::Io)?;

    tracing::info!("coldproxy API server listening on {addr}");

    axum::serve(listener, app).await.map_err(CoreError::Io)?;

    Ok(())
}
