/// Typed sessions and the fresh-authentication gate.
///
/// A session is a small record keyed by an opaque random token: the
/// authenticated user, the timestamp of the last successful WebAuthn
/// user verification, and any in-flight ceremony state. Privileged
/// operations (export, rotation, kill switch) demand a verification
/// newer than the freshness window.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use webauthn_rs::prelude::{PasskeyAuthentication, PasskeyRegistration};

use crate::crypto::aead;
use crate::error::{CoreError, Result};

#[derive(Default)]
struct Session {
    user_id: Option<String>,
    last_uv_at: Option<Instant>,
    /// In-flight unlock ceremony: (user it was issued for, state).
    webauthn_unlock: Option<(String, PasskeyAuthentication)>,
    /// In-flight registration ceremony.
    webauthn_reg: Option<(String, PasskeyRegistration)>,
}

pub struct SessionStore {
    inner: Mutex<HashMap<String, Session>>,
    fresh_window: Duration,
}

impl SessionStore {
    pub fn new(fresh_window: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            fresh_window,
        }
    }

    /// Reuse the inbound session token when one is presented; mint a
    /// fresh random token otherwise.
    pub fn resolve_token(&self, inbound: Option<&str>) -> String {
        match inbound {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => hex::encode(aead::random_bytes(32)),
        }
    }

    pub fn set_user(&self, token: &str, user_id: &str) {
        let mut inner = self.lock();
        inner.entry(token.to_string()).or_default().user_id = Some(user_id.to_string());
    }

    pub fn user_id(&self, token: &str) -> Option<String> {
        let inner = self.lock();
        inner.get(token)?.user_id.clone()
    }

    /// Record a successful WebAuthn user verification.
    pub fn mark_user_verified(&self, token: &str) {
        let mut inner = self.lock();
        inner.entry(token.to_string()).or_default().last_uv_at = Some(Instant::now());
    }

    /// Admit only sessions whose last user verification is inside the
    /// freshness window.
    pub fn require_fresh_webauthn(&self, token: &str) -> Result<()> {
        let inner = self.lock();
        let fresh = inner
            .get(token)
            .and_then(|s| s.last_uv_at)
            .is_some_and(|at| at.elapsed() <= self.fresh_window);
        if fresh {
            Ok(())
        } else {
            Err(CoreError::Forbidden)
        }
    }

    pub fn put_webauthn_unlock(&self, token: &str, user_id: &str, state: PasskeyAuthentication) {
        let mut inner = self.lock();
        inner.entry(token.to_string()).or_default().webauthn_unlock =
            Some((user_id.to_string(), state));
    }

    /// Take the in-flight unlock state. Single use; returns `None` when
    /// absent or issued for a different user.
    pub fn take_webauthn_unlock(&self, token: &str, user_id: &str) -> Option<PasskeyAuthentication> {
        let mut inner = self.lock();
        let session = inner.get_mut(token)?;
        match session.webauthn_unlock.take() {
            Some((owner, state)) if owner == user_id => Some(state),
            _ => None,
        }
    }

    pub fn put_webauthn_reg(&self, token: &str, user_id: &str, state: PasskeyRegistration) {
        let mut inner = self.lock();
        inner.entry(token.to_string()).or_default().webauthn_reg =
            Some((user_id.to_string(), state));
    }

    pub fn take_webauthn_reg(&self, token: &str, user_id: &str) -> Option<PasskeyRegistration> {
        let mut inner = self.lock();
        let session = inner.get_mut(token)?;
        match session.webauthn_reg.take() {
            Some((owner, state)) if owner == user_id => Some(state),
            _ => None,
        }
    }

    /// Drop a session entirely (logout).
    pub fn remove(&self, token: &str) {
        let mut inner = self.lock();
        inner.remove(token);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
