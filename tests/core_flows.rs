//! End-to-end flows over an in-memory store: provisioning, unlock,
//! capture, tamper detection, rotation, recovery, and the HTTP gates.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use coldproxy::capture::{CaptureWriter, PlainInteraction};
use coldproxy::config::CoreConfig;
use coldproxy::crypto::kdf::KdfParams;
use coldproxy::error::CoreError;
use coldproxy::server::{build_app, AppState};
use coldproxy::store::{self, Database};

fn fast_config() -> CoreConfig {
    CoreConfig {
        kdf: KdfParams::fast_insecure(),
        ..CoreConfig::default()
    }
}

async fn state_with(config: CoreConfig) -> Arc<AppState> {
    let db = Database::in_memory().await.unwrap();
    Arc::new(AppState::new(db, &config).unwrap())
}

async fn test_state() -> Arc<AppState> {
    state_with(fast_config()).await
}

fn interaction(user_id: &str, body: Vec<u8>) -> PlainInteraction {
    PlainInteraction {
        user_id: user_id.to_string(),
        model: Some("claude-test".into()),
        tokens: Some(256),
        cost_usd: Some(0.01),
        body,
        request_fingerprint: Some("fp-1".into()),
        truncated: false,
    }
}

// ─── Scenario: setup + unlock ────────────────────────────

#[tokio::test]
async fn setup_then_unlock_materializes_dek() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();

    // Nothing is cached by provisioning itself.
    assert!(state.unlock.get_decrypted_dek("u1").await.is_none());

    assert!(state.unlock.unlock_with_pin("u1", "1234").await.unwrap());

    let dek = state.unlock.get_decrypted_dek("u1").await.unwrap();
    assert_eq!(dek.as_bytes().len(), 32);
}

#[tokio::test]
async fn provisioning_twice_conflicts() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();

    let err = state.setup.set_pin("u1", "5678").await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
}

// ─── Scenario: wrong PIN and lockout ─────────────────────

#[tokio::test]
async fn five_wrong_pins_lock_the_account() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();

    for _ in 0..5 {
        assert!(!state.unlock.unlock_with_pin("u1", "0000").await.unwrap());
    }

    // The sixth attempt is rejected before any derivation, correct or not.
    assert!(matches!(
        state.unlock.unlock_with_pin("u1", "1234").await,
        Err(CoreError::AccountLocked)
    ));
}

// ─── Scenario: capture roundtrip ─────────────────────────

#[tokio::test]
async fn roundtrip_150k_body_in_three_chunks() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state.unlock.unlock_with_pin("u1", "1234").await.unwrap();

    let body: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
    let id = state
        .encryptor
        .encrypt_interaction(&interaction("u1", body.clone()))
        .await
        .unwrap();

    let header = store::interactions::find_header(state.db.pool(), &id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(header.chunk_count, 3);
    assert_eq!(header.byte_count, 150_000);
    assert_eq!(header.chunk_size, 65_536);
    assert_eq!(header.cipher_key_version, 1);

    let blobs = store::interactions::list_blobs(state.db.pool(), &id)
        .await
        .unwrap();
    assert_eq!(blobs.len(), 3);

    let plaintext = state.encryptor.read_interaction(&id, "u1").await.unwrap();
    assert_eq!(plaintext, body);
}

#[tokio::test]
async fn roundtrip_empty_body() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state.unlock.unlock_with_pin("u1", "1234").await.unwrap();

    let id = state
        .encryptor
        .encrypt_interaction(&interaction("u1", Vec::new()))
        .await
        .unwrap();

    let header = store::interactions::find_header(state.db.pool(), &id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(header.chunk_count, 1);
    assert_eq!(header.byte_count, 0);

    let plaintext = state.encryptor.read_interaction(&id, "u1").await.unwrap();
    assert!(plaintext.is_empty());
}

#[tokio::test]
async fn roundtrip_exact_chunk_boundary() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state.unlock.unlock_with_pin("u1", "1234").await.unwrap();

    let body = vec![0xF0u8; 2 * 65_536];
    let id = state
        .encryptor
        .encrypt_interaction(&interaction("u1", body.clone()))
        .await
        .unwrap();

    let header = store::interactions::find_header(state.db.pool(), &id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(header.chunk_count, 2);

    let plaintext = state.encryptor.read_interaction(&id, "u1").await.unwrap();
    assert_eq!(plaintext, body);
}

#[tokio::test]
async fn encrypt_requires_unlocked_master_key() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();

    let err = state
        .encryptor
        .encrypt_interaction(&interaction("u1", vec![1, 2, 3]))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Locked));
}

#[tokio::test]
async fn read_denies_other_users() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state.setup.set_pin("u2", "9999").await.unwrap();
    state.unlock.unlock_with_pin("u1", "1234").await.unwrap();
    state.unlock.unlock_with_pin("u2", "9999").await.unwrap();

    let id = state
        .encryptor
        .encrypt_interaction(&interaction("u1", b"private".to_vec()))
        .await
        .unwrap();

    // The other user sees the same answer as for a nonexistent id.
    let err = state.encryptor.read_interaction(&id, "u2").await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

#[tokio::test]
async fn same_plaintext_never_repeats_ciphertext() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state.unlock.unlock_with_pin("u1", "1234").await.unwrap();

    let body = vec![0x42u8; 1000];
    let id1 = state
        .encryptor
        .encrypt_interaction(&interaction("u1", body.clone()))
        .await
        .unwrap();
    let id2 = state
        .encryptor
        .encrypt_interaction(&interaction("u1", body))
        .await
        .unwrap();

    let blob1 = &store::interactions::list_blobs(state.db.pool(), &id1).await.unwrap()[0];
    let blob2 = &store::interactions::list_blobs(state.db.pool(), &id2).await.unwrap()[0];
    assert_ne!(blob1.nonce, blob2.nonce);
    assert_ne!(blob1.ciphertext, blob2.ciphertext);
}

// ─── Scenario: tampering ─────────────────────────────────

#[tokio::test]
async fn flipped_ciphertext_byte_reads_as_tampered() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state.unlock.unlock_with_pin("u1", "1234").await.unwrap();

    let body: Vec<u8> = vec![7u8; 150_000];
    let id = state
        .encryptor
        .encrypt_interaction(&interaction("u1", body))
        .await
        .unwrap();
    let other = state
        .encryptor
        .encrypt_interaction(&interaction("u1", b"untouched".to_vec()))
        .await
        .unwrap();

    let blobs = store::interactions::list_blobs(state.db.pool(), &id)
        .await
        .unwrap();
    let mut ciphertext = blobs[1].ciphertext.clone();
    ciphertext[10] ^= 0x01;
    sqlx::query("UPDATE cipher_blobs SET ciphertext = ? WHERE id = ?")
        .bind(&ciphertext)
        .bind(&blobs[1].id)
        .execute(state.db.pool())
        .await
        .unwrap();

    let err = state.encryptor.read_interaction(&id, "u1").await.unwrap_err();
    assert!(matches!(err, CoreError::Tampered(_)));

    // Other interactions are unaffected.
    assert!(state.encryptor.read_interaction(&other, "u1").await.is_ok());
}

#[tokio::test]
async fn tampered_nonce_reads_as_tampered() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state.unlock.unlock_with_pin("u1", "1234").await.unwrap();

    let id = state
        .encryptor
        .encrypt_interaction(&interaction("u1", b"some body".to_vec()))
        .await
        .unwrap();

    let blobs = store::interactions::list_blobs(state.db.pool(), &id)
        .await
        .unwrap();
    let mut nonce = hex::decode(&blobs[0].nonce).unwrap();
    nonce[0] ^= 0x80;
    sqlx::query("UPDATE cipher_blobs SET nonce = ? WHERE id = ?")
        .bind(hex::encode(nonce))
        .bind(&blobs[0].id)
        .execute(state.db.pool())
        .await
        .unwrap();

    let err = state.encryptor.read_interaction(&id, "u1").await.unwrap_err();
    assert!(matches!(err, CoreError::Tampered(_)));
}

#[tokio::test]
async fn altered_aad_component_reads_as_tampered() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state.unlock.unlock_with_pin("u1", "1234").await.unwrap();

    let id = state
        .encryptor
        .encrypt_interaction(&interaction("u1", b"some body".to_vec()))
        .await
        .unwrap();

    // The key version is part of every chunk's AAD.
    sqlx::query("UPDATE interactions SET cipher_key_version = 9 WHERE id = ?")
        .bind(&id)
        .execute(state.db.pool())
        .await
        .unwrap();

    let err = state.encryptor.read_interaction(&id, "u1").await.unwrap_err();
    assert!(matches!(err, CoreError::Tampered(_)));
}

#[tokio::test]
async fn missing_blob_reads_as_tampered() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state.unlock.unlock_with_pin("u1", "1234").await.unwrap();

    let body = vec![1u8; 70_000]; // two chunks
    let id = state
        .encryptor
        .encrypt_interaction(&interaction("u1", body))
        .await
        .unwrap();

    sqlx::query("DELETE FROM cipher_blobs WHERE interaction_id = ? AND chunk_index = 1")
        .bind(&id)
        .execute(state.db.pool())
        .await
        .unwrap();

    let err = state.encryptor.read_interaction(&id, "u1").await.unwrap_err();
    assert!(matches!(err, CoreError::Tampered(_)));
}

// ─── Scenario: idle TTL ──────────────────────────────────

#[tokio::test]
async fn idle_ttl_evicts_master_key() {
    let config = CoreConfig {
        mk_cache_ttl: Duration::from_millis(80),
        ..fast_config()
    };
    let state = state_with(config).await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state.unlock.unlock_with_pin("u1", "1234").await.unwrap();
    assert!(state.unlock.get_decrypted_dek("u1").await.is_some());

    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(state.unlock.get_decrypted_dek("u1").await.is_none());

    // Re-unlock restores access.
    assert!(state.unlock.unlock_with_pin("u1", "1234").await.unwrap());
    assert!(state.unlock.get_decrypted_dek("u1").await.is_some());
}

// ─── Scenario: rotation ──────────────────────────────────

#[tokio::test]
async fn rotation_preserves_dek_and_old_ciphertext() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state.unlock.unlock_with_pin("u1", "1234").await.unwrap();

    let dek_before = state.unlock.get_decrypted_dek("u1").await.unwrap();
    let old_id = state
        .encryptor
        .encrypt_interaction(&interaction("u1", b"pre-rotation".to_vec()))
        .await
        .unwrap();

    state.setup.rotate_master_key("u1", "1234").await.unwrap();

    // Same DEK bytes, new wrapping, bumped version.
    let dek_after = state.unlock.get_decrypted_dek("u1").await.unwrap();
    assert_eq!(dek_before.as_bytes(), dek_after.as_bytes());

    let dek_record = store::keys::find_by_id(state.db.pool(), "dek_u1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dek_record.meta.unwrap()["version"], 2);

    // Pre-rotation ciphertext still decrypts; new captures carry the
    // new version.
    let plaintext = state.encryptor.read_interaction(&old_id, "u1").await.unwrap();
    assert_eq!(plaintext, b"pre-rotation");

    let new_id = state
        .encryptor
        .encrypt_interaction(&interaction("u1", b"post-rotation".to_vec()))
        .await
        .unwrap();
    let new_header = store::interactions::find_header(state.db.pool(), &new_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(new_header.cipher_key_version, 2);

    // The old PIN wrapper is gone: the old unlock path would now use
    // the new salt and wrapping, and the old PIN still works because
    // rotation re-wrapped under the same PIN.
    assert!(state.unlock.unlock_with_pin("u1", "1234").await.unwrap());
}

#[tokio::test]
async fn rotation_rejects_wrong_pin() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state.unlock.unlock_with_pin("u1", "1234").await.unwrap();

    let err = state
        .setup
        .rotate_master_key("u1", "0000")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidCredentials));
}

#[tokio::test]
async fn rotation_requires_unlocked_master_key() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();

    let err = state
        .setup
        .rotate_master_key("u1", "1234")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Locked));
}

// ─── Scenario: recovery ──────────────────────────────────

#[tokio::test]
async fn recovery_code_restores_master_key_and_resets_wrappers() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state.unlock.unlock_with_pin("u1", "1234").await.unwrap();
    let dek_before = state.unlock.get_decrypted_dek("u1").await.unwrap();

    let code = state.setup.generate_recovery_code("u1").await.unwrap();

    state.unlock.logout("u1");
    assert!(state.unlock.get_decrypted_dek("u1").await.is_none());

    // Wrong code is an opaque false.
    assert!(!state
        .setup
        .recover_master_key("u1", "AAAA-BBBB-CCCC")
        .await
        .unwrap());

    assert!(state.setup.recover_master_key("u1", &code).await.unwrap());
    let dek_after = state.unlock.get_decrypted_dek("u1").await.unwrap();
    assert_eq!(dek_before.as_bytes(), dek_after.as_bytes());

    // PIN wrapper was dropped; the old PIN no longer unlocks.
    assert!(!state.unlock.unlock_with_pin("u1", "1234").await.unwrap());

    // Re-provisioning a PIN works while the recovered MK is cached, and
    // the DEK survives.
    state.setup.set_pin("u1", "5678").await.unwrap();
    state.unlock.logout("u1");
    assert!(state.unlock.unlock_with_pin("u1", "5678").await.unwrap());
    let dek_final = state.unlock.get_decrypted_dek("u1").await.unwrap();
    assert_eq!(dek_before.as_bytes(), dek_final.as_bytes());

    // The code was single-use.
    assert!(!state.setup.recover_master_key("u1", &code).await.unwrap());
}

// ─── Scenario: async writer ──────────────────────────────

#[tokio::test]
async fn capture_writer_flushes_on_shutdown() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state.unlock.unlock_with_pin("u1", "1234").await.unwrap();

    let writer = CaptureWriter::spawn(state.encryptor.clone(), 16);
    assert!(writer.enqueue(interaction("u1", b"queued body".to_vec())));
    assert_eq!(writer.dropped_jobs(), 0);
    writer.shutdown().await;

    let headers = store::interactions::list_headers_for_user(state.db.pool(), "u1")
        .await
        .unwrap();
    assert_eq!(headers.len(), 1);

    let plaintext = state
        .encryptor
        .read_interaction(&headers[0].id, "u1")
        .await
        .unwrap();
    assert_eq!(plaintext, b"queued body");
}

// ─── Scenario: export ────────────────────────────────────

#[tokio::test]
async fn export_decrypts_everything_owned() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state.unlock.unlock_with_pin("u1", "1234").await.unwrap();

    state
        .encryptor
        .encrypt_interaction(&interaction("u1", b"first".to_vec()))
        .await
        .unwrap();
    state
        .encryptor
        .encrypt_interaction(&interaction("u1", b"second".to_vec()))
        .await
        .unwrap();

    let exported = state.encryptor.export_user("u1").await.unwrap();
    assert_eq!(exported.len(), 2);
    assert_eq!(exported[0].1, b"first");
    assert_eq!(exported[1].1, b"second");
}

// ─── HTTP surface ────────────────────────────────────────

fn post_json(uri: &str, body: &str, forwarded_for: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-forwarded-for", forwarded_for)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn sixth_unlock_request_is_rate_limited() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    let app = build_app(state.clone());

    for _ in 0..5 {
        let response = app
            .clone()
            .oneshot(post_json(
                "/unlock/pin",
                r#"{"userId":"u1","pin":"1234"}"#,
                "203.0.113.7",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(post_json(
            "/unlock/pin",
            r#"{"userId":"u1","pin":"1234"}"#,
            "203.0.113.7",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(response).await["error"], "too_many_requests");

    // A different client is unaffected.
    let response = app
        .oneshot(post_json(
            "/unlock/pin",
            r#"{"userId":"u1","pin":"1234"}"#,
            "203.0.113.8",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn kill_switch_hides_behind_generic_unavailable() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state
        .kill_switch
        .store(true, std::sync::atomic::Ordering::Relaxed);
    let app = build_app(state);

    let response = app
        .clone()
        .oneshot(post_json(
            "/unlock/pin",
            r#"{"userId":"u1","pin":"1234"}"#,
            "198.51.100.1",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["error"], "service_unavailable");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/decrypt/some-id")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn privileged_routes_demand_fresh_webauthn() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state.unlock.unlock_with_pin("u1", "1234").await.unwrap();
    let app = build_app(state.clone());

    // A PIN-only session is not enough for export.
    let token = state.sessions.resolve_token(None);
    state.sessions.set_user(&token, "u1");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/export")
                .header("x-session-token", token.clone())
                .header("x-forwarded-for", "198.51.100.2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["error"], "forbidden");

    // With a recent user verification the same session is admitted.
    state.sessions.mark_user_verified(&token);
    state
        .encryptor
        .encrypt_interaction(&interaction("u1", b"export me".to_vec()))
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/export")
                .header("x-session-token", token)
                .header("x-forwarded-for", "198.51.100.2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unlock_response_is_opaque_for_unknown_users() {
    let state = test_state().await;
    let app = build_app(state);

    let response = app
        .oneshot(post_json(
            "/unlock/pin",
            r#"{"userId":"nobody","pin":"1234"}"#,
            "198.51.100.3",
        ))
        .await
        .unwrap();

    // Same shape as a wrong PIN for a real user.
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["success"], false);
}

#[tokio::test]
async fn decrypt_route_returns_owner_plaintext() {
    let state = test_state().await;
    state.setup.set_pin("u1", "1234").await.unwrap();
    state.unlock.unlock_with_pin("u1", "1234").await.unwrap();

    let id = state
        .encryptor
        .encrypt_interaction(&interaction("u1", b"hello proxy".to_vec()))
        .await
        .unwrap();

    let token = state.sessions.resolve_token(None);
    state.sessions.set_user(&token, "u1");

    let app = build_app(state);
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/decrypt/{id}"))
                .header("x-session-token", token)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    use base64::Engine as _;
    let plaintext = base64::engine::general_purpose::STANDARD
        .decode(body["body"].as_str().unwrap())
        .unwrap();
    assert_eq!(plaintext, b"hello proxy");
}

// ─── Nonce hygiene ───────────────────────────────────────

#[test]
fn random_nonces_do_not_repeat() {
    use std::collections::HashSet;

    let mut seen = HashSet::new();
    for _ in 0..10_000 {
        assert!(seen.insert(coldproxy::crypto::aead::generate_nonce()));
    }
}
