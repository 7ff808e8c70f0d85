//! HttpBackend against an in-process fake backend.

mod common;

use ferry::backend::{BackendError, ChatBackend, HttpBackend};
use std::time::Duration;

async fn client() -> (HttpBackend, common::FakeBackend) {
    let (url, fake) = common::spawn_backend().await;
    let backend = HttpBackend::new(&url, Duration::from_millis(300)).expect("backend client");
    (backend, fake)
}

#[tokio::test]
async fn create_send_and_inspect_a_session() {
    let (backend, fake) = client().await;
    let session = backend.create_session().await.unwrap();
    assert_eq!(session.session_id, "sess-1");
    assert_eq!(session.model.as_deref(), Some("fake-model"));

    let reply = backend.send_message(&session.session_id, "hello").await.unwrap();
    assert_eq!(reply.assistant_message, "echo: hello");
    assert_eq!(reply.response_id.as_deref(), Some("resp-1"));

    let detail = backend.get_session(&session.session_id).await.unwrap();
    assert_eq!(detail.message_count, 1);
    assert_eq!(fake.created(), 1);
}

#[tokio::test]
async fn unknown_session_is_session_not_found() {
    let (backend, _fake) = client().await;
    assert!(matches!(
        backend.send_message("nope", "hi").await,
        Err(BackendError::SessionNotFound)
    ));
    assert!(matches!(
        backend.get_session("nope").await,
        Err(BackendError::SessionNotFound)
    ));
}

#[tokio::test]
async fn server_error_is_unavailable() {
    let (backend, _fake) = client().await;
    match backend.send_message("boom", "hi").await {
        Err(BackendError::Unavailable(detail)) => assert!(detail.contains("500")),
        other => panic!("expected Unavailable, got {:?}", other),
    }
}

#[tokio::test]
async fn non_json_body_is_malformed() {
    let (backend, _fake) = client().await;
    assert!(matches!(
        backend.send_message("garbled", "hi").await,
        Err(BackendError::MalformedReply(_))
    ));
}

#[tokio::test]
async fn slow_backend_times_out_as_unavailable() {
    let (backend, _fake) = client().await;
    assert!(matches!(
        backend.send_message("slow", "hi").await,
        Err(BackendError::Unavailable(_))
    ));
}

#[tokio::test]
async fn unreachable_backend_is_unavailable() {
    let url = format!("http://127.0.0.1:{}", common::free_port());
    let backend = HttpBackend::new(&url, Duration::from_millis(300)).unwrap();
    assert!(matches!(
        backend.create_session().await,
        Err(BackendError::Unavailable(_))
    ));
    assert!(backend.health().await.is_err());
}

#[tokio::test]
async fn delete_is_best_effort() {
    let (backend, fake) = client().await;
    let session = backend.create_session().await.unwrap();
    assert_eq!(fake.live(), 1);
    backend.delete_session(&session.session_id).await;
    assert_eq!(fake.live(), 0);
    // Already gone: logged, not an error.
    backend.delete_session(&session.session_id).await;
}

#[tokio::test]
async fn health_keeps_extra_fields() {
    let (backend, _fake) = client().await;
    let health = backend.health().await.unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(
        health.details.get("model").and_then(|v| v.as_str()),
        Some("fake-model")
    );
}
