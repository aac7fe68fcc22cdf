//! Resource Registry Tests
//!
//! Sessions against a scripted TCP server:
//! - Creation and the credential handshake
//! - Release by owner and by scope
//! - close_all and fail-fast afterwards

mod common;

use common::*;
use rowlink::driver::{CollectingVisitor, HandleId, ResourceRegistry};
use rowlink::DriverError;

// ============================================================================
// Creation
// ============================================================================

#[tokio::test]
async fn test_create_sends_credentials() {
    let server = MockServer::start().await;
    let registry = ResourceRegistry::new();

    let session = registry
        .create_session(HandleId(1), HandleId(1), &server.config())
        .await
        .unwrap();
    assert_eq!(registry.session_count(), 1);
    assert_eq!(registry.owner_of(session.id()), Some(HandleId(1)));
    assert_eq!(registry.scope_session_count(HandleId(1)), 1);
    assert_eq!(session.peer().port(), server.config().port);

    let credentials = Event::Credentials {
        user: "tester".to_string(),
        password: "secret".to_string(),
    };
    eventually("credentials", || server.count(&credentials) == 1).await;
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn test_created_session_runs_exchanges() {
    let server = MockServer::start().await;
    let registry = ResourceRegistry::new();
    let session = registry
        .create_session(HandleId(1), HandleId(1), &server.config())
        .await
        .unwrap();

    let mut protocol = session.lock().await;
    assert!(protocol.begin_exchange("VACUUM", None).await.unwrap());
    let mut visitor = CollectingVisitor::new();
    assert!(protocol.stream_response(&mut visitor).await.unwrap());
    drop(protocol);

    eventually("message", || {
        server.count(&Event::Message("VACUUM".to_string())) == 1
    })
    .await;
}

#[tokio::test]
async fn test_session_ids_are_unique() {
    let server = MockServer::start().await;
    let registry = ResourceRegistry::new();
    let config = server.config();

    let a = registry.create_session(HandleId(1), HandleId(1), &config).await.unwrap();
    let b = registry.create_session(HandleId(2), HandleId(2), &config).await.unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(registry.session_count(), 2);
    assert!(registry.session(a.id()).is_some());
}

// ============================================================================
// Release
// ============================================================================

#[tokio::test]
async fn test_release_cascades_through_scope() {
    let server = MockServer::start().await;
    let registry = ResourceRegistry::new();
    let config = server.config();

    // Two sessions in scope 1, one of them owned by handle 2; a third elsewhere.
    let own = registry.create_session(HandleId(1), HandleId(1), &config).await.unwrap();
    let scoped = registry.create_session(HandleId(2), HandleId(1), &config).await.unwrap();
    let other = registry.create_session(HandleId(3), HandleId(3), &config).await.unwrap();
    assert_eq!(registry.scope_session_count(HandleId(1)), 2);

    registry.release(HandleId(1)).await.unwrap();
    assert_eq!(registry.session_count(), 1);
    assert_eq!(registry.scope_session_count(HandleId(1)), 0);
    assert!(registry.session(own.id()).is_none());
    assert!(registry.session(scoped.id()).is_none());
    assert!(registry.owner_of(scoped.id()).is_none());
    assert!(registry.session(other.id()).is_some());

    assert!(own.lock().await.is_closed());
    assert!(scoped.lock().await.is_closed());
    eventually("two closed sockets", || server.count(&Event::Closed) == 2).await;
}

#[tokio::test]
async fn test_release_owner_keeps_rest_of_scope() {
    let server = MockServer::start().await;
    let registry = ResourceRegistry::new();
    let config = server.config();

    registry.create_session(HandleId(1), HandleId(1), &config).await.unwrap();
    let scoped = registry.create_session(HandleId(2), HandleId(1), &config).await.unwrap();

    registry.release(HandleId(2)).await.unwrap();
    assert_eq!(registry.session_count(), 1);
    assert_eq!(registry.scope_session_count(HandleId(1)), 1);
    assert!(registry.session(scoped.id()).is_none());
}

#[tokio::test]
async fn test_release_single_session() {
    let server = MockServer::start().await;
    let registry = ResourceRegistry::new();
    let session = registry
        .create_session(HandleId(1), HandleId(1), &server.config())
        .await
        .unwrap();

    registry.release_session(session.id()).await.unwrap();
    registry.release_session(session.id()).await.unwrap();
    assert_eq!(registry.session_count(), 0);
    assert_eq!(registry.scope_session_count(HandleId(1)), 0);
}

#[tokio::test]
async fn test_release_on_external_event() {
    let server = MockServer::start().await;
    let registry = ResourceRegistry::new();
    let config = server.config();

    for h in 1..=4 {
        registry.create_session(HandleId(h), HandleId(h), &config).await.unwrap();
    }
    registry
        .release_on_external_event(|h| h.0 % 2 == 0)
        .await
        .unwrap();

    assert_eq!(registry.session_count(), 2);
    assert_eq!(registry.scope_session_count(HandleId(2)), 0);
    assert_eq!(registry.scope_session_count(HandleId(3)), 1);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_close_all_then_fail_fast() {
    let server = MockServer::start().await;
    let registry = ResourceRegistry::new();
    let config = server.config();

    let a = registry.create_session(HandleId(1), HandleId(1), &config).await.unwrap();
    registry.create_session(HandleId(2), HandleId(1), &config).await.unwrap();
    registry.create_session(HandleId(3), HandleId(3), &config).await.unwrap();

    registry.close_all().await.unwrap();
    assert!(registry.is_closed());
    assert_eq!(registry.session_count(), 0);
    assert_eq!(registry.scope_session_count(HandleId(1)), 0);
    assert!(registry.owner_of(a.id()).is_none());
    assert!(a.lock().await.is_closed());

    eventually("three accepts", || server.accepted() == 3).await;
    let err = registry
        .create_session(HandleId(4), HandleId(4), &config)
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::RegistryClosed));
    assert_eq!(server.accepted(), 3);

    // Idempotent.
    registry.close_all().await.unwrap();
}
