use super::*;
use crate::error::DbError;
use crate::memory::{MemoryDatabase, MemorySession, MemorySessionPool};
use carevault_core::{Principal, Role};
use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

fn broker() -> (TenantContextBroker<MemorySessionPool>, Arc<MemoryDatabase>) {
    let db = MemoryDatabase::new();
    let pool = MemorySessionPool::new(db.clone(), 1);
    (TenantContextBroker::new(pool), db)
}

fn alice() -> Principal {
    Principal::new("alice", Role::StandardUser).unwrap()
}

async fn vars_on_idle_connection(broker: &TenantContextBroker<MemorySessionPool>) -> SessionVariables {
    let mut session = broker.pool().checkout().await.unwrap();
    session.session_variables().await.unwrap()
}

#[tokio::test]
async fn test_bind_uses_stored_procedure() {
    let (broker, db) = broker();
    let mut session = broker.pool().checkout().await.unwrap();

    broker.bind(&mut session, &alice(), false).await.unwrap();

    let vars = session.session_variables().await.unwrap();
    assert_eq!(vars.principal_id, "alice");
    assert_eq!(vars.role, "standard_user");
    assert!(!vars.is_system);
    assert_eq!(db.set_context_calls(), 1);
    assert_eq!(db.variable_writes(), 0);
}

#[tokio::test]
async fn test_bind_system_override() {
    let (broker, _) = broker();
    let mut session = broker.pool().checkout().await.unwrap();

    broker.bind(&mut session, &alice(), true).await.unwrap();
    assert!(session.session_variables().await.unwrap().is_system);
}

#[tokio::test]
async fn test_bind_falls_back_to_session_variables() {
    let (broker, db) = broker();
    db.set_procedures_installed(false);
    let mut session = broker.pool().checkout().await.unwrap();

    broker.bind(&mut session, &alice(), false).await.unwrap();

    let vars = session.session_variables().await.unwrap();
    assert_eq!(vars.principal_id, "alice");
    assert_eq!(db.variable_writes(), 3);
}

#[tokio::test]
async fn test_bind_fails_when_every_binder_fails() {
    let (broker, db) = broker();
    db.set_procedures_installed(false);
    db.set_variables_writable(false);
    let mut session = broker.pool().checkout().await.unwrap();

    let err = broker.bind(&mut session, &alice(), false).await.unwrap_err();
    assert_eq!(err.attempts.len(), 2);
    assert!(err.to_string().contains("stored_procedure"));
    assert!(err.to_string().contains("session_variables"));
}

#[tokio::test]
async fn test_release_resets_to_inert_values() {
    let (broker, db) = broker();
    let mut session = broker.pool().checkout().await.unwrap();
    broker.bind(&mut session, &alice(), false).await.unwrap();

    broker.release(&mut session).await;

    assert_eq!(session.session_variables().await.unwrap(), SessionVariables::inert());
    assert_eq!(db.clear_context_calls(), 1);
}

#[tokio::test]
async fn test_release_falls_back_and_never_fails() {
    let (broker, db) = broker();
    let mut session = broker.pool().checkout().await.unwrap();
    broker.bind(&mut session, &alice(), false).await.unwrap();

    db.set_procedures_installed(false);
    broker.release(&mut session).await;
    assert!(session.session_variables().await.unwrap().is_inert());

    db.set_variables_writable(false);
    broker.release(&mut session).await;
}

#[tokio::test]
async fn test_run_with_context_binds_and_releases() {
    let (broker, db) = broker();
    db.seed("health_events", "alice", json!({"kind": "lab"}));
    db.seed("health_events", "bob", json!({"kind": "xray"}));

    let rows = broker
        .run_with_context(Some(&alice()), &ContextOptions::authenticated(), |s: &mut MemorySession| {
            async move { s.select("health_events") }.boxed()
        })
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].owner_id, "alice");
    assert_eq!(db.clear_context_calls(), 1);
    assert!(vars_on_idle_connection(&broker).await.is_inert());
}

#[tokio::test]
async fn test_unauthenticated_rejected_before_checkout() {
    let (broker, db) = broker();

    let result: Result<(), ContextError<DbError>> = broker
        .run_with_context(None, &ContextOptions::authenticated(), |_s| {
            async move { Ok(()) }.boxed()
        })
        .await;

    assert!(matches!(result, Err(ContextError::Unauthenticated)));
    assert_eq!(db.checkouts(), 0);
}

#[tokio::test]
async fn test_wrong_role_rejected_before_checkout() {
    let (broker, db) = broker();
    let options = ContextOptions::authenticated().require_roles([Role::Admin]);

    let result: Result<(), ContextError<DbError>> = broker
        .run_with_context(Some(&alice()), &options, |_s| async move { Ok(()) }.boxed())
        .await;

    assert!(matches!(
        result,
        Err(ContextError::Forbidden(Role::StandardUser))
    ));
    assert_eq!(db.checkouts(), 0);
}

#[tokio::test]
async fn test_system_principal_rejected_outside_system_mode() {
    let (broker, _) = broker();

    let result: Result<(), ContextError<DbError>> = broker
        .run_with_context(
            Some(&Principal::system()),
            &ContextOptions::authenticated(),
            |_s| async move { Ok(()) }.boxed(),
        )
        .await;

    assert!(matches!(result, Err(ContextError::Forbidden(_))));
}

#[tokio::test]
async fn test_system_mode_binds_system_principal() {
    let (broker, db) = broker();
    db.seed("receivers", "alice", json!({}));
    db.seed("receivers", "bob", json!({}));

    let count = broker
        .run_with_context(None, &ContextOptions::system(), |s: &mut MemorySession| {
            async move {
                let vars = s.session_variables().await?;
                assert!(vars.is_system);
                Ok::<_, DbError>(s.select("receivers")?.len())
            }
            .boxed()
        })
        .await
        .unwrap();

    assert_eq!(count, 2);
    assert!(vars_on_idle_connection(&broker).await.is_inert());
}

#[tokio::test]
async fn test_release_runs_once_on_handler_error() {
    let (broker, db) = broker();

    let result: Result<(), _> = broker
        .run_with_context(Some(&alice()), &ContextOptions::authenticated(), |_s| {
            async move { Err(DbError::NotFound("event".to_string())) }.boxed()
        })
        .await;

    assert!(matches!(
        result,
        Err(ContextError::Handler(DbError::NotFound(_)))
    ));
    assert_eq!(db.clear_context_calls(), 1);
    assert!(vars_on_idle_connection(&broker).await.is_inert());
}

#[tokio::test]
async fn test_release_runs_once_on_timeout() {
    let (broker, db) = broker();
    let options = ContextOptions::authenticated().with_timeout(Duration::from_millis(20));

    let result: Result<(), ContextError<DbError>> = broker
        .run_with_context(Some(&alice()), &options, |_s| {
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
            .boxed()
        })
        .await;

    assert!(matches!(result, Err(ContextError::Timeout(_))));
    assert_eq!(db.clear_context_calls(), 1);
    assert!(vars_on_idle_connection(&broker).await.is_inert());
}

#[tokio::test]
async fn test_release_runs_once_on_panic() {
    let (broker, db) = broker();

    let outcome = AssertUnwindSafe(broker.run_with_context(
        Some(&alice()),
        &ContextOptions::authenticated(),
        |_s: &mut MemorySession| async move {
            if true {
                panic!("handler bug");
            }
            Ok::<(), DbError>(())
        }
        .boxed(),
    ))
    .catch_unwind()
    .await;

    assert!(outcome.is_err(), "panic must propagate to the caller");
    assert_eq!(db.clear_context_calls(), 1);
    assert!(vars_on_idle_connection(&broker).await.is_inert());
}

#[tokio::test]
async fn test_binding_failure_releases_and_reports() {
    let (broker, db) = broker();
    db.set_procedures_installed(false);
    db.set_variables_writable(false);

    let result: Result<(), ContextError<DbError>> = broker
        .run_with_context(Some(&alice()), &ContextOptions::authenticated(), |_s| {
            async move { Ok(()) }.boxed()
        })
        .await;

    assert!(matches!(result, Err(ContextError::Binding(_))));
    // Release was attempted and, failing, the session was discarded.
    assert_eq!(db.clear_context_calls(), 1);
    assert_eq!(db.discarded(), 1);
}

#[tokio::test]
async fn test_partial_fallback_bind_is_cleared() {
    let (broker, db) = broker();
    db.set_procedures_installed(false);

    broker
        .run_with_context(Some(&alice()), &ContextOptions::authenticated(), |_s| {
            async move { Ok::<_, DbError>(()) }.boxed()
        })
        .await
        .unwrap();

    // Bound and cleared via individual variables: 3 writes each way.
    assert_eq!(db.variable_writes(), 6);
    assert!(vars_on_idle_connection(&broker).await.is_inert());
}

#[tokio::test]
async fn test_checkout_failure_is_session_error() {
    let (broker, db) = broker();
    db.set_available(false);

    let result: Result<(), ContextError<DbError>> = broker
        .run_with_context(Some(&alice()), &ContextOptions::authenticated(), |_s| {
            async move { Ok(()) }.boxed()
        })
        .await;

    assert!(matches!(result, Err(ContextError::Session(_))));
}

#[test]
fn test_context_options_builders() {
    let options = ContextOptions::system()
        .require_roles([Role::Issuer])
        .with_timeout(Duration::from_secs(2));
    assert!(options.system_mode);
    assert_eq!(options.required_roles, vec![Role::Issuer]);
    assert_eq!(options.timeout, Some(Duration::from_secs(2)));
    assert_eq!(
        TenantContextBroker::new(MemorySessionPool::new(MemoryDatabase::new(), 1))
            .handler_timeout(),
        DEFAULT_HANDLER_TIMEOUT
    );
}

#[test]
fn test_authorize_without_checkout() {
    let (broker, db) = broker();
    let admin_only = ContextOptions::authenticated().require_roles([Role::Admin]);

    assert!(matches!(
        broker.authorize(None, &ContextOptions::authenticated()),
        Err(ContextError::Unauthenticated)
    ));
    assert!(matches!(
        broker.authorize(Some(&alice()), &admin_only),
        Err(ContextError::Forbidden(Role::StandardUser))
    ));
    let admin = Principal::new("root", Role::Admin).unwrap();
    assert_eq!(broker.authorize(Some(&admin), &admin_only).unwrap().id(), "root");
    assert!(broker
        .authorize(None, &ContextOptions::system())
        .unwrap()
        .is_system());
    assert_eq!(db.checkouts(), 0);
}
