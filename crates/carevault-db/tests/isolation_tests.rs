//! Isolation property: a request bound to one principal never observes
//! another principal's rows, even when connections are reused across
//! requests that error, time out, or interleave.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use carevault_core::{Principal, Role};
use carevault_db::{
    ContextError, ContextOptions, DbError, MemoryDatabase, MemoryRow, MemorySession,
    MemorySessionPool, SecuritySession, SessionPool, TenantContextBroker,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

const OWNERS: [&str; 2] = ["alice", "bob"];

fn seeded_database() -> Arc<MemoryDatabase> {
    let db = MemoryDatabase::new();
    for owner in OWNERS {
        for n in 0..5 {
            db.seed("health_events", owner, json!({ "n": n }));
        }
    }
    db
}

async fn assert_idle_connections_inert(pool: &MemorySessionPool, max: usize) {
    let mut held = Vec::new();
    for _ in 0..max {
        let mut session = pool.checkout().await.unwrap();
        let vars = session.session_variables().await.unwrap();
        assert!(vars.is_inert(), "connection {} leaked {vars:?}", session.connection_id());
        assert!(session.select("health_events").unwrap().is_empty());
        held.push(session);
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Ok,
    Error,
    Timeout,
}

async fn run_randomized(db: Arc<MemoryDatabase>, tasks: u64, iterations: usize) {
    const MAX_CONNECTIONS: usize = 2;
    let pool = MemorySessionPool::new(db, MAX_CONNECTIONS);
    let broker = Arc::new(
        TenantContextBroker::new(pool.clone()).with_handler_timeout(Duration::from_millis(20)),
    );
    let violations = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for task in 0..tasks {
        let broker = Arc::clone(&broker);
        let violations = Arc::clone(&violations);
        let completed = Arc::clone(&completed);

        handles.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(0xC0FFEE + task);
            for _ in 0..iterations {
                let owner = OWNERS[rng.gen_range(0..OWNERS.len())];
                let principal = Principal::new(owner, Role::StandardUser).unwrap();
                let outcome = match rng.gen_range(0..100) {
                    0..=79 => Outcome::Ok,
                    80..=97 => Outcome::Error,
                    _ => Outcome::Timeout,
                };
                let yields = rng.gen_range(0..3);
                let expected = owner.to_string();
                let violations = Arc::clone(&violations);

                let result = broker
                    .run_with_context(
                        Some(&principal),
                        &ContextOptions::authenticated(),
                        move |s: &mut MemorySession| {
                            async move {
                                for _ in 0..yields {
                                    tokio::task::yield_now().await;
                                }
                                let rows = s.select("health_events")?;
                                if rows.len() != 5 || rows.iter().any(|r| r.owner_id != expected) {
                                    violations.fetch_add(1, Ordering::SeqCst);
                                }
                                match outcome {
                                    Outcome::Ok => Ok(rows.len()),
                                    Outcome::Error => Err(DbError::NotFound("simulated".into())),
                                    Outcome::Timeout => {
                                        tokio::time::sleep(Duration::from_millis(200)).await;
                                        Ok(rows.len())
                                    }
                                }
                            }
                            .boxed()
                        },
                    )
                    .await;

                match (outcome, result) {
                    (Outcome::Ok, Ok(5))
                    | (Outcome::Error, Err(ContextError::Handler(_)))
                    | (Outcome::Timeout, Err(ContextError::Timeout(_))) => {}
                    (outcome, other) => panic!("unexpected result for {outcome:?}: {other:?}"),
                }
                completed.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(completed.load(Ordering::SeqCst), tasks as usize * iterations);
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_idle_connections_inert(&pool, MAX_CONNECTIONS).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn isolation_holds_under_random_interleaving() {
    run_randomized(seeded_database(), 8, 400).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn isolation_holds_with_fallback_binding() {
    let db = seeded_database();
    db.set_procedures_installed(false);
    run_randomized(db, 4, 250).await;
}

fn read_events(s: &mut MemorySession) -> BoxFuture<'_, Result<(u64, Vec<MemoryRow>), DbError>> {
    async move { Ok((s.connection_id(), s.select("health_events")?)) }.boxed()
}

#[tokio::test]
async fn reused_connection_does_not_leak_between_principals() {
    let pool = MemorySessionPool::new(seeded_database(), 1);
    let broker = TenantContextBroker::new(pool);
    let alice = Principal::new("alice", Role::StandardUser).unwrap();
    let bob = Principal::new("bob", Role::StandardUser).unwrap();

    for _ in 0..1000 {
        let (alice_conn, rows) = broker
            .run_with_context(Some(&alice), &ContextOptions::authenticated(), read_events)
            .await
            .unwrap();
        assert!(rows.iter().all(|r| r.owner_id == "alice"));

        let (bob_conn, rows) = broker
            .run_with_context(Some(&bob), &ContextOptions::authenticated(), read_events)
            .await
            .unwrap();
        assert_eq!(alice_conn, bob_conn, "single connection must be reused");
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.owner_id == "bob"));
    }
}

#[tokio::test]
async fn skipping_release_is_detectable() {
    // Control case for the simulation: binding without releasing leaks the
    // context to the next checkout of the same connection.
    let db = seeded_database();
    let pool = MemorySessionPool::new(db, 1);
    let broker = TenantContextBroker::new(pool.clone());
    let alice = Principal::new("alice", Role::StandardUser).unwrap();

    let mut session = pool.checkout().await.unwrap();
    broker.bind(&mut session, &alice, false).await.unwrap();
    drop(session);

    let session = pool.checkout().await.unwrap();
    assert_eq!(session.select("health_events").unwrap().len(), 5);
}
