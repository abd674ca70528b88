//! Wiring of the shared collaborators behind the HTTP router.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use carevault_api_documents::{documents_router, DocumentsApi, LocalDocumentStorage};
use carevault_db::{
    run_migrations, AuditWriter, DbPool, DbPoolConfig, MemoryAuditStore, MemoryDatabase,
    MemorySessionPool, PgAuditStore, SharedAuditStore, TenantContextBroker,
};
use carevault_pipeline::{IdentityResolver, JwtIdentityResolver, ValidationConfig};
use carevault_store::{MemoryCounterStore, RedisCounterStore, RedisStoreConfig, SharedCounterStore};

use crate::config::{Config, DatabaseBackend};

/// The assembled application.
pub struct AppState {
    pub router: Router,
    /// Session and audit pools of the Postgres backend; closed on shutdown.
    pub db_pools: Vec<DbPool>,
}

pub async fn build(config: &Config) -> anyhow::Result<AppState> {
    let counters = counter_store(config).await?;
    let identity = identity_resolver(config)?;
    tokio::fs::create_dir_all(&config.storage.root)
        .await
        .with_context(|| format!("preparing document storage at {}", config.storage.root))?;
    let storage = Arc::new(LocalDocumentStorage::new(&config.storage.root));
    let api_config = config.documents_api();

    match config.database.backend {
        DatabaseBackend::Postgres => {
            let url = config
                .database
                .url
                .clone()
                .context("database.url is required for the postgres backend")?;
            let mut pool_config = DbPoolConfig::new(url);
            pool_config.max_connections = config.database.max_connections;
            pool_config.min_connections = config.database.min_connections;
            pool_config.acquire_timeout = Duration::from_secs(config.database.acquire_timeout_secs);

            let pool = DbPool::connect_with(&pool_config)
                .await
                .context("connecting to the database")?;
            tracing::info!(max_connections = pool_config.max_connections, "Database pool ready");

            // Audit writes never wait on the broker's sessions.
            let mut audit_pool_config = pool_config.clone();
            audit_pool_config.max_connections = config.database.audit_max_connections;
            audit_pool_config.min_connections = 0;
            let audit_pool = DbPool::connect_with(&audit_pool_config)
                .await
                .context("connecting the audit pool")?;
            tracing::info!(
                max_connections = audit_pool_config.max_connections,
                "Audit pool ready"
            );

            if config.database.run_migrations {
                run_migrations(&pool).await.context("running migrations")?;
                tracing::info!("Migrations applied");
            }

            let audit = audit_writer(config, Arc::new(PgAuditStore::new(audit_pool.clone())));
            let broker =
                TenantContextBroker::new(pool.clone()).with_handler_timeout(config.handler_timeout());
            let api = DocumentsApi::new(broker, counters, audit, storage, identity)
                .with_config(api_config);

            Ok(AppState {
                router: documents_router(api),
                db_pools: vec![pool, audit_pool],
            })
        }
        DatabaseBackend::Memory => {
            tracing::warn!(
                "Using the in-memory database backend; data is lost on restart and this mode is for development only"
            );
            let pool = MemorySessionPool::new(
                MemoryDatabase::new(),
                usize::try_from(config.database.max_connections).unwrap_or(usize::MAX),
            );
            let audit = audit_writer(config, Arc::new(MemoryAuditStore::new()));
            let broker =
                TenantContextBroker::new(pool).with_handler_timeout(config.handler_timeout());
            let api = DocumentsApi::new(broker, counters, audit, storage, identity)
                .with_config(api_config);

            Ok(AppState {
                router: documents_router(api),
                db_pools: Vec::new(),
            })
        }
    }
}

async fn counter_store(config: &Config) -> anyhow::Result<SharedCounterStore> {
    match &config.redis.url {
        Some(url) => {
            let store_config = RedisStoreConfig::new(url.clone())
                .with_operation_timeout(Duration::from_millis(config.redis.operation_timeout_ms));
            let store = RedisCounterStore::connect(store_config)
                .await
                .context("connecting to the counter store")?;
            tracing::info!("Redis counter store connected");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!(
                "No redis.url configured; rate limit and circuit breaker counters are per-process"
            );
            Ok(Arc::new(MemoryCounterStore::new()))
        }
    }
}

fn identity_resolver(config: &Config) -> anyhow::Result<Arc<dyn IdentityResolver>> {
    let auth = &config.auth;
    let resolver = match (&auth.jwt_secret, &auth.public_key_path) {
        (Some(secret), _) => JwtIdentityResolver::hs256(secret.as_bytes())?,
        (None, Some(path)) => {
            let pem = std::fs::read(path)
                .with_context(|| format!("reading JWT public key from {path}"))?;
            JwtIdentityResolver::rs256_pem(&pem)?
        }
        (None, None) => anyhow::bail!("no JWT verification key configured"),
    };

    let mut validation = ValidationConfig::default().with_leeway(auth.leeway_secs);
    if let Some(issuer) = &auth.issuer {
        validation = validation.issuer(issuer.clone());
    }
    if let Some(audience) = &auth.audience {
        validation = validation.audience(vec![audience.clone()]);
    }
    Ok(Arc::new(resolver.with_validation(validation)))
}

fn audit_writer(config: &Config, store: SharedAuditStore) -> AuditWriter {
    AuditWriter::new(store)
        .with_min_retention(chrono::Duration::days(config.audit.min_retention_days))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config(root: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.database.backend = DatabaseBackend::Memory;
        config.auth.jwt_secret = Some("state-test-secret".into());
        config.storage.root = root.display().to_string();
        config
    }

    #[tokio::test]
    async fn test_memory_backend_builds_router() {
        let dir = tempfile::tempdir().unwrap();
        let state = build(&memory_config(dir.path())).await.unwrap();
        assert!(state.db_pools.is_empty());
    }

    #[tokio::test]
    async fn test_memory_backend_accepts_any_pool_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = memory_config(dir.path());
        config.database.max_connections = u32::MAX;
        assert!(build(&config).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_public_key_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = memory_config(dir.path());
        config.auth.jwt_secret = None;
        config.auth.public_key_path = Some(dir.path().join("absent.pem").display().to_string());
        assert!(build(&config).await.is_err());
    }
}
