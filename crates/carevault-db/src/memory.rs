//! In-process session pool that emulates the row-level policies.
//!
//! A [`MemoryDatabase`] holds rows tagged with an owner id. Sessions carry
//! the three security variables exactly like pooled Postgres connections:
//! values survive when a session goes back to the pool, so a missing release
//! shows up as a leak. Row visibility follows the same rule as the SQL
//! policies: a row is visible when `app.is_system` is true or its owner is
//! `app.current_principal_id`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::context::{
    SecuritySession, SessionPool, SessionVariables, IS_SYSTEM_VAR, PRINCIPAL_ID_VAR, ROLE_VAR,
};
use crate::error::DbError;

/// One stored row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryRow {
    pub id: Uuid,
    pub owner_id: String,
    pub data: JsonValue,
}

#[derive(Debug, Default)]
struct Counters {
    checkouts: AtomicUsize,
    set_context_calls: AtomicUsize,
    clear_context_calls: AtomicUsize,
    variable_writes: AtomicUsize,
    discarded: AtomicUsize,
}

/// Shared state behind a [`MemorySessionPool`].
pub struct MemoryDatabase {
    tables: Mutex<HashMap<String, Vec<MemoryRow>>>,
    procedures_installed: AtomicBool,
    variables_writable: AtomicBool,
    available: AtomicBool,
    counters: Counters,
}

impl fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("tables", &self.tables.lock().len())
            .field(
                "procedures_installed",
                &self.procedures_installed.load(Ordering::SeqCst),
            )
            .finish_non_exhaustive()
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            procedures_installed: AtomicBool::new(true),
            variables_writable: AtomicBool::new(true),
            available: AtomicBool::new(true),
            counters: Counters::default(),
        }
    }
}

impl MemoryDatabase {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a row bypassing the policies, as a migration or superuser would.
    pub fn seed(&self, table: &str, owner_id: &str, data: JsonValue) -> MemoryRow {
        let row = MemoryRow {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            data,
        };
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        row
    }

    /// All rows of a table, ignoring the policies.
    #[must_use]
    pub fn all_rows(&self, table: &str) -> Vec<MemoryRow> {
        self.tables.lock().get(table).cloned().unwrap_or_default()
    }

    /// Simulate the context routines being installed or dropped.
    pub fn set_procedures_installed(&self, installed: bool) {
        self.procedures_installed.store(installed, Ordering::SeqCst);
    }

    /// Make `set_config` fail, so that the fallback binder fails too.
    pub fn set_variables_writable(&self, writable: bool) {
        self.variables_writable.store(writable, Ordering::SeqCst);
    }

    /// Simulate the database being unreachable: checkouts fail.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    #[must_use]
    pub fn checkouts(&self) -> usize {
        self.counters.checkouts.load(Ordering::SeqCst)
    }

    /// Calls to `set_security_context`, successful or not.
    #[must_use]
    pub fn set_context_calls(&self) -> usize {
        self.counters.set_context_calls.load(Ordering::SeqCst)
    }

    /// Calls to `clear_security_context`, successful or not.
    #[must_use]
    pub fn clear_context_calls(&self) -> usize {
        self.counters.clear_context_calls.load(Ordering::SeqCst)
    }

    /// Successful individual variable writes.
    #[must_use]
    pub fn variable_writes(&self) -> usize {
        self.counters.variable_writes.load(Ordering::SeqCst)
    }

    /// Sessions closed instead of returned to the pool.
    #[must_use]
    pub fn discarded(&self) -> usize {
        self.counters.discarded.load(Ordering::SeqCst)
    }

    fn missing_function(name: &str) -> DbError {
        DbError::UndefinedFunction(format!("function {name} does not exist"))
    }
}

/// A pooled connection's state. Variables persist across checkouts.
#[derive(Debug)]
struct Connection {
    id: u64,
    vars: HashMap<String, String>,
}

/// Pool of in-memory sessions with a fixed maximum size.
#[derive(Debug, Clone)]
pub struct MemorySessionPool {
    db: Arc<MemoryDatabase>,
    idle: Arc<Mutex<Vec<Connection>>>,
    permits: Arc<Semaphore>,
    next_id: Arc<AtomicU64>,
}

impl MemorySessionPool {
    #[must_use]
    pub fn new(db: Arc<MemoryDatabase>, max_connections: usize) -> Self {
        Self {
            db,
            idle: Arc::new(Mutex::new(Vec::new())),
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    #[must_use]
    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    /// Number of idle connections.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

#[async_trait]
impl SessionPool for MemorySessionPool {
    type Session = MemorySession;

    async fn checkout(&self) -> Result<Self::Session, DbError> {
        if !self.db.available.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("connection refused".to_string()));
        }

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DbError::Unavailable("pool closed".to_string()))?;

        let conn = self.idle.lock().pop().unwrap_or_else(|| Connection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            vars: HashMap::new(),
        });
        self.db.counters.checkouts.fetch_add(1, Ordering::SeqCst);

        Ok(MemorySession {
            conn: Some(conn),
            db: Arc::clone(&self.db),
            idle: Arc::clone(&self.idle),
            _permit: permit,
        })
    }

    fn discard(&self, mut session: Self::Session) {
        session.conn = None;
        self.db.counters.discarded.fetch_add(1, Ordering::SeqCst);
    }
}

/// A checked-out in-memory session. Dropping it returns the connection.
#[derive(Debug)]
pub struct MemorySession {
    conn: Option<Connection>,
    db: Arc<MemoryDatabase>,
    idle: Arc<Mutex<Vec<Connection>>>,
    _permit: OwnedSemaphorePermit,
}

impl MemorySession {
    /// Identity of the underlying pooled connection.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.conn.as_ref().map_or(0, |c| c.id)
    }

    fn var(&self, name: &str) -> Option<&str> {
        self.conn
            .as_ref()
            .and_then(|c| c.vars.get(name))
            .map(String::as_str)
    }

    fn vars_mut(&mut self) -> Result<&mut HashMap<String, String>, DbError> {
        self.conn
            .as_mut()
            .map(|c| &mut c.vars)
            .ok_or_else(|| DbError::Unavailable("session closed".to_string()))
    }

    fn is_system(&self) -> bool {
        self.var(IS_SYSTEM_VAR)
            .is_some_and(SessionVariables::parse_flag)
    }

    fn can_see(&self, row: &MemoryRow) -> bool {
        if self.is_system() {
            return true;
        }
        match self.var(PRINCIPAL_ID_VAR) {
            Some(id) if !id.is_empty() => row.owner_id == id,
            _ => false,
        }
    }

    /// Rows of `table` visible under the bound context.
    pub fn select(&self, table: &str) -> Result<Vec<MemoryRow>, DbError> {
        let tables = self.db.tables.lock();
        Ok(tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| self.can_see(r)).cloned().collect())
            .unwrap_or_default())
    }

    /// Insert a row; the policy's check rejects rows the context cannot see.
    pub fn insert(&self, table: &str, owner_id: &str, data: JsonValue) -> Result<MemoryRow, DbError> {
        let row = MemoryRow {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            data,
        };
        if !self.can_see(&row) {
            return Err(DbError::ValidationFailed(format!(
                "new row violates row-level security policy for table \"{table}\""
            )));
        }
        self.db
            .tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    /// Delete a visible row. Returns whether a row was removed.
    pub fn delete(&self, table: &str, id: Uuid) -> Result<bool, DbError> {
        let mut tables = self.db.tables.lock();
        let Some(rows) = tables.get_mut(table) else {
            return Ok(false);
        };
        let before = rows.len();
        rows.retain(|r| !(r.id == id && self.can_see(r)));
        Ok(rows.len() != before)
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.idle.lock().push(conn);
        }
    }
}

#[async_trait]
impl SecuritySession for MemorySession {
    async fn call_set_security_context(
        &mut self,
        principal_id: &str,
        role: &str,
        is_system: bool,
    ) -> Result<(), DbError> {
        self.db
            .counters
            .set_context_calls
            .fetch_add(1, Ordering::SeqCst);
        if !self.db.procedures_installed.load(Ordering::SeqCst) {
            return Err(MemoryDatabase::missing_function(
                "set_security_context(text, text, boolean)",
            ));
        }
        let vars = self.vars_mut()?;
        vars.insert(PRINCIPAL_ID_VAR.to_string(), principal_id.to_string());
        vars.insert(ROLE_VAR.to_string(), role.to_string());
        vars.insert(IS_SYSTEM_VAR.to_string(), is_system.to_string());
        Ok(())
    }

    async fn call_clear_security_context(&mut self) -> Result<(), DbError> {
        self.db
            .counters
            .clear_context_calls
            .fetch_add(1, Ordering::SeqCst);
        if !self.db.procedures_installed.load(Ordering::SeqCst) {
            return Err(MemoryDatabase::missing_function("clear_security_context()"));
        }
        let inert = SessionVariables::inert();
        let vars = self.vars_mut()?;
        vars.insert(PRINCIPAL_ID_VAR.to_string(), inert.principal_id);
        vars.insert(ROLE_VAR.to_string(), inert.role);
        vars.insert(IS_SYSTEM_VAR.to_string(), inert.is_system.to_string());
        Ok(())
    }

    async fn set_session_variable(&mut self, name: &str, value: &str) -> Result<(), DbError> {
        if !self.db.variables_writable.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable(format!(
                "permission denied to set parameter \"{name}\""
            )));
        }
        self.vars_mut()?.insert(name.to_string(), value.to_string());
        self.db
            .counters
            .variable_writes
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn session_variables(&mut self) -> Result<SessionVariables, DbError> {
        Ok(SessionVariables {
            principal_id: self.var(PRINCIPAL_ID_VAR).unwrap_or_default().to_string(),
            role: self.var(ROLE_VAR).unwrap_or("none").to_string(),
            is_system: self.is_system(),
        })
    }
}
