//! Request-scoped binding of a principal to a database session.

use std::any::Any;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use carevault_core::{Principal, Role};
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;

use super::binder::{clear_with, default_binders, ContextBinder};
use super::session::{SecuritySession, SessionPool, SessionVariables};
use crate::error::DbError;

/// Default hard timeout for a handler running inside a bound session.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(8);

/// Every binder failed to write the security context.
#[derive(Debug, Error)]
#[error("could not bind security context for {principal}: {}", .attempts.join("; "))]
pub struct BindingError {
    pub principal: String,
    /// One message per binder tried, in order.
    pub attempts: Vec<String>,
}

/// Errors from [`TenantContextBroker::run_with_context`].
///
/// `E` is the business handler's error type.
#[derive(Debug, Error)]
pub enum ContextError<E = Infallible> {
    /// No principal and the route is not in system mode.
    #[error("authentication required")]
    Unauthenticated,

    /// The principal's role is not allowed on this route.
    #[error("role {0} is not permitted for this operation")]
    Forbidden(Role),

    #[error(transparent)]
    Binding(#[from] BindingError),

    /// No session could be checked out.
    #[error("database session unavailable: {0}")]
    Session(#[source] DbError),

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    /// The handler's own error, returned after the session was released.
    #[error("{0}")]
    Handler(E),
}

impl ContextError {
    /// Re-type a pre-handler error for a specific handler error type.
    #[must_use]
    pub fn widen<E>(self) -> ContextError<E> {
        match self {
            ContextError::Unauthenticated => ContextError::Unauthenticated,
            ContextError::Forbidden(role) => ContextError::Forbidden(role),
            ContextError::Binding(err) => ContextError::Binding(err),
            ContextError::Session(err) => ContextError::Session(err),
            ContextError::Timeout(after) => ContextError::Timeout(after),
            ContextError::Handler(never) => match never {},
        }
    }
}

/// Per-call options for [`TenantContextBroker::run_with_context`].
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// Bind [`Principal::system`] instead of the caller. Only whitelisted
    /// public ingestion routes set this.
    pub system_mode: bool,
    /// Roles allowed to run the handler; empty means any authenticated role.
    pub required_roles: Vec<Role>,
    /// Overrides the broker's handler timeout.
    pub timeout: Option<Duration>,
}

impl ContextOptions {
    /// Any authenticated principal.
    #[must_use]
    pub fn authenticated() -> Self {
        Self::default()
    }

    /// System mode for public ingestion routes.
    #[must_use]
    pub fn system() -> Self {
        Self {
            system_mode: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn require_roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.required_roles = roles.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Binds principals to sessions checked out from `P`.
///
/// The broker is stateless apart from its configuration; clones share the
/// underlying pool.
#[derive(Debug, Clone)]
pub struct TenantContextBroker<P> {
    pool: P,
    binders: Vec<Arc<dyn ContextBinder>>,
    handler_timeout: Duration,
}

impl<P: SessionPool> TenantContextBroker<P> {
    /// Broker with the primary and fallback binders and the default timeout.
    #[must_use]
    pub fn new(pool: P) -> Self {
        Self {
            pool,
            binders: default_binders(),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Replace the binding strategies, tried in order.
    #[must_use]
    pub fn with_binders(mut self, binders: Vec<Arc<dyn ContextBinder>>) -> Self {
        self.binders = binders;
        self
    }

    #[must_use]
    pub fn pool(&self) -> &P {
        &self.pool
    }

    #[must_use]
    pub fn handler_timeout(&self) -> Duration {
        self.handler_timeout
    }

    /// Bind `principal` to `session`.
    ///
    /// `system_override` binds the principal with the system flag set
    /// regardless of its own flag. On error the session may be partially
    /// bound; the caller must [`release`](Self::release) it.
    pub async fn bind<S: SecuritySession>(
        &self,
        session: &mut S,
        principal: &Principal,
        system_override: bool,
    ) -> Result<(), BindingError> {
        let vars = SessionVariables {
            principal_id: principal.id().to_string(),
            role: principal.role().as_str().to_string(),
            is_system: principal.is_system() || system_override,
        };
        self.bind_vars(session, &vars, principal).await
    }

    async fn bind_vars(
        &self,
        session: &mut dyn SecuritySession,
        vars: &SessionVariables,
        principal: &Principal,
    ) -> Result<(), BindingError> {
        let mut attempts = Vec::with_capacity(self.binders.len());

        for (index, binder) in self.binders.iter().enumerate() {
            match binder.bind(&mut *session, vars).await {
                Ok(()) => {
                    if index > 0 {
                        tracing::warn!(
                            target: "tenant_context",
                            binder = binder.name(),
                            principal = %principal,
                            "Security context bound through fallback binder"
                        );
                    } else {
                        tracing::debug!(
                            target: "tenant_context",
                            principal = %principal,
                            is_system = vars.is_system,
                            "Security context bound"
                        );
                    }
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        target: "tenant_context",
                        binder = binder.name(),
                        principal = %principal,
                        error = %err,
                        "Security context binder failed"
                    );
                    attempts.push(format!("{}: {}", binder.name(), err));
                }
            }
        }

        tracing::error!(
            target: "tenant_context",
            principal = %principal,
            "Security context could not be bound by any binder"
        );
        Err(BindingError {
            principal: principal.to_string(),
            attempts,
        })
    }

    /// Clear the security context. Never fails; failures are logged.
    pub async fn release<S: SecuritySession>(&self, session: &mut S) {
        clear_with(&self.binders, session).await;
    }

    /// Check out a session, bind the effective principal, run `handler`
    /// under the timeout and release the session on every path.
    ///
    /// Unauthenticated and wrong-role callers are rejected before any
    /// session is checked out. A handler panic is resumed after release.
    pub async fn run_with_context<T, E, F>(
        &self,
        principal: Option<&Principal>,
        options: &ContextOptions,
        handler: F,
    ) -> Result<T, ContextError<E>>
    where
        F: for<'c> FnOnce(&'c mut P::Session) -> BoxFuture<'c, Result<T, E>> + Send,
    {
        let effective = self.authorize(principal, options).map_err(ContextError::widen)?;

        let mut session = self.pool.checkout().await.map_err(|err| {
            tracing::warn!(
                target: "tenant_context",
                error = %err,
                "Failed to check out database session"
            );
            ContextError::Session(err)
        })?;

        if let Err(err) = self.bind(&mut session, &effective, false).await {
            self.finish(session).await;
            return Err(err.into());
        }

        let timeout = options.timeout.unwrap_or(self.handler_timeout);
        let started = Instant::now();
        let outcome = AssertUnwindSafe(tokio::time::timeout(timeout, handler(&mut session)))
            .catch_unwind()
            .await;

        self.finish(session).await;

        match outcome {
            Ok(Ok(result)) => result.map_err(ContextError::Handler),
            Ok(Err(_elapsed)) => {
                tracing::warn!(
                    target: "tenant_context",
                    principal = %effective,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Handler timed out, session released"
                );
                Err(ContextError::Timeout(timeout))
            }
            Err(panic) => resume_after_release(&effective, panic),
        }
    }

    /// Resolve the principal a route runs as, without touching the pool.
    ///
    /// System-mode routes run as the system principal. Other routes need a
    /// caller, never the system principal, holding one of the required
    /// roles.
    pub fn authorize(
        &self,
        principal: Option<&Principal>,
        options: &ContextOptions,
    ) -> Result<Principal, ContextError> {
        if options.system_mode {
            return Ok(Principal::system());
        }

        let principal = principal.ok_or(ContextError::Unauthenticated)?;

        // The system principal is only reachable through system mode.
        if principal.is_system() {
            tracing::warn!(
                target: "tenant_context",
                "System principal presented on a non-system route"
            );
            return Err(ContextError::Forbidden(principal.role()));
        }

        if !options.required_roles.is_empty() && !options.required_roles.contains(&principal.role())
        {
            tracing::warn!(
                target: "tenant_context",
                principal = %principal,
                required = ?options.required_roles,
                "Principal role not permitted"
            );
            return Err(ContextError::Forbidden(principal.role()));
        }

        Ok(principal.clone())
    }

    /// Release, then return the session to the pool or discard it if its
    /// context could not be cleared.
    async fn finish(&self, mut session: P::Session) {
        if !clear_with(&self.binders, &mut session).await {
            self.pool.discard(session);
        }
    }
}

fn resume_after_release<T>(principal: &Principal, panic: Box<dyn Any + Send>) -> T {
    tracing::error!(
        target: "tenant_context",
        principal = %principal,
        "Handler panicked, session released before unwinding"
    );
    std::panic::resume_unwind(panic)
}
