//! Tenant context broker.
//!
//! Row-level security policies in the database read three session
//! variables: `app.current_principal_id`, `app.current_role` and
//! `app.is_system`. Connections are pooled, so a value left on a connection
//! would leak into the next request that checks it out. The
//! [`TenantContextBroker`] owns that lifecycle: it binds the variables when a
//! session is checked out for a request and clears them on every exit path.

mod binder;
mod broker;
mod postgres;
mod session;

pub use binder::{default_binders, ContextBinder, FallbackBinder, PrimaryBinder};
pub use broker::{
    BindingError, ContextError, ContextOptions, TenantContextBroker, DEFAULT_HANDLER_TIMEOUT,
};
pub use session::{
    SecuritySession, SessionPool, SessionVariables, IS_SYSTEM_VAR, PRINCIPAL_ID_VAR, ROLE_VAR,
};

/// Clear a session's context with the default binders.
///
/// Used by the pool's release hook; returns whether the session is clean.
pub(crate) async fn release_session(session: &mut dyn SecuritySession) -> bool {
    binder::clear_with(&default_binders(), session).await
}

#[cfg(test)]
mod tests;
