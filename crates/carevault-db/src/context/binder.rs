//! Strategies for writing the security context onto a session.
//!
//! [`PrimaryBinder`] uses the stored routines installed by the migrations.
//! [`FallbackBinder`] writes the three variables one statement at a time and
//! is only reached when the routines are missing or failing.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use super::session::{SecuritySession, SessionVariables, IS_SYSTEM_VAR, PRINCIPAL_ID_VAR, ROLE_VAR};
use crate::error::DbError;

/// One way of binding and clearing a session's security context.
#[async_trait]
pub trait ContextBinder: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn bind(
        &self,
        session: &mut dyn SecuritySession,
        vars: &SessionVariables,
    ) -> Result<(), DbError>;

    async fn clear(&self, session: &mut dyn SecuritySession) -> Result<(), DbError>;
}

/// Binds through `set_security_context` / `clear_security_context`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrimaryBinder;

#[async_trait]
impl ContextBinder for PrimaryBinder {
    fn name(&self) -> &'static str {
        "stored_procedure"
    }

    async fn bind(
        &self,
        session: &mut dyn SecuritySession,
        vars: &SessionVariables,
    ) -> Result<(), DbError> {
        session
            .call_set_security_context(&vars.principal_id, &vars.role, vars.is_system)
            .await
    }

    async fn clear(&self, session: &mut dyn SecuritySession) -> Result<(), DbError> {
        session.call_clear_security_context().await
    }
}

/// Sets `app.current_principal_id`, `app.current_role` and `app.is_system`
/// individually.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackBinder;

impl FallbackBinder {
    async fn write(
        session: &mut dyn SecuritySession,
        vars: &SessionVariables,
    ) -> Result<(), DbError> {
        let is_system = if vars.is_system { "true" } else { "false" };
        session
            .set_session_variable(PRINCIPAL_ID_VAR, &vars.principal_id)
            .await?;
        session.set_session_variable(ROLE_VAR, &vars.role).await?;
        session.set_session_variable(IS_SYSTEM_VAR, is_system).await
    }
}

#[async_trait]
impl ContextBinder for FallbackBinder {
    fn name(&self) -> &'static str {
        "session_variables"
    }

    async fn bind(
        &self,
        session: &mut dyn SecuritySession,
        vars: &SessionVariables,
    ) -> Result<(), DbError> {
        Self::write(session, vars).await
    }

    async fn clear(&self, session: &mut dyn SecuritySession) -> Result<(), DbError> {
        Self::write(session, &SessionVariables::inert()).await
    }
}

/// The primary binder followed by the fallback.
#[must_use]
pub fn default_binders() -> Vec<Arc<dyn ContextBinder>> {
    vec![Arc::new(PrimaryBinder), Arc::new(FallbackBinder)]
}

/// Clear the context with each binder in turn until one succeeds.
///
/// Returns whether the session is known to be clean. Never fails.
pub(crate) async fn clear_with(
    binders: &[Arc<dyn ContextBinder>],
    session: &mut dyn SecuritySession,
) -> bool {
    for (index, binder) in binders.iter().enumerate() {
        match binder.clear(&mut *session).await {
            Ok(()) => {
                if index > 0 {
                    tracing::warn!(
                        target: "tenant_context",
                        binder = binder.name(),
                        "Security context cleared through fallback binder"
                    );
                }
                return true;
            }
            Err(err) => {
                tracing::warn!(
                    target: "tenant_context",
                    binder = binder.name(),
                    error = %err,
                    "Failed to clear security context"
                );
            }
        }
    }

    tracing::error!(
        target: "tenant_context",
        "Security context could not be cleared by any binder"
    );
    false
}
