//! Session and pool abstractions the broker binds through.

use async_trait::async_trait;

use crate::error::DbError;

/// Session variable holding the bound principal id.
pub const PRINCIPAL_ID_VAR: &str = "app.current_principal_id";
/// Session variable holding the bound role.
pub const ROLE_VAR: &str = "app.current_role";
/// Session variable holding the system flag.
pub const IS_SYSTEM_VAR: &str = "app.is_system";

/// Values of the three security variables on one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionVariables {
    pub principal_id: String,
    pub role: String,
    pub is_system: bool,
}

impl SessionVariables {
    /// Values that grant nothing under the row-level policies.
    #[must_use]
    pub fn inert() -> Self {
        Self {
            principal_id: String::new(),
            role: "none".to_string(),
            is_system: false,
        }
    }

    /// Whether these values leave the session without any identity.
    #[must_use]
    pub fn is_inert(&self) -> bool {
        self.principal_id.is_empty() && !self.is_system
    }

    /// Interpret the raw `app.is_system` setting the way the policies do.
    #[must_use]
    pub fn parse_flag(raw: &str) -> bool {
        matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "on" | "t" | "1")
    }
}

impl Default for SessionVariables {
    fn default() -> Self {
        Self::inert()
    }
}

/// One database session that can carry a security context.
///
/// Implemented for Postgres connections and for the in-memory session used
/// in tests. Object safe so binders can work on `&mut dyn SecuritySession`.
#[async_trait]
pub trait SecuritySession: Send {
    /// Invoke `set_security_context(principal_id, role, is_system)`.
    async fn call_set_security_context(
        &mut self,
        principal_id: &str,
        role: &str,
        is_system: bool,
    ) -> Result<(), DbError>;

    /// Invoke `clear_security_context()`.
    async fn call_clear_security_context(&mut self) -> Result<(), DbError>;

    /// Set one session-scoped variable (`set_config(name, value, false)`).
    async fn set_session_variable(&mut self, name: &str, value: &str) -> Result<(), DbError>;

    /// Read the three security variables.
    async fn session_variables(&mut self) -> Result<SessionVariables, DbError>;
}

/// A pool of sessions.
#[async_trait]
pub trait SessionPool: Send + Sync {
    type Session: SecuritySession + 'static;

    /// Check out one session. Dropping it returns it to the pool.
    async fn checkout(&self) -> Result<Self::Session, DbError>;

    /// Close a session instead of returning it for reuse.
    fn discard(&self, session: Self::Session) {
        drop(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inert_variables() {
        let vars = SessionVariables::inert();
        assert!(vars.is_inert());
        assert_eq!(vars.role, "none");
    }

    #[test]
    fn test_system_flag_is_not_inert() {
        let vars = SessionVariables {
            principal_id: String::new(),
            role: "issuer".to_string(),
            is_system: true,
        };
        assert!(!vars.is_inert());
    }

    #[test]
    fn test_parse_flag() {
        assert!(SessionVariables::parse_flag("true"));
        assert!(SessionVariables::parse_flag("on"));
        assert!(!SessionVariables::parse_flag("false"));
        assert!(!SessionVariables::parse_flag(""));
    }
}
