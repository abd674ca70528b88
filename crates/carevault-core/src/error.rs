//! Error Types
//!
//! Errors raised while constructing core values.

use thiserror::Error;

/// Errors from core type construction and parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// The role string does not name a known role.
    #[error("Invalid role: {0}")]
    InvalidRole(String),

    /// The principal id is empty, too long, or reserved.
    #[error("Invalid principal id: '{0}'")]
    InvalidPrincipalId(String),
}

/// Type alias for Results using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            CoreError::InvalidRole("root".to_string()).to_string(),
            "Invalid role: root"
        );
        assert_eq!(
            CoreError::InvalidPrincipalId(String::new()).to_string(),
            "Invalid principal id: ''"
        );
    }
}
