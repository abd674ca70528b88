//! Security principal for one request.
//!
//! A [`Principal`] is produced by identity resolution, lives for exactly one
//! request and is never persisted. Its three fields are what the database
//! session is bound to for row-level filtering.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Principal id used for system-mode requests on public ingestion endpoints.
pub const SYSTEM_PRINCIPAL_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Maximum accepted length of a principal id.
const MAX_PRINCIPAL_ID_LEN: usize = 128;

/// Role a principal acts as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// A patient or other end user who only sees their own records.
    StandardUser,
    /// A professional or organisation issuing documents to users.
    Issuer,
    /// Platform administrator.
    Admin,
}

impl Role {
    /// Session-variable representation read by the database policies.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StandardUser => "standard_user",
            Self::Issuer => "issuer",
            Self::Admin => "admin",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard_user" | "user" => Ok(Self::StandardUser),
            "issuer" => Ok(Self::Issuer),
            "admin" => Ok(Self::Admin),
            other => Err(CoreError::InvalidRole(other.to_string())),
        }
    }
}

/// The resolved identity a request acts as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    id: String,
    role: Role,
    is_system: bool,
}

impl Principal {
    /// Create a non-system principal.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidPrincipalId`] when the id is empty, too
    /// long, or equal to the reserved system id.
    pub fn new(id: impl Into<String>, role: Role) -> Result<Self, CoreError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() || trimmed.len() > MAX_PRINCIPAL_ID_LEN {
            return Err(CoreError::InvalidPrincipalId(id));
        }
        if trimmed == SYSTEM_PRINCIPAL_ID {
            return Err(CoreError::InvalidPrincipalId(id));
        }
        Ok(Self {
            id: trimmed.to_string(),
            role,
            is_system: false,
        })
    }

    /// The conventional system principal used by whitelisted public
    /// ingestion endpoints.
    #[must_use]
    pub fn system() -> Self {
        Self {
            id: SYSTEM_PRINCIPAL_ID.to_string(),
            role: Role::Issuer,
            is_system: true,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn is_system(&self) -> bool {
        self.is_system
    }

    /// Whether this principal holds administrator privilege.
    ///
    /// The system principal is never an administrator.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin && !self.is_system
    }
}

impl Display for Principal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_system {
            write!(f, "system:{}", self.role)
        } else {
            write!(f, "{}:{}", self.role, self.id)
        }
    }
}
