//! CareVault Core Library
//!
//! Shared types for the CareVault services.
//!
//! # Modules
//!
//! - [`ids`] - Strongly typed identifiers (DocumentId, AuditEntryId, RequestId)
//! - [`principal`] - The per-request security principal and its role
//! - [`clock`] - Injectable wall-clock time source
//! - [`error`] - Standardized error types (CoreError)
//!
//! # Example
//!
//! ```
//! use carevault_core::{Principal, Role};
//!
//! let principal = Principal::new("user-123", Role::StandardUser).unwrap();
//! assert!(!principal.is_system());
//!
//! let system = Principal::system();
//! assert!(system.is_system());
//! assert_eq!(system.role(), Role::Issuer);
//! ```

pub mod clock;
pub mod error;
pub mod ids;
pub mod principal;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{CoreError, Result};
pub use ids::{AuditEntryId, DocumentId, ParseIdError, RequestId};
pub use principal::{Principal, Role, SYSTEM_PRINCIPAL_ID};
