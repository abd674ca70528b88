//! Audit log model.
//!
//! Records document handling and security events. Entries are immutable;
//! the only removal path is the retention purge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// Audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    DocumentSubmitted,
    AuthenticationFailed,
    AccessDenied,
    RateLimited,
    ContextBindingFailed,
    RetentionPurge,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditAction::DocumentSubmitted => write!(f, "document_submitted"),
            AuditAction::AuthenticationFailed => write!(f, "authentication_failed"),
            AuditAction::AccessDenied => write!(f, "access_denied"),
            AuditAction::RateLimited => write!(f, "rate_limited"),
            AuditAction::ContextBindingFailed => write!(f, "context_binding_failed"),
            AuditAction::RetentionPurge => write!(f, "retention_purge"),
        }
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "document_submitted" => Ok(AuditAction::DocumentSubmitted),
            "authentication_failed" => Ok(AuditAction::AuthenticationFailed),
            "access_denied" => Ok(AuditAction::AccessDenied),
            "rate_limited" => Ok(AuditAction::RateLimited),
            "context_binding_failed" => Ok(AuditAction::ContextBindingFailed),
            "retention_purge" => Ok(AuditAction::RetentionPurge),
            _ => Err(format!("Invalid audit action: {s}")),
        }
    }
}

/// Outcome recorded with an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Success,
    Failure,
    UserNotFound,
    Denied,
    RateLimited,
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditStatus::Success => write!(f, "SUCCESS"),
            AuditStatus::Failure => write!(f, "FAILURE"),
            AuditStatus::UserNotFound => write!(f, "USER_NOT_FOUND"),
            AuditStatus::Denied => write!(f, "DENIED"),
            AuditStatus::RateLimited => write!(f, "RATE_LIMITED"),
        }
    }
}

impl std::str::FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SUCCESS" => Ok(AuditStatus::Success),
            "FAILURE" => Ok(AuditStatus::Failure),
            "USER_NOT_FOUND" => Ok(AuditStatus::UserNotFound),
            "DENIED" => Ok(AuditStatus::Denied),
            "RATE_LIMITED" => Ok(AuditStatus::RateLimited),
            _ => Err(format!("Invalid audit status: {s}")),
        }
    }
}

/// Channel through which the audited event arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOrigin {
    PublicSubmission,
    AuthenticatedApi,
}

impl std::fmt::Display for AuditOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditOrigin::PublicSubmission => write!(f, "public_submission"),
            AuditOrigin::AuthenticatedApi => write!(f, "authenticated_api"),
        }
    }
}

/// Audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub action: String,
    pub origin: String,
    /// National identifier of the receiving user, where the record requires it.
    pub receiver_identifier: Option<String>,
    /// Identifier of the issuing professional or organisation.
    pub issuer_identifier: Option<String>,
    /// SHA-256 of the acting identity; the plain value is never stored.
    pub actor_identifier_hash: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub metadata: JsonValue,
}

impl AuditLogEntry {
    #[must_use]
    pub fn action_enum(&self) -> Option<AuditAction> {
        self.action.parse().ok()
    }

    #[must_use]
    pub fn status_enum(&self) -> Option<AuditStatus> {
        self.status.parse().ok()
    }
}

/// Input for creating an audit log entry.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub action: AuditAction,
    pub origin: AuditOrigin,
    pub status: AuditStatus,
    pub receiver_identifier: Option<String>,
    pub issuer_identifier: Option<String>,
    pub actor_identifier_hash: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: JsonValue,
}

impl NewAuditEntry {
    #[must_use]
    pub fn new(action: AuditAction, origin: AuditOrigin, status: AuditStatus) -> Self {
        Self {
            action,
            origin,
            status,
            receiver_identifier: None,
            issuer_identifier: None,
            actor_identifier_hash: None,
            resource_type: None,
            resource_id: None,
            ip_address: None,
            user_agent: None,
            metadata: JsonValue::Object(serde_json::Map::new()),
        }
    }

    #[must_use]
    pub fn receiver(mut self, identifier: impl Into<String>) -> Self {
        self.receiver_identifier = Some(identifier.into());
        self
    }

    #[must_use]
    pub fn issuer(mut self, identifier: impl Into<String>) -> Self {
        self.issuer_identifier = Some(identifier.into());
        self
    }

    /// Record the acting identity as a hash.
    #[must_use]
    pub fn actor(mut self, identifier: &str) -> Self {
        self.actor_identifier_hash = Some(hash_identifier(identifier));
        self
    }

    #[must_use]
    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    #[must_use]
    pub fn client(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }

    /// Add one metadata field. Metadata is always a JSON object.
    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        if let JsonValue::Object(map) = &mut self.metadata {
            map.insert(key.to_string(), value.into());
        }
        self
    }
}

/// Filter options for querying the audit log.
#[derive(Debug, Clone, Default)]
pub struct AuditLogFilter {
    pub action: Option<AuditAction>,
    pub status: Option<AuditStatus>,
    pub actor_identifier_hash: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl AuditLogFilter {
    /// Whether `entry` satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.action.map_or(true, |a| entry.action == a.to_string())
            && self.status.map_or(true, |s| entry.status == s.to_string())
            && self
                .actor_identifier_hash
                .as_ref()
                .map_or(true, |h| entry.actor_identifier_hash.as_ref() == Some(h))
            && self.start_date.map_or(true, |d| entry.created_at >= d)
            && self.end_date.map_or(true, |d| entry.created_at <= d)
    }
}

/// Lowercase hex SHA-256 of an identifier.
#[must_use]
pub fn hash_identifier(identifier: &str) -> String {
    hex::encode(Sha256::digest(identifier.as_bytes()))
}
