//! Request and response types for the documents API.

use carevault_core::DocumentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of a national identifier.
pub const MAX_NATIONAL_ID_LEN: usize = 32;

/// Maximum length of a stored file name.
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Body of `POST /public/documents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitDocumentRequest {
    /// National identifier of the receiving user.
    pub national_id: String,
    /// Identifier of the issuing professional or organisation.
    pub issuer_identifier: String,
    pub file_name: String,
    pub content_type: String,
    /// Document content, standard base64.
    pub content_base64: String,
}

impl SubmitDocumentRequest {
    /// Check field formats. Returns a message naming the first bad field.
    pub fn validate(&self) -> Result<(), String> {
        validate_national_id(&self.national_id)?;
        if self.issuer_identifier.trim().is_empty() || self.issuer_identifier.len() > 128 {
            return Err("issuer_identifier must be 1-128 characters".to_string());
        }
        let name = self.file_name.trim();
        if name.is_empty()
            || name.len() > MAX_FILE_NAME_LEN
            || name.contains(['/', '\\'])
            || name.chars().any(char::is_control)
        {
            return Err("file_name must be a plain file name".to_string());
        }
        if !self.content_type.contains('/') || self.content_type.len() > 127 {
            return Err("content_type must be a MIME type".to_string());
        }
        Ok(())
    }
}

/// National identifiers are ASCII alphanumerics, optionally with dashes.
pub fn validate_national_id(national_id: &str) -> Result<(), String> {
    let valid = !national_id.is_empty()
        && national_id.len() <= MAX_NATIONAL_ID_LEN
        && national_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        && national_id.chars().any(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err("national_id is not a valid identifier".to_string())
    }
}

/// Response of an accepted submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitDocumentResponse {
    pub document_id: DocumentId,
    pub status: String,
}

/// A registered receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receiver {
    pub id: Uuid,
    pub owner_id: String,
    pub national_id: String,
    pub display_name: Option<String>,
}

/// Document metadata to persist.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: DocumentId,
    pub owner_id: String,
    pub issuer_identifier: String,
    pub file_name: String,
    pub content_type: String,
    pub storage_key: String,
    pub size_bytes: i64,
}

/// Stored document metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub owner_id: String,
    pub issuer_identifier: Option<String>,
    pub file_name: String,
    pub content_type: String,
    #[serde(skip_serializing)]
    pub storage_key: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

/// Response of `GET /documents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentListResponse {
    pub documents: Vec<Document>,
}

/// Body of `POST /admin/audit/purge`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeRequest {
    pub cutoff: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub removed: u64,
}
