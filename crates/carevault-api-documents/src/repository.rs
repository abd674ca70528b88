//! Row-level isolated data access for the documents API.
//!
//! Every method runs on a session already bound by the broker; visibility
//! is decided by the database policies, never by a WHERE clause here.

use async_trait::async_trait;
use carevault_core::DocumentId;
use carevault_db::{DbError, MemoryRow, MemorySession, SecuritySession};
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use uuid::Uuid;

use crate::models::{Document, NewDocument, Receiver};

const RECEIVERS: &str = "receivers";
const DOCUMENTS: &str = "documents";

/// Data access for receivers and documents on a bound session.
#[async_trait]
pub trait DocumentRepository: SecuritySession {
    async fn find_receiver(&mut self, national_id: &str) -> Result<Option<Receiver>, DbError>;

    async fn insert_document(&mut self, document: &NewDocument) -> Result<Document, DbError>;

    /// Visible documents, newest first.
    async fn list_documents(&mut self, limit: i64) -> Result<Vec<Document>, DbError>;

    async fn delete_document(&mut self, id: DocumentId) -> Result<bool, DbError>;
}

type DocumentRow = (
    Uuid,
    String,
    Option<String>,
    String,
    String,
    String,
    i64,
    DateTime<Utc>,
);

fn document_from_row(row: DocumentRow) -> Document {
    let (id, owner_id, issuer_identifier, file_name, content_type, storage_key, size_bytes, created_at) =
        row;
    Document {
        id: DocumentId::from_uuid(id),
        owner_id,
        issuer_identifier,
        file_name,
        content_type,
        storage_key,
        size_bytes,
        created_at,
    }
}

#[async_trait]
impl DocumentRepository for PoolConnection<Postgres> {
    async fn find_receiver(&mut self, national_id: &str) -> Result<Option<Receiver>, DbError> {
        let row: Option<(Uuid, String, String, Option<String>)> = sqlx::query_as(
            "SELECT id, owner_id, national_id, display_name FROM receivers WHERE national_id = $1",
        )
        .bind(national_id)
        .fetch_optional(&mut **self)
        .await
        .map_err(DbError::from_query)?;

        Ok(row.map(|(id, owner_id, national_id, display_name)| Receiver {
            id,
            owner_id,
            national_id,
            display_name,
        }))
    }

    async fn insert_document(&mut self, document: &NewDocument) -> Result<Document, DbError> {
        let row: DocumentRow = sqlx::query_as(
            r"
            INSERT INTO documents (id, owner_id, issuer_identifier, file_name, content_type, storage_key, size_bytes)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, owner_id, issuer_identifier, file_name, content_type, storage_key, size_bytes, created_at
            ",
        )
        .bind(document.id.as_uuid())
        .bind(&document.owner_id)
        .bind(&document.issuer_identifier)
        .bind(&document.file_name)
        .bind(&document.content_type)
        .bind(&document.storage_key)
        .bind(document.size_bytes)
        .fetch_one(&mut **self)
        .await
        .map_err(DbError::from_query)?;

        Ok(document_from_row(row))
    }

    async fn list_documents(&mut self, limit: i64) -> Result<Vec<Document>, DbError> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            r"
            SELECT id, owner_id, issuer_identifier, file_name, content_type, storage_key, size_bytes, created_at
            FROM documents
            ORDER BY created_at DESC
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(&mut **self)
        .await
        .map_err(DbError::from_query)?;

        Ok(rows.into_iter().map(document_from_row).collect())
    }

    async fn delete_document(&mut self, id: DocumentId) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut **self)
            .await
            .map_err(DbError::from_query)?;
        Ok(result.rows_affected() > 0)
    }
}

fn receiver_from_memory(row: MemoryRow) -> Option<Receiver> {
    Some(Receiver {
        id: row.id,
        national_id: row.data.get("national_id")?.as_str()?.to_string(),
        display_name: row
            .data
            .get("display_name")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        owner_id: row.owner_id,
    })
}

fn document_from_memory(row: &MemoryRow) -> Option<Document> {
    let field = |name: &str| row.data.get(name).and_then(|v| v.as_str());
    Some(Document {
        id: field("document_id")?.parse().ok()?,
        owner_id: row.owner_id.clone(),
        issuer_identifier: field("issuer_identifier").map(str::to_string),
        file_name: field("file_name")?.to_string(),
        content_type: field("content_type")?.to_string(),
        storage_key: field("storage_key")?.to_string(),
        size_bytes: row.data.get("size_bytes")?.as_i64()?,
        created_at: field("created_at")?.parse().ok()?,
    })
}

#[async_trait]
impl DocumentRepository for MemorySession {
    async fn find_receiver(&mut self, national_id: &str) -> Result<Option<Receiver>, DbError> {
        Ok(self
            .select(RECEIVERS)?
            .into_iter()
            .filter_map(receiver_from_memory)
            .find(|r| r.national_id == national_id))
    }

    async fn insert_document(&mut self, document: &NewDocument) -> Result<Document, DbError> {
        let row = self.insert(
            DOCUMENTS,
            &document.owner_id,
            json!({
                "document_id": document.id.to_string(),
                "issuer_identifier": document.issuer_identifier,
                "file_name": document.file_name,
                "content_type": document.content_type,
                "storage_key": document.storage_key,
                "size_bytes": document.size_bytes,
                "created_at": Utc::now().to_rfc3339(),
            }),
        )?;
        document_from_memory(&row)
            .ok_or_else(|| DbError::ValidationFailed("stored document row is malformed".into()))
    }

    async fn list_documents(&mut self, limit: i64) -> Result<Vec<Document>, DbError> {
        let mut documents: Vec<Document> = self
            .select(DOCUMENTS)?
            .iter()
            .filter_map(document_from_memory)
            .collect();
        documents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        documents.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(documents)
    }

    async fn delete_document(&mut self, id: DocumentId) -> Result<bool, DbError> {
        let row_id = self
            .select(DOCUMENTS)?
            .into_iter()
            .find(|row| document_from_memory(row).is_some_and(|d| d.id == id))
            .map(|row| row.id);
        match row_id {
            Some(row_id) => self.delete(DOCUMENTS, row_id),
            None => Ok(false),
        }
    }
}
