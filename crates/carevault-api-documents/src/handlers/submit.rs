//! Public document submission.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use bytes::Bytes;
use carevault_core::DocumentId;
use carevault_db::{
    AuditAction, AuditOrigin, AuditStatus, AuditWriter, NewAuditEntry, SessionPool,
};
use carevault_pipeline::{HandlerError, PipelineError, PipelineRequest, ScopedHandler, SessionScope};
use futures::FutureExt;

use super::{audit_failure, dependency};
use crate::models::{NewDocument, SubmitDocumentRequest, SubmitDocumentResponse};
use crate::repository::DocumentRepository;
use crate::storage::DocumentStorage;

/// Default maximum decoded document size.
pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 5 * 1024 * 1024;

/// Accepts a document for a receiver identified by national id.
///
/// Runs in system mode: the caller is anonymous, and the receiver lookup
/// must see every registered receiver. A bound session is held only for
/// the receiver lookup and the document insert; the upload and every audit
/// write happen between them, with no session checked out.
///
/// The audit record is part of the deliverable, so it is written before
/// the 202 and its failure fails the request.
#[derive(Debug, Clone)]
pub struct SubmitDocumentHandler {
    storage: Arc<dyn DocumentStorage>,
    audit: AuditWriter,
    max_document_bytes: usize,
}

impl SubmitDocumentHandler {
    #[must_use]
    pub fn new(storage: Arc<dyn DocumentStorage>, audit: AuditWriter) -> Self {
        Self {
            storage,
            audit,
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
        }
    }

    #[must_use]
    pub fn with_max_document_bytes(mut self, max: usize) -> Self {
        self.max_document_bytes = max;
        self
    }

    fn decode_content(&self, body: &SubmitDocumentRequest) -> Result<Vec<u8>, HandlerError> {
        let content = base64::engine::general_purpose::STANDARD
            .decode(body.content_base64.as_bytes())
            .map_err(|_| HandlerError::Validation("content_base64 is not valid base64".into()))?;
        if content.is_empty() || content.len() > self.max_document_bytes {
            return Err(HandlerError::Validation(format!(
                "document must be between 1 and {} bytes",
                self.max_document_bytes
            )));
        }
        Ok(content)
    }

    fn audit_entry(
        req: &PipelineRequest,
        body: &SubmitDocumentRequest,
        status: AuditStatus,
    ) -> NewAuditEntry {
        NewAuditEntry::new(
            AuditAction::DocumentSubmitted,
            AuditOrigin::PublicSubmission,
            status,
        )
        .receiver(&body.national_id)
        .issuer(&body.issuer_identifier)
        .client(
            req.client_ip.map(|ip| ip.to_string()),
            req.user_agent().map(str::to_string),
        )
        .with_metadata("request_id", req.request_id.to_string())
    }

    async fn discard_upload(&self, key: &str) {
        if let Err(err) = self.storage.delete(key).await {
            tracing::error!(key = %key, error = %err, "Failed to remove orphaned document content");
        }
    }
}

#[async_trait]
impl<P> ScopedHandler<P> for SubmitDocumentHandler
where
    P: SessionPool + 'static,
    P::Session: DocumentRepository,
{
    async fn handle(
        &self,
        scope: &SessionScope<'_, P>,
        req: PipelineRequest,
    ) -> Result<Response, PipelineError> {
        let body: SubmitDocumentRequest = req.json()?;
        body.validate().map_err(HandlerError::Validation)?;
        let content = self.decode_content(&body)?;

        let national_id = body.national_id.clone();
        let receiver = scope
            .run(move |session| {
                async move { session.find_receiver(&national_id).await.map_err(dependency) }
                    .boxed()
            })
            .await?;

        let Some(receiver) = receiver else {
            tracing::info!(
                request_id = %req.request_id,
                issuer = %body.issuer_identifier,
                "Document submitted for unknown identifier"
            );
            self.audit
                .record(Self::audit_entry(&req, &body, AuditStatus::UserNotFound))
                .await
                .map_err(audit_failure)?;
            return Err(HandlerError::NotFound("identifier not found".to_string()).into());
        };

        let document_id = DocumentId::new();
        let storage_key = format!("{}/{}", receiver.id, document_id);
        let stored = match self
            .storage
            .upload(&storage_key, &body.content_type, Bytes::from(content))
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!(key = %storage_key, error = %err, "Document upload failed");
                self.audit
                    .record_best_effort(
                        Self::audit_entry(&req, &body, AuditStatus::Failure)
                            .with_metadata("reason", "storage_unavailable"),
                    )
                    .await;
                return Err(HandlerError::Dependency(err.to_string()).into());
            }
        };

        let new_document = NewDocument {
            id: document_id,
            owner_id: receiver.owner_id.clone(),
            issuer_identifier: body.issuer_identifier.clone(),
            file_name: body.file_name.trim().to_string(),
            content_type: body.content_type.clone(),
            storage_key: stored.key.clone(),
            size_bytes: i64::try_from(stored.size_bytes).unwrap_or(i64::MAX),
        };
        let inserted = scope
            .run(move |session| {
                async move { session.insert_document(&new_document).await.map_err(dependency) }
                    .boxed()
            })
            .await;
        let document = match inserted {
            Ok(document) => document,
            Err(err) => {
                self.discard_upload(&storage_key).await;
                return Err(err);
            }
        };

        let entry = Self::audit_entry(&req, &body, AuditStatus::Success)
            .resource("document", document.id.to_string())
            .with_metadata("size_bytes", document.size_bytes);
        if let Err(err) = self.audit.record(entry).await {
            // Without its audit record the submission must not exist.
            let unaudited = document.id;
            let rollback = scope
                .run(move |session| {
                    async move { session.delete_document(unaudited).await.map_err(dependency) }
                        .boxed()
                })
                .await;
            if let Err(rollback_err) = rollback {
                tracing::error!(document_id = %unaudited, error = %rollback_err, "Failed to roll back unaudited document");
            }
            self.discard_upload(&storage_key).await;
            return Err(audit_failure(err).into());
        }

        tracing::info!(
            request_id = %req.request_id,
            document_id = %document.id,
            size_bytes = document.size_bytes,
            "Document accepted"
        );

        Ok((
            StatusCode::ACCEPTED,
            Json(SubmitDocumentResponse {
                document_id: document.id,
                status: "accepted".to_string(),
            }),
        )
            .into_response())
    }
}
