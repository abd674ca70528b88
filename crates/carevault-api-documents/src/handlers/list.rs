//! Authenticated document listing.

use async_trait::async_trait;
use axum::response::{IntoResponse, Response};
use axum::Json;
use carevault_pipeline::{BusinessHandler, HandlerError, PipelineRequest};

use super::{dependency, limit_param};
use crate::models::DocumentListResponse;
use crate::repository::DocumentRepository;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

/// Lists the documents visible to the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListDocumentsHandler;

#[async_trait]
impl<S: DocumentRepository> BusinessHandler<S> for ListDocumentsHandler {
    async fn handle(&self, session: &mut S, req: PipelineRequest) -> Result<Response, HandlerError> {
        let limit = limit_param(&req, DEFAULT_LIMIT, MAX_LIMIT)?;
        let documents = session.list_documents(limit).await.map_err(dependency)?;
        Ok(Json(DocumentListResponse { documents }).into_response())
    }
}
