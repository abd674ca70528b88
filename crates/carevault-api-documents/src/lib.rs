//! Document API for CareVault.
//!
//! The public submission endpoint, the authenticated listing endpoint and
//! the administrator audit endpoints, each mounted behind its own request
//! pipeline.

pub mod handlers;
pub mod models;
pub mod repository;
pub mod router;
pub mod storage;

pub use handlers::{
    BreakerStatusHandler, ListAuditHandler, ListDocumentsHandler, PurgeAuditHandler,
    SubmitDocumentHandler,
};
pub use models::{
    Document, DocumentListResponse, NewDocument, PurgeRequest, PurgeResponse, Receiver,
    SubmitDocumentRequest, SubmitDocumentResponse,
};
pub use repository::DocumentRepository;
pub use router::{
    documents_router, DocumentsApi, DocumentsApiConfig, DOCUMENT_STORE_BREAKER, SUBMISSION_SCOPE,
};
pub use storage::{DocumentStorage, LocalDocumentStorage, StorageError, StoredObject};
