//! Tower [`Service`] adapter so a [`Pipeline`] can be mounted on an axum
//! router with `route_service` / `post_service`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;
use axum::response::Response;
use futures::future::BoxFuture;
use tower::Service;

use crate::pipeline::Pipeline;
use crate::request::{extract_client_ip, PipelineRequest};

/// Default maximum buffered request body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Serves HTTP requests through a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineService {
    pipeline: Pipeline,
    max_body_bytes: usize,
    trust_forwarded_headers: bool,
}

impl PipelineService {
    #[must_use]
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            trust_forwarded_headers: false,
        }
    }

    #[must_use]
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Take the client IP from `X-Forwarded-For` / `X-Real-IP`. Enable only
    /// behind a proxy that overwrites these headers.
    #[must_use]
    pub fn trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    /// Body reading is deferred to the end of the stage chain.
    async fn serve(self, req: Request<Body>) -> Response {
        let (parts, body) = req.into_parts();
        let client_ip = extract_client_ip(
            &parts.headers,
            parts.extensions.get::<ConnectInfo<SocketAddr>>(),
            self.trust_forwarded_headers,
        );

        let mut request = PipelineRequest::streaming(
            parts.method,
            parts.uri,
            parts.headers,
            body,
            self.max_body_bytes,
        );
        request.client_ip = client_ip;
        self.pipeline.execute(request).await
    }
}

impl Service<Request<Body>> for PipelineService {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.serve(req).await) })
    }
}
