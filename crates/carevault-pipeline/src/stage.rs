//! Stage composition.
//!
//! A request runs through an ordered slice of [`Stage`]s and ends at an
//! [`Endpoint`]. Each stage receives a [`Next`] continuation and decides
//! whether to call it.

use std::sync::Arc;

use async_trait::async_trait;
use axum::response::Response;

use crate::error::PipelineError;
use crate::request::PipelineRequest;

/// One step of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Handle the request, calling `next.run(req)` to continue.
    async fn handle(
        &self,
        req: PipelineRequest,
        next: Next<'_>,
    ) -> Result<Response, PipelineError>;
}

/// Terminal step producing the response.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, req: PipelineRequest) -> Result<Response, PipelineError>;
}

/// The remaining stages plus the endpoint.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub(crate) fn new(stages: &'a [Arc<dyn Stage>], endpoint: &'a dyn Endpoint) -> Self {
        Self { stages, endpoint }
    }

    /// Run the rest of the chain.
    ///
    /// The request body is read only once the last stage has passed the
    /// request on, so rejected requests never have their body buffered.
    pub async fn run(self, mut req: PipelineRequest) -> Result<Response, PipelineError> {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                tracing::trace!(stage = stage.name(), request_id = %req.request_id, "Entering stage");
                stage.handle(req, Next::new(rest, self.endpoint)).await
            }
            None => {
                req.read_body().await?;
                self.endpoint.call(req).await
            }
        }
    }
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field(
                "stages",
                &self.stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderMap, Method, StatusCode, Uri};
    use axum::response::IntoResponse;
    use bytes::Bytes;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Recorder {
        fn push(&self, s: impl Into<String>) {
            self.0.lock().unwrap().push(s.into());
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    struct Tag {
        name: &'static str,
        log: Arc<Recorder>,
        short_circuit: bool,
    }

    #[async_trait]
    impl Stage for Tag {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(
            &self,
            req: PipelineRequest,
            next: Next<'_>,
        ) -> Result<Response, PipelineError> {
            self.log.push(format!("enter:{}", self.name));
            if self.short_circuit {
                return Err(PipelineError::Forbidden);
            }
            let result = next.run(req).await;
            self.log.push(format!("leave:{}", self.name));
            result
        }
    }

    struct Ok200(Arc<Recorder>);

    #[async_trait]
    impl Endpoint for Ok200 {
        async fn call(&self, req: PipelineRequest) -> Result<Response, PipelineError> {
            self.0.push(format!("endpoint:{}", req.body.len()));
            Ok(StatusCode::OK.into_response())
        }
    }

    fn streaming(len: usize, limit: usize) -> PipelineRequest {
        PipelineRequest::streaming(
            Method::POST,
            Uri::from_static("/"),
            HeaderMap::new(),
            Body::from(vec![b'x'; len]),
            limit,
        )
    }

    fn request() -> PipelineRequest {
        PipelineRequest::new(Method::GET, Uri::from_static("/"), HeaderMap::new(), Bytes::new())
    }

    fn tag(name: &'static str, log: &Arc<Recorder>, short_circuit: bool) -> Arc<dyn Stage> {
        Arc::new(Tag {
            name,
            log: log.clone(),
            short_circuit,
        })
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let log = Arc::new(Recorder::default());
        let stages = vec![tag("a", &log, false), tag("b", &log, false)];
        let endpoint = Ok200(log.clone());

        let response = Next::new(&stages, &endpoint).run(request()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            log.take(),
            vec!["enter:a", "enter:b", "endpoint:0", "leave:b", "leave:a"]
        );
    }

    #[tokio::test]
    async fn test_body_is_read_after_the_last_stage() {
        let log = Arc::new(Recorder::default());
        let stages = vec![tag("a", &log, false)];
        let endpoint = Ok200(log.clone());

        let response = Next::new(&stages, &endpoint)
            .run(streaming(16, 64))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(log.take(), vec!["enter:a", "endpoint:16", "leave:a"]);
    }

    #[tokio::test]
    async fn test_short_circuit_wins_over_oversized_body() {
        let log = Arc::new(Recorder::default());
        let stages = vec![tag("a", &log, true)];
        let endpoint = Ok200(log.clone());

        let result = Next::new(&stages, &endpoint).run(streaming(128, 64)).await;

        assert!(matches!(result, Err(PipelineError::Forbidden)));
        assert_eq!(log.take(), vec!["enter:a"]);
    }

    #[tokio::test]
    async fn test_oversized_body_never_reaches_endpoint() {
        let log = Arc::new(Recorder::default());
        let stages = vec![tag("a", &log, false)];
        let endpoint = Ok200(log.clone());

        let result = Next::new(&stages, &endpoint).run(streaming(128, 64)).await;

        assert!(matches!(result, Err(PipelineError::BadRequest(_))));
        assert_eq!(log.take(), vec!["enter:a", "leave:a"]);
    }

    #[tokio::test]
    async fn test_stage_can_short_circuit() {
        let log = Arc::new(Recorder::default());
        let stages = vec![tag("a", &log, true), tag("b", &log, false)];
        let endpoint = Ok200(log.clone());

        let result = Next::new(&stages, &endpoint).run(request()).await;

        assert!(matches!(result, Err(PipelineError::Forbidden)));
        assert_eq!(log.take(), vec!["enter:a"]);
    }
}
