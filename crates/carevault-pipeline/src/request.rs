//! The request as seen by pipeline stages and business handlers.

use std::net::{IpAddr, SocketAddr};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Method, Uri};
use bytes::Bytes;
use carevault_core::{Principal, RequestId};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use crate::error::{HandlerError, PipelineError};

/// An inbound request.
///
/// `principal` starts empty and is filled by the identity stage. A request
/// built with [`PipelineRequest::streaming`] leaves its body unread until
/// [`PipelineRequest::read_body`] runs, which the pipeline does only after
/// every stage has let the request through.
#[derive(Debug)]
pub struct PipelineRequest {
    pub request_id: RequestId,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// Buffered body; empty while the body is still unread.
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    pub principal: Option<Principal>,
    unread: Mutex<Option<UnreadBody>>,
}

struct UnreadBody {
    body: Body,
    limit: usize,
}

impl std::fmt::Debug for UnreadBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnreadBody")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl PipelineRequest {
    /// Request with an already buffered body.
    #[must_use]
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            request_id: RequestId::new(),
            method,
            uri,
            headers,
            body,
            client_ip: None,
            principal: None,
            unread: Mutex::new(None),
        }
    }

    /// Request whose body is read later, up to `limit` bytes.
    #[must_use]
    pub fn streaming(method: Method, uri: Uri, headers: HeaderMap, body: Body, limit: usize) -> Self {
        let mut request = Self::new(method, uri, headers, Bytes::new());
        request.unread = Mutex::new(Some(UnreadBody { body, limit }));
        request
    }

    /// Whether the body still has to be read.
    #[must_use]
    pub fn body_pending(&self) -> bool {
        self.unread.lock().is_some()
    }

    /// Buffer a pending body into [`PipelineRequest::body`]. A no-op once
    /// the body has been read.
    pub async fn read_body(&mut self) -> Result<(), PipelineError> {
        let Some(UnreadBody { body, limit }) = self.unread.get_mut().take() else {
            return Ok(());
        };
        match axum::body::to_bytes(body, limit).await {
            Ok(bytes) => {
                self.body = bytes;
                Ok(())
            }
            Err(err) => {
                tracing::info!(
                    request_id = %self.request_id,
                    limit,
                    error = %err,
                    "Failed to read request body"
                );
                Err(PipelineError::BadRequest(
                    "request body unreadable or too large".into(),
                ))
            }
        }
    }

    #[must_use]
    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    #[must_use]
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    /// Header value as a string, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    #[must_use]
    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    /// Token from an `Authorization: Bearer <token>` header.
    #[must_use]
    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.header("authorization")?;
        let (scheme, token) = value.split_once(' ')?;
        if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
            Some(token.trim())
        } else {
            None
        }
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| HandlerError::Validation(format!("invalid JSON body: {e}")))
    }

    /// Value of a query-string parameter.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.uri.query()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then(|| value.to_string())
        })
    }
}

/// Determine the client IP of a request.
///
/// With `trust_forwarded` set, checks in order:
/// 1. X-Forwarded-For header (first IP in chain)
/// 2. X-Real-IP header
/// 3. Peer address from connection
///
/// Without it only the peer address is used, since the headers are
/// client-controlled when no proxy strips them.
pub fn extract_client_ip(
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
    trust_forwarded: bool,
) -> Option<IpAddr> {
    if trust_forwarded {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            tracing::debug!(ip = %ip, "Extracted IP from X-Forwarded-For");
            return Some(ip);
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok());
        if let Some(ip) = real_ip {
            tracing::debug!(ip = %ip, "Extracted IP from X-Real-IP");
            return Some(ip);
        }
    }

    if let Some(ConnectInfo(addr)) = connect_info {
        return Some(addr.ip());
    }

    tracing::warn!("Could not determine client IP address");
    None
}
