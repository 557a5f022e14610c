use crate::ProxyBody;
use http::StatusCode;
use hyper::Response;
use serde_json::json;
use shared::http::make_json_response;
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] crate::config::ValidationError),
    #[error("invalid URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("store error: {0}")]
    Store(#[from] directory::store::StoreError),
    #[error("directory load error: {0}")]
    DirectoryLoad(#[from] directory::directory::LoadError),
    #[error("invalid realm header: {0}")]
    InvalidHeader(#[from] http::header::InvalidHeaderName),
    #[error("shard operations error: {0}")]
    ShardOps(#[from] crate::shard_ops::ShardOpsError),
    #[error("handoff error: {0}")]
    Handoff(#[from] crate::handoff::HandoffError),
}

/// Client-visible routing failures. Every variant maps to a distinguished response
/// so that clients can retry or re-fetch their queue.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// The queue the client polls no longer lives where it was registered.
    #[error("bad event queue id: {0}")]
    StaleQueue(String),
    #[error("could not determine realm for request")]
    UnresolvedRealm,
    #[error("backend unavailable for shard {0}")]
    BackendUnavailable(String),
    /// Only produced for safe methods; the client polls again.
    #[error("request held past its deadline")]
    BufferTimeout,
}

impl RouteError {
    pub fn to_response(&self) -> Response<ProxyBody> {
        match self {
            RouteError::StaleQueue(queue_id) => bad_queue(queue_id),
            RouteError::UnresolvedRealm => make_json_response(
                StatusCode::BAD_REQUEST,
                &json!({
                    "result": "error",
                    "msg": "Could not determine realm for request",
                    "code": "BAD_REQUEST",
                }),
            ),
            RouteError::BackendUnavailable(_) => make_json_response(
                StatusCode::BAD_GATEWAY,
                &json!({
                    "result": "error",
                    "msg": "Backend unavailable",
                    "code": "BACKEND_UNAVAILABLE",
                }),
            ),
            RouteError::BufferTimeout => make_json_response(
                StatusCode::OK,
                &json!({
                    "result": "success",
                    "msg": "",
                    "events": [],
                }),
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteError::StaleQueue(_) => "stale_queue",
            RouteError::UnresolvedRealm => "unresolved_realm",
            RouteError::BackendUnavailable(_) => "backend_unavailable",
            RouteError::BufferTimeout => "buffer_timeout",
        }
    }
}

pub const BAD_EVENT_QUEUE_ID: &str = "BAD_EVENT_QUEUE_ID";

pub fn bad_queue(queue_id: &str) -> Response<ProxyBody> {
    make_json_response(
        StatusCode::BAD_REQUEST,
        &json!({
            "result": "error",
            "msg": format!("Bad event queue_id: {queue_id}"),
            "queue_id": queue_id,
            "code": BAD_EVENT_QUEUE_ID,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response<ProxyBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_stale_queue_shape() {
        let response = RouteError::StaleQueue("1517705-12".into()).to_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["code"], "BAD_EVENT_QUEUE_ID");
        assert_eq!(body["queue_id"], "1517705-12");
        assert_eq!(body["msg"], "Bad event queue_id: 1517705-12");
        assert_eq!(body["result"], "error");
    }

    #[tokio::test]
    async fn test_buffer_timeout_is_empty_poll() {
        let response = RouteError::BufferTimeout.to_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["result"], "success");
        assert_eq!(body["events"], json!([]));
    }

    #[test]
    fn test_backend_unavailable_is_bad_gateway() {
        let response = RouteError::BackendUnavailable("shard-a".into()).to_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
