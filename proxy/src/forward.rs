use crate::ProxyBody;
use crate::config::BackendConfig;
use crate::shards::Shard;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, Uri};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use shared::http::{append_via, strip_hop_by_hop};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::time::timeout;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
/// Fencing token of the assignment the request was routed by.
pub const X_SHARD_EPOCH: HeaderName = HeaderName::from_static("x-shard-epoch");

#[derive(thiserror::Error, Debug)]
pub enum ForwardError {
    /// No connection could be established; nothing reached the shard.
    #[error("could not connect to shard {0}: {1}")]
    Connect(String, String),
    #[error("shard {0} did not respond in time")]
    Timeout(String),
    #[error("request to shard {0} failed: {1}")]
    Failed(String, String),
}

/// Pooled HTTP client shared by every request to every shard.
pub struct Forwarder {
    client: Client<HttpConnector, ProxyBody>,
    request_timeout: Duration,
}

impl Forwarder {
    pub fn new(backend: &BackendConfig, connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(backend.pool_idle_timeout_secs))
            .pool_max_idle_per_host(backend.pool_max_idle_per_host)
            .build(connector);

        Forwarder {
            client,
            request_timeout: Duration::from_secs(backend.request_timeout_secs),
        }
    }

    /// Sends `request` to `shard`, rewriting only the target URI and the proxy
    /// headers. The response body is streamed back untouched.
    pub async fn send(
        &self,
        shard: &Shard,
        request: Request<ProxyBody>,
        client_addr: SocketAddr,
        epoch: u64,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = shard
            .url_for(path_and_query)
            .as_str()
            .parse()
            .map_err(|e: http::uri::InvalidUri| ForwardError::Failed(shard.id.clone(), e.to_string()))?;

        let (mut parts, body) = request.into_parts();
        let version = parts.version;
        strip_hop_by_hop(&mut parts.headers, version);
        append_via(&mut parts.headers, version);
        append_forwarded_for(&mut parts.headers, client_addr.ip());
        parts.headers.insert(X_SHARD_EPOCH, HeaderValue::from(epoch));
        parts.uri = uri;
        // The pool negotiates its own protocol with the shard.
        parts.version = http::Version::HTTP_11;

        let response = timeout(
            self.request_timeout,
            self.client.request(Request::from_parts(parts, body)),
        )
        .await
        .map_err(|_| ForwardError::Timeout(shard.id.clone()))?
        .map_err(|e| {
            if e.is_connect() {
                ForwardError::Connect(shard.id.clone(), e.to_string())
            } else {
                ForwardError::Failed(shard.id.clone(), e.to_string())
            }
        })?;

        let (mut parts, body) = response.into_parts();
        let version = parts.version;
        strip_hop_by_hop(&mut parts.headers, version);
        append_via(&mut parts.headers, version);

        Ok(Response::from_parts(parts, body.boxed()))
    }
}

// IPv4 clients may show up as their IPv4-in-IPv6 equivalent, like `::ffff:127.0.0.1`.
fn client_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or_else(|| v6.to_string(), |v4| v4.to_string()),
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let ip = client_ip(ip);
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {ip}"),
        _ => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
