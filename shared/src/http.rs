//! Response builders for the proxy and admin services, and the header rewriting
//! applied to messages crossing the proxy in either direction.

use http::header::{
    CONNECTION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE, VIA,
};
use http::{Response, StatusCode, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;

pub const PROXY_NAME: &str = "shardgate";

static HOP_BY_HOP_NAMES: &[HeaderName] = &[
    CONNECTION,
    TRANSFER_ENCODING,
    TE,
    TRAILER,
    UPGRADE,
    PROXY_AUTHORIZATION,
    PROXY_AUTHENTICATE,
];

/// Wraps a fully buffered payload into the boxed body type used by all services.
pub fn full_body<E>(bytes: impl Into<Bytes>) -> BoxBody<Bytes, E>
where
    E: 'static,
{
    Full::new(bytes.into()).map_err(|e| match e {}).boxed()
}

pub fn make_error_response<E>(status_code: StatusCode) -> Response<BoxBody<Bytes, E>>
where
    E: 'static,
{
    let message = status_code
        .canonical_reason()
        .unwrap_or("an error occurred");

    let mut response = Response::new(full_body(message));
    *response.status_mut() = status_code;
    response
}

pub fn make_json_response<E>(
    status_code: StatusCode,
    value: &serde_json::Value,
) -> Response<BoxBody<Bytes, E>>
where
    E: 'static,
{
    let mut response = Response::new(full_body(value.to_string()));
    *response.status_mut() = status_code;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn via_protocol(version: Version) -> Option<&'static str> {
    Some(match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => return None,
    })
}

/// Records this hop in `Via`, after whatever earlier hops already put there.
pub fn append_via(headers: &mut HeaderMap, version: Version) {
    let Some(protocol) = via_protocol(version) else {
        tracing::warn!(?version, "Unknown HTTP version, skipping Via header");
        return;
    };
    let hop = format!("{protocol} {PROXY_NAME}");
    let value = match headers.get(VIA).and_then(|v| v.to_str().ok()) {
        Some(earlier) => format!("{earlier}, {hop}"),
        None => hop,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(VIA, value);
    }
}

/// Removes connection-scoped headers before a message crosses the proxy. HTTP/2
/// and later have none, so only HTTP/1.x messages are touched.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, version: Version) {
    if !matches!(version, Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11) {
        return;
    }

    // Headers named in any Connection line are hop-by-hop too.
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|line| line.to_str().ok())
        .flat_map(|line| line.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP_NAMES.iter().chain(named.iter()) {
        headers.remove(name);
    }
    if version != Version::HTTP_11 {
        headers.remove(HeaderName::from_static("keep-alive"));
    }
}
