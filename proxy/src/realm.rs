use crate::config::RealmConfig;
use directory::types::RealmId;
use http::header::{HOST, HeaderName, InvalidHeaderName};
use http::{Request, Uri};

/// Largest DELETE body inspected for a `queue_id` field.
pub const MAX_FORM_BODY: usize = 64 * 1024;

const QUEUE_ID: &str = "queue_id";

/// Derives the realm of a request from a trusted header or from the Host.
pub struct RealmExtractor {
    header: HeaderName,
    root_domain: Option<String>,
}

impl RealmExtractor {
    pub fn new(config: &RealmConfig) -> Result<Self, InvalidHeaderName> {
        Ok(RealmExtractor {
            header: HeaderName::from_bytes(config.header.as_bytes())?,
            root_domain: config
                .root_domain
                .as_ref()
                .map(|d| d.trim_matches('.').to_ascii_lowercase()),
        })
    }

    pub fn extract<B>(&self, request: &Request<B>) -> Option<RealmId> {
        if let Some(value) = request.headers().get(&self.header)
            && let Ok(realm) = value.to_str()
        {
            let realm = realm.trim();
            if !realm.is_empty() {
                return Some(realm.to_ascii_lowercase());
            }
        }

        let root = self.root_domain.as_deref()?;
        let host = request
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| request.uri().host())?;
        realm_from_host(host, root)
    }
}

fn realm_from_host(host: &str, root: &str) -> Option<RealmId> {
    let host = strip_port(host).trim_end_matches('.').to_ascii_lowercase();
    if host == root {
        return Some(RealmId::new());
    }
    let label = host.strip_suffix(root)?.strip_suffix('.')?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    Some(label.to_string())
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// The `queue_id` query parameter, if any.
pub fn query_queue_id(uri: &Uri) -> Option<String> {
    form_queue_id(uri.query()?.as_bytes())
}

/// The `queue_id` field of an urlencoded form.
pub fn form_queue_id(form: &[u8]) -> Option<String> {
    url::form_urlencoded::parse(form)
        .find(|(key, _)| key == QUEUE_ID)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(root: Option<&str>) -> RealmExtractor {
        RealmExtractor::new(&RealmConfig {
            header: "x-shardgate-realm".into(),
            root_domain: root.map(String::from),
        })
        .unwrap()
    }

    fn request(host: &str) -> Request<()> {
        Request::builder()
            .uri("/json/events")
            .header(HOST, host)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_realm_from_host() {
        let extractor = extractor(Some("zulipchat.com"));
        assert_eq!(
            extractor.extract(&request("chat.zulipchat.com")),
            Some("chat".to_string())
        );
        assert_eq!(
            extractor.extract(&request("Chat.ZulipChat.com:443")),
            Some("chat".to_string())
        );
        assert_eq!(
            extractor.extract(&request("zulipchat.com")),
            Some(String::new())
        );
        assert_eq!(extractor.extract(&request("a.b.zulipchat.com")), None);
        assert_eq!(extractor.extract(&request("example.com")), None);
        assert_eq!(extractor.extract(&request("evilzulipchat.com")), None);
    }

    #[test]
    fn test_header_wins() {
        let with_root = extractor(Some("zulipchat.com"));
        let req = Request::builder()
            .uri("/json/events")
            .header(HOST, "chat.zulipchat.com")
            .header("x-shardgate-realm", "lear")
            .body(())
            .unwrap();
        assert_eq!(with_root.extract(&req), Some("lear".to_string()));

        // Without a root domain only the header works.
        assert_eq!(extractor(None).extract(&request("chat.zulipchat.com")), None);
    }

    #[test]
    fn test_queue_id() {
        let uri: Uri = "/json/events?queue_id=1517705-12&last_event_id=4"
            .parse()
            .unwrap();
        assert_eq!(query_queue_id(&uri), Some("1517705-12".to_string()));

        let uri: Uri = "/json/events?last_event_id=4".parse().unwrap();
        assert_eq!(query_queue_id(&uri), None);

        assert_eq!(
            form_queue_id(b"queue_id=abc%2Fdef"),
            Some("abc/def".to_string())
        );
        assert_eq!(form_queue_id(b"queue_id="), None);
    }
}
