//! Replaying stored requests.
//!
//! A stored [`Request`] is turned back into a live outbound call. Every field
//! that the scanner can mutate (query, form, headers, cookies) is rebuilt from
//! the record's maps rather than from the original raw bytes, so a mutated
//! clone replays exactly as mutated.

mod scanner;

pub use scanner::{Finding, ScanReport, Scanner, Signature, ALL_GOOD};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

use crate::capture::Request;
use crate::config::ReplayConfig;
use crate::error::{Error, Result};
use crate::proxy::HOP_BY_HOP_HEADERS;

/// Marker that the body truncation keys on.
pub const HTML_MARKER: &str = "<html>";

/// Headers recomputed by the client instead of copied from the record.
const RECOMPUTED_HEADERS: &[&str] = &["host", "content-length", "accept-encoding"];

/// Executes stored requests against their original targets.
#[derive(Debug, Clone)]
pub struct Replayer {
    client: reqwest::Client,
}

impl Replayer {
    /// Build a replayer from configuration.
    ///
    /// Redirects are never followed, so a replay observes exactly what the
    /// origin answers.
    pub fn new(config: &ReplayConfig) -> Result<Self> {
        Self::build(config.timeout(), config.proxy.as_deref())
    }

    fn build(timeout: Duration, proxy: Option<&str>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout);

        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| {
                Error::config(format!("Invalid replay proxy '{}': {}", proxy_url, e))
            })?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }

        let client = builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build replay client: {}", e)))?;
        Ok(Self { client })
    }

    /// Replay a request and return its body after [`truncate_at_html_marker`].
    pub async fn replay(&self, request: &Request) -> Result<String> {
        let body = self.replay_raw(request).await?;
        Ok(truncate_at_html_marker(&body))
    }

    /// Replay a request and return the body text untouched.
    pub async fn replay_raw(&self, request: &Request) -> Result<String> {
        let outbound = self.build_request(request)?;
        let method = outbound.method().clone();
        let url = outbound.url().clone();

        let response = self
            .client
            .execute(outbound)
            .await
            .map_err(|e| Error::replay_failed(format!("{} {}: {}", method, url, e)))?;

        tracing::debug!(method = %method, url = %url, status = %response.status(), "Replayed request");

        response
            .text()
            .await
            .map_err(|e| Error::replay_failed(format!("reading body of {}: {}", url, e)))
    }

    /// Translate a canonical request into an outbound reqwest request.
    pub fn build_request(&self, request: &Request) -> Result<reqwest::Request> {
        let method = replay_method(&request.method)?;
        let url = target_url(request)?;

        let mut builder = self.client.request(method, url);
        builder = builder.headers(replay_headers(request));

        if !request.cookies.is_empty() {
            let cookie = request
                .cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; ");
            match HeaderValue::from_str(&cookie) {
                Ok(value) => builder = builder.header(reqwest::header::COOKIE, value),
                Err(e) => tracing::debug!(error = %e, "Dropping unencodable cookie header"),
            }
        }

        if !request.post_params.is_empty() {
            builder = builder.form(&request.post_params);
        }

        builder
            .build()
            .map_err(|e| Error::replay_failed(format!("Failed to build request: {}", e)))
    }
}

/// Keep the body from the last `<html>` onward; without the marker, prefix it.
///
/// Fragile for non-HTML bodies and case variants, and kept as is for
/// compatibility with existing consumers of repeat/scan output.
pub fn truncate_at_html_marker(body: &str) -> String {
    match body.rfind(HTML_MARKER) {
        Some(pos) => body[pos..].to_string(),
        None => format!("{}{}", HTML_MARKER, body),
    }
}

fn replay_method(method: &str) -> Result<reqwest::Method> {
    // Tunnel records only know the host; replay them as a plain fetch of it.
    if method.eq_ignore_ascii_case("CONNECT") {
        return Ok(reqwest::Method::GET);
    }
    reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|e| Error::replay_failed(format!("Invalid method '{}': {}", method, e)))
}

/// Resolve the record's path to an absolute URL and rebuild its query from
/// `get_params`.
fn target_url(request: &Request) -> Result<url::Url> {
    let mut url = match url::Url::parse(&request.path) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let host = request
                .headers
                .get("host")
                .ok_or_else(|| Error::invalid_url(format!("{} has no host", request.path)))?;
            url::Url::parse(&format!("http://{}{}", host, request.path))
                .map_err(|e| Error::invalid_url(format!("{}: {}", request.path, e)))?
        }
        Err(e) => return Err(Error::invalid_url(format!("{}: {}", request.path, e))),
    };

    url.set_query(None);
    if !request.get_params.is_empty() {
        url.query_pairs_mut().extend_pairs(request.get_params.iter());
    }
    Ok(url)
}

/// Whether the stored header `name` is sent as-is on replay.
///
/// Hop-by-hop and client-computed headers never are; `cookie` and
/// `content-type` are rebuilt from the cookie and form maps when those are
/// non-empty.
pub fn header_is_replayed(request: &Request, name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) || RECOMPUTED_HEADERS.contains(&lower.as_str())
    {
        return false;
    }
    if lower == "cookie" && !request.cookies.is_empty() {
        return false;
    }
    if lower == "content-type" && !request.post_params.is_empty() {
        return false;
    }
    true
}

fn replay_headers(request: &Request) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
        if !header_is_replayed(request, name) {
            continue;
        }
        let lower = name.to_ascii_lowercase();

        match (
            HeaderName::from_bytes(lower.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::debug!(header = %name, "Skipping header that cannot be replayed"),
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replayer() -> Replayer {
        Replayer::new(&ReplayConfig::default()).unwrap()
    }

    fn stored(method: &str, path: &str) -> Request {
        Request {
            method: method.to_string(),
            path: path.to_string(),
            ..Request::default()
        }
    }

    #[test]
    fn test_truncate_keeps_tail_from_last_marker() {
        let body = "junk<html>first</html><html>second</html>";
        assert_eq!(truncate_at_html_marker(body), "<html>second</html>");
    }

    #[test]
    fn test_truncate_prefixes_when_marker_absent() {
        assert_eq!(truncate_at_html_marker("root:x:0:0"), "<html>root:x:0:0");
        assert_eq!(truncate_at_html_marker(""), "<html>");
    }

    #[test]
    fn test_truncate_is_case_sensitive() {
        assert_eq!(truncate_at_html_marker("<HTML>x"), "<html><HTML>x");
    }

    #[test]
    fn test_query_rebuilt_from_params() {
        let mut req = stored("GET", "http://example.com/search?q=old");
        req.get_params.insert("q".to_string(), "test;cat /etc/passwd;".to_string());

        let built = replayer().build_request(&req).unwrap();
        assert_eq!(built.method(), reqwest::Method::GET);
        assert_eq!(built.url().path(), "/search");
        let pairs: Vec<(String, String)> = built
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![("q".to_string(), "test;cat /etc/passwd;".to_string())]
        );
    }

    #[test]
    fn test_relative_path_uses_host_header() {
        let mut req = stored("GET", "/search");
        req.headers.insert("host".to_string(), "example.com:8000".to_string());

        let built = replayer().build_request(&req).unwrap();
        assert_eq!(built.url().as_str(), "http://example.com:8000/search");
        assert!(built.headers().get("host").is_none());
    }

    #[test]
    fn test_relative_path_without_host_is_invalid() {
        let err = replayer().build_request(&stored("GET", "/nowhere")).unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));
    }

    #[test]
    fn test_connect_placeholder_replays_as_get() {
        let built = replayer()
            .build_request(&stored("CONNECT", "https://example.com/"))
            .unwrap();
        assert_eq!(built.method(), reqwest::Method::GET);
        assert_eq!(built.url().as_str(), "https://example.com/");
    }

    #[test]
    fn test_cookies_replace_raw_cookie_header() {
        let mut req = stored("GET", "http://example.com/");
        req.headers.insert("cookie".to_string(), "sid=old".to_string());
        req.headers.insert("proxy-connection".to_string(), "keep-alive".to_string());
        req.headers.insert("x-trace".to_string(), "1".to_string());
        req.cookies.insert("sid".to_string(), "new".to_string());
        req.cookies.insert("theme".to_string(), "dark".to_string());

        let built = replayer().build_request(&req).unwrap();
        let cookies: Vec<&str> = built
            .headers()
            .get_all("cookie")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(cookies, vec!["sid=new; theme=dark"]);
        assert!(built.headers().get("proxy-connection").is_none());
        assert_eq!(built.headers()["x-trace"], "1");
    }

    #[test]
    fn test_post_params_sent_as_form() {
        let mut req = stored("POST", "http://example.com/login");
        req.headers.insert(
            "content-type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        );
        req.post_params.insert("user".to_string(), "alice|id|".to_string());

        let built = replayer().build_request(&req).unwrap();
        assert_eq!(built.method(), reqwest::Method::POST);
        assert_eq!(
            built.headers()["content-type"],
            "application/x-www-form-urlencoded"
        );
        let body = built.body().and_then(|b| b.as_bytes()).unwrap();
        assert_eq!(body, b"user=alice%7Cid%7C");
    }

    #[test]
    fn test_header_is_replayed() {
        let mut req = stored("POST", "http://example.com/");
        assert!(header_is_replayed(&req, "x-q"));
        assert!(header_is_replayed(&req, "cookie"));
        assert!(header_is_replayed(&req, "content-type"));
        assert!(!header_is_replayed(&req, "Host"));
        assert!(!header_is_replayed(&req, "content-length"));
        assert!(!header_is_replayed(&req, "proxy-connection"));

        req.cookies.insert("sid".to_string(), "abc".to_string());
        req.post_params.insert("a".to_string(), "1".to_string());
        assert!(!header_is_replayed(&req, "cookie"));
        assert!(!header_is_replayed(&req, "content-type"));
    }

    #[test]
    fn test_invalid_method_is_replay_failure() {
        let err = replayer()
            .build_request(&stored("BAD METHOD", "http://example.com/"))
            .unwrap_err();
        assert!(matches!(err, Error::ReplayFailed(_)));
    }
}
