//! Conversion of raw HTTP messages into canonical records.

use hyper::header::{CONTENT_TYPE, COOKIE};
use hyper::http::request::Parts;
use hyper::{HeaderMap, Method, StatusCode};

use super::{ParamMap, Request, Response};
use crate::error::{Error, Result};

/// Separator placed between values of a repeated key.
pub const VALUE_SEPARATOR: &str = ", ";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Fold key/value pairs into a [`ParamMap`], joining repeated keys with
/// [`VALUE_SEPARATOR`] in the order they were seen.
pub fn join_values<K, V, I>(pairs: I) -> ParamMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: AsRef<str>,
{
    let mut map = ParamMap::new();
    for (key, value) in pairs {
        map.entry(key.into())
            .and_modify(|joined: &mut String| {
                joined.push_str(VALUE_SEPARATOR);
                joined.push_str(value.as_ref());
            })
            .or_insert_with(|| value.as_ref().to_string());
    }
    map
}

/// Build a canonical [`Request`] from a request head and its full body.
///
/// Only a `POST` declaring a form-urlencoded body fills `post_params`; any
/// other body leaves the map empty.
pub fn parse_request(parts: &Parts, body: &[u8]) -> Request {
    let post_params = if parts.method == Method::POST && is_form(&parts.headers) {
        parse_form(body).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "Ignoring malformed form body");
            ParamMap::new()
        })
    } else {
        ParamMap::new()
    };

    Request {
        method: parts.method.to_string(),
        path: parts.uri.to_string(),
        get_params: parse_query(parts.uri.query()),
        headers: parse_headers(&parts.headers),
        cookies: parse_cookies(&parts.headers),
        post_params,
    }
}

/// Build a canonical [`Response`] from a status, headers and an already decoded body.
pub fn parse_response(status: StatusCode, headers: &HeaderMap, body: String) -> Response {
    Response {
        code: status.as_u16(),
        message: status_line(status),
        headers: parse_headers(headers),
        body,
    }
}

/// Status line text, e.g. `200 OK`.
pub fn status_line(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

/// Decode HTML character references (`&amp;`, `&#39;`, ...) in a captured body.
pub fn decode_entities(text: &str) -> String {
    html_escape::decode_html_entities(text).into_owned()
}

fn parse_query(query: Option<&str>) -> ParamMap {
    match query {
        Some(q) => join_values(url::form_urlencoded::parse(q.as_bytes())),
        None => ParamMap::new(),
    }
}

fn parse_headers(headers: &HeaderMap) -> ParamMap {
    join_values(
        headers
            .iter()
            .map(|(name, value)| (name.as_str(), String::from_utf8_lossy(value.as_bytes()))),
    )
}

fn parse_cookies(headers: &HeaderMap) -> ParamMap {
    let pairs = headers
        .get_all(COOKIE)
        .iter()
        .flat_map(|value| {
            String::from_utf8_lossy(value.as_bytes())
                .split(';')
                .filter_map(|pair| {
                    let (name, value) = pair.split_once('=')?;
                    let name = name.trim();
                    if name.is_empty() {
                        return None;
                    }
                    Some((name.to_string(), value.trim().trim_matches('"').to_string()))
                })
                .collect::<Vec<_>>()
        });
    join_values(pairs)
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains(FORM_CONTENT_TYPE))
        .unwrap_or(false)
}

fn parse_form(body: &[u8]) -> Result<ParamMap> {
    let text = std::str::from_utf8(body)
        .map_err(|e| Error::parse(format!("form body is not valid UTF-8: {}", e)))?;
    Ok(join_values(url::form_urlencoded::parse(text.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(method: &str, uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = hyper::Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_join_values_uses_comma_space_in_order() {
        let map = join_values(vec![("k", "a"), ("k", "b"), ("other", "c")]);
        assert_eq!(map["k"], "a, b");
        assert_eq!(map["other"], "c");
    }

    #[test]
    fn test_repeated_query_and_header_values_joined() {
        let p = parts(
            "GET",
            "http://example.com/list?tag=a&tag=b",
            &[("x-tag", "a"), ("x-tag", "b")],
        );
        let req = parse_request(&p, b"");
        assert_eq!(req.get_params["tag"], "a, b");
        assert_eq!(req.headers["x-tag"], "a, b");
    }

    #[test]
    fn test_search_path_and_query() {
        let p = parts("GET", "/search?q=test", &[]);
        let req = parse_request(&p, b"");
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/search?q=test");
        assert_eq!(req.get_params.len(), 1);
        assert_eq!(req.get_params["q"], "test");
        assert!(req.post_params.is_empty());
    }

    #[test]
    fn test_absolute_target_kept_as_path() {
        let p = parts("GET", "http://example.com:8000/a/b?x=1%202", &[]);
        let req = parse_request(&p, b"");
        assert_eq!(req.path, "http://example.com:8000/a/b?x=1%202");
        assert_eq!(req.get_params["x"], "1 2");
    }

    #[test]
    fn test_form_post_populates_post_params() {
        let p = parts(
            "POST",
            "http://example.com/login",
            &[("content-type", "application/x-www-form-urlencoded; charset=utf-8")],
        );
        let req = parse_request(&p, b"user=alice&pass=s3cr%21t&user=bob");
        assert_eq!(req.post_params["user"], "alice, bob");
        assert_eq!(req.post_params["pass"], "s3cr!t");
    }

    #[test]
    fn test_json_post_leaves_post_params_empty() {
        let p = parts(
            "POST",
            "http://example.com/api",
            &[("content-type", "application/json")],
        );
        let req = parse_request(&p, br#"{"user":"alice"}"#);
        assert!(req.post_params.is_empty());
    }

    #[test]
    fn test_form_body_on_get_is_ignored() {
        let p = parts(
            "GET",
            "http://example.com/",
            &[("content-type", "application/x-www-form-urlencoded")],
        );
        let req = parse_request(&p, b"a=1");
        assert!(req.post_params.is_empty());
    }

    #[test]
    fn test_invalid_utf8_form_falls_back_to_empty() {
        let p = parts(
            "POST",
            "http://example.com/",
            &[("content-type", "application/x-www-form-urlencoded")],
        );
        let req = parse_request(&p, &[b'a', b'=', 0xff, 0xfe]);
        assert!(req.post_params.is_empty());
    }

    #[test]
    fn test_cookies_parsed_from_all_cookie_headers() {
        let p = parts(
            "GET",
            "http://example.com/",
            &[("cookie", "session=abc; theme=dark"), ("cookie", "lang=en")],
        );
        let req = parse_request(&p, b"");
        assert_eq!(req.cookies["session"], "abc");
        assert_eq!(req.cookies["theme"], "dark");
        assert_eq!(req.cookies["lang"], "en");
        assert_eq!(req.headers["cookie"], "session=abc; theme=dark, lang=en");
    }

    #[test]
    fn test_parse_response() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", "a=1".parse().unwrap());
        headers.append("set-cookie", "b=2".parse().unwrap());
        let resp = parse_response(StatusCode::FOUND, &headers, "moved".to_string());
        assert_eq!(resp.code, 302);
        assert_eq!(resp.message, "302 Found");
        assert_eq!(resp.headers["set-cookie"], "a=1, b=2");
        assert_eq!(resp.body, "moved");
    }

    #[test]
    fn test_status_line_without_reason() {
        let status = StatusCode::from_u16(599).unwrap();
        assert_eq!(status_line(status), "599");
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(
            decode_entities("&lt;b&gt;Tom &amp; Jerry&#39;s&lt;/b&gt;"),
            "<b>Tom & Jerry's</b>"
        );
        assert_eq!(decode_entities("plain"), "plain");
    }
}
