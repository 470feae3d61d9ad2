#![no_main]

use libfuzzer_sys::fuzz_target;
use tapline::capture::codec;
use tapline::replay::truncate_at_html_marker;

fuzz_target!(|data: &[u8]| {
    // First line is the request target, second a Cookie header, rest the form body
    let mut sections = data.splitn(3, |b| *b == b'\n');
    let target = sections.next().unwrap_or_default();
    let cookie = sections.next().unwrap_or_default();
    let body = sections.next().unwrap_or_default();

    let Ok(uri) = hyper::Uri::try_from(target) else {
        return;
    };

    let mut builder = hyper::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/x-www-form-urlencoded");
    if let Ok(value) = hyper::header::HeaderValue::from_bytes(cookie) {
        builder = builder.header("cookie", value);
    }
    let Ok(req) = builder.body(()) else {
        return;
    };
    let (parts, _) = req.into_parts();

    let request = codec::parse_request(&parts, body);
    for value in request.cookies.values().chain(request.post_params.values()) {
        let _ = codec::decode_entities(value);
    }

    let text = String::from_utf8_lossy(body);
    let truncated = truncate_at_html_marker(&text);
    assert!(truncated.starts_with("<html>"));
});
