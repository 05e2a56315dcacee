// src/streaming.rs - Event-stream detection and response headers

use hyper::header::{ACCEPT, ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONNECTION, CONTENT_TYPE, HeaderValue};
use hyper::http::response::Builder;
use hyper::{HeaderMap, Uri};

pub const EVENT_STREAM: &str = "text/event-stream";

/// Whether a proxied request should be served as Server-Sent Events.
pub fn is_sse_request(headers: &HeaderMap, uri: &Uri) -> bool {
    let accepts_events = headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .any(|accept| accept.contains(EVENT_STREAM));

    accepts_events || {
        let path = uri.path().trim_end_matches('/');
        path.ends_with("/events") || path.ends_with("/sse")
    }
}

/// Attach the headers every event-stream response carries.
pub fn with_sse_headers(builder: Builder) -> Builder {
    builder
        .header(CONTENT_TYPE, HeaderValue::from_static(EVENT_STREAM))
        .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
        .header(CONNECTION, HeaderValue::from_static("keep-alive"))
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_sse_detection() {
        let plain: Uri = "/api/items".parse().unwrap();
        assert!(!is_sse_request(&HeaderMap::new(), &plain));
        assert!(is_sse_request(&accept("text/event-stream"), &plain));
        assert!(!is_sse_request(&accept("application/json"), &plain));

        assert!(is_sse_request(&HeaderMap::new(), &"/feed/events".parse().unwrap()));
        assert!(is_sse_request(&HeaderMap::new(), &"/sse?topic=a".parse().unwrap()));
        assert!(!is_sse_request(&HeaderMap::new(), &"/eventsource".parse().unwrap()));
    }

    #[test]
    fn test_sse_headers() {
        let response = with_sse_headers(hyper::Response::builder()).body(()).unwrap();
        assert_eq!(response.headers()[CONTENT_TYPE], EVENT_STREAM);
        assert_eq!(response.headers()[CACHE_CONTROL], "no-cache");
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }
}
