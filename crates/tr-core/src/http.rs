//! HTTP/1.x message parsing for captured traffic
//!
//! The capture agent hands over the raw bytes of each request and response.
//! These parsers turn them into structured views for display. They are
//! deliberately lenient about semantics (no unchunking, no length checks)
//! and strict about structure: a buffer that does not look like an HTTP
//! message yields an [`HttpParseError`] and the caller keeps showing the raw
//! bytes instead.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::HttpParseError;

const CRLF: &str = "\r\n";
const HEADER_BOUNDARY: &[u8] = b"\r\n\r\n";

/// A parsed HTTP request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub http_version: String,
    /// Header names keep the case they were sent with
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpRequest {
    /// Parse raw request bytes
    pub fn from_raw(raw: &[u8]) -> Result<Self, HttpParseError> {
        parse_request(raw)
    }

    /// Value of the `Host` header, falling back to lowercase `host`
    pub fn host(&self) -> Option<&str> {
        header_value(&self.headers, "Host")
    }

    /// Value of the `Content-Type` header, falling back to lowercase
    pub fn content_type(&self) -> Option<&str> {
        header_value(&self.headers, "Content-Type")
    }

    /// Body pretty-printed according to its content type
    pub fn formatted_body(&self) -> String {
        format_body(&self.body, self.content_type())
    }
}

/// A parsed HTTP response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub http_version: String,
    pub status: u16,
    pub status_msg: String,
    /// Header names keep the case they were sent with
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    /// Parse raw response bytes
    pub fn from_raw(raw: &[u8]) -> Result<Self, HttpParseError> {
        parse_response(raw)
    }

    /// Value of the `Content-Type` header, falling back to lowercase
    pub fn content_type(&self) -> Option<&str> {
        header_value(&self.headers, "Content-Type")
    }

    /// Body pretty-printed according to its content type
    pub fn formatted_body(&self) -> String {
        format_body(&self.body, self.content_type())
    }
}

/// Parse a raw HTTP request.
///
/// The first line must be exactly `METHOD PATH VERSION`. Header lines follow
/// up to the first blank line; everything after it is the body.
pub fn parse_request(raw: &[u8]) -> Result<HttpRequest, HttpParseError> {
    let (head, body) = split_message(raw)?;
    let mut lines = head.split(CRLF);

    let request_line = lines.next().unwrap_or_default();
    let tokens: Vec<&str> = request_line.split(' ').collect();
    let [method, path, http_version] = tokens.as_slice() else {
        return Err(HttpParseError::InvalidRequestLine(request_line.to_string()));
    };

    let headers = parse_headers(lines)?;

    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        http_version: http_version.to_string(),
        headers,
        body,
    })
}

/// Parse a raw HTTP response.
///
/// The status line is `VERSION STATUS [MESSAGE...]`; the message words are
/// re-joined with single spaces.
pub fn parse_response(raw: &[u8]) -> Result<HttpResponse, HttpParseError> {
    let (head, body) = split_message(raw)?;
    let mut lines = head.split(CRLF);

    let status_line = lines.next().unwrap_or_default();
    let tokens: Vec<&str> = status_line.split(' ').collect();
    if tokens.len() < 2 {
        return Err(HttpParseError::InvalidStatusLine(status_line.to_string()));
    }

    let status = tokens[1]
        .parse::<u16>()
        .map_err(|_| HttpParseError::InvalidStatus(tokens[1].to_string()))?;

    let headers = parse_headers(lines)?;

    Ok(HttpResponse {
        http_version: tokens[0].to_string(),
        status,
        status_msg: tokens[2..].join(" "),
        headers,
        body,
    })
}

/// Pretty-print a body when its content type is JSON.
///
/// Anything that is not JSON, or does not parse as JSON, is returned as-is.
pub fn format_body(body: &str, content_type: Option<&str>) -> String {
    if !content_type.is_some_and(is_json_content_type) {
        return body.to_string();
    }

    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => return body.to_string(),
    };

    let mut out = Vec::with_capacity(body.len() * 2);
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    if value.serialize(&mut serializer).is_err() {
        return body.to_string();
    }

    String::from_utf8(out).unwrap_or_else(|_| body.to_string())
}

fn is_json_content_type(content_type: &str) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    media_type == "application/json" || media_type == "text/json" || media_type.ends_with("+json")
}

/// Split a message at the first blank line into (header block, body).
///
/// The header block must be UTF-8; the body is decoded lossily.
fn split_message(raw: &[u8]) -> Result<(&str, String), HttpParseError> {
    let boundary = raw
        .windows(HEADER_BOUNDARY.len())
        .position(|w| w == HEADER_BOUNDARY)
        .ok_or(HttpParseError::MissingBoundary)?;

    let head =
        std::str::from_utf8(&raw[..boundary]).map_err(|_| HttpParseError::InvalidUtf8)?;
    let body = String::from_utf8_lossy(&raw[boundary + HEADER_BOUNDARY.len()..]).into_owned();

    Ok((head, body))
}

fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<HashMap<String, String>, HttpParseError> {
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (key, value) = line
            .split_once(": ")
            .ok_or_else(|| HttpParseError::InvalidHeader(line.to_string()))?;
        headers.insert(key.to_string(), value.to_string());
    }
    Ok(headers)
}

fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .or_else(|| headers.get(&name.to_ascii_lowercase()))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CURL_REQUEST: &[u8] =
        b"GET / HTTP/1.1\r\nHost: 172.17.0.3:3001\r\nUser-Agent: curl/7.81.0\r\nAccept: */*\r\n\r\n";

    const WERKZEUG_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nServer: Werkzeug/3.0.1 Python/3.10.12\r\nDate: Tue, 30 Jan 2024 12:42:46 GMT\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: 12\r\nConnection: close\r\n\r\nHello World!";

    #[test]
    fn test_parse_request() {
        let req = parse_request(CURL_REQUEST).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/");
        assert_eq!(req.http_version, "HTTP/1.1");
        assert_eq!(req.headers.len(), 3);
        assert_eq!(req.headers["User-Agent"], "curl/7.81.0");
        assert_eq!(req.host(), Some("172.17.0.3:3001"));
        assert_eq!(req.body, "");
    }

    #[test]
    fn test_parse_request_with_body() {
        let raw = b"POST /things HTTP/1.1\r\nhost: api.local\r\nContent-Type: application/json\r\n\r\n{\"a\":1}\r\n\r\ntrailing";
        let req = parse_request(raw).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.host(), Some("api.local"));
        // Only the first blank line separates headers from body
        assert_eq!(req.body, "{\"a\":1}\r\n\r\ntrailing");
    }

    #[test]
    fn test_host_prefers_canonical_case() {
        let raw = b"GET / HTTP/1.1\r\nhost: lower\r\nHost: upper\r\n\r\n";
        let req = parse_request(raw).unwrap();
        assert_eq!(req.host(), Some("upper"));

        let raw = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n";
        assert_eq!(parse_request(raw).unwrap().host(), None);
    }

    #[test]
    fn test_parse_request_errors() {
        assert_eq!(
            parse_request(b"GET / HTTP/1.1\r\nHost: x\r\n"),
            Err(HttpParseError::MissingBoundary)
        );
        assert!(matches!(
            parse_request(b"GET /\r\n\r\n"),
            Err(HttpParseError::InvalidRequestLine(_))
        ));
        assert!(matches!(
            parse_request(b"GET / HTTP/1.1 extra\r\n\r\n"),
            Err(HttpParseError::InvalidRequestLine(_))
        ));
        assert!(matches!(
            parse_request(b"GET / HTTP/1.1\r\nNoColonHere\r\n\r\n"),
            Err(HttpParseError::InvalidHeader(_))
        ));
        assert_eq!(
            parse_request(b"GET /\xff HTTP/1.1\r\n\r\n"),
            Err(HttpParseError::InvalidUtf8)
        );
    }

    #[test]
    fn test_parse_response() {
        let resp = parse_response(WERKZEUG_RESPONSE).unwrap();
        assert_eq!(resp.http_version, "HTTP/1.1");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.status_msg, "OK");
        assert_eq!(resp.headers["Content-Length"], "12");
        assert_eq!(resp.content_type(), Some("text/html; charset=utf-8"));
        assert_eq!(resp.body, "Hello World!");
    }

    #[test]
    fn test_parse_response_multiword_status() {
        let resp = parse_response(b"HTTP/1.1 404 Not  Found\r\n\r\n").unwrap();
        assert_eq!(resp.status, 404);
        // Empty tokens survive the re-join
        assert_eq!(resp.status_msg, "Not  Found");

        let resp = parse_response(b"HTTP/1.1 503 Service Temporarily Unavailable\r\n\r\n").unwrap();
        assert_eq!(resp.status_msg, "Service Temporarily Unavailable");

        let resp = parse_response(b"HTTP/1.1 204\r\n\r\n").unwrap();
        assert_eq!(resp.status_msg, "");
    }

    #[test]
    fn test_parse_response_errors() {
        assert_eq!(
            parse_response(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n"),
            Err(HttpParseError::MissingBoundary)
        );
        assert!(matches!(
            parse_response(b"HTTP/1.1 abc OK\r\n\r\n"),
            Err(HttpParseError::InvalidStatus(_))
        ));
        assert!(matches!(
            parse_response(b"HTTP/1.1\r\n\r\n"),
            Err(HttpParseError::InvalidStatusLine(_))
        ));
        assert!(matches!(
            parse_response(b"HTTP/1.1 200 OK\r\nbroken\r\n\r\n"),
            Err(HttpParseError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_binary_body_is_decoded_lossily() {
        let mut raw = b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\n\r\n".to_vec();
        raw.extend_from_slice(&[0x1f, 0x8b, 0x08]);
        let resp = parse_response(&raw).unwrap();
        assert_eq!(resp.status, 200);
        assert!(resp.body.contains('\u{fffd}'));
    }

    #[test]
    fn test_parse_is_repeatable() {
        assert_eq!(
            parse_request(CURL_REQUEST).unwrap(),
            parse_request(CURL_REQUEST).unwrap()
        );
        assert_eq!(
            parse_response(WERKZEUG_RESPONSE).unwrap(),
            parse_response(WERKZEUG_RESPONSE).unwrap()
        );
    }

    #[test]
    fn test_format_body_json() {
        let formatted = format_body(r#"{"b":1,"a":[true,null]}"#, Some("application/json"));
        assert_eq!(
            formatted,
            "{\n    \"b\": 1,\n    \"a\": [\n        true,\n        null\n    ]\n}"
        );

        let formatted = format_body(r#"{"x":1}"#, Some("application/problem+json; charset=utf-8"));
        assert_eq!(formatted, "{\n    \"x\": 1\n}");
    }

    #[test]
    fn test_format_body_passthrough() {
        assert_eq!(format_body("<p>hi</p>", Some("text/html")), "<p>hi</p>");
        assert_eq!(format_body("{not json", Some("application/json")), "{not json");
        assert_eq!(format_body(r#"{"a":1}"#, None), r#"{"a":1}"#);
    }

    #[test]
    fn test_formatted_body_uses_header() {
        let raw = b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\r\n[1,2]";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.formatted_body(), "[\n    1,\n    2\n]");
    }
}
