//! Minimal HTTP/1.1 request and response models.
//!
//! Only what the API needs: one request per connection, fixed
//! `Content-Length` bodies, `Connection: close` on every response.

use std::io::{self, Write};

use serde::Serialize;

/// Headers attached to every response so browser front-ends can call the API.
pub const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "GET, POST, PUT, DELETE, OPTIONS"),
    ("Access-Control-Allow-Headers", "Content-Type"),
];

/// One framed request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// Method token, e.g. `GET`.
    pub method: String,
    /// Request target without the query string.
    pub path: String,
    /// Raw query string, without the `?`.
    pub query: Option<String>,
    /// Protocol version token, e.g. `HTTP/1.1`.
    pub version: String,
    /// Header lines in arrival order.
    pub headers: Vec<(String, String)>,
    /// Body bytes, exactly `Content-Length` long.
    pub body: Vec<u8>,
}

impl Request {
    /// First header named `name`, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response about to be serialized onto a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status code.
    pub status: u16,
    /// Extra headers; CORS, `Content-Length` and `Connection` are added on write.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl Response {
    /// Empty response with `status`.
    #[must_use]
    pub const fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// JSON response. Serialization failure degrades to a 500 with an empty
    /// object so a handler never has to deal with it.
    #[must_use]
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(status)
                .with_header("Content-Type", "application/json; charset=utf-8")
                .with_body(body),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize response body");
                Self::new(500)
                    .with_header("Content-Type", "application/json; charset=utf-8")
                    .with_body(b"{}".to_vec())
            }
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// First header named `name`, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialize status line, headers and body into one buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status));
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        for (name, value) in CORS_HEADERS {
            if self.header(name).is_none() {
                head.push_str(name);
                head.push_str(": ");
                head.push_str(value);
                head.push_str("\r\n");
            }
        }
        head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        head.push_str("Connection: close\r\n\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }

    /// Write the serialized response and flush.
    ///
    /// # Errors
    ///
    /// Propagates any I/O error from `out`.
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&self.to_bytes())?;
        out.flush()
    }
}

/// Reason phrase for the status codes this server produces.
#[must_use]
pub const fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
