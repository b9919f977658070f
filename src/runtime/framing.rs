//! Framing: read exactly one request off a byte stream under size and time
//! bounds.
//!
//! The caller puts a read timeout on the socket, so every individual `read`
//! is bounded. On top of that [`read_request`] enforces an overall deadline
//! for the whole request and caps header and body sizes.

use std::io::{self, Read};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::http::Request;

const TERMINATOR: &[u8] = b"\r\n\r\n";
const READ_CHUNK: usize = 1024;

/// Size and time bounds for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Largest header block, terminator included.
    pub max_header_bytes: usize,
    /// Largest accepted `Content-Length`.
    pub max_body_bytes: usize,
    /// Budget for reading the whole request.
    pub request_timeout: Duration,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: 8 * 1024,
            max_body_bytes: 64 * 1024,
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Why a request could not be framed. Each one ends only its connection.
#[derive(Debug, Error)]
pub enum FramingError {
    /// A read timed out or the overall deadline passed.
    #[error("timed out reading request")]
    Timeout,
    /// Peer closed the connection without sending anything.
    #[error("connection closed before request")]
    Closed,
    /// No header terminator within the header size limit.
    #[error("request header too large")]
    HeaderTooLarge,
    /// `Content-Length` above the body limit.
    #[error("request body too large: {0} bytes")]
    BodyTooLarge(usize),
    /// Request line or headers could not be parsed.
    #[error("malformed request: {0}")]
    Malformed(String),
    /// Peer closed before sending the announced body.
    #[error("short body: expected {expected} bytes, got {received}")]
    ShortBody {
        /// Announced `Content-Length`.
        expected: usize,
        /// Bytes received before EOF.
        received: usize,
    },
    /// Any other I/O failure.
    #[error("i/o error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for FramingError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Io(e),
        }
    }
}

impl FramingError {
    /// Status code for the best-effort error response.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::Timeout => 408,
            Self::HeaderTooLarge | Self::BodyTooLarge(_) => 413,
            _ => 500,
        }
    }
}

/// Read one request from `stream`.
///
/// Bytes are read in chunks and scanned for `CRLF CRLF`. Bytes past the
/// terminator count towards the body; anything beyond `Content-Length` is
/// ignored since a connection carries one request.
///
/// # Errors
///
/// See [`FramingError`].
pub fn read_request<R: Read>(stream: &mut R, limits: &FrameLimits) -> Result<Request, FramingError> {
    let started = Instant::now();
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    let header_end = loop {
        if let Some(pos) = find_terminator(&buf) {
            if pos + TERMINATOR.len() > limits.max_header_bytes {
                return Err(FramingError::HeaderTooLarge);
            }
            break pos;
        }
        if buf.len() >= limits.max_header_bytes {
            return Err(FramingError::HeaderTooLarge);
        }

        let n = read_some(stream, &mut chunk)?;
        if n == 0 {
            return Err(if buf.is_empty() {
                FramingError::Closed
            } else {
                FramingError::Malformed("connection closed before end of headers".into())
            });
        }
        buf.extend_from_slice(&chunk[..n]);
        check_deadline(started, limits.request_timeout)?;
    };

    let head = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| FramingError::Malformed("header is not valid UTF-8".into()))?;
    let mut request = parse_head(head)?;

    let content_length = match request.header("Content-Length") {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| FramingError::Malformed(format!("invalid Content-Length `{raw}`")))?,
        None => 0,
    };
    if content_length > limits.max_body_bytes {
        return Err(FramingError::BodyTooLarge(content_length));
    }

    let mut body = buf.split_off(header_end + TERMINATOR.len());
    body.truncate(content_length);
    while body.len() < content_length {
        let want = (content_length - body.len()).min(READ_CHUNK);
        let n = read_some(stream, &mut chunk[..want])?;
        if n == 0 {
            return Err(FramingError::ShortBody {
                expected: content_length,
                received: body.len(),
            });
        }
        body.extend_from_slice(&chunk[..n]);
        check_deadline(started, limits.request_timeout)?;
    }
    request.body = body;
    Ok(request)
}

fn read_some<R: Read>(stream: &mut R, chunk: &mut [u8]) -> Result<usize, FramingError> {
    loop {
        match stream.read(chunk) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

fn check_deadline(started: Instant, budget: Duration) -> Result<(), FramingError> {
    if started.elapsed() > budget {
        Err(FramingError::Timeout)
    } else {
        Ok(())
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len()).position(|w| w == TERMINATOR)
}

/// Parse the request line and header lines. The body is filled in later.
fn parse_head(head: &str) -> Result<Request, FramingError> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(FramingError::Malformed(format!(
            "bad request line `{request_line}`"
        )));
    };
    let version = parts.next().unwrap_or("HTTP/1.1");

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (target.to_owned(), None),
    };

    let headers = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            let value = value.strip_prefix(' ').unwrap_or(value);
            Some((name.trim().to_owned(), value.trim_end().to_owned()))
        })
        .collect();

    Ok(Request {
        method: method.to_owned(),
        path,
        query,
        version: version.to_owned(),
        headers,
        body: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that yields its data in fixed-size pieces, then times out.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.data.len() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "stalled"));
            }
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn frame(raw: &[u8]) -> Result<Request, FramingError> {
        read_request(&mut Cursor::new(raw.to_vec()), &FrameLimits::default())
    }

    #[test]
    fn test_simple_get() {
        let req = frame(b"GET /api/status?x=1 HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/api/status");
        assert_eq!(req.query.as_deref(), Some("x=1"));
        assert_eq!(req.header("host"), Some("localhost"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_body_split_across_reads() {
        let raw = b"POST /api/vehicle HTTP/1.1\r\ncontent-length: 11\r\n\r\nhello world".to_vec();
        let mut reader = Trickle {
            data: raw,
            pos: 0,
            step: 3,
        };
        let req = read_request(&mut reader, &FrameLimits::default()).unwrap();
        assert_eq!(req.body, b"hello world");
    }

    #[test]
    fn test_header_value_trims_one_leading_space() {
        let req = frame(b"GET / HTTP/1.1\r\nX-Pad:  two\r\n\r\n").unwrap();
        assert_eq!(req.header("X-Pad"), Some(" two"));
    }

    #[test]
    fn test_extra_bytes_after_body_ignored() {
        let req = frame(b"PUT /api/rate HTTP/1.1\r\nContent-Length: 2\r\n\r\n{}garbage").unwrap();
        assert_eq!(req.body, b"{}");
    }

    #[test]
    fn test_stall_without_terminator_times_out() {
        let mut reader = Trickle {
            data: b"GET / HTTP/1.1\r\nHost: x\r\n".to_vec(),
            pos: 0,
            step: 8,
        };
        let err = read_request(&mut reader, &FrameLimits::default()).unwrap_err();
        assert!(matches!(err, FramingError::Timeout));
        assert_eq!(err.status(), 408);
    }

    #[test]
    fn test_header_too_large() {
        let limits = FrameLimits {
            max_header_bytes: 32,
            ..FrameLimits::default()
        };
        let raw = format!("GET / HTTP/1.1\r\nX-Long: {}\r\n\r\n", "a".repeat(64));
        let err = read_request(&mut Cursor::new(raw.into_bytes()), &limits).unwrap_err();
        assert!(matches!(err, FramingError::HeaderTooLarge));
        assert_eq!(err.status(), 413);
    }

    #[test]
    fn test_body_too_large() {
        let limits = FrameLimits {
            max_body_bytes: 4,
            ..FrameLimits::default()
        };
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello".to_vec();
        let err = read_request(&mut Cursor::new(raw), &limits).unwrap_err();
        assert!(matches!(err, FramingError::BodyTooLarge(5)));
    }

    #[test]
    fn test_short_body() {
        let err = frame(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc").unwrap_err();
        assert!(matches!(
            err,
            FramingError::ShortBody {
                expected: 10,
                received: 3
            }
        ));
    }

    #[test]
    fn test_malformed_request_line() {
        assert!(matches!(frame(b"GARBAGE\r\n\r\n"), Err(FramingError::Malformed(_))));
        assert!(matches!(
            frame(b"GET / HTTP/1.1\r\nContent-Length: ten\r\n\r\n"),
            Err(FramingError::Malformed(_))
        ));
    }

    #[test]
    fn test_closed_connection() {
        assert!(matches!(frame(b""), Err(FramingError::Closed)));
        assert!(matches!(frame(b"GET / HT"), Err(FramingError::Malformed(_))));
    }
}
