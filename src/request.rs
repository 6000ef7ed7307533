//! Reading and parsing HTTP requests.
//!
//! The parser accumulates bytes from the client into a single bounded
//! buffer until the canonical `\r\n\r\n` header terminator shows up, then
//! picks the request line apart. Reads are blocking but guarded by a
//! readiness poll with the configured idle timeout, so a silent client
//! can never wedge a worker.
//!
//! All protocol rejections are answered right here with the matching
//! canned response from [`crate::response`]; the caller only ever has to
//! close the connection.

use std::io;
use std::io::{Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;
use log::{debug, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use crate::response;

/// The maximum size of the request line and header block.
pub const MAX_HEADER_BYTES: usize = 8192;

/// The maximum length of the request path including the query string.
pub const MAX_PATH_BYTES: usize = 512;


//------------ Method --------------------------------------------------------

/// The request methods we accept.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Method {
    Get,
    Head,
    Delete,
    Put,
    Post,
    Options,
}

impl Method {
    /// Returns the method for the given token if it is on the allow-list.
    fn from_token(token: &[u8]) -> Option<Self> {
        match token {
            b"GET" => Some(Method::Get),
            b"HEAD" => Some(Method::Head),
            b"DELETE" => Some(Method::Delete),
            b"PUT" => Some(Method::Put),
            b"POST" => Some(Method::Post),
            b"OPTIONS" => Some(Method::Options),
            _ => None
        }
    }

    /// Returns the canonical name of the method.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Delete => "DELETE",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Options => "OPTIONS",
        }
    }
}


//------------ ParsedRequest -------------------------------------------------

/// A successfully parsed request.
///
/// The value keeps the full read-ahead buffer. Bytes up to `header_end`
/// are the request line and header block; anything after it is the
/// beginning of the request body that happened to arrive alongside the
/// headers.
#[derive(Clone, Debug)]
pub struct ParsedRequest {
    /// The request method.
    pub method: Method,

    /// The request path, starting with a slash, without the query string.
    pub path: String,

    /// The query string, without the question mark, if there was one.
    pub query: Option<String>,

    /// The name of the handler serving this request.
    ///
    /// This is the request path without its leading slash.
    pub handler_name: String,

    /// The value of the Content-Length header, zero if absent.
    pub content_length: usize,

    /// Everything read from the client so far.
    buffer: Vec<u8>,

    /// The offset just past the `\r\n\r\n` header terminator.
    header_end: usize,
}

impl ParsedRequest {
    /// Returns the raw request line and header block.
    pub fn header_block(&self) -> &[u8] {
        &self.buffer[..self.header_end]
    }

    /// Returns the body bytes that arrived together with the headers.
    pub fn body_read_ahead(&self) -> &[u8] {
        &self.buffer[self.header_end..]
    }
}


//------------ RequestError --------------------------------------------------

/// Reading a request did not produce a parsed request.
#[derive(Debug)]
pub enum RequestError {
    /// The client closed the connection. No response was sent.
    ClientClosed,

    /// The client went idle past the timeout. No response was sent.
    TimedOut,

    /// The request was rejected. The canned response has been written.
    Rejected(Reject),

    /// Reading from or writing to the client failed.
    Transport(io::Error),
}

/// The reason a request was rejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reject {
    /// Bad method or malformed request line. Answered with 400.
    BadRequest,

    /// Oversized path or header block. Answered with 414.
    TooLong,

    /// The path tried to escape the handler root. Answered with 403.
    Forbidden,
}

impl Reject {
    /// Returns the canned response for this rejection.
    fn response(self) -> &'static [u8] {
        match self {
            Reject::BadRequest => response::BAD_REQUEST,
            Reject::TooLong => response::TOO_LONG,
            Reject::Forbidden => response::FORBIDDEN,
        }
    }
}


//------------ read_request --------------------------------------------------

/// Reads and parses a request from a client connection.
///
/// Blocks until a complete header block has arrived, the client goes
/// quiet for longer than `timeout`, or the buffer fills up. Rejections
/// are answered on the spot; whatever the outcome, the caller closes the
/// connection afterwards.
pub fn read_request<S: Read + Write + AsFd>(
    sock: &mut S, timeout: Duration
) -> Result<ParsedRequest, RequestError> {
    let mut buf = Vec::with_capacity(1024);
    loop {
        if !wait_readable(sock.as_fd(), timeout)
            .map_err(RequestError::Transport)?
        {
            debug!("client timeout while reading headers");
            return Err(RequestError::TimedOut)
        }
        let mut chunk = [0u8; 1024];
        let read = match sock.read(&mut chunk) {
            Ok(read) => read,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                continue
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                continue
            }
            Err(err) => return Err(RequestError::Transport(err)),
        };
        if read == 0 {
            return Err(RequestError::ClientClosed)
        }
        buf.extend_from_slice(&chunk[..read]);

        if let Some(header_end) = find_terminator(&buf) {
            return match parse_buffer(buf, header_end) {
                Ok(res) => Ok(res),
                Err(reject) => {
                    reply(sock, reject)?;
                    Err(RequestError::Rejected(reject))
                }
            }
        }
        if buf.len() >= MAX_HEADER_BYTES {
            warn!("request header block exceeds {} bytes", MAX_HEADER_BYTES);
            reply(sock, Reject::TooLong)?;
            return Err(RequestError::Rejected(Reject::TooLong))
        }
    }
}

/// Writes the canned response for a rejection.
fn reply(
    sock: &mut impl Write, reject: Reject
) -> Result<(), RequestError> {
    sock.write_all(reject.response()).map_err(RequestError::Transport)
}

/// Waits for the descriptor to become readable.
///
/// Returns `Ok(false)` on timeout. Interrupted polls are retried.
pub(crate) fn wait_readable(
    fd: BorrowedFd, timeout: Duration
) -> Result<bool, io::Error> {
    // Poll takes milliseconds as a c_int; longer timeouts are capped at
    // the maximum rather than wrapped.
    let millis = libc::c_int::try_from(timeout.as_millis())
        .unwrap_or(libc::c_int::MAX);
    loop {
        let mut fds = [PollFd::new(&fd, PollFlags::POLLIN)];
        match poll(&mut fds, millis) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// Finds the header terminator, returning the offset just past it.
fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Parses an accumulated buffer with a complete header block.
fn parse_buffer(
    buf: Vec<u8>, header_end: usize
) -> Result<ParsedRequest, Reject> {
    let head = &buf[..header_end];

    // Method token runs up to the first space. The longest method we
    // accept is OPTIONS; anything longer can’t be on the allow-list.
    let space = match head.iter().position(|&ch| ch == b' ') {
        Some(pos) if pos <= 7 => pos,
        _ => return Err(Reject::BadRequest),
    };
    let method = match Method::from_token(&head[..space]) {
        Some(method) => method,
        None => return Err(Reject::BadRequest),
    };

    let mut pos = space + 1;
    if head.get(pos) != Some(&b'/') {
        return Err(Reject::BadRequest)
    }

    // The path runs until a space or the start of the query string. The
    // length bound is enforced while scanning.
    let path_start = pos;
    pos += 1;
    while let Some(&ch) = head.get(pos) {
        if ch == b' ' || ch == b'?' {
            break
        }
        if ch == b'\r' || ch == b'\n' {
            return Err(Reject::BadRequest)
        }
        pos += 1;
        if pos - path_start > MAX_PATH_BYTES {
            return Err(Reject::TooLong)
        }
    }
    let path = match std::str::from_utf8(&head[path_start..pos]) {
        Ok(path) => path.to_string(),
        Err(_) => return Err(Reject::BadRequest),
    };

    let query = if head.get(pos) == Some(&b'?') {
        let query_start = pos + 1;
        pos = query_start;
        while let Some(&ch) = head.get(pos) {
            if ch == b' ' {
                break
            }
            if ch == b'\r' || ch == b'\n' {
                return Err(Reject::BadRequest)
            }
            pos += 1;
            if pos - path_start > MAX_PATH_BYTES {
                return Err(Reject::TooLong)
            }
        }
        match std::str::from_utf8(&head[query_start..pos]) {
            Ok(query) => Some(query.to_string()),
            Err(_) => return Err(Reject::BadRequest),
        }
    }
    else {
        None
    };

    // A path that climbs towards a parent directory could escape the
    // exec root. Rejected outright.
    if path.split('/').any(|segment| segment == "..") {
        return Err(Reject::Forbidden)
    }

    let handler_name = path[1..].to_string();
    let content_length = parse_content_length(head);

    Ok(ParsedRequest {
        method,
        path,
        query,
        handler_name,
        content_length,
        buffer: buf,
        header_end,
    })
}

/// Extracts the Content-Length value from a header block.
///
/// A missing or unparseable header counts as zero: such a request simply
/// has no body we would read.
fn parse_content_length(head: &[u8]) -> usize {
    for line in head.split(|&ch| ch == b'\n') {
        let line = match line.strip_suffix(b"\r") {
            Some(line) => line,
            None => line,
        };
        let colon = match line.iter().position(|&ch| ch == b':') {
            Some(pos) => pos,
            None => continue,
        };
        if line[..colon].eq_ignore_ascii_case(b"content-length") {
            if let Ok(value) = std::str::from_utf8(&line[colon + 1..]) {
                if let Ok(value) = value.trim().parse() {
                    return value
                }
            }
        }
    }
    0
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn parse_ok(request: &[u8]) -> ParsedRequest {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        client.write_all(request).unwrap();
        read_request(&mut server, TIMEOUT).unwrap()
    }

    fn parse_err(request: &[u8]) -> (RequestError, Vec<u8>) {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        client.write_all(request).unwrap();
        let err = read_request(&mut server, TIMEOUT).unwrap_err();
        drop(server);
        let mut sent = Vec::new();
        client.read_to_end(&mut sent).unwrap();
        (err, sent)
    }

    #[test]
    fn simple_get() {
        let req = parse_ok(b"GET /echo HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/echo");
        assert_eq!(req.query, None);
        assert_eq!(req.handler_name, "echo");
        assert_eq!(req.content_length, 0);
        assert!(req.body_read_ahead().is_empty());
    }

    #[test]
    fn post_with_read_ahead_body() {
        let req = parse_ok(
            b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello"
        );
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.content_length, 5);
        assert_eq!(req.body_read_ahead(), b"hello");
        assert!(req.header_block().ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn query_string_split() {
        let req = parse_ok(b"GET /find?q=beans&x=1 HTTP/1.1\r\n\r\n");
        assert_eq!(req.path, "/find");
        assert_eq!(req.handler_name, "find");
        assert_eq!(req.query.as_deref(), Some("q=beans&x=1"));
    }

    #[test]
    fn headers_split_across_reads() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        let writer = thread::spawn(move || {
            client.write_all(b"GET /ec").unwrap();
            thread::sleep(Duration::from_millis(10));
            client.write_all(b"ho HTTP/1.1\r\nHo").unwrap();
            thread::sleep(Duration::from_millis(10));
            client.write_all(b"st: x\r\n\r\n").unwrap();
            client
        });
        let req = read_request(&mut server, TIMEOUT).unwrap();
        assert_eq!(req.path, "/echo");
        drop(writer.join().unwrap());
    }

    #[test]
    fn unknown_method_rejected() {
        let (err, sent) = parse_err(b"BREW /pot HTTP/1.1\r\n\r\n");
        assert!(matches!(
            err, RequestError::Rejected(Reject::BadRequest)
        ));
        assert_eq!(sent, crate::response::BAD_REQUEST);
    }

    #[test]
    fn missing_leading_slash_rejected() {
        let (err, sent) = parse_err(b"GET echo HTTP/1.1\r\n\r\n");
        assert!(matches!(
            err, RequestError::Rejected(Reject::BadRequest)
        ));
        assert_eq!(sent, crate::response::BAD_REQUEST);
    }

    #[test]
    fn oversized_path_rejected() {
        let mut req = Vec::from(&b"GET /"[..]);
        req.extend(std::iter::repeat(b'a').take(MAX_PATH_BYTES + 10));
        req.extend(b" HTTP/1.1\r\n\r\n");
        let (err, sent) = parse_err(&req);
        assert!(matches!(err, RequestError::Rejected(Reject::TooLong)));
        assert_eq!(sent, crate::response::TOO_LONG);
    }

    #[test]
    fn oversized_header_block_rejected() {
        let mut req = Vec::from(&b"GET /echo HTTP/1.1\r\n"[..]);
        while req.len() < MAX_HEADER_BYTES {
            req.extend(b"X-Filler: yes\r\n");
        }
        let (err, sent) = parse_err(&req);
        assert!(matches!(err, RequestError::Rejected(Reject::TooLong)));
        assert_eq!(sent, crate::response::TOO_LONG);
    }

    #[test]
    fn parent_directory_rejected() {
        let (err, sent) = parse_err(b"GET /../etc/passwd HTTP/1.1\r\n\r\n");
        assert!(matches!(
            err, RequestError::Rejected(Reject::Forbidden)
        ));
        assert_eq!(sent, crate::response::FORBIDDEN);
    }

    #[test]
    fn closed_client() {
        let (client, mut server) = UnixStream::pair().unwrap();
        drop(client);
        assert!(matches!(
            read_request(&mut server, TIMEOUT),
            Err(RequestError::ClientClosed)
        ));
    }

    #[test]
    fn idle_client_times_out() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        client.write_all(b"GET /echo HT").unwrap();
        assert!(matches!(
            read_request(&mut server, Duration::from_millis(30)),
            Err(RequestError::TimedOut)
        ));
    }

    #[test]
    fn huge_timeout_still_waits_for_data() {
        // A timeout past c_int::MAX milliseconds must not wrap into an
        // immediate poll return.
        let (mut client, server) = UnixStream::pair().unwrap();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            client.write_all(b"x").unwrap();
            client
        });
        let readable = wait_readable(
            server.as_fd(), Duration::from_millis(1 << 32)
        ).unwrap();
        assert!(readable);
        drop(writer.join().unwrap());
    }

    #[test]
    fn content_length_parsing() {
        assert_eq!(
            parse_content_length(b"GET / HTTP/1.1\r\nContent-Length: 42\r\n"),
            42
        );
        assert_eq!(
            parse_content_length(b"GET / HTTP/1.1\r\ncontent-length:7\r\n"),
            7
        );
        assert_eq!(parse_content_length(b"GET / HTTP/1.1\r\n"), 0);
    }
}
