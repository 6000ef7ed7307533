//! Canned error responses.
//!
//! Everything that can go wrong before a handler runs is answered with one
//! of a small set of fixed, pre-sized HTTP/1.1 messages. They are complete
//! wire messages – status line, headers, and HTML body – so callers can
//! write them to the client socket in a single call and close.

/// The response for a request whose method or request line we reject.
pub const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\n\
      Content-Type: text/html\r\n\
      Content-Length: 71\r\n\
      \r\n\
      <html>\n    <body>\n        <h1>400 Bad Request</h1>\n    \
      </body>\n</html>\n";

/// The response for a handler path that resolves outside the exec root.
pub const FORBIDDEN: &[u8] =
    b"HTTP/1.1 403 Forbidden\r\n\
      Content-Type: text/html\r\n\
      Content-Length: 69\r\n\
      \r\n\
      <html>\n    <body>\n        <h1>403 Forbidden</h1>\n    \
      </body>\n</html>\n";

/// The response for a handler that doesn’t exist.
pub const NOT_FOUND: &[u8] =
    b"HTTP/1.1 404 Not Found\r\n\
      Content-Type: text/html\r\n\
      Content-Length: 69\r\n\
      \r\n\
      <html>\n    <body>\n        <h1>404 Not Found</h1>\n    \
      </body>\n</html>\n";

/// The response for an oversized request line or header block.
pub const TOO_LONG: &[u8] =
    b"HTTP/1.1 414 URI Too Long\r\n\
      Content-Type: text/html\r\n\
      Content-Length: 68\r\n\
      \r\n\
      <html>\n    <body>\n        <h1>414 Too Long</h1>\n    \
      </body>\n</html>\n";

/// The response for everything that fails on our side.
pub const INTERNAL_ERROR: &[u8] =
    b"HTTP/1.1 500 Internal Server Error\r\n\
      Content-Type: text/html\r\n\
      Content-Length: 81\r\n\
      \r\n\
      <html>\n    <body>\n        <h1>500 Internal Server Error</h1>\n    \
      </body>\n</html>\n";


//============ Tests =========================================================
