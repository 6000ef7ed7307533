//! Running subprocess handlers.
//!
//! A subprocess handler is an executable or script below the exec root,
//! named by the request path. It receives the request metadata through a
//! CGI-style environment, the request body on standard input, and writes
//! its response – status line, headers, and body – directly to the client
//! socket, which it holds as standard output.
//!
//! The worker does not wait for the handler. The child keeps its own
//! duplicate of the client descriptor, so the connection stays open
//! exactly as long as the handler needs it, and the worker is free to
//! pick up the next connection immediately. Workers ignore `SIGCHLD`,
//! leaving reaping to the kernel.

use std::io;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use log::{debug, error, warn};
use nix::unistd::dup;
use crate::config::Config;
use crate::request::{ParsedRequest, wait_readable};
use crate::response;

/// Script extensions and the interpreters that run them.
const INTERPRETERS: &[(&str, &str)] = &[
    ("py", "python3"),
    ("js", "node"),
    ("sh", "bash"),
    ("pl", "perl"),
    ("rb", "ruby"),
    ("php", "php"),
];


//------------ build_environment ---------------------------------------------

/// Builds the CGI-style environment for a request.
///
/// Every header turns into one `HTTP_<NAME>` entry with the name
/// uppercased and separators kept, except for the special-cased
/// `Content-Length`, `Content-Type` and `Authorization` headers. The
/// request method is always present; the query string only when the
/// request had one.
pub fn build_environment(req: &ParsedRequest) -> Vec<(String, String)> {
    let mut res = Vec::new();
    let head = req.header_block();
    for line in head.split(|&ch| ch == b'\n').skip(1) {
        let line = match line.strip_suffix(b"\r") {
            Some(line) => line,
            None => line,
        };
        let line = match std::str::from_utf8(line) {
            Ok(line) => line,
            Err(_) => continue,
        };
        let (key, value) = match line.split_once(':') {
            Some(parts) => parts,
            None => continue,
        };
        let key = key.trim();
        let value = value.trim();
        if key.eq_ignore_ascii_case("Content-Length") {
            res.push(("CONTENT_LENGTH".into(), value.into()));
        }
        else if key.eq_ignore_ascii_case("Content-Type") {
            res.push(("CONTENT_TYPE".into(), value.into()));
        }
        else if key.eq_ignore_ascii_case("Authorization") {
            res.push(("AUTH_TYPE".into(), value.into()));
            res.push(("HTTP_AUTHORIZATION".into(), value.into()));
        }
        else {
            res.push((
                format!("HTTP_{}", key.to_ascii_uppercase()),
                value.into()
            ));
        }
    }
    res.push(("REQUEST_METHOD".into(), req.method.as_str().into()));
    if let Some(query) = req.query.as_ref() {
        res.push(("QUERY_STRING".into(), query.clone()));
    }
    res
}


//------------ resolve_handler -----------------------------------------------

/// The resolved location of a subprocess handler.
struct ResolvedHandler {
    /// The path of the executable or script.
    path: PathBuf,

    /// The interpreter to run it with, if the extension asks for one.
    interpreter: Option<&'static str>,
}

/// Resolves the handler named by a request below the exec root.
///
/// Returns `None` if there is no regular file at the resolved path. The
/// parser has already refused paths with parent-directory segments, so
/// joining the handler name cannot escape the root.
fn resolve_handler(
    config: &Config, handler_name: &str
) -> Option<ResolvedHandler> {
    if handler_name.is_empty() {
        return None
    }
    let path = config.exec_root.join(handler_name);
    if !path.is_file() {
        return None
    }
    let interpreter = path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| {
            INTERPRETERS.iter().find(|item| item.0 == ext)
        })
        .map(|item| item.1);
    Some(ResolvedHandler { path, interpreter })
}


//------------ invoke --------------------------------------------------------

/// Runs the subprocess handler for a parsed request.
///
/// The client socket becomes the child’s standard output; the request
/// body is streamed into the child’s standard input. When this returns,
/// the response is either underway from the child or a canned error has
/// been written, and the caller can close its copy of the socket.
pub fn invoke<S: Read + Write + AsFd + AsRawFd>(
    config: &Config, req: &ParsedRequest, sock: &mut S
) {
    let handler = match resolve_handler(config, &req.handler_name) {
        Some(handler) => handler,
        None => {
            warn!("handler not found: {}", req.path);
            let _ = sock.write_all(response::NOT_FOUND);
            return
        }
    };

    let client_stdout = match dup(sock.as_raw_fd()) {
        Ok(fd) => unsafe { Stdio::from_raw_fd(fd) },
        Err(err) => {
            error!("failed to duplicate client socket: {}", err);
            let _ = sock.write_all(response::INTERNAL_ERROR);
            return
        }
    };

    let mut command = match handler.interpreter {
        Some(interpreter) => {
            let mut command = Command::new(interpreter);
            command.arg(&handler.path);
            command
        }
        None => Command::new(&handler.path),
    };
    command
        .env_clear()
        .envs(build_environment(req))
        .stdin(Stdio::piped())
        .stdout(client_stdout)
        .stderr(Stdio::null());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!("failed to spawn handler {}: {}",
                handler.path.display(), err
            );
            let _ = sock.write_all(response::INTERNAL_ERROR);
            return
        }
    };

    // The child got its own duplicate of the socket; from here on the
    // worker only feeds the body into the pipe.
    let mut stdin = child.stdin.take().expect("handler stdin not piped");
    if let Err(err) = stream_body(
        sock, req.body_read_ahead(), req.content_length,
        &mut stdin, config.read_timeout
    ) {
        debug!("body streaming to {} ended early: {}",
            handler.path.display(), err
        );
    }
    drop(stdin);

    debug!("handler {} detached for {}",
        handler.path.display(), req.path
    );
}

/// Streams the request body into the handler’s standard input.
///
/// First forwards the read-ahead bytes that arrived with the headers,
/// then reads the rest from the client up to the declared content
/// length, forwarding each chunk immediately. Stops early when the
/// client goes idle past the timeout or closes.
fn stream_body<S: Read + AsFd>(
    sock: &mut S, read_ahead: &[u8], content_length: usize,
    stdin: &mut impl Write, timeout: Duration,
) -> Result<(), io::Error> {
    let head = read_ahead.len().min(content_length);
    stdin.write_all(&read_ahead[..head])?;
    let mut remaining = content_length - head;

    let mut chunk = [0u8; 8192];
    while remaining > 0 {
        if !wait_readable(sock.as_fd(), timeout)? {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut, "client idle during body"
            ))
        }
        let want = remaining.min(chunk.len());
        let read = match sock.read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(read) => read,
            Err(ref err)
                if err.kind() == io::ErrorKind::Interrupted
                || err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        };
        stdin.write_all(&chunk[..read])?;
        remaining -= read;
    }
    Ok(())
}


//============ Tests =========================================================
