//! The worker process.
//!
//! Each worker handles exactly one request at a time, synchronously, end
//! to end. Under the handoff dispatch model the worker connects to the
//! master’s control socket, announces readiness with a single byte, and
//! then blocks receiving one client descriptor at a time. Under the
//! shared-listener model it simply loops on `accept` over the listener it
//! inherited at spawn.

use std::io;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::thread::sleep;
use std::time::Duration;
use log::{debug, error, info, warn};
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::unistd;
use crate::cgi;
use crate::config::{Config, HandlerKind};
use crate::error::Failed;
use crate::fdpass::{RecvFdError, recv_fd};
use crate::request::{ParsedRequest, RequestError, read_request, wait_readable};
use crate::response;
use crate::wasm::ModuleCache;

/// The byte a worker sends to announce it is idle.
pub const READY_BYTE: u8 = b'R';

/// How often to retry connecting to the master’s control socket.
const CONNECT_ATTEMPTS: usize = 50;

/// The pause between connection attempts.
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);


//------------ Worker --------------------------------------------------------

/// A worker process.
pub struct Worker {
    /// The configuration, copied from the master at spawn.
    config: Config,

    /// The per-process cache of compiled WebAssembly modules.
    cache: ModuleCache,
}

impl Worker {
    /// Creates a new worker and sets up its signal dispositions.
    ///
    /// Child-termination signals are ignored so detached subprocess
    /// handlers are reaped by the kernel; broken pipes surface as write
    /// errors instead of killing the process.
    pub fn new(config: Config) -> Self {
        unsafe {
            let _ = signal(Signal::SIGCHLD, SigHandler::SigIgn);
            let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
        }
        Worker {
            config,
            cache: ModuleCache::new(),
        }
    }

    /// Runs the worker under the handoff dispatch model.
    ///
    /// Exits cleanly when the master closes the control channel.
    pub fn run_handoff(mut self) -> Result<(), Failed> {
        let mut channel = self.connect_control()?;
        info!("worker {} connected to master", unistd::getpid());
        if channel.write_all(&[READY_BYTE]).is_err() {
            error!("worker: cannot signal readiness, master gone");
            return Err(Failed)
        }
        loop {
            let client = match recv_fd(&channel) {
                Ok(fd) => fd,
                Err(RecvFdError::Disconnected) => {
                    info!("worker {}: master closed channel, exiting",
                        unistd::getpid()
                    );
                    return Ok(())
                }
                Err(err) => {
                    warn!("worker: control channel receive failed: {}", err);
                    continue
                }
            };
            self.handle(&mut ClientSocket(client));
            // The readiness byte tells the master this worker can take
            // the next connection. If it can't be delivered, the master
            // is gone and so is our reason to exist.
            if channel.write_all(&[READY_BYTE]).is_err() {
                error!("worker: cannot signal readiness, master gone");
                return Err(Failed)
            }
        }
    }

    /// Runs the worker on a shared listener inherited from the master.
    pub fn run_shared(mut self, listener: TcpListener) -> Result<(), Failed> {
        info!("worker {} accepting directly", unistd::getpid());
        loop {
            let mut client = match listener.accept() {
                Ok((client, addr)) => {
                    debug!("accepted connection from {}", addr);
                    client
                }
                Err(ref err)
                    if err.kind() == io::ErrorKind::Interrupted =>
                {
                    continue
                }
                Err(err) => {
                    error!("worker: accept failed: {}", err);
                    return Ok(())
                }
            };
            self.handle(&mut client);
        }
    }

    /// Connects to the master’s control socket.
    ///
    /// The master may not have begun listening yet, so this retries with
    /// a fixed backoff.
    fn connect_control(&self) -> Result<UnixStream, Failed> {
        let path = self.config.socket_path();
        for _ in 0..CONNECT_ATTEMPTS {
            match UnixStream::connect(&path) {
                Ok(channel) => return Ok(channel),
                Err(_) => sleep(CONNECT_BACKOFF),
            }
        }
        error!(
            "worker: cannot connect to control socket {}",
            path.display()
        );
        Err(Failed)
    }

    /// Handles a single client connection.
    ///
    /// The connection is closed when this returns and the socket is
    /// dropped; under the subprocess invoker a detached handler may keep
    /// the underlying socket open through its own duplicate.
    pub fn handle<S: Read + Write + AsFd + AsRawFd>(
        &mut self, client: &mut S
    ) {
        let req = match read_request(client, self.config.read_timeout) {
            Ok(req) => req,
            Err(RequestError::ClientClosed) => {
                debug!("client closed before request was complete");
                return
            }
            Err(RequestError::TimedOut) => {
                warn!("client timed out during request");
                return
            }
            Err(RequestError::Rejected(reject)) => {
                debug!("request rejected: {:?}", reject);
                return
            }
            Err(RequestError::Transport(err)) => {
                warn!("client transport error: {}", err);
                return
            }
        };
        match self.config.handler_kind {
            HandlerKind::Subprocess => {
                cgi::invoke(&self.config, &req, client);
            }
            HandlerKind::WasmModule => {
                self.handle_wasm(&req, client);
            }
        }
    }

    /// Runs a WebAssembly handler and writes its response.
    fn handle_wasm<S: Read + Write + AsFd>(
        &mut self, req: &ParsedRequest, client: &mut S
    ) {
        let path = self.config.exec_root.join(
            format!("{}.wasm", req.handler_name)
        );
        if req.handler_name.is_empty() || !path.is_file() {
            warn!("wasm handler not found: {}", path.display());
            let _ = client.write_all(response::NOT_FOUND);
            return
        }
        let body = match read_body(
            client, req.body_read_ahead(), req.content_length,
            self.config.read_timeout
        ) {
            Ok(body) => body,
            Err(err) => {
                warn!("failed to read request body: {}", err);
                return
            }
        };
        match self.cache.execute(&path, &body) {
            Ok(result) => {
                let head = format!(
                    "HTTP/1.1 200 OK\r\n\
                     Content-Length: {}\r\n\
                     Content-Type: application/json\r\n\
                     Connection: close\r\n\
                     \r\n",
                    result.len()
                );
                if client.write_all(head.as_bytes())
                    .and_then(|_| client.write_all(&result)).is_err()
                {
                    debug!("client went away while writing response");
                }
            }
            Err(err) => {
                error!("wasm handler {} failed: {}", path.display(), err);
                let _ = client.write_all(response::INTERNAL_ERROR);
            }
        }
    }
}

/// Reads the full request body into memory.
///
/// Combines the read-ahead bytes that arrived with the headers with
/// whatever remains on the socket, up to the declared content length.
/// A client closing early just yields a shorter body.
fn read_body<S: Read + AsFd>(
    sock: &mut S, read_ahead: &[u8], content_length: usize,
    timeout: Duration,
) -> Result<Vec<u8>, io::Error> {
    let mut body = Vec::with_capacity(content_length);
    body.extend_from_slice(
        &read_ahead[..read_ahead.len().min(content_length)]
    );
    let mut chunk = [0u8; 8192];
    while body.len() < content_length {
        if !wait_readable(sock.as_fd(), timeout)? {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut, "client idle during body"
            ))
        }
        let want = (content_length - body.len()).min(chunk.len());
        match sock.read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(read) => body.extend_from_slice(&chunk[..read]),
            Err(ref err)
                if err.kind() == io::ErrorKind::Interrupted
                || err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(body)
}


//------------ ClientSocket --------------------------------------------------

/// A client connection received over the control channel.
///
/// The descriptor arrives domain-less through `SCM_RIGHTS`, so this wraps
/// it with just the stream I/O the request path needs. Dropping the value
/// closes the worker’s copy of the descriptor.
pub struct ClientSocket(pub OwnedFd);

impl Read for ClientSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        unistd::read(self.0.as_raw_fd(), buf).map_err(io::Error::from)
    }
}

impl Write for ClientSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        unistd::write(self.0.as_raw_fd(), buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsFd for ClientSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for ClientSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::thread;
    use crate::fdpass::send_fd;

    const ECHO_MODULE: &str = r#"
        (module
          (memory (export "memory") 1)
          (global $heap (mut i32) (i32.const 1024))
          (func (export "alloc") (param i32) (result i32)
            (local $ptr i32)
            global.get $heap
            local.set $ptr
            global.get $heap
            local.get 0
            i32.add
            global.set $heap
            local.get $ptr)
          (func (export "handle_request") (param i32 i32) (result i64)
            local.get 0
            i64.extend_i32_u
            i64.const 32
            i64.shl
            local.get 1
            i64.extend_i32_u
            i64.or))
    "#;

    fn wasm_config(dir: &std::path::Path) -> Config {
        Config {
            exec_root: dir.into(),
            handler_kind: HandlerKind::WasmModule,
            read_timeout: Duration::from_millis(200),
            .. Config::default()
        }
    }

    #[test]
    fn wasm_request_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("echo.wasm"), ECHO_MODULE).unwrap();
        let mut worker = Worker::new(wasm_config(dir.path()));
        let (mut client, mut server) = UnixStream::pair().unwrap();
        client.write_all(
            b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello"
        ).unwrap();
        worker.handle(&mut server);
        drop(server);
        let mut sent = Vec::new();
        client.read_to_end(&mut sent).unwrap();
        let sent = String::from_utf8(sent).unwrap();
        assert!(sent.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(sent.contains("Content-Length: 5\r\n"));
        assert!(sent.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn missing_wasm_handler_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = Worker::new(wasm_config(dir.path()));
        let (mut client, mut server) = UnixStream::pair().unwrap();
        client.write_all(b"GET /nothing HTTP/1.1\r\n\r\n").unwrap();
        worker.handle(&mut server);
        drop(server);
        let mut sent = Vec::new();
        client.read_to_end(&mut sent).unwrap();
        assert_eq!(sent, response::NOT_FOUND);
        assert_eq!(sent.len(), 140);
    }

    #[test]
    fn handoff_worker_serves_and_exits() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("echo.wasm"), ECHO_MODULE).unwrap();
        let socket_path = dir.path().join("control.sock");
        let rendezvous = UnixListener::bind(&socket_path).unwrap();

        let mut config = wasm_config(dir.path());
        config.socket_path = Some(socket_path.clone());
        let worker = thread::spawn(move || {
            Worker::new(config).run_handoff()
        });

        // Play master: take the control connection, wait for readiness,
        // hand over one client descriptor.
        let (mut channel, _) = rendezvous.accept().unwrap();
        let mut byte = [0u8; 1];
        channel.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], READY_BYTE);

        let (mut client, remote) = UnixStream::pair().unwrap();
        send_fd(&channel, remote.as_raw_fd()).unwrap();
        drop(remote);
        client.write_all(
            b"POST /echo HTTP/1.1\r\nContent-Length: 3\r\n\r\npot"
        ).unwrap();

        channel.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], READY_BYTE);
        let mut sent = Vec::new();
        client.read_to_end(&mut sent).unwrap();
        assert!(sent.ends_with(b"\r\n\r\npot"));

        // Closing the channel tells the worker to exit.
        drop(channel);
        drop(rendezvous);
        assert!(worker.join().unwrap().is_ok());
    }

    #[test]
    fn body_read_helper() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        client.write_all(b"remainder").unwrap();
        let body = read_body(
            &mut server, b"head-", 14, Duration::from_millis(100)
        ).unwrap();
        assert_eq!(body, b"head-remainder");
    }
}
