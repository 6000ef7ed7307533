//! The master process.
//!
//! The master owns the listening socket, spawns the worker pool, and —
//! under the handoff dispatch model — accepts every client connection
//! itself and moves the descriptor to an idle worker over that worker’s
//! control channel. One accepted client per loop iteration, one ready
//! worker per client: a worker never holds two connections at once.
//!
//! Workers that die are logged and skipped. They are not respawned; the
//! pool only shrinks until the next restart.

use std::{fs, io, process};
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::thread::sleep;
use std::time::Duration;
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use nix::sys::signal::{Signal, kill};
use nix::unistd::{ForkResult, Pid, fork};
use socket2::{Domain, Socket, Type};
use crate::config::{Config, DispatchModel};
use crate::error::Failed;
use crate::fdpass::send_fd;
use crate::process::shutdown_requested;
use crate::worker::Worker;


//------------ run -----------------------------------------------------------

/// Runs the server until shutdown is requested.
pub fn run(config: &Config) -> Result<(), Failed> {
    let listener = bind_listener(config)?;
    match config.dispatch {
        DispatchModel::Handoff => run_handoff(config, listener),
        DispatchModel::SharedListener => run_shared(config, listener),
    }
}

/// Creates the listening endpoint.
///
/// Address reuse is always set so restarts don’t trip over a
/// still-draining prior binding. Port reuse is set where available for
/// the shared-listener variant; failure there is only logged.
fn bind_listener(config: &Config) -> Result<TcpListener, Failed> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let socket = match Socket::new(Domain::IPV4, Type::STREAM, None) {
        Ok(socket) => socket,
        Err(err) => {
            error!("Fatal: cannot create listening socket: {}", err);
            return Err(Failed)
        }
    };
    if let Err(err) = socket.set_reuse_address(true) {
        error!("Fatal: cannot set SO_REUSEADDR: {}", err);
        return Err(Failed)
    }
    if let Err(err) = socket.set_reuse_port(true) {
        warn!("cannot set SO_REUSEPORT, continuing without: {}", err);
    }
    if let Err(err) = socket.bind(&addr.into()) {
        error!("Fatal: cannot bind to {}: {}", addr, err);
        return Err(Failed)
    }
    if let Err(err) = socket.listen(10) {
        error!("Fatal: cannot listen on {}: {}", addr, err);
        return Err(Failed)
    }
    info!("listening on {}", addr);
    Ok(socket.into())
}


//------------ Handoff Dispatch ----------------------------------------------

/// Runs the handoff dispatch model.
fn run_handoff(
    config: &Config, listener: TcpListener
) -> Result<(), Failed> {
    let socket_path = config.socket_path();
    Config::runtime_dir()?;
    if socket_path.exists() {
        let _ = fs::remove_file(&socket_path);
    }
    let rendezvous = match UnixListener::bind(&socket_path) {
        Ok(rendezvous) => rendezvous,
        Err(err) => {
            error!(
                "Fatal: cannot bind control socket {}: {}",
                socket_path.display(), err
            );
            return Err(Failed)
        }
    };

    let mut pool = spawn_workers(config, |worker| worker.run_handoff())?;

    // One control connection per worker, taken in spawn order.
    for idx in 0..pool.len() {
        match rendezvous.accept() {
            Ok((channel, _)) => pool[idx].channel = Some(channel),
            Err(err) => {
                error!("Fatal: control socket accept failed: {}", err);
                shut_down_pool(&pool, &socket_path);
                return Err(Failed)
            }
        }
    }
    info!("{} workers connected, dispatching", pool.len());

    loop {
        if shutdown_requested() {
            break
        }
        let client = match listener.accept() {
            Ok((client, addr)) => {
                debug!("accepted connection from {}", addr);
                client
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                continue
            }
            Err(err) => {
                error!("accept failed: {}", err);
                continue
            }
        };
        let idx = match next_ready_worker(&mut pool) {
            Some(idx) => idx,
            None => {
                if shutdown_requested() {
                    break
                }
                error!("Fatal: no live workers remain");
                shut_down_pool(&pool, &socket_path);
                return Err(Failed)
            }
        };
        let channel = pool[idx].channel.as_ref()
            .expect("ready worker without channel");
        if let Err(err) = send_fd(channel, client.as_raw_fd()) {
            warn!(
                "descriptor handoff to worker {} failed: {}",
                pool[idx].pid, err
            );
            pool[idx].channel = None;
        }
        // The worker holds its own copy now; drop ours.
        drop(client);
    }

    info!("shutting down");
    shut_down_pool(&pool, &socket_path);
    Ok(())
}

/// Waits for a worker to signal readiness and returns its index.
///
/// Polls all live control channels, reads the single readiness byte from
/// the first one that has it, and returns that worker. A channel that
/// delivers end-of-file instead means the worker died: it is logged,
/// dropped from polling, and never handed another connection. Returns
/// `None` when no live workers remain or polling was interrupted by
/// shutdown.
fn next_ready_worker(pool: &mut [WorkerRecord]) -> Option<usize> {
    loop {
        let live: Vec<usize> = pool.iter().enumerate()
            .filter(|item| item.1.channel.is_some())
            .map(|item| item.0)
            .collect();
        if live.is_empty() {
            return None
        }
        let readable = {
            let mut fds: Vec<PollFd> = live.iter().map(|&idx| {
                PollFd::new(
                    pool[idx].channel.as_ref()
                        .expect("live worker without channel"),
                    PollFlags::POLLIN
                )
            }).collect();
            match poll(&mut fds, -1) {
                Ok(_) => {}
                Err(Errno::EINTR) => {
                    if shutdown_requested() {
                        return None
                    }
                    continue
                }
                Err(err) => {
                    error!("poll on control channels failed: {}", err);
                    return None
                }
            }
            fds.iter().zip(&live).find_map(|(slot, &idx)| {
                let hit = slot.revents().map_or(false, |ev| {
                    ev.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)
                });
                if hit { Some(idx) } else { None }
            })
        };
        let idx = match readable {
            Some(idx) => idx,
            None => continue,
        };
        let mut byte = [0u8; 1];
        let read = pool[idx].channel.as_mut()
            .expect("live worker without channel")
            .read(&mut byte);
        match read {
            Ok(0) | Err(_) => {
                warn!(
                    "worker {} disconnected, skipping", pool[idx].pid
                );
                pool[idx].channel = None;
            }
            Ok(_) => return Some(idx),
        }
    }
}


//------------ Shared-listener Dispatch --------------------------------------

/// Runs the shared-listener dispatch model.
///
/// Every worker inherits the listener and accepts directly; the master
/// only waits for the shutdown request.
fn run_shared(
    config: &Config, listener: TcpListener
) -> Result<(), Failed> {
    let pool = spawn_workers(config, move |worker| {
        let listener = listener.try_clone().map_err(|err| {
            error!("worker: cannot use inherited listener: {}", err);
            Failed
        })?;
        worker.run_shared(listener)
    })?;
    info!("{} workers accepting, waiting for shutdown", pool.len());
    while !shutdown_requested() {
        sleep(Duration::from_millis(500));
    }
    info!("shutting down");
    for record in &pool {
        let _ = kill(record.pid, Signal::SIGTERM);
    }
    Ok(())
}


//------------ Worker Pool ---------------------------------------------------

/// The master’s record of one spawned worker.
struct WorkerRecord {
    /// The worker’s process ID.
    pid: Pid,

    /// The control channel, present once the worker has connected.
    ///
    /// `None` after the worker was seen dead.
    channel: Option<UnixStream>,
}

/// Forks the worker pool.
///
/// Each child builds a [`Worker`] from its copy of the configuration,
/// runs `body` on it, and exits without ever returning to master code.
fn spawn_workers<F>(
    config: &Config, body: F
) -> Result<Vec<WorkerRecord>, Failed>
where F: Fn(Worker) -> Result<(), Failed> {
    let mut pool = Vec::with_capacity(config.workers);
    for _ in 0..config.workers {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let code = match body(Worker::new(config.clone())) {
                    Ok(()) => 0,
                    Err(_) => 1,
                };
                process::exit(code)
            }
            Ok(ForkResult::Parent { child }) => {
                debug!("spawned worker {}", child);
                pool.push(WorkerRecord { pid: child, channel: None });
            }
            Err(err) => {
                error!("Fatal: failed to fork worker: {}", err);
                shut_down_pool(&pool, &config.socket_path());
                return Err(Failed)
            }
        }
    }
    Ok(pool)
}

/// Terminates all recorded workers and removes the control socket.
///
/// Does not wait for the workers to exit.
fn shut_down_pool(pool: &[WorkerRecord], socket_path: &std::path::Path) {
    for record in pool {
        let _ = kill(record.pid, Signal::SIGTERM);
    }
    let _ = fs::remove_file(socket_path);
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use crate::fdpass::{RecvFdError, recv_fd};
    use crate::worker::READY_BYTE;

    fn mock_pool(count: usize) -> (Vec<WorkerRecord>, Vec<UnixStream>) {
        let mut pool = Vec::new();
        let mut remotes = Vec::new();
        for idx in 0..count {
            let (local, remote) = UnixStream::pair().unwrap();
            pool.push(WorkerRecord {
                pid: Pid::from_raw(1000 + idx as i32),
                channel: Some(local),
            });
            remotes.push(remote);
        }
        (pool, remotes)
    }

    #[test]
    fn ready_worker_selected() {
        let (mut pool, mut remotes) = mock_pool(2);
        remotes[1].write_all(&[READY_BYTE]).unwrap();
        assert_eq!(next_ready_worker(&mut pool), Some(1));
        remotes[0].write_all(&[READY_BYTE]).unwrap();
        assert_eq!(next_ready_worker(&mut pool), Some(0));
    }

    #[test]
    fn dead_worker_skipped() {
        let (mut pool, mut remotes) = mock_pool(2);
        drop(remotes.remove(0));
        remotes[0].write_all(&[READY_BYTE]).unwrap();
        assert_eq!(next_ready_worker(&mut pool), Some(1));
        assert!(pool[0].channel.is_none());
    }

    #[test]
    fn all_workers_dead() {
        let (mut pool, remotes) = mock_pool(2);
        drop(remotes);
        assert_eq!(next_ready_worker(&mut pool), None);
    }

    #[test]
    fn no_second_descriptor_before_readiness() {
        // Mock workers count their in-flight descriptors; the handoff
        // rule says that count can never reach two.
        const CLIENTS: usize = 20;
        let (mut pool, remotes) = mock_pool(3);
        let violations = Arc::new(AtomicUsize::new(0));
        let served = Arc::new(AtomicUsize::new(0));

        let mut joins = Vec::new();
        for mut remote in remotes {
            let violations = violations.clone();
            let served = served.clone();
            joins.push(thread::spawn(move || {
                remote.write_all(&[READY_BYTE]).unwrap();
                let in_flight = AtomicUsize::new(0);
                loop {
                    match recv_fd(&remote) {
                        Ok(fd) => {
                            if in_flight.fetch_add(1, Ordering::SeqCst)
                                >= 1
                            {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            drop(fd);
                            served.fetch_add(1, Ordering::SeqCst);
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            remote.write_all(&[READY_BYTE]).unwrap();
                        }
                        Err(RecvFdError::Disconnected) => break,
                        Err(err) => panic!("receive failed: {}", err),
                    }
                }
            }));
        }

        for _ in 0..CLIENTS {
            let idx = next_ready_worker(&mut pool).unwrap();
            let (local, remote) = UnixStream::pair().unwrap();
            send_fd(
                pool[idx].channel.as_ref().unwrap(),
                remote.as_raw_fd()
            ).unwrap();
            drop(remote);
            drop(local);
        }
        for record in &mut pool {
            record.channel = None;
        }
        for join in joins {
            join.join().unwrap();
        }
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(served.load(Ordering::SeqCst), CLIENTS);
    }
}
