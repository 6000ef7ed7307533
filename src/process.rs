//! Managing the process the server runs in.

use std::{fs, process};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use log::error;
use nix::errno::Errno;
use nix::fcntl::{FlockArg, OFlag, flock, open};
use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, Signal, kill, sigaction
};
use nix::sys::stat::Mode;
use nix::unistd::{Pid, chdir, dup2, fork, getpid, setsid, write};
use crate::config::Config;
use crate::error::Failed;
use crate::log as logging;


//------------ Process -------------------------------------------------------

/// A representation of the process the server runs in.
///
/// This type wraps up everything around the actual serving: logging,
/// the PID file, detaching from the terminal, and the shutdown signals.
pub struct Process {
    config: Config,
    service: ServiceImpl,
}

impl Process {
    pub fn init() -> Result<(), Failed> {
        logging::init()
    }

    /// Creates a new process object.
    pub fn new(config: Config) -> Self {
        Process {
            service: ServiceImpl::default(),
            config
        }
    }

    /// Returns a reference to the config.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// # Logging
///
impl Process {
    /// Switches logging to the configured target.
    ///
    /// Once the configuration has been successfully loaded, logging
    /// should be switched to whatever the user asked for via this
    /// method.
    pub fn switch_logging(&self, daemon: bool) -> Result<(), Failed> {
        logging::switch(&self.config, daemon)
    }
}

/// # System Service
///
impl Process {
    /// Sets up the system service.
    ///
    /// Creates and locks the PID file, at the configured path or the
    /// instance’s conventional one, and, if `detach` is `true`, detaches
    /// from the terminal and keeps running in the background.
    ///
    /// This method may encounter and log errors after detaching. You
    /// should therefore call [`switch_logging`][Self::switch_logging]
    /// before this method.
    pub fn setup_service(&mut self, detach: bool) -> Result<(), Failed> {
        self.service.setup_service(&self.config, detach)
    }

    /// Installs the handler that turns SIGTERM and SIGINT into a
    /// graceful shutdown.
    pub fn install_shutdown_handler(&self) -> Result<(), Failed> {
        install_shutdown_handler()
    }

    /// Removes the PID file on the way out.
    pub fn cleanup(&self) {
        let _ = fs::remove_file(self.config.pid_path());
    }
}


//------------ Shutdown Handling ---------------------------------------------

/// Whether a shutdown signal has arrived.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Returns whether the process was asked to shut down.
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

extern "C" fn handle_shutdown_signal(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Installs the shutdown handler for SIGTERM and SIGINT.
///
/// The handler is installed without SA_RESTART so a blocking accept
/// returns with EINTR and the main loop gets to see the flag.
fn install_shutdown_handler() -> Result<(), Failed> {
    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGTERM, Signal::SIGINT] {
        if let Err(err) = unsafe { sigaction(signal, &action) } {
            error!("Fatal: cannot install {} handler: {}", signal, err);
            return Err(Failed)
        }
    }
    Ok(())
}


//------------ Stopping an Instance ------------------------------------------

/// Asks the running instance behind the config to shut down.
///
/// Reads the instance’s PID file and sends SIGTERM. A PID file whose
/// process is gone is stale and gets removed.
pub fn stop_instance(config: &Config) -> Result<(), Failed> {
    let path = config.pid_path();
    let pid = read_pid_file(&path)?;
    match kill(pid, Signal::SIGTERM) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            error!(
                "Instance '{}' is not running, removing stale PID file.",
                config.instance_name
            );
            let _ = fs::remove_file(&path);
            Err(Failed)
        }
        Err(err) => {
            error!("Fatal: cannot signal process {}: {}", pid, err);
            Err(Failed)
        }
    }
}

/// Reads and parses a PID file.
fn read_pid_file(path: &Path) -> Result<Pid, Failed> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            error!(
                "Fatal: cannot read PID file {}: {}", path.display(), err
            );
            return Err(Failed)
        }
    };
    match content.trim().parse::<libc::pid_t>() {
        Ok(pid) if pid > 0 => Ok(Pid::from_raw(pid)),
        _ => {
            error!(
                "Fatal: PID file {} does not contain a PID.",
                path.display()
            );
            Err(Failed)
        }
    }
}


//------------ ServiceImpl ---------------------------------------------------

/// The Unix side of running as a service.
#[derive(Debug, Default)]
struct ServiceImpl {
    pid_file: Option<OwnedFd>,
}

impl ServiceImpl {
    fn setup_service(
        &mut self, config: &Config, detach: bool
    ) -> Result<(), Failed> {
        if config.pid_file.is_none() {
            Config::runtime_dir()?;
        }
        self.create_pid_file(&config.pid_path())?;
        if detach {
            self.detach()?
        }
        self.write_pid_file()
    }

    /// Opens and locks the PID file.
    ///
    /// The lock is what actually guards against a second instance under
    /// the same name; it dies with the process even if the file stays.
    fn create_pid_file(&mut self, path: &Path) -> Result<(), Failed> {
        let fd = match open(
            path,
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
            Mode::from_bits_truncate(0o666)
        ) {
            Ok(fd) => fd,
            Err(err) => {
                error!("Fatal: failed to create PID file {}: {}",
                    path.display(), err
                );
                return Err(Failed)
            }
        };
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        if let Err(err) = flock(
            fd.as_raw_fd(), FlockArg::LockExclusiveNonblock
        ) {
            error!("Fatal: cannot lock PID file {}: {}",
                path.display(), err
            );
            return Err(Failed)
        }
        self.pid_file = Some(fd);
        Ok(())
    }

    /// Writes our PID to the locked PID file.
    ///
    /// Happens after detaching so the file carries the PID of the final
    /// process.
    fn write_pid_file(&self) -> Result<(), Failed> {
        if let Some(pid_file) = self.pid_file.as_ref() {
            let pid = format!("{}", getpid());
            match write(pid_file.as_raw_fd(), pid.as_bytes()) {
                Ok(len) if len == pid.len() => {}
                Ok(_) => {
                    error!(
                        "Fatal: failed to write PID to PID file: \
                         short write"
                    );
                    return Err(Failed)
                }
                Err(err) => {
                    error!(
                        "Fatal: failed to write PID to PID file: {}", err
                    );
                    return Err(Failed)
                }
            }
        }
        Ok(())
    }

    /// Detaches from the terminal.
    ///
    /// The usual double fork with a session in between, then the
    /// standard streams get pointed at /dev/null.
    fn detach(&self) -> Result<(), Failed> {
        self.fork_and_exit_parent()?;
        if let Err(err) = setsid() {
            error!("Fatal: failed to create session: {}", err);
            return Err(Failed)
        }
        self.fork_and_exit_parent()?;
        if let Err(err) = chdir("/") {
            error!("Fatal: failed to change to /: {}", err);
            return Err(Failed)
        }
        self.redirect_standard_streams()
    }

    fn fork_and_exit_parent(&self) -> Result<(), Failed> {
        match unsafe { fork() } {
            Ok(res) => {
                if res.is_parent() {
                    process::exit(0)
                }
                Ok(())
            }
            Err(err) => {
                error!("Fatal: failed to detach: {}", err);
                Err(Failed)
            }
        }
    }

    fn redirect_standard_streams(&self) -> Result<(), Failed> {
        let null = match fs::OpenOptions::new()
            .read(true).write(true).open("/dev/null")
        {
            Ok(null) => null,
            Err(err) => {
                error!("Fatal: cannot open /dev/null: {}", err);
                return Err(Failed)
            }
        };
        for stream in 0..3 {
            if let Err(err) = dup2(null.as_raw_fd(), stream) {
                error!(
                    "Fatal: cannot redirect standard stream {}: {}",
                    stream, err
                );
                return Err(Failed)
            }
        }
        Ok(())
    }
}

//============ Tests =========================================================
