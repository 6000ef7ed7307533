//! Logging.
//!
//! All diagnostic output goes through the `log` crate into a global
//! logger installed once at startup. The logger starts out provisional,
//! writing everything to stderr, and is switched to the configured
//! target once the configuration has been loaded.
//!
//! Syslog and file targets don’t write from the request path. Messages
//! are queued and a dedicated thread drains the queue, so a slow log
//! sink cannot stall the master loop.

use std::{fs, io, process, thread};
use std::collections::VecDeque;
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use chrono::{DateTime, Local};
use log::{error, LevelFilter};
use once_cell::sync::OnceCell;
use crate::config::{Config, LogTarget};
use crate::error::Failed;


//------------ Module Interface ----------------------------------------------

/// Installs the provisional logger.
///
/// Needs to happen before anything that may log. Until [`switch`] is
/// called, messages of level warn and up go to stderr.
pub fn init() -> Result<(), Failed> {
    log::set_max_level(LevelFilter::Warn);
    if let Err(err) = log::set_logger(&GLOBAL_LOGGER) {
        eprintln!("Failed to initialize logger: {}.\nAborting.", err);
        return Err(Failed)
    }
    Ok(())
}

/// Switches logging to the configured target.
pub fn switch(config: &Config, daemon: bool) -> Result<(), Failed> {
    let logger = Logger::new(config, daemon)?;
    GLOBAL_LOGGER.switch(logger);
    log::set_max_level(config.log_level);
    Ok(())
}


//------------ Logger --------------------------------------------------------

/// Format and write log messages.
struct Logger {
    /// Where to write messages to.
    target: Mutex<LogBackend>,

    /// The queue drained by the flush thread, if one is running.
    queue: Option<Arc<LogQueue>>,

    /// The maximum log level.
    log_level: LevelFilter,
}

/// The actual target for logging.
enum LogBackend {
    #[cfg(unix)]
    Syslog(SyslogLogger),
    File {
        file: fs::File,
        path: PathBuf,
    },
    Stderr(io::Stderr),
}

impl Logger {
    /// Creates a new logger from the config.
    fn new(config: &Config, daemon: bool) -> Result<Self, Failed> {
        let target = match config.log_target {
            #[cfg(unix)]
            LogTarget::Default(_) => {
                if daemon {
                    if config.log_file.is_none() {
                        Config::runtime_dir()?;
                    }
                    Self::new_file_target(config.log_path())?
                }
                else {
                    LogBackend::Stderr(io::stderr())
                }
            }
            #[cfg(unix)]
            LogTarget::Syslog(facility) => {
                Self::new_syslog_target(facility)?
            }
            LogTarget::File(ref path) => {
                Self::new_file_target(path.clone())?
            }
            LogTarget::Stderr => LogBackend::Stderr(io::stderr()),
        };
        // Stderr writes are cheap enough to do inline. If the flush
        // thread cannot be spawned, fall back to inline writes too.
        let queue = match target {
            LogBackend::Stderr(_) => None,
            _ => LogQueue::start().ok(),
        };
        Ok(Self {
            target: Mutex::new(target),
            queue,
            log_level: config.log_level,
        })
    }

    #[cfg(unix)]
    fn new_syslog_target(
        facility: syslog::Facility
    ) -> Result<LogBackend, Failed> {
        SyslogLogger::new(facility).map(LogBackend::Syslog)
    }

    fn new_file_target(path: PathBuf) -> Result<LogBackend, Failed> {
        Ok(LogBackend::File {
            file: match open_log_file(&path) {
                Ok(file) => file,
                Err(err) => {
                    error!(
                        "Failed to open log file '{}': {}",
                        path.display(), err
                    );
                    return Err(Failed)
                }
            },
            path
        })
    }

    /// Logs a message.
    fn log(&self, record: &log::Record) {
        if self.should_ignore(record) {
            return;
        }
        let entry = LogEntry {
            when: Local::now(),
            level: record.level(),
            message: record.args().to_string(),
        };
        match self.queue.as_ref() {
            Some(queue) => queue.push(entry),
            None => {
                if let Err(err) = self.write_entry(&entry) {
                    self.log_failure(err)
                }
            }
        }
    }

    /// Writes one entry to the backend.
    fn write_entry(&self, entry: &LogEntry) -> Result<(), io::Error> {
        match self.target.lock().unwrap().deref_mut() {
            #[cfg(unix)]
            LogBackend::Syslog(ref mut logger) => logger.log(entry),
            LogBackend::File { ref mut file, .. } => {
                writeln!(
                    file, "{} [{}] {}",
                    entry.when.format("[%Y-%m-%d %H:%M:%S]"),
                    entry.level, entry.message
                )
            }
            LogBackend::Stderr(ref mut stderr) => {
                // We never fail when writing to stderr.
                let _ = writeln!(
                    stderr, "[{}] {}", entry.level, entry.message
                );
                Ok(())
            }
        }
    }

    /// Handles an error that happened during logging.
    fn log_failure(&self, err: io::Error) -> ! {
        // Try to leave a meaningful message on stderr and then abort.
        match self.target.lock().unwrap().deref() {
            #[cfg(unix)]
            LogBackend::Syslog(_) => {
                eprintln!("Logging to syslog failed: {}. Exiting.", err);
            }
            LogBackend::File { ref path, .. } => {
                eprintln!(
                    "Logging to file {} failed: {}. Exiting.",
                    path.display(), err
                );
            }
            LogBackend::Stderr(_) => { }
        }
        process::exit(1)
    }

    /// Flushes queued entries and the backend.
    fn flush(&self) {
        if let Some(queue) = self.queue.as_ref() {
            for entry in queue.drain() {
                if let Err(err) = self.write_entry(&entry) {
                    self.log_failure(err)
                }
            }
        }
        match self.target.lock().unwrap().deref_mut() {
            #[cfg(unix)]
            LogBackend::Syslog(ref mut logger) => logger.flush(),
            LogBackend::File { ref mut file, .. } => {
                let _ = file.flush();
            }
            LogBackend::Stderr(ref mut stderr) => {
                let _ = stderr.lock().flush();
            }
        }
    }

    /// Determines whether a log record should be ignored.
    ///
    /// Filters out chatter from libraries unless we are debugging.
    fn should_ignore(&self, record: &log::Record) -> bool {
        let module = match record.module_path() {
            Some(module) => module,
            None => return false,
        };
        if self.log_level >= LevelFilter::Debug {
            return false
        }
        record.level() > log::Level::Info && (
               module.starts_with("wasmtime")
            || module.starts_with("cranelift")
        )
    }
}

/// Opens a log file for appending.
fn open_log_file(path: &PathBuf) -> Result<fs::File, io::Error> {
    fs::OpenOptions::new().create(true).append(true).open(path)
}


//------------ LogEntry ------------------------------------------------------

/// A formatted message waiting to be written.
struct LogEntry {
    when: DateTime<Local>,
    level: log::Level,
    message: String,
}


//------------ LogQueue ------------------------------------------------------

/// The queue between loggers and the flush thread.
struct LogQueue {
    entries: Mutex<VecDeque<LogEntry>>,
    bell: Condvar,
}

impl LogQueue {
    /// Creates the queue and spawns the flush thread.
    fn start() -> Result<Arc<Self>, io::Error> {
        let queue = Arc::new(LogQueue {
            entries: Mutex::new(VecDeque::new()),
            bell: Condvar::new(),
        });
        let waiter = queue.clone();
        thread::Builder::new()
            .name("log-flush".into())
            .spawn(move || {
                loop {
                    for entry in waiter.wait() {
                        if let Some(logger) = GLOBAL_LOGGER.inner.get() {
                            if let Err(err) = logger.write_entry(&entry) {
                                logger.log_failure(err)
                            }
                        }
                    }
                }
            })?;
        Ok(queue)
    }

    /// Appends an entry and wakes the flush thread.
    fn push(&self, entry: LogEntry) {
        self.entries.lock().unwrap().push_back(entry);
        self.bell.notify_one();
    }

    /// Takes everything currently queued.
    fn drain(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().drain(..).collect()
    }

    /// Blocks until entries arrive, then takes them all.
    fn wait(&self) -> Vec<LogEntry> {
        let mut entries = self.entries.lock().unwrap();
        while entries.is_empty() {
            entries = self.bell.wait(entries).unwrap();
        }
        entries.drain(..).collect()
    }
}


//------------ SyslogLogger --------------------------------------------------

/// A syslog logger.
///
/// This is essentially [`syslog::BasicLogger`] but that one keeps the
/// logger behind a mutex – which we already do – and doesn’t return
/// errors – which we do want to see.
#[cfg(unix)]
struct SyslogLogger(
    syslog::Logger<syslog::LoggerBackend, syslog::Formatter3164>
);

#[cfg(unix)]
impl SyslogLogger {
    /// Creates a new syslog logger.
    fn new(facility: syslog::Facility) -> Result<Self, Failed> {
        let process = std::env::current_exe().ok().and_then(|path|
            path.file_name()
                .and_then(std::ffi::OsStr::to_str)
                .map(ToString::to_string)
        ).unwrap_or_else(|| String::from("percolator"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone()).or_else(|_| {
            syslog::tcp(formatter.clone(), ("127.0.0.1", 601))
        }).or_else(|_| {
            syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514))
        });
        match logger {
            Ok(logger) => Ok(Self(logger)),
            Err(err) => {
                error!("Cannot connect to syslog: {}", err);
                Err(Failed)
            }
        }
    }

    /// Tries logging.
    fn log(&mut self, entry: &LogEntry) -> Result<(), io::Error> {
        match entry.level {
            log::Level::Error => self.0.err(&entry.message),
            log::Level::Warn => self.0.warning(&entry.message),
            log::Level::Info => self.0.info(&entry.message),
            log::Level::Debug => self.0.debug(&entry.message),
            log::Level::Trace => self.0.debug(&entry.message),
        }.map_err(|err| {
            match err.0 {
                syslog::ErrorKind::Io(err) => err,
                syslog::ErrorKind::Msg(err) => {
                    io::Error::new(io::ErrorKind::Other, err)
                }
                err => {
                    io::Error::new(io::ErrorKind::Other, format!("{}", err))
                }
            }
        })
    }

    /// Flushes the logger.
    ///
    /// Ignores any errors.
    fn flush(&mut self) {
        let _ = self.0.backend.flush();
    }
}


//------------ GlobalLogger --------------------------------------------------

/// The global logger.
///
/// A value of this type can go into a static. Until a proper logger is
/// installed, it just writes all log output to stderr.
struct GlobalLogger {
    /// The real logger. Can only be set once.
    inner: OnceCell<Logger>,
}

/// The static for the log crate.
static GLOBAL_LOGGER: GlobalLogger = GlobalLogger::new();

impl GlobalLogger {
    /// Creates a new provisional logger.
    const fn new() -> Self {
        GlobalLogger { inner: OnceCell::new() }
    }

    /// Switches to the proper logger.
    fn switch(&self, logger: Logger) {
        if self.inner.set(logger).is_err() {
            panic!("Tried to switch logger more than once.")
        }
    }
}

impl log::Log for GlobalLogger {
    fn enabled(&self, _: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        match self.inner.get() {
            Some(logger) => logger.log(record),
            None => {
                let _ = writeln!(
                    io::stderr().lock(), "[{}] {}",
                    record.level(), record.args()
                );
            }
        }
    }

    fn flush(&self) {
        if let Some(logger) = self.inner.get() {
            logger.flush()
        }
    }
}


//============ Tests =========================================================
