//! Configuration.
//!
//! This module primarily contains the type [`Config`] that holds all the
//! configuration used by Percolator. It can be loaded both from a TOML
//! formatted config file and command line options.

use std::{fmt, fs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use clap::{Args, ArgAction, ArgMatches, Command, FromArgMatches};
use log::{LevelFilter, error};
#[cfg(unix)] use syslog::Facility;
use crate::error::Failed;


//------------ Defaults for Some Values --------------------------------------

/// The default listening port.
const DEFAULT_PORT: u16 = 8080;

/// The default number of worker processes.
const DEFAULT_WORKERS: usize = 4;

/// The default instance name.
const DEFAULT_INSTANCE: &str = "percolator";

/// The default root directory for executable handlers.
const DEFAULT_EXEC_ROOT: &str = "/var/lib/percolator";

/// The default client idle timeout in seconds.
const DEFAULT_READ_TIMEOUT: u64 = 5;

/// The directory for per-instance runtime files.
const RUNTIME_DIR: &str = "/tmp/percolator";

/// The default syslog facility.
#[cfg(unix)]
const DEFAULT_SYSLOG_FACILITY: Facility = Facility::LOG_DAEMON;


//------------ Config --------------------------------------------------------

/// Percolator configuration.
///
/// This type contains the complete configuration of a server instance:
/// the listening endpoint, the worker pool, how connections are handed to
/// workers, and what kind of handlers the workers run.
///
/// A value is constructed once at startup and passed by reference into
/// every component. Workers receive their own copy at spawn time through
/// process duplication; nothing ever mutates it after startup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// The TCP port to listen on.
    pub port: u16,

    /// The number of worker processes.
    pub workers: usize,

    /// The name of this server instance.
    ///
    /// Runtime files – the control socket, the PID file, and the log
    /// file – are derived from this name unless overridden explicitly.
    pub instance_name: String,

    /// The root directory for executable handlers.
    pub exec_root: PathBuf,

    /// How accepted connections reach the workers.
    pub dispatch: DispatchModel,

    /// What kind of handler the workers run.
    pub handler_kind: HandlerKind,

    /// Whether to detach from the terminal and run in the background.
    pub detach: bool,

    /// The maximum log level.
    pub log_level: LevelFilter,

    /// The target to log to.
    pub log_target: LogTarget,

    /// An explicit path for the PID file.
    pub pid_file: Option<PathBuf>,

    /// An explicit path for the control socket.
    pub socket_path: Option<PathBuf>,

    /// An explicit path for the log file.
    pub log_file: Option<PathBuf>,

    /// How long to wait for more bytes from an idle client.
    pub read_timeout: Duration,
}

impl Config {
    /// Adds the basic arguments to a clap command.
    ///
    /// The function follows clap’s builder pattern: it takes a command,
    /// adds a bunch of arguments to it and returns it at the end.
    pub fn config_args(app: Command) -> Command {
        GlobalArgs::augment_args(app)
    }

    /// Creates a configuration from command line matches.
    ///
    /// The function attempts to create configuration from the command line
    /// arguments provided via `matches`. It will try to read a config file
    /// if provided via the config file option (`-c` or `--config`),
    /// otherwise it starts out with the default configuration.
    ///
    /// All relative paths given in command line arguments will be
    /// interpreted relative to `cur_dir`. Conversely, paths in the config
    /// file are treated as relative to the config file’s directory.
    pub fn from_arg_matches(
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<Self, Failed> {
        let args = GlobalArgs::from_arg_matches(matches)
            .expect("bug in command line arguments parser");
        let mut res = match args.config.as_ref() {
            Some(path) => {
                Self::from_config_file(ConfigFile::read(&cur_dir.join(path))?)?
            }
            None => Self::default(),
        };
        res.apply_args(args, cur_dir);
        Ok(res)
    }

    /// Applies the command line arguments to the configuration.
    fn apply_args(&mut self, args: GlobalArgs, cur_dir: &Path) {
        if let Some(port) = args.port {
            self.port = port
        }
        if let Some(workers) = args.workers {
            self.workers = workers
        }
        if let Some(name) = args.name {
            self.instance_name = name
        }
        if let Some(path) = args.path {
            self.exec_root = cur_dir.join(path)
        }
        if let Some(dispatch) = args.dispatch {
            self.dispatch = dispatch
        }
        if let Some(kind) = args.handler {
            self.handler_kind = kind
        }
        if args.detach {
            self.detach = true
        }
        if let Some(level) = args.log_level {
            self.log_level = level
        }
        if let Some(path) = args.logfile {
            if path.as_os_str() == "-" {
                self.log_target = LogTarget::Stderr
            }
            else {
                let path = cur_dir.join(path);
                self.log_target = LogTarget::File(path.clone());
                self.log_file = Some(path);
            }
        }
        #[cfg(unix)]
        if args.syslog {
            self.log_target = LogTarget::Syslog(DEFAULT_SYSLOG_FACILITY)
        }
        if let Some(path) = args.pid_file {
            self.pid_file = Some(cur_dir.join(path))
        }
    }

    /// Creates a configuration from a config file.
    fn from_config_file(mut file: ConfigFile) -> Result<Self, Failed> {
        let mut res = Self::default();
        if let Some(port) = file.take_u16("port")? {
            res.port = port
        }
        if let Some(workers) = file.take_usize("workers")? {
            res.workers = workers
        }
        if let Some(name) = file.take_string("instance-name")? {
            res.instance_name = name
        }
        if let Some(path) = file.take_path("exec-root")? {
            res.exec_root = path
        }
        if let Some(value) = file.take_from_str::<DispatchModel>(
            "dispatch"
        )? {
            res.dispatch = value
        }
        if let Some(value) = file.take_from_str::<HandlerKind>(
            "handler"
        )? {
            res.handler_kind = value
        }
        if let Some(value) = file.take_from_str::<LevelFilter>(
            "log-level"
        )? {
            res.log_level = value
        }
        if let Some(path) = file.take_path("log-file")? {
            res.log_target = LogTarget::File(path.clone());
            res.log_file = Some(path);
        }
        if let Some(path) = file.take_path("pid-file")? {
            res.pid_file = Some(path)
        }
        if let Some(path) = file.take_path("socket-path")? {
            res.socket_path = Some(path)
        }
        if let Some(secs) = file.take_usize("read-timeout")? {
            res.read_timeout = Duration::from_secs(secs as u64)
        }
        file.check_exhausted()?;
        Ok(res)
    }

    /// Returns the path of the control socket for this instance.
    ///
    /// This is the rendezvous address workers connect to under the
    /// handoff dispatch model.
    pub fn socket_path(&self) -> PathBuf {
        match self.socket_path.as_ref() {
            Some(path) => path.clone(),
            None => Path::new(RUNTIME_DIR).join(
                format!("percolator-{}.sock", self.instance_name)
            )
        }
    }

    /// Returns the path of the PID file for this instance.
    pub fn pid_path(&self) -> PathBuf {
        match self.pid_file.as_ref() {
            Some(path) => path.clone(),
            None => Path::new(RUNTIME_DIR).join(
                format!("percolator-{}.pid", self.instance_name)
            )
        }
    }

    /// Returns the path of the log file for this instance.
    pub fn log_path(&self) -> PathBuf {
        match self.log_file.as_ref() {
            Some(path) => path.clone(),
            None => Path::new(RUNTIME_DIR).join(
                format!("percolator-{}.log", self.instance_name)
            )
        }
    }

    /// Returns the directory holding per-instance runtime files.
    ///
    /// Creates the directory if it doesn’t exist yet.
    pub fn runtime_dir() -> Result<PathBuf, Failed> {
        let dir = PathBuf::from(RUNTIME_DIR);
        if let Err(err) = fs::create_dir_all(&dir) {
            error!(
                "Fatal: failed to create runtime directory {}: {}",
                dir.display(), err
            );
            return Err(Failed)
        }
        Ok(dir)
    }

    /// Returns a TOML representation of the configuration.
    pub fn to_toml(&self) -> toml::Value {
        let mut res = toml::value::Table::new();
        res.insert("port".into(), (self.port as i64).into());
        res.insert("workers".into(), (self.workers as i64).into());
        res.insert(
            "instance-name".into(), self.instance_name.clone().into()
        );
        res.insert(
            "exec-root".into(),
            format!("{}", self.exec_root.display()).into()
        );
        res.insert("dispatch".into(), format!("{}", self.dispatch).into());
        res.insert("handler".into(), format!("{}", self.handler_kind).into());
        res.insert(
            "log-level".into(), format!("{}", self.log_level).into()
        );
        res.insert(
            "read-timeout".into(),
            (self.read_timeout.as_secs() as i64).into()
        );
        res.into()
    }
}


//--- Default

impl Default for Config {
    fn default() -> Self {
        Config {
            port: DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            instance_name: DEFAULT_INSTANCE.into(),
            exec_root: DEFAULT_EXEC_ROOT.into(),
            dispatch: DispatchModel::Handoff,
            handler_kind: HandlerKind::Subprocess,
            detach: false,
            log_level: LevelFilter::Info,
            log_target: LogTarget::default(),
            pid_file: None,
            socket_path: None,
            log_file: None,
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT),
        }
    }
}


//------------ GlobalArgs ----------------------------------------------------

/// The command line arguments for the basic configuration.
#[derive(Clone, Debug, Args)]
struct GlobalArgs {
    /// Read base configuration from this file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listen on this TCP port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Number of worker processes
    #[arg(short, long, value_name = "COUNT")]
    workers: Option<usize>,

    /// Name of this server instance
    #[arg(short, long, value_name = "NAME")]
    name: Option<String>,

    /// Base path for executable handlers
    #[arg(long, value_name = "DIR")]
    path: Option<PathBuf>,

    /// Connection dispatch model: "handoff" or "shared-listener"
    #[arg(long, value_name = "MODEL")]
    dispatch: Option<DispatchModel>,

    /// Handler kind: "subprocess" or "wasm"
    #[arg(long, value_name = "KIND")]
    handler: Option<HandlerKind>,

    /// Detach from the terminal and run in the background
    #[arg(short = 'D', long)]
    detach: bool,

    /// Log verbosity: error, warn, info, or debug
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<LevelFilter>,

    /// Log to this file ("-" for stderr)
    #[arg(long, value_name = "PATH")]
    logfile: Option<PathBuf>,

    /// Log to syslog
    #[cfg(unix)]
    #[arg(long, action = ArgAction::SetTrue)]
    syslog: bool,

    /// The file for keeping the process ID
    #[arg(long, value_name = "PATH")]
    pid_file: Option<PathBuf>,
}


//------------ DispatchModel -------------------------------------------------

/// How accepted connections reach the workers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchModel {
    /// The master accepts and transfers each descriptor to an idle worker.
    Handoff,

    /// All workers inherit the listener and call `accept` themselves.
    SharedListener,
}

impl FromStr for DispatchModel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "handoff" => Ok(DispatchModel::Handoff),
            "shared-listener" => Ok(DispatchModel::SharedListener),
            _ => Err(format!("invalid dispatch model '{}'", value))
        }
    }
}

impl fmt::Display for DispatchModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            DispatchModel::Handoff => "handoff",
            DispatchModel::SharedListener => "shared-listener",
        })
    }
}


//------------ HandlerKind ---------------------------------------------------

/// What kind of handler the workers run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandlerKind {
    /// Spawn an executable or script with a CGI-style environment.
    Subprocess,

    /// Run a sandboxed WebAssembly module.
    WasmModule,
}

impl FromStr for HandlerKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "subprocess" => Ok(HandlerKind::Subprocess),
            "wasm" => Ok(HandlerKind::WasmModule),
            _ => Err(format!("invalid handler kind '{}'", value))
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            HandlerKind::Subprocess => "subprocess",
            HandlerKind::WasmModule => "wasm",
        })
    }
}


//------------ LogTarget -----------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug)]
pub enum LogTarget {
    /// Default.
    ///
    /// Logs to the instance’s log file in detached mode and `Stderr`
    /// otherwise.
    #[cfg(unix)]
    Default(Facility),

    /// Syslog.
    #[cfg(unix)]
    Syslog(Facility),

    /// A file.
    File(PathBuf),

    /// Stderr.
    Stderr,
}

#[cfg(unix)]
impl Default for LogTarget {
    fn default() -> Self {
        LogTarget::Default(DEFAULT_SYSLOG_FACILITY)
    }
}

#[cfg(not(unix))]
impl Default for LogTarget {
    fn default() -> Self {
        LogTarget::Stderr
    }
}

impl PartialEq for LogTarget {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            #[cfg(unix)]
            (LogTarget::Default(s), LogTarget::Default(o)) => {
                (*s as usize) == (*o as usize)
            }
            #[cfg(unix)]
            (LogTarget::Syslog(s), LogTarget::Syslog(o)) => {
                (*s as usize) == (*o as usize)
            }
            (LogTarget::File(s), LogTarget::File(o)) => s == o,
            (LogTarget::Stderr, LogTarget::Stderr) => true,
            _ => false
        }
    }
}

impl Eq for LogTarget { }


//------------ ConfigFile ----------------------------------------------------

/// The content of a config file.
///
/// This is a thin wrapper around a TOML table that keeps the path the file
/// was read from so relative paths in the file can be resolved and errors
/// can name the file.
struct ConfigFile {
    /// The content of the file.
    content: toml::value::Table,

    /// The path to the config file.
    path: PathBuf,

    /// The directory we found the file in.
    ///
    /// This is used in relative paths.
    dir: PathBuf,
}

impl ConfigFile {
    /// Reads the config file at the given path.
    fn read(path: &Path) -> Result<Self, Failed> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                error!(
                    "Failed to read config file {}: {}",
                    path.display(), err
                );
                return Err(Failed)
            }
        };
        Self::parse(&content, path)
    }

    /// Parses the content of the file from a string.
    fn parse(content: &str, path: &Path) -> Result<Self, Failed> {
        let content = match toml::from_str(content) {
            Ok(toml::Value::Table(content)) => content,
            Ok(_) => {
                error!(
                    "Failed to parse config file {}: not a mapping",
                    path.display()
                );
                return Err(Failed)
            }
            Err(err) => {
                error!(
                    "Failed to parse config file {}: {}",
                    path.display(), err
                );
                return Err(Failed)
            }
        };
        let dir = match path.parent() {
            Some(dir) => dir.into(),
            None => PathBuf::new(),
        };
        Ok(ConfigFile {
            content,
            path: path.into(),
            dir,
        })
    }

    /// Takes a string value from the config file.
    fn take_string(&mut self, key: &str) -> Result<Option<String>, Failed> {
        match self.content.remove(key) {
            Some(toml::Value::String(res)) => Ok(Some(res)),
            Some(_) => {
                error!(
                    "Error in config file {}: '{}' expected to be a string.",
                    self.path.display(), key
                );
                Err(Failed)
            }
            None => Ok(None)
        }
    }

    /// Takes a non-negative integer value from the config file.
    fn take_usize(&mut self, key: &str) -> Result<Option<usize>, Failed> {
        match self.content.remove(key) {
            Some(toml::Value::Integer(res)) => {
                res.try_into().map(Some).map_err(|_| {
                    error!(
                        "Error in config file {}: \
                         '{}' expected to be a non-negative integer.",
                        self.path.display(), key
                    );
                    Failed
                })
            }
            Some(_) => {
                error!(
                    "Error in config file {}: \
                     '{}' expected to be an integer.",
                    self.path.display(), key
                );
                Err(Failed)
            }
            None => Ok(None)
        }
    }

    /// Takes a 16 bit unsigned integer value from the config file.
    fn take_u16(&mut self, key: &str) -> Result<Option<u16>, Failed> {
        match self.take_usize(key)? {
            Some(value) => {
                value.try_into().map(Some).map_err(|_| {
                    error!(
                        "Error in config file {}: \
                         '{}' expected to be in the range 0..65536.",
                        self.path.display(), key
                    );
                    Failed
                })
            }
            None => Ok(None)
        }
    }

    /// Takes a path value from the config file.
    ///
    /// Relative paths are interpreted relative to the file’s directory.
    fn take_path(&mut self, key: &str) -> Result<Option<PathBuf>, Failed> {
        self.take_string(key).map(|opt| {
            opt.map(|path| self.dir.join(path))
        })
    }

    /// Takes any value that can be created from a string.
    fn take_from_str<T: FromStr>(
        &mut self, key: &str
    ) -> Result<Option<T>, Failed> {
        match self.take_string(key)? {
            Some(value) => match T::from_str(&value) {
                Ok(value) => Ok(Some(value)),
                Err(_) => {
                    error!(
                        "Error in config file {}: \
                         invalid value for '{}'.",
                        self.path.display(), key
                    );
                    Err(Failed)
                }
            }
            None => Ok(None)
        }
    }

    /// Checks that no unexpected keys remain.
    fn check_exhausted(&self) -> Result<(), Failed> {
        if let Some(key) = self.content.keys().next() {
            error!(
                "Error in config file {}: unknown setting '{}'.",
                self.path.display(), key
            );
            return Err(Failed)
        }
        Ok(())
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_file(content: &str) -> Config {
        Config::from_config_file(
            ConfigFile::parse(content, Path::new("/test/percolator.conf"))
                .unwrap()
        ).unwrap()
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.instance_name, DEFAULT_INSTANCE);
        assert_eq!(config.exec_root, Path::new(DEFAULT_EXEC_ROOT));
        assert_eq!(config.dispatch, DispatchModel::Handoff);
        assert_eq!(config.handler_kind, HandlerKind::Subprocess);
        assert_eq!(config.log_level, LevelFilter::Info);
        assert_eq!(
            config.read_timeout,
            Duration::from_secs(DEFAULT_READ_TIMEOUT)
        );
        assert_eq!(
            config.socket_path(),
            Path::new("/tmp/percolator/percolator-percolator.sock")
        );
    }

    #[test]
    fn good_config_file() {
        let config = parse_file(
            "port = 9090\n\
             workers = 2\n\
             instance-name = \"espresso\"\n\
             exec-root = \"handlers\"\n\
             dispatch = \"shared-listener\"\n\
             handler = \"wasm\"\n\
             log-level = \"debug\"\n\
             log-file = \"server.log\"\n\
             socket-path = \"control.sock\"\n\
             read-timeout = 30\n"
        );
        assert_eq!(config.port, 9090);
        assert_eq!(config.workers, 2);
        assert_eq!(config.instance_name, "espresso");
        assert_eq!(config.exec_root, Path::new("/test/handlers"));
        assert_eq!(config.dispatch, DispatchModel::SharedListener);
        assert_eq!(config.handler_kind, HandlerKind::WasmModule);
        assert_eq!(config.log_level, LevelFilter::Debug);
        assert_eq!(
            config.log_target,
            LogTarget::File("/test/server.log".into())
        );
        assert_eq!(config.log_path(), Path::new("/test/server.log"));
        assert_eq!(config.socket_path(), Path::new("/test/control.sock"));
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(
            config.pid_path(),
            Path::new("/tmp/percolator/percolator-espresso.pid")
        );
    }

    #[test]
    fn bad_config_file() {
        assert!(
            ConfigFile::parse("not a toml file", Path::new("/test/x"))
                .is_err()
        );
        assert!(
            Config::from_config_file(
                ConfigFile::parse(
                    "port = \"eight\"", Path::new("/test/x")
                ).unwrap()
            ).is_err()
        );
        assert!(
            Config::from_config_file(
                ConfigFile::parse(
                    "dispatch = \"carrier-pigeon\"", Path::new("/test/x")
                ).unwrap()
            ).is_err()
        );
        assert!(
            Config::from_config_file(
                ConfigFile::parse(
                    "no-such-setting = true", Path::new("/test/x")
                ).unwrap()
            ).is_err()
        );
    }
}
