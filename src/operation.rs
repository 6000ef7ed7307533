//! What Percolator can do for you.
//!
//! This module implements all the commands users can ask Percolator to
//! perform. They are encapsulated in the type [`Operation`] which can
//! determine the command from the command line arguments and then execute
//! it.

// Some functions here have unnecessarily wrapped return types for
// consistency.
#![allow(clippy::unnecessary_wraps)]

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use clap::{ArgMatches, Args, FromArgMatches};
use log::{error, info};
use crate::{deploy, instances, master, process};
use crate::config::Config;
use crate::error::{ExitError, Failed};
use crate::process::Process;


//------------ Operation -----------------------------------------------------

/// The command to execute.
///
/// This type collects all the commands we have defined plus any possible
/// extra configuration they support.
///
/// You can create a value from the command line arguments. First, you add
/// all necessary sub-commands and arguments to a clap `Command` via
/// [`config_args`][Self::config_args] and then process the argument
/// matches into a value in
/// [`from_arg_matches`][Self::from_arg_matches]. Finally, you can execute
/// the created command through the [`run`][Self::run] method.
pub enum Operation {
    Server(Server),
    Stop(Stop),
    List(List),
    Deploy(Deploy),
    ShowLog(ShowLog),
    PrintConfig(PrintConfig),
}

impl Operation {
    /// Prepares everything.
    ///
    /// Call this before doing anything else.
    pub fn prepare() -> Result<(), Failed> {
        Process::init()
    }

    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        let app = Server::config_args(app);
        let app = Stop::config_args(app);
        let app = List::config_args(app);
        let app = Deploy::config_args(app);
        let app = ShowLog::config_args(app);
        PrintConfig::config_args(app)
    }

    /// Creates a command from clap matches.
    pub fn from_arg_matches(
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<Self, Failed> {
        Ok(match matches.subcommand() {
            Some(("server", _)) => Operation::Server(Server),
            Some(("stop", _)) => Operation::Stop(Stop),
            Some(("list", _)) => Operation::List(List),
            Some(("deploy", matches)) => {
                Operation::Deploy(
                    Deploy::from_arg_matches(matches, cur_dir)?
                )
            }
            Some(("log", matches)) => {
                Operation::ShowLog(ShowLog::from_arg_matches(matches)?)
            }
            Some(("config", _)) => Operation::PrintConfig(PrintConfig),
            _ => {
                error!(
                    "Failed: a command is required.\n\
                     \nCommonly used commands are:\
                     \n   server  Start serving requests\
                     \n   stop    Stop a running instance\
                     \n   list    List known instances\
                     \n   deploy  Install a handler\
                     \n\
                     \nSee percolator -h for a usage summary."
                );
                return Err(Failed)
            }
        })
    }

    /// Runs the command.
    ///
    /// Depending on the command, this method may switch to logging at
    /// some point.
    pub fn run(self, config: Config) -> Result<(), ExitError> {
        let process = Process::new(config);
        match self {
            Operation::Server(cmd) => cmd.run(process),
            Operation::Stop(cmd) => cmd.run(process),
            Operation::List(cmd) => cmd.run(process),
            Operation::Deploy(cmd) => cmd.run(process),
            Operation::ShowLog(cmd) => cmd.run(process),
            Operation::PrintConfig(cmd) => cmd.run(process),
        }
    }
}


//------------ Server --------------------------------------------------------

/// Run as server.
pub struct Server;

impl Server {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            clap::Command::new("server")
                .about("Starts serving requests")
        )
    }

    /// Starts Percolator in server mode.
    ///
    /// If detaching was requested, forks into the background first.
    /// Otherwise just runs the server until a shutdown signal arrives.
    pub fn run(self, mut process: Process) -> Result<(), ExitError> {
        let detach = process.config().detach;
        process.switch_logging(detach)?;
        process.install_shutdown_handler()?;
        process.setup_service(detach)?;
        info!(
            "Starting instance '{}' on port {}.",
            process.config().instance_name, process.config().port
        );
        let res = master::run(process.config());
        process.cleanup();
        res?;
        Ok(())
    }
}


//------------ Stop ----------------------------------------------------------

/// Stop a running instance.
pub struct Stop;

impl Stop {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            clap::Command::new("stop")
                .about("Stops a running instance")
        )
    }

    /// Sends the shutdown signal to the configured instance.
    pub fn run(self, process: Process) -> Result<(), ExitError> {
        process.switch_logging(false)?;
        process::stop_instance(process.config())?;
        Ok(())
    }
}


//------------ List ----------------------------------------------------------

/// List known instances.
pub struct List;

impl List {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            clap::Command::new("list")
                .about("Lists known instances")
        )
    }

    /// Prints the known instances and whether they are running.
    pub fn run(self, process: Process) -> Result<(), ExitError> {
        process.switch_logging(false)?;
        let instances = instances::list()?;
        let mut out = io::stdout().lock();
        for instance in instances {
            let _ = writeln!(out, "{}", instance);
        }
        Ok(())
    }
}


//------------ Deploy --------------------------------------------------------

/// Install a handler below the exec root.
pub struct Deploy {
    /// The file to install.
    source: PathBuf,

    /// The name to install it under.
    name: Option<String>,
}

/// The extra command line arguments of the deploy command.
#[derive(Clone, Debug, Args)]
struct DeployArgs {
    /// The handler file to install
    #[arg(value_name = "SOURCE", required = true)]
    source: PathBuf,

    /// Install the handler under this name
    #[arg(long, value_name = "NAME")]
    name: Option<String>,
}

impl Deploy {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            DeployArgs::augment_args(
                clap::Command::new("deploy")
                    .about("Installs a handler below the exec root")
            )
        )
    }

    /// Creates a command from clap matches.
    pub fn from_arg_matches(
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<Self, Failed> {
        let args = DeployArgs::from_arg_matches(matches)
            .expect("bug in command line arguments parser");
        Ok(Deploy {
            source: cur_dir.join(args.source),
            name: args.name,
        })
    }

    /// Copies the handler into the exec root.
    pub fn run(self, process: Process) -> Result<(), ExitError> {
        process.switch_logging(false)?;
        let dest = deploy::deploy(
            process.config(), &self.source, self.name.as_deref()
        )?;
        info!("Deployed {}.", dest.display());
        Ok(())
    }
}


//------------ ShowLog -------------------------------------------------------

/// Print or reset the log file of an instance.
pub struct ShowLog {
    /// Truncate the log file instead of printing it.
    reset: bool,
}

/// The extra command line arguments of the log command.
#[derive(Clone, Debug, Args)]
struct ShowLogArgs {
    /// Truncate the log file instead of printing it
    #[arg(long)]
    reset: bool,
}

impl ShowLog {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            ShowLogArgs::augment_args(
                clap::Command::new("log")
                    .about("Prints or resets the log file of an instance")
            )
        )
    }

    /// Creates a command from clap matches.
    pub fn from_arg_matches(matches: &ArgMatches) -> Result<Self, Failed> {
        let args = ShowLogArgs::from_arg_matches(matches)
            .expect("bug in command line arguments parser");
        Ok(ShowLog { reset: args.reset })
    }

    /// Dumps the instance’s log file to stdout or truncates it.
    pub fn run(self, process: Process) -> Result<(), ExitError> {
        process.switch_logging(false)?;
        let path = process.config().log_path();
        if self.reset {
            if let Err(err) = fs::File::create(&path) {
                error!(
                    "Fatal: cannot reset log file {}: {}",
                    path.display(), err
                );
                return Err(ExitError::Generic)
            }
            return Ok(())
        }
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                error!(
                    "Fatal: cannot read log file {}: {}",
                    path.display(), err
                );
                return Err(ExitError::Generic)
            }
        };
        let _ = io::stdout().lock().write_all(content.as_bytes());
        Ok(())
    }
}


//------------ PrintConfig ---------------------------------------------------

/// Print the configuration and exit.
pub struct PrintConfig;

impl PrintConfig {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            clap::Command::new("config")
                .about("Prints the current configuration")
        )
    }

    /// Prints the current configuration as TOML.
    pub fn run(self, process: Process) -> Result<(), ExitError> {
        process.switch_logging(false)?;
        println!("{}", process.config().to_toml());
        Ok(())
    }
}
