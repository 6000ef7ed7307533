//! Discovering server instances.
//!
//! Every instance leaves a PID file in the runtime directory, named
//! after the instance. Listing instances is a directory scan plus a
//! liveness probe with a null signal. A PID file that outlived its
//! process shows up as stopped.

use std::{fmt, fs};
use std::path::Path;
use log::error;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use crate::config::Config;
use crate::error::Failed;


//------------ Instance ------------------------------------------------------

/// A known server instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// The instance name.
    pub name: String,

    /// The PID recorded for the instance, if the file was readable.
    pub pid: Option<i32>,

    /// Whether a process with that PID is alive.
    pub alive: bool,
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.pid, self.alive) {
            (Some(pid), true) => {
                write!(f, "{}\trunning\tpid {}", self.name, pid)
            }
            (Some(pid), false) => {
                write!(f, "{}\tstopped\tstale pid {}", self.name, pid)
            }
            (None, _) => {
                write!(f, "{}\tunknown\tunreadable pid file", self.name)
            }
        }
    }
}


//------------ list ----------------------------------------------------------

/// Lists the instances known from the runtime directory.
pub fn list() -> Result<Vec<Instance>, Failed> {
    list_dir(&Config::runtime_dir()?)
}

/// Lists the instances recorded in the given directory.
pub fn list_dir(dir: &Path) -> Result<Vec<Instance>, Failed> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            error!(
                "Fatal: cannot read runtime directory {}: {}",
                dir.display(), err
            );
            return Err(Failed)
        }
    };
    let mut res = Vec::new();
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let name = match instance_name(&file_name.to_string_lossy()) {
            Some(name) => name,
            None => continue,
        };
        let pid = fs::read_to_string(entry.path()).ok().and_then(|raw| {
            raw.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
        });
        let alive = pid.map_or(false, |pid| {
            kill(Pid::from_raw(pid), None).is_ok()
        });
        res.push(Instance { name, pid, alive });
    }
    res.sort_by(|left, right| left.name.cmp(&right.name));
    Ok(res)
}

/// Extracts the instance name from a PID file name.
fn instance_name(file_name: &str) -> Option<String> {
    file_name
        .strip_prefix("percolator-")?
        .strip_suffix(".pid")
        .map(Into::into)
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn name_extraction() {
        assert_eq!(
            instance_name("percolator-espresso.pid").as_deref(),
            Some("espresso")
        );
        assert_eq!(instance_name("percolator-espresso.sock"), None);
        assert_eq!(instance_name("random.pid"), None);
    }

    #[test]
    fn live_and_stale_instances() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("percolator-live.pid"),
            format!("{}", getpid())
        ).unwrap();
        // i32::MAX is far past any real PID range.
        fs::write(
            dir.path().join("percolator-stale.pid"),
            format!("{}", i32::MAX)
        ).unwrap();
        fs::write(
            dir.path().join("percolator-broken.pid"), "not a pid"
        ).unwrap();
        fs::write(dir.path().join("unrelated.txt"), "x").unwrap();

        let instances = list_dir(dir.path()).unwrap();
        assert_eq!(instances.len(), 3);
        assert_eq!(instances[0].name, "broken");
        assert_eq!(instances[0].pid, None);
        assert_eq!(instances[1].name, "live");
        assert!(instances[1].alive);
        assert_eq!(instances[2].name, "stale");
        assert!(!instances[2].alive);
    }

    #[test]
    fn missing_directory_is_an_error() {
        assert!(list_dir(Path::new("/nonexistent-runtime")).is_err());
    }
}
