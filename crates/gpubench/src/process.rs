//! Background process bookkeeping.
//!
//! Long-running helpers (port-forward, the benchmark) are detached from the
//! CLI and tracked only through a PID file and a log file in the work
//! directory, so any later invocation can inspect or stop them.

use std::collections::HashSet;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::exec::{Cmd, CommandRunner};
use crate::retry;

/// A file holding a single PID.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `pid`, replacing any previous content.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, format!("{pid}\n"))?;
        Ok(())
    }

    /// Read the recorded PID; missing or garbled files read as `None`.
    #[must_use]
    pub fn read(&self) -> Option<u32> {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| content.trim().parse().ok())
    }

    /// Remove the file; a missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(&self) -> Result<()> {
        remove_if_exists(&self.path)
    }
}

/// Remove a file, ignoring `NotFound`.
///
/// # Errors
///
/// Returns any other I/O error.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Whether `pid` names a live (non-zombie) process.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid)
        .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

/// `pid` and all of its descendants, parents first.
fn process_tree(sys: &System, root: Pid) -> Vec<Pid> {
    let mut tree = vec![root];
    let mut seen: HashSet<Pid> = HashSet::from([root]);
    let mut index = 0;
    while index < tree.len() {
        let parent = tree[index];
        for (pid, process) in sys.processes() {
            if process.parent() == Some(parent) && seen.insert(*pid) {
                tree.push(*pid);
            }
        }
        index += 1;
    }
    tree
}

/// Stop `pid` and its children: SIGTERM, then SIGKILL after `grace`.
///
/// Returns `false` when the process was already gone.
pub async fn terminate(pid: u32, grace: Duration) -> bool {
    let root = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    if sys.process(root).is_none() || !is_alive(pid) {
        return false;
    }

    let tree = process_tree(&sys, root);
    debug!(pid, members = tree.len(), "Sending SIGTERM to process tree");
    for member in &tree {
        if let Some(process) = sys.process(*member) {
            if process.kill_with(Signal::Term).is_none() {
                process.kill();
            }
        }
    }

    let stopped = retry::poll_until(
        "process exit",
        grace,
        Duration::from_millis(100),
        || tree.iter().all(|p| !is_alive(p.as_u32())).then_some(()),
    )
    .await;

    if stopped.is_err() {
        warn!(pid, "Process ignored SIGTERM, killing");
        sys.refresh_processes(ProcessesToUpdate::Some(&tree), true);
        for member in &tree {
            if let Some(process) = sys.process(*member) {
                process.kill();
            }
        }
    }
    true
}

/// A detached process tracked by a PID file and a log file.
#[derive(Debug, Clone)]
pub struct BackgroundJob {
    name: String,
    pid_file: PidFile,
    log_file: PathBuf,
}

impl BackgroundJob {
    /// Job `name` with `<name>.pid` and `<name>.log` in `dir`.
    #[must_use]
    pub fn new(name: &str, dir: &Path) -> Self {
        Self {
            name: name.to_string(),
            pid_file: PidFile::new(dir.join(format!("{name}.pid"))),
            log_file: dir.join(format!("{name}.log")),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    #[must_use]
    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// The PID recorded for this job, alive or not.
    #[must_use]
    pub fn recorded_pid(&self) -> Option<u32> {
        self.pid_file.read()
    }

    /// The PID of the job if it is still running.
    #[must_use]
    pub fn running_pid(&self) -> Option<u32> {
        self.recorded_pid().filter(|pid| is_alive(*pid))
    }

    /// Start `cmd` detached, truncating the previous log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if the job is alive, or an error if
    /// the process cannot be spawned.
    pub fn start(&self, runner: &dyn CommandRunner, cmd: &Cmd) -> Result<u32> {
        if let Some(pid) = self.running_pid() {
            return Err(Error::AlreadyRunning {
                name: self.name.clone(),
                pid,
            });
        }
        if let Some(dir) = self.log_file.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.log_file, format!("# {}\n", cmd.display()))?;

        let pid = runner.spawn_detached(cmd, &self.log_file)?;
        self.pid_file.write(pid)?;
        info!(job = %self.name, pid, log = %self.log_file.display(), "Started background job");
        Ok(pid)
    }

    /// Stop the job if it is running and drop its PID file.
    ///
    /// Returns whether a live process was stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the PID file cannot be removed.
    pub async fn stop(&self, grace: Duration) -> Result<bool> {
        let stopped = match self.recorded_pid() {
            Some(pid) => terminate(pid, grace).await,
            None => false,
        };
        self.pid_file.remove()?;
        if stopped {
            info!(job = %self.name, "Stopped background job");
        }
        Ok(stopped)
    }

    /// Last `lines` lines of the job's log.
    ///
    /// # Errors
    ///
    /// Returns an error if the log exists but cannot be read.
    pub fn tail(&self, lines: usize) -> Result<Vec<String>> {
        tail_file(&self.log_file, lines)
    }
}

/// Last `lines` lines of a file; a missing file yields nothing.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn tail_file(path: &Path, lines: usize) -> Result<Vec<String>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut window = std::collections::VecDeque::with_capacity(lines);
    for line in BufReader::new(file).lines() {
        if window.len() == lines {
            window.pop_front();
        }
        if lines > 0 {
            window.push_back(line?);
        }
    }
    Ok(window.into())
}
