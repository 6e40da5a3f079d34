//! External process execution.
//!
//! Every tool the bring-up drives (docker, kind, kubectl, helm, the load
//! generator) goes through the [`CommandRunner`] trait so the workflow can be
//! exercised against a scripted runner in tests.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{Error, Result};

/// A command line to execute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub current_dir: Option<PathBuf>,
}

impl Cmd {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Bytes written to the child's stdin.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Render the command as a shell-quoted line (without env or stdin).
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl std::fmt::Display for Cmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display())
    }
}

/// Quote a word for POSIX `sh`.
#[must_use]
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    /// Successful output with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    #[must_use]
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Seam over process execution.
#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output.
    ///
    /// A non-zero exit is reported in [`CmdOutput::code`], not as an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started.
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput>;

    /// Start a command in its own process group with stdout and stderr
    /// appended to `log`, and return its PID without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be opened or the process cannot start.
    fn spawn_detached(&self, cmd: &Cmd, log: &Path) -> Result<u32>;

    /// Locate a program on the runner's search path.
    fn which(&self, program: &str) -> Option<PathBuf>;
}

/// Run a command and fail on a non-zero exit, returning stdout.
///
/// # Errors
///
/// Returns [`Error::CommandFailed`] on a non-zero exit.
pub fn run_checked(runner: &dyn CommandRunner, cmd: &Cmd) -> Result<String> {
    let output = runner.run(cmd)?;
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(Error::command_failed(&cmd.program, output.code, &output.stderr))
    }
}

/// Runner backed by `std::process::Command`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    extra_path: Vec<PathBuf>,
}

impl SystemRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Search `dir` before `PATH`, so freshly installed tools are picked up.
    #[must_use]
    pub fn with_bin_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            extra_path: vec![dir.into()],
        }
    }

    fn search_path(&self) -> OsString {
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let dirs = self
            .extra_path
            .iter()
            .cloned()
            .chain(std::env::split_paths(&inherited));
        std::env::join_paths(dirs).unwrap_or(inherited)
    }

    fn command(&self, cmd: &Cmd) -> Result<Command> {
        let program = self
            .which(&cmd.program)
            .ok_or_else(|| Error::ToolNotFound(cmd.program.clone()))?;

        let mut command = Command::new(program);
        command.args(&cmd.args).env("PATH", self.search_path());
        for (key, value) in &cmd.env {
            command.env(key, value);
        }
        if let Some(dir) = &cmd.current_dir {
            command.current_dir(dir);
        }
        Ok(command)
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput> {
        debug!(command = %cmd, "Running");
        let mut command = self.command(cmd)?;
        let spawn_err = |source| Error::Spawn {
            program: cmd.program.clone(),
            source,
        };

        let output = if let Some(input) = &cmd.stdin {
            let mut child = command
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(spawn_err)?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input)?;
            }
            child.wait_with_output()?
        } else {
            command.output().map_err(spawn_err)?
        };

        Ok(CmdOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn_detached(&self, cmd: &Cmd, log: &Path) -> Result<u32> {
        debug!(command = %cmd, log = %log.display(), "Spawning in background");
        let stdout = OpenOptions::new().create(true).append(true).open(log)?;
        let stderr = stdout.try_clone()?;

        let child = self
            .command(cmd)?
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|source| Error::Spawn {
                program: cmd.program.clone(),
                source,
            })?;

        Ok(child.id())
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        which::which_in(program, Some(self.search_path()), cwd).ok()
    }
}

/// Scripted runner that answers commands from canned responses.
///
/// Responses are matched by substring against [`Cmd::display`], first rule
/// wins. A rule with several queued responses pops them in order and keeps
/// repeating the last one. Unmatched commands succeed with empty output.
pub mod scripted {
    use std::collections::{HashSet, VecDeque};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::{Cmd, CmdOutput, CommandRunner};
    use crate::error::Result;

    struct Rule {
        pattern: String,
        responses: VecDeque<CmdOutput>,
    }

    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Mutex<Vec<Rule>>,
        calls: Mutex<Vec<Cmd>>,
        spawned: Mutex<Vec<Cmd>>,
        tools: Mutex<HashSet<String>>,
        all_tools: bool,
        next_pid: AtomicU32,
    }

    impl ScriptedRunner {
        /// Runner where every tool resolves on the search path.
        #[must_use]
        pub fn new() -> Self {
            Self {
                all_tools: true,
                next_pid: AtomicU32::new(4_000_000),
                ..Self::default()
            }
        }

        /// Runner where only `tools` resolve on the search path.
        #[must_use]
        pub fn with_tools(tools: &[&str]) -> Self {
            Self {
                tools: Mutex::new(tools.iter().map(ToString::to_string).collect()),
                next_pid: AtomicU32::new(4_000_000),
                ..Self::default()
            }
        }

        /// Queue a response for commands containing `pattern`.
        #[must_use]
        pub fn on(self, pattern: &str, output: CmdOutput) -> Self {
            {
                let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(rule) = rules.iter_mut().find(|r| r.pattern == pattern) {
                    rule.responses.push_back(output);
                } else {
                    rules.push(Rule {
                        pattern: pattern.to_string(),
                        responses: VecDeque::from([output]),
                    });
                }
            }
            self
        }

        /// Command lines run so far, in order.
        #[must_use]
        pub fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(Cmd::display)
                .collect()
        }

        /// Full commands run so far, in order.
        #[must_use]
        pub fn commands(&self) -> Vec<Cmd> {
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        /// Command lines spawned in the background so far.
        #[must_use]
        pub fn spawned(&self) -> Vec<String> {
            self.spawned
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(Cmd::display)
                .collect()
        }

        /// Whether any recorded command line contains `needle`.
        #[must_use]
        pub fn ran(&self, needle: &str) -> bool {
            self.calls().iter().any(|c| c.contains(needle))
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, cmd: &Cmd) -> Result<CmdOutput> {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(cmd.clone());

            let line = cmd.display();
            let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
            let Some(rule) = rules.iter_mut().find(|r| line.contains(&r.pattern)) else {
                return Ok(CmdOutput::ok(""));
            };
            let output = if rule.responses.len() > 1 {
                rule.responses.pop_front().unwrap_or_default()
            } else {
                rule.responses.front().cloned().unwrap_or_default()
            };
            Ok(output)
        }

        fn spawn_detached(&self, cmd: &Cmd, _log: &Path) -> Result<u32> {
            self.spawned
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(cmd.clone());
            Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
        }

        fn which(&self, program: &str) -> Option<PathBuf> {
            let known = self.all_tools
                || self
                    .tools
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .contains(program);
            known.then(|| PathBuf::from("/usr/bin").join(program))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("kubectl"), "kubectl");
        assert_eq!(shell_quote("--timeout=300s"), "--timeout=300s");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_cmd_display() {
        let cmd = Cmd::new("kubectl")
            .args(["get", "nodes", "-o"])
            .arg("jsonpath={.items[*].metadata.name}");
        assert_eq!(
            cmd.display(),
            "kubectl get nodes -o 'jsonpath={.items[*].metadata.name}'"
        );
    }

    #[test]
    fn test_run_checked_maps_failure() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| cmd.program == "kind")
            .returning(|_| Ok(CmdOutput::failed(2, "no such cluster")));

        let err = run_checked(&runner, &Cmd::new("kind").arg("delete")).unwrap_err();
        assert!(err.to_string().contains("exit code 2"));
        assert!(err.to_string().contains("no such cluster"));
    }

    #[test]
    fn test_system_runner_captures_output() {
        let runner = SystemRunner::new();
        let output = runner
            .run(&Cmd::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn test_system_runner_feeds_stdin() {
        let runner = SystemRunner::new();
        let output = runner.run(&Cmd::new("cat").stdin("hello")).unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "hello");
    }

    #[test]
    fn test_system_runner_missing_tool() {
        let runner = SystemRunner::new();
        let err = runner
            .run(&Cmd::new("definitely-not-a-real-tool-xyz"))
            .unwrap_err();
        assert!(matches!(err, Error::ToolNotFound(_)));
    }

    #[test]
    fn test_scripted_runner_queues_responses() {
        use scripted::ScriptedRunner;

        let runner = ScriptedRunner::new()
            .on("get nodes", CmdOutput::failed(1, "not yet"))
            .on("get nodes", CmdOutput::ok("node-1"));

        let cmd = Cmd::new("kubectl").args(["get", "nodes"]);
        assert!(!runner.run(&cmd).unwrap().success());
        assert_eq!(runner.run(&cmd).unwrap().stdout, "node-1");
        assert_eq!(runner.run(&cmd).unwrap().stdout, "node-1");
        assert_eq!(runner.calls().len(), 3);
    }
}
