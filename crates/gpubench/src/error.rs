//! Error types shared by the bring-up modules.

use thiserror::Error;

/// Result alias for operations that fail with [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while driving external tools.
#[derive(Error, Debug)]
pub enum Error {
    /// An external command ran but exited unsuccessfully.
    #[error("{program} failed ({status}): {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    /// An external command could not be started at all.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A required binary is not on the search path.
    #[error("Required tool not found: {0}")]
    ToolNotFound(String),

    /// A poll loop gave up.
    #[error("Timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    /// A local port is still held after reclamation.
    #[error("Port {0} is still in use after reclaiming it")]
    PortBusy(u16),

    /// A background job is already running.
    #[error("{name} is already running (pid {pid})")]
    AlreadyRunning { name: String, pid: u32 },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl Error {
    /// Build a [`Error::CommandFailed`] from a process exit code.
    #[must_use]
    pub fn command_failed(program: &str, code: Option<i32>, stderr: &str) -> Self {
        let status = match code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        };
        Self::CommandFailed {
            program: program.to_string(),
            status,
            stderr: stderr.trim().to_string(),
        }
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// A [`Error::Timeout`] already spent its whole budget, so it is final.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::PortBusy(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::CommandFailed { stderr, .. } => is_transient_message(stderr),
            Self::Kube(e) => is_transient_message(&e.to_string()),
            _ => false,
        }
    }
}

/// Check if an error message looks transient and worth retrying.
#[must_use]
pub fn is_transient_message(message: &str) -> bool {
    let msg = message.to_lowercase();
    msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("connection refused")
        || msg.contains("connection reset")
        || msg.contains("rate limit")
        || msg.contains("too many requests")
        || msg.contains("503")
        || msg.contains("502")
        || msg.contains("504")
        || msg.contains("temporarily unavailable")
        || msg.contains("try again")
        || msg.contains("tls handshake")
        || msg.contains("no endpoints available")
        || msg.contains("the server is currently unable")
}

/// Check if an `anyhow` error chain contains a transient failure.
///
/// A chain holding an exhausted poll is never transient, whatever its text.
#[must_use]
pub fn is_transient(error: &anyhow::Error) -> bool {
    let typed: Vec<&Error> = error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<Error>())
        .collect();
    if typed.iter().any(|e| matches!(e, Error::Timeout { .. })) {
        return false;
    }

    typed.iter().any(|e| e.is_transient()) || is_transient_message(&format!("{error:#}"))
}
