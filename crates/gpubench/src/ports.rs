//! Local port reclamation.
//!
//! A stale `kubectl port-forward` (or anything else) squatting on the serving
//! port would make a new forward fail, so before binding we find whoever
//! listens on the port and stop them. Reclaiming a free port is a no-op.

use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::exec::{Cmd, CommandRunner};
use crate::process;
use crate::retry;

/// Whether nothing is bound to `127.0.0.1:port`.
#[must_use]
pub fn is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Whether something accepts connections on `127.0.0.1:port`.
#[must_use]
pub fn accepts_connections(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_ok()
}

/// Extract PIDs from `lsof -t` or `fuser` output.
#[must_use]
pub fn parse_pids(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .split_whitespace()
        // fuser may suffix access flags (`1234e`); `30080/tcp:` is a label.
        .filter_map(|token| {
            token
                .trim_end_matches(|c: char| c.is_ascii_alphabetic())
                .parse()
                .ok()
        })
        .filter(|pid| *pid > 0)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// PIDs listening on `port`, via `lsof` or, failing that, `fuser`.
#[must_use]
pub fn listeners(runner: &dyn CommandRunner, port: u16) -> Vec<u32> {
    let cmd = if runner.which("lsof").is_some() {
        Cmd::new("lsof").args(["-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
    } else if runner.which("fuser").is_some() {
        Cmd::new("fuser").arg(format!("{port}/tcp"))
    } else {
        warn!(port, "Neither lsof nor fuser is available, cannot identify port owner");
        return Vec::new();
    };

    // Both tools exit non-zero when nothing matches.
    match runner.run(&cmd) {
        Ok(output) => parse_pids(&output.stdout),
        Err(e) => {
            warn!(port, error = %e, "Failed to list port listeners");
            Vec::new()
        }
    }
}

/// Make `port` free, stopping any process listening on it.
///
/// Returns the PIDs that were stopped.
///
/// # Errors
///
/// Returns [`Error::PortBusy`] if the port is still held afterwards.
pub async fn reclaim(runner: &dyn CommandRunner, port: u16, grace: Duration) -> Result<Vec<u32>> {
    if is_free(port) {
        return Ok(Vec::new());
    }

    let own = std::process::id();
    let owners: Vec<u32> = listeners(runner, port)
        .into_iter()
        .filter(|pid| *pid != own)
        .collect();

    let mut stopped = Vec::new();
    for pid in owners {
        info!(port, pid, "Reclaiming port from process");
        if process::terminate(pid, grace).await {
            stopped.push(pid);
        }
    }

    retry::poll_until(
        "port release",
        grace.max(Duration::from_secs(1)),
        Duration::from_millis(100),
        || is_free(port).then_some(()),
    )
    .await
    .map_err(|_| Error::PortBusy(port))?;

    Ok(stopped)
}
