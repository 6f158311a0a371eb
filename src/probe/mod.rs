//! Readiness probing for Packet Tracer IPC endpoints
//!
//! The actual handshake lives in an external checker jar; the daemon only
//! launches it and reads the verdict.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// Extra wall time granted to the checker process beyond the probe timeout
const CHECKER_GRACE: Duration = Duration::from_secs(5);

/// Capability that answers whether an instance's IPC endpoint is up
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Whether the endpoint answers within the timeout
    async fn is_answering(&self, host: &str, port: u16, timeout: Duration) -> bool;
}

/// Probe backed by the external checker jar
pub struct PtChecker {
    jar_path: PathBuf,
}

impl PtChecker {
    pub fn new(jar_path: impl Into<PathBuf>) -> Self {
        Self {
            jar_path: jar_path.into(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for PtChecker {
    async fn is_answering(&self, host: &str, port: u16, timeout: Duration) -> bool {
        let output = Command::new("java")
            .arg("-jar")
            .arg(&self.jar_path)
            .arg(host)
            .arg(port.to_string())
            .arg(timeout.as_secs().to_string())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout + CHECKER_GRACE, output).await {
            Ok(Ok(out)) => {
                let verdict = String::from_utf8_lossy(&out.stdout);
                let answered = verdict.trim().eq_ignore_ascii_case("true");
                debug!("Probe {}:{} answered: {}", host, port, answered);
                answered
            }
            Ok(Err(e)) => {
                warn!("Failed to launch checker {:?}: {}", self.jar_path, e);
                false
            }
            Err(_) => {
                warn!("Checker for {}:{} exceeded its deadline", host, port);
                false
            }
        }
    }
}
