//! Restart Escalation - External Restart then Process Exit
//!
//! Implements the `Escalation` port: runs the configured restart
//! commands for dependent services, then broadcasts shutdown so `main`
//! stops every task and exits non-zero for the process supervisor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::ports::escalation::Escalation;

/// Bound on each restart command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Escalation that restarts dependencies and stops the service.
pub struct RestartEscalation {
    /// Shell commands run in order (`sh -c`).
    commands: Vec<String>,
    /// Process-wide shutdown broadcaster.
    shutdown_tx: broadcast::Sender<()>,
    /// Set once escalation has run; `main` exits 1 when set.
    escalated: Arc<AtomicBool>,
}

impl RestartEscalation {
    pub fn new(commands: Vec<String>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            commands,
            shutdown_tx,
            escalated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag shared with `main`.
    pub fn escalated_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.escalated)
    }

    async fn run_command(command: &str) {
        info!(command, "Running restart command");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).kill_on_drop(true);

        match tokio::time::timeout(COMMAND_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) if status.success() => info!(command, "Restart command succeeded"),
            Ok(Ok(status)) => warn!(command, code = ?status.code(), "Restart command failed"),
            Ok(Err(e)) => error!(command, error = %e, "Failed to spawn restart command"),
            Err(_) => error!(command, "Restart command timed out"),
        }
    }
}

#[async_trait]
impl Escalation for RestartEscalation {
    async fn on_threshold_exceeded(&self, consecutive_failures: u32) {
        if self.escalated.swap(true, Ordering::AcqRel) {
            return;
        }

        error!(
            consecutive_failures,
            commands = self.commands.len(),
            "Failure threshold exceeded, restarting dependencies and shutting down"
        );

        for command in &self.commands {
            Self::run_command(command).await;
        }

        let _ = self.shutdown_tx.send(());
    }
}
