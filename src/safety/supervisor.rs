//! Connectivity Supervisor
//!
//! Blocks the boot path on the established signal. A timeout, or the signal
//! being dropped without firing, triggers the restart path exactly once.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info};

use crate::connection::EstablishedSignal;

/// Exit status that asks the host supervisor for a restart
pub const RESTART_EXIT_CODE: i32 = 75;

/// Fail-safe restart of the whole node
pub trait Restarter: Send + Sync {
    fn restart(&self, reason: &str);
}

/// Restarts by exiting the process; the host service manager starts it again
pub struct ProcessRestarter;

impl Restarter for ProcessRestarter {
    fn restart(&self, reason: &str) {
        error!("[SUPERVISOR] Restarting: {}", reason);
        std::process::exit(RESTART_EXIT_CODE);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
    Established,
    Restarted,
}

pub struct ConnectivitySupervisor {
    timeout: Duration,
    restarter: Arc<dyn Restarter>,
}

impl ConnectivitySupervisor {
    pub fn new(timeout: Duration, restarter: Arc<dyn Restarter>) -> Self {
        Self { timeout, restarter }
    }

    /// Wait for the established signal, consuming it
    pub async fn wait(&self, signal: EstablishedSignal) -> SupervisorOutcome {
        info!("[SUPERVISOR] Waiting up to {:?} for connectivity", self.timeout);

        let reason = match timeout(self.timeout, signal).await {
            Ok(Ok(())) => {
                info!("[SUPERVISOR] Connected, starting telemetry");
                return SupervisorOutcome::Established;
            }
            Ok(Err(_)) => "established signal dropped before firing".to_string(),
            Err(_) => format!("not established within {:?}", self.timeout),
        };

        error!("[SUPERVISOR] Connectivity timeout: {}", reason);
        self.restarter.restart(&reason);
        SupervisorOutcome::Restarted
    }
}
