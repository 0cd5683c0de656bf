//! Ports to the things that actually run game servers, plus the simulated
//! adapters the panel uses when no real backend is wired in.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::LifecycleConfig;
use crate::error::SupervisorError;

/// Starts and stops the real server process. Both calls resolve once the
/// process has reached the requested state, or failed to.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn start(&self, server_id: &str) -> Result<(), SupervisorError>;
    async fn stop(&self, server_id: &str) -> Result<(), SupervisorError>;
}

/// Console/RCON transport to a running server.
#[async_trait]
pub trait RemoteCommandChannel: Send + Sync {
    async fn send(&self, server_id: &str, command: &str) -> Result<(), SupervisorError>;
}

/// Pretends to boot and shut down servers after a fixed delay.
#[derive(Debug, Clone)]
pub struct SimulatedSupervisor {
    start_delay: Duration,
    stop_delay: Duration,
}

impl SimulatedSupervisor {
    pub fn new(start_delay: Duration, stop_delay: Duration) -> Self {
        Self {
            start_delay,
            stop_delay,
        }
    }

    pub fn from_config(cfg: &LifecycleConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.simulated_start_ms),
            Duration::from_millis(cfg.simulated_stop_ms),
        )
    }
}

#[async_trait]
impl ProcessSupervisor for SimulatedSupervisor {
    async fn start(&self, server_id: &str) -> Result<(), SupervisorError> {
        tracing::debug!("Simulating start of '{}'", server_id);
        tokio::time::sleep(self.start_delay).await;
        Ok(())
    }

    async fn stop(&self, server_id: &str) -> Result<(), SupervisorError> {
        tracing::debug!("Simulating stop of '{}'", server_id);
        tokio::time::sleep(self.stop_delay).await;
        Ok(())
    }
}

/// Accepts every command without delivering it anywhere.
#[derive(Debug, Clone, Default)]
pub struct SimulatedCommandChannel;

#[async_trait]
impl RemoteCommandChannel for SimulatedCommandChannel {
    async fn send(&self, server_id: &str, command: &str) -> Result<(), SupervisorError> {
        tracing::debug!("Command for '{}': {}", server_id, command);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn simulated_supervisor_waits_configured_delay() {
        let supervisor = SimulatedSupervisor::from_config(&LifecycleConfig::default());
        let before = tokio::time::Instant::now();
        supervisor.start("srv1").await.unwrap();
        assert!(before.elapsed() >= Duration::from_millis(3000));

        let before = tokio::time::Instant::now();
        supervisor.stop("srv1").await.unwrap();
        assert!(before.elapsed() >= Duration::from_millis(2000));
    }
}
