//! Drives servers through `Offline -> Starting -> Online -> Stopping ->
//! Offline`, with at most one transition in flight per server.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

use crate::config::LifecycleConfig;
use crate::console::{ConsoleHub, LogLevel};
use crate::error::{PanelError, PanelResult};
use crate::events::ServerEvent;
use crate::registry::ServerRegistry;
use crate::server::{Operation, Server, ServerStats, ServerStatus};
use crate::supervisor::ProcessSupervisor;

/// Whether `action` may begin from `status`, ignoring in-flight work.
pub fn permits(action: Operation, status: ServerStatus) -> bool {
    match action {
        Operation::Start => status == ServerStatus::Offline,
        Operation::Stop | Operation::Restart => status == ServerStatus::Online,
        Operation::Command => false,
    }
}

struct PendingTransition {
    action: Operation,
    ticket: u64,
    abort: Option<AbortHandle>,
}

#[derive(Clone)]
pub struct LifecycleController {
    registry: ServerRegistry,
    consoles: ConsoleHub,
    supervisor: Arc<dyn ProcessSupervisor>,
    pending: Arc<DashMap<String, PendingTransition>>,
    tickets: Arc<AtomicU64>,
    start_timeout: Duration,
    stop_timeout: Duration,
}

impl LifecycleController {
    pub fn new(
        registry: ServerRegistry,
        consoles: ConsoleHub,
        supervisor: Arc<dyn ProcessSupervisor>,
        cfg: &LifecycleConfig,
    ) -> Self {
        Self {
            registry,
            consoles,
            supervisor,
            pending: Arc::new(DashMap::new()),
            tickets: Arc::new(AtomicU64::new(1)),
            start_timeout: cfg.start_timeout(),
            stop_timeout: cfg.stop_timeout(),
        }
    }

    pub fn pending_action(&self, server_id: &str) -> Option<Operation> {
        self.pending.get(server_id).map(|p| p.action)
    }

    /// `Offline -> Starting`; `Online` follows once the supervisor reports
    /// success.
    pub fn start(&self, server_id: &str) -> PanelResult<Server> {
        self.launch(server_id, Operation::Start)
    }

    /// `Online -> Stopping`; `Offline` follows once the supervisor reports
    /// the process gone.
    pub fn stop(&self, server_id: &str) -> PanelResult<Server> {
        self.launch(server_id, Operation::Stop)
    }

    /// A full stop followed by a start, held as a single pending transition
    /// so nothing else can interleave.
    pub fn restart(&self, server_id: &str) -> PanelResult<Server> {
        self.launch(server_id, Operation::Restart)
    }

    fn launch(&self, server_id: &str, action: Operation) -> PanelResult<Server> {
        let (ticket, server) = self.begin(server_id, action)?;

        let message = match action {
            Operation::Restart => "Server restarting",
            Operation::Stop => "Server stopping",
            _ => "Server starting",
        };
        tracing::info!("{} '{}'", message, server_id);

        let this = self.clone();
        let id = server_id.to_string();
        let handle = tokio::spawn(async move {
            this.consoles.log(&id, LogLevel::Info, message).await;
            this.run(&id, action, ticket).await;
        });

        if let Some(mut pending) = self.pending.get_mut(server_id) {
            if pending.ticket == ticket {
                pending.abort = Some(handle.abort_handle());
            }
        }
        Ok(server)
    }

    /// Checks the guards and claims the pending slot in one step.
    fn begin(&self, server_id: &str, action: Operation) -> PanelResult<(u64, Server)> {
        match self.pending.entry(server_id.to_string()) {
            Entry::Occupied(_) => {
                let status = self.registry.get(server_id)?.status;
                tracing::warn!(
                    "Rejected {} of '{}': transition already pending",
                    action,
                    server_id
                );
                Err(PanelError::InvalidTransition {
                    id: server_id.to_string(),
                    status,
                    action,
                })
            }
            Entry::Vacant(slot) => {
                let server = self.registry.try_update(server_id, |server| {
                    if !permits(action, server.status) {
                        return Err(PanelError::InvalidTransition {
                            id: server_id.to_string(),
                            status: server.status,
                            action,
                        });
                    }
                    match action {
                        Operation::Start => server.mark_starting(),
                        _ => server.mark_stopping(),
                    }
                    Ok(())
                });
                let server = server.map_err(|e| {
                    tracing::warn!("Rejected {} of '{}': {}", action, server_id, e);
                    e
                })?;

                let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
                slot.insert(PendingTransition {
                    action,
                    ticket,
                    abort: None,
                });
                Ok((ticket, server))
            }
        }
    }

    async fn run(&self, server_id: &str, action: Operation, ticket: u64) {
        match action {
            Operation::Start => match self.drive(server_id, Operation::Start).await {
                Ok(()) => self.finish_online(server_id, ticket).await,
                Err(e) => self.fail(server_id, ticket, e).await,
            },
            Operation::Stop => match self.drive(server_id, Operation::Stop).await {
                Ok(()) => self.finish_offline(server_id, ticket).await,
                Err(e) => self.fail(server_id, ticket, e).await,
            },
            Operation::Restart => {
                if let Err(e) = self.drive(server_id, Operation::Stop).await {
                    self.fail(server_id, ticket, e).await;
                    return;
                }
                if !self.is_current(server_id, ticket) {
                    return;
                }
                // The slot stays claimed, so observers see Offline then
                // Starting with nothing in between.
                if self
                    .registry
                    .update(server_id, |server| server.mark_offline())
                    .is_err()
                {
                    self.release(server_id, ticket);
                    return;
                }
                self.consoles
                    .log(server_id, LogLevel::Info, "Server stopped")
                    .await;
                if self
                    .registry
                    .update(server_id, |server| server.mark_starting())
                    .is_err()
                {
                    self.release(server_id, ticket);
                    return;
                }
                self.consoles
                    .log(server_id, LogLevel::Info, "Server starting")
                    .await;

                match self.drive(server_id, Operation::Start).await {
                    Ok(()) => self.finish_online(server_id, ticket).await,
                    Err(e) => self.fail(server_id, ticket, e).await,
                }
            }
            Operation::Command => {}
        }
    }

    /// Calls the supervisor with the matching timeout.
    async fn drive(&self, server_id: &str, step: Operation) -> PanelResult<()> {
        let (call, limit) = match step {
            Operation::Start => (self.supervisor.start(server_id), self.start_timeout),
            _ => (self.supervisor.stop(server_id), self.stop_timeout),
        };
        match tokio::time::timeout(limit, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PanelError::OperationFailed {
                id: server_id.to_string(),
                action: step,
                reason: e.to_string(),
            }),
            Err(_) => Err(PanelError::OperationTimeout {
                id: server_id.to_string(),
                action: step,
                after: limit,
            }),
        }
    }

    fn is_current(&self, server_id: &str, ticket: u64) -> bool {
        self.pending
            .get(server_id)
            .is_some_and(|p| p.ticket == ticket)
    }

    /// Releases the pending slot if it still belongs to `ticket`. A `false`
    /// means the transition was cancelled and its result must be dropped.
    fn release(&self, server_id: &str, ticket: u64) -> bool {
        self.pending
            .remove_if(server_id, |_, p| p.ticket == ticket)
            .is_some()
    }

    async fn finish_online(&self, server_id: &str, ticket: u64) {
        if !self.release(server_id, ticket) {
            return;
        }
        if self
            .registry
            .update(server_id, |server| server.mark_online(Utc::now()))
            .is_ok()
        {
            tracing::info!("Server '{}' is online", server_id);
            self.consoles
                .log(server_id, LogLevel::Info, "Server started successfully")
                .await;
        }
    }

    async fn finish_offline(&self, server_id: &str, ticket: u64) {
        if !self.release(server_id, ticket) {
            return;
        }
        if self
            .registry
            .update(server_id, |server| server.mark_offline())
            .is_ok()
        {
            tracing::info!("Server '{}' is offline", server_id);
            self.consoles
                .log(server_id, LogLevel::Info, "Server stopped")
                .await;
        }
    }

    /// Any failed or timed-out step lands the server in `Offline`.
    async fn fail(&self, server_id: &str, ticket: u64, error: PanelError) {
        if !self.release(server_id, ticket) {
            return;
        }
        tracing::error!("{}", error);
        if self
            .registry
            .update(server_id, |server| server.mark_offline())
            .is_err()
        {
            return;
        }
        self.consoles
            .log(server_id, LogLevel::Error, error.to_string())
            .await;

        let action = match &error {
            PanelError::OperationFailed { action, .. }
            | PanelError::OperationTimeout { action, .. } => *action,
            _ => Operation::Start,
        };
        self.registry.events().publish(ServerEvent::OperationFailed {
            id: server_id.to_string(),
            action,
            error: error.to_string(),
        });
    }

    /// Cancels any pending transition, then drops the server and its
    /// console.
    pub fn remove_server(&self, server_id: &str) -> PanelResult<Server> {
        if let Some((_, pending)) = self.pending.remove(server_id) {
            tracing::info!(
                "Cancelled pending {} of '{}'",
                pending.action,
                server_id
            );
            if let Some(abort) = pending.abort {
                abort.abort();
            }
        }
        let server = self.registry.remove(server_id)?;
        self.consoles.remove(server_id);
        Ok(server)
    }

    /// Records gauges reported for a running server.
    pub fn report_stats(&self, server_id: &str, stats: ServerStats) -> PanelResult<Server> {
        self.registry.try_update(server_id, |server| {
            if server.status != ServerStatus::Online {
                return Err(PanelError::NotRunning(server_id.to_string()));
            }
            server.apply_stats(stats);
            Ok(())
        })
    }

    /// Stops every online server and waits for the in-flight work to drain.
    pub async fn shutdown(&self) {
        for server in self.registry.list() {
            if server.status == ServerStatus::Online {
                if let Err(e) = self.stop(&server.id) {
                    tracing::warn!("Could not stop '{}' on shutdown: {}", server.id, e);
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.stop_timeout.max(self.start_timeout);
        while !self.pending.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
