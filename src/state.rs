use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::console::ConsoleHub;
use crate::events::EventBus;
use crate::lifecycle::LifecycleController;
use crate::registry::ServerRegistry;
use crate::server::Server;
use crate::supervisor::{ProcessSupervisor, RemoteCommandChannel};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<Config>>,
    pub config_path: Arc<PathBuf>,
    pub registry: ServerRegistry,
    pub consoles: ConsoleHub,
    pub lifecycle: LifecycleController,
}

impl AppState {
    /// Builds the registry from the configured servers, all `Offline`.
    pub fn new(
        config: Config,
        config_path: PathBuf,
        supervisor: Arc<dyn ProcessSupervisor>,
        channel: Arc<dyn RemoteCommandChannel>,
    ) -> Self {
        let registry = ServerRegistry::new(EventBus::new());
        for server in &config.servers {
            if let Err(e) = registry.insert(Server::from_config(server)) {
                tracing::warn!("Skipping server from config: {}", e);
            }
        }
        let consoles = ConsoleHub::new(registry.clone(), channel);
        let lifecycle =
            LifecycleController::new(registry.clone(), consoles.clone(), supervisor, &config.lifecycle);

        Self {
            config: Arc::new(RwLock::new(config)),
            config_path: Arc::new(config_path),
            registry,
            consoles,
            lifecycle,
        }
    }
}
