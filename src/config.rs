use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

pub const CONFIG_ENV: &str = "GAME_PANEL_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/panel.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub bind_address: String,
    #[serde(default = "default_public_dir")]
    pub public_dir: String,
}

fn default_public_dir() -> String {
    "public".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            public_dir: default_public_dir(),
        }
    }
}

/// Timing knobs for lifecycle transitions. The simulated delays only apply
/// to the built-in supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub start_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub simulated_start_ms: u64,
    pub simulated_stop_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            start_timeout_secs: 30,
            stop_timeout_secs: 30,
            simulated_start_ms: 3000,
            simulated_stop_ms: 2000,
        }
    }
}

impl LifecycleConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    pub map: String,
    pub port: u16,
    pub max_players: u32,
    pub max_ram_mb: u32,
    #[serde(default)]
    pub autostart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub async fn load_config(path: &Path) -> anyhow::Result<Config> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let config: Config = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            validate_lifecycle_config(&config.lifecycle)
                .map_err(anyhow::Error::msg)
                .context("Invalid lifecycle settings in config")?;
            for server in &config.servers {
                validate_server_config(server)
                    .map_err(anyhow::Error::msg)
                    .with_context(|| format!("Invalid server '{}' in config", server.id))?;
            }
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("Config file {} not found, using defaults", path.display());
            Ok(Config::default())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

pub async fn save_config(path: &Path, config: &Config) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    let tmp_path = path.with_extension("json.tmp");

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create config directory")?;
    }

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .context("Failed to create temp config file")?;
    file.write_all(json.as_bytes())
        .await
        .context("Failed to write temp config file")?;
    file.flush().await.context("Failed to flush temp config file")?;
    file.sync_all().await.context("Failed to fsync temp config file")?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .context("Failed to rename tmp config to final")?;

    Ok(())
}

pub fn validate_lifecycle_config(cfg: &LifecycleConfig) -> Result<(), String> {
    if cfg.start_timeout_secs == 0 {
        return Err("start_timeout_secs must be at least 1".to_string());
    }
    if cfg.stop_timeout_secs == 0 {
        return Err("stop_timeout_secs must be at least 1".to_string());
    }
    Ok(())
}

pub fn validate_server_config(cfg: &ServerConfig) -> Result<(), String> {
    if cfg.id.trim().is_empty() {
        return Err("id must not be empty".to_string());
    }
    if cfg.id.contains('/') || cfg.id.contains('\\') || cfg.id.contains("..") {
        return Err("id must not contain '/', '\\', or '..'".to_string());
    }
    if cfg.name.trim().is_empty() {
        return Err("name must not be empty".to_string());
    }
    if cfg.port < 1024 {
        return Err("port must be between 1024 and 65535".to_string());
    }
    if cfg.max_players == 0 {
        return Err("max_players must be at least 1".to_string());
    }
    if cfg.max_ram_mb == 0 {
        return Err("max_ram_mb must be at least 1".to_string());
    }
    Ok(())
}
