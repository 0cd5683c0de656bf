use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ServerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Offline,
    Starting,
    Online,
    Stopping,
}

impl ServerStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Starting => "starting",
            Self::Online => "online",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Start,
    Stop,
    Restart,
    Command,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Command => "command",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Elapsed run time, rendered the way the dashboard shows it
/// (`2d 14h 32m`, or `0h 0m` when there are no whole days).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Uptime {
    minutes: i64,
}

impl Uptime {
    pub const ZERO: Uptime = Uptime { minutes: 0 };

    pub fn between(since: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self::from_minutes((now - since).num_minutes())
    }

    pub fn from_minutes(minutes: i64) -> Self {
        Self {
            minutes: minutes.max(0),
        }
    }
}

impl fmt::Display for Uptime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days = self.minutes / (24 * 60);
        let hours = (self.minutes / 60) % 24;
        let minutes = self.minutes % 60;
        if days > 0 {
            write!(f, "{}d {}h {}m", days, hours, minutes)
        } else {
            write!(f, "{}h {}m", hours, minutes)
        }
    }
}

/// Resource gauges reported for a running server.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServerStats {
    pub players: u32,
    pub cpu: f32,
    pub ram: u32,
}

/// A registry record. Fields are readable by anyone; writes only happen
/// inside `ServerRegistry::update`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub id: String,
    pub name: String,
    pub status: ServerStatus,
    pub players: u32,
    pub max_players: u32,
    pub map: String,
    pub port: u16,
    pub cpu: f32,
    pub ram: u32,
    pub max_ram: u32,
    pub started_at: Option<DateTime<Utc>>,
}

impl Server {
    pub fn from_config(cfg: &ServerConfig) -> Self {
        Self {
            id: cfg.id.clone(),
            name: cfg.name.clone(),
            status: ServerStatus::Offline,
            players: 0,
            max_players: cfg.max_players,
            map: cfg.map.clone(),
            port: cfg.port,
            cpu: 0.0,
            ram: 0,
            max_ram: cfg.max_ram_mb,
            started_at: None,
        }
    }

    pub fn uptime(&self, now: DateTime<Utc>) -> Uptime {
        match (self.status, self.started_at) {
            (ServerStatus::Online, Some(since)) => Uptime::between(since, now),
            _ => Uptime::ZERO,
        }
    }

    pub(crate) fn mark_starting(&mut self) {
        self.status = ServerStatus::Starting;
    }

    pub(crate) fn mark_online(&mut self, now: DateTime<Utc>) {
        self.status = ServerStatus::Online;
        self.started_at = Some(now);
    }

    pub(crate) fn mark_stopping(&mut self) {
        self.status = ServerStatus::Stopping;
    }

    /// Offline always clears players, gauges and uptime.
    pub(crate) fn mark_offline(&mut self) {
        self.status = ServerStatus::Offline;
        self.players = 0;
        self.cpu = 0.0;
        self.ram = 0;
        self.started_at = None;
    }

    pub(crate) fn apply_stats(&mut self, stats: ServerStats) {
        self.players = stats.players.min(self.max_players);
        self.cpu = stats.cpu.clamp(0.0, 100.0);
        self.ram = stats.ram.min(self.max_ram);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn server() -> Server {
        Server::from_config(&ServerConfig {
            id: "srv2".to_string(),
            name: "TTT Fun Server".to_string(),
            map: "ttt_minecraft_b5".to_string(),
            port: 27016,
            max_players: 20,
            max_ram_mb: 2048,
            autostart: false,
        })
    }

    #[test]
    fn uptime_renders_days_only_when_present() {
        assert_eq!(Uptime::ZERO.to_string(), "0h 0m");
        assert_eq!(Uptime::from_minutes(75).to_string(), "1h 15m");
        let minutes = 2 * 24 * 60 + 14 * 60 + 32;
        assert_eq!(Uptime::from_minutes(minutes).to_string(), "2d 14h 32m");
    }

    #[test]
    fn uptime_is_zero_unless_online() {
        let now = Utc::now();
        let mut srv = server();
        srv.mark_online(now - Duration::minutes(90));
        assert_eq!(srv.uptime(now), Uptime::from_minutes(90));

        srv.mark_stopping();
        assert_eq!(srv.uptime(now), Uptime::ZERO);
    }

    #[test]
    fn offline_resets_players_and_uptime() {
        let now = Utc::now();
        let mut srv = server();
        srv.mark_online(now - Duration::hours(5));
        srv.apply_stats(ServerStats {
            players: 16,
            cpu: 32.0,
            ram: 1536,
        });

        srv.mark_offline();
        assert_eq!(srv.players, 0);
        assert_eq!(srv.ram, 0);
        assert_eq!(srv.started_at, None);
        assert_eq!(srv.uptime(now), Uptime::ZERO);
    }

    #[test]
    fn stats_are_clamped_to_capacity() {
        let mut srv = server();
        srv.apply_stats(ServerStats {
            players: 99,
            cpu: 180.0,
            ram: 9000,
        });
        assert_eq!(srv.players, 20);
        assert_eq!(srv.cpu, 100.0);
        assert_eq!(srv.ram, 2048);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ServerStatus::Stopping).unwrap(),
            "\"stopping\""
        );
    }
}
