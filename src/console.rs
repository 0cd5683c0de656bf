use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::error::{PanelError, PanelResult};
use crate::events::{EventBus, ServerEvent};
use crate::registry::ServerRegistry;
use crate::server::{Operation, ServerStatus};
use crate::supervisor::RemoteCommandChannel;

pub const HISTORY_LIMIT: usize = 50;
const LIVE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Command,
}

impl LogLevel {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Command => "COMMAND",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

/// Most recent submitted commands, oldest evicted first, with an up/down
/// navigation cursor.
///
/// The cursor counts back from the newest entry; `None` means the user is
/// on the live (empty) input line. Only `push` resets it.
#[derive(Debug, Clone)]
pub struct CommandHistory {
    entries: VecDeque<String>,
    limit: usize,
    cursor: Option<usize>,
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::with_limit(HISTORY_LIMIT)
    }
}

impl CommandHistory {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit),
            limit: limit.max(1),
            cursor: None,
        }
    }

    pub fn push(&mut self, command: impl Into<String>) {
        if self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(command.into());
        self.cursor = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    fn at(&self, back: usize) -> &str {
        &self.entries[self.entries.len() - 1 - back]
    }

    /// Steps toward older commands and returns what the input should show.
    /// Sticks at the oldest entry; `None` only when the history is empty.
    pub fn older(&mut self) -> Option<&str> {
        if self.is_empty() {
            return None;
        }
        let next = match self.cursor {
            None => 0,
            Some(c) if c + 1 < self.len() => c + 1,
            Some(c) => c,
        };
        self.cursor = Some(next);
        Some(self.at(next))
    }

    /// Steps back toward the live input. Leaving the newest entry yields
    /// `Some("")`; on the live input already, `None` (nothing changes).
    pub fn newer(&mut self) -> Option<&str> {
        match self.cursor {
            None => None,
            Some(0) => {
                self.cursor = None;
                Some("")
            }
            Some(c) => {
                self.cursor = Some(c - 1);
                Some(self.at(c - 1))
            }
        }
    }
}

/// Per-server log buffer and command history.
///
/// The log is append-only and unbounded; callers that care about memory
/// clear it explicitly.
pub struct ConsoleSession {
    logs: Vec<LogEntry>,
    history: CommandHistory,
    live_tx: broadcast::Sender<LogEntry>,
}

impl Default for ConsoleSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleSession {
    pub fn new() -> Self {
        let (live_tx, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            logs: Vec::new(),
            history: CommandHistory::default(),
            live_tx,
        }
    }

    pub fn append(&mut self, entry: LogEntry) {
        let _ = self.live_tx.send(entry.clone());
        self.logs.push(entry);
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub fn clear(&mut self) {
        self.logs.clear();
    }

    pub fn history(&self) -> &CommandHistory {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut CommandHistory {
        &mut self.history
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.live_tx.subscribe()
    }

    pub fn export(&self) -> String {
        let mut out = String::new();
        for (i, entry) in self.logs.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let _ = write!(
                out,
                "[{}] [{}] {}",
                entry.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                entry.level.label(),
                entry.message
            );
        }
        out
    }
}

/// All console sessions, keyed by server id, plus the path commands take
/// to the remote server.
#[derive(Clone)]
pub struct ConsoleHub {
    sessions: Arc<DashMap<String, Arc<Mutex<ConsoleSession>>>>,
    registry: ServerRegistry,
    channel: Arc<dyn RemoteCommandChannel>,
    events: EventBus,
}

impl ConsoleHub {
    pub fn new(registry: ServerRegistry, channel: Arc<dyn RemoteCommandChannel>) -> Self {
        let events = registry.events().clone();
        Self {
            sessions: Arc::new(DashMap::new()),
            registry,
            channel,
            events,
        }
    }

    fn session(&self, server_id: &str) -> PanelResult<Arc<Mutex<ConsoleSession>>> {
        if !self.registry.contains(server_id) {
            return Err(PanelError::NotFound(server_id.to_string()));
        }
        let session = self
            .sessions
            .entry(server_id.to_string())
            .or_default()
            .value()
            .clone();
        // The server may have been removed between the check and the insert.
        if !self.registry.contains(server_id) {
            self.sessions
                .remove_if(server_id, |_, existing| Arc::ptr_eq(existing, &session));
            return Err(PanelError::NotFound(server_id.to_string()));
        }
        Ok(session)
    }

    pub async fn append_log(&self, server_id: &str, entry: LogEntry) -> PanelResult<()> {
        let session = self.session(server_id)?;
        session.lock().await.append(entry);
        Ok(())
    }

    pub async fn log(&self, server_id: &str, level: LogLevel, message: impl Into<String>) {
        if let Err(e) = self.append_log(server_id, LogEntry::new(level, message)).await {
            tracing::debug!("Dropping console line: {}", e);
        }
    }

    pub async fn logs(&self, server_id: &str) -> PanelResult<Vec<LogEntry>> {
        let session = self.session(server_id)?;
        let logs = session.lock().await.logs().to_vec();
        Ok(logs)
    }

    /// The last `backlog` entries plus a receiver for everything after them.
    pub async fn follow(
        &self,
        server_id: &str,
        backlog: usize,
    ) -> PanelResult<(Vec<LogEntry>, broadcast::Receiver<LogEntry>)> {
        let session = self.session(server_id)?;
        let session = session.lock().await;
        let logs = session.logs();
        let recent = logs[logs.len().saturating_sub(backlog)..].to_vec();
        Ok((recent, session.subscribe()))
    }

    pub async fn clear_logs(&self, server_id: &str) -> PanelResult<()> {
        let session = self.session(server_id)?;
        session.lock().await.clear();
        Ok(())
    }

    /// Returns a download file name and the rendered log text.
    pub async fn export_logs(&self, server_id: &str) -> PanelResult<(String, String)> {
        let server = self.registry.get(server_id)?;
        let session = self.session(server_id)?;
        let text = session.lock().await.export();
        let file_name = format!(
            "{}_console_{}.log",
            server.name,
            Utc::now().format("%Y-%m-%d")
        );
        Ok((file_name, text))
    }

    /// Echoes `text` into the log, records it in history and forwards it.
    ///
    /// Blank input is a no-op and returns `Ok(None)`. A server that is not
    /// online gets an error line instead, and nothing is forwarded.
    pub async fn submit_command(&self, server_id: &str, text: &str) -> PanelResult<Option<LogEntry>> {
        let server = self.registry.get(server_id)?;
        if text.trim().is_empty() {
            return Ok(None);
        }

        let session = self.session(server_id)?;
        if server.status != ServerStatus::Online {
            tracing::warn!(
                "Rejected command for '{}' while {}: {}",
                server_id,
                server.status,
                text
            );
            session.lock().await.append(LogEntry::new(
                LogLevel::Error,
                format!("Cannot send command, server is {}", server.status),
            ));
            return Err(PanelError::NotRunning(server_id.to_string()));
        }

        let echo = LogEntry::new(LogLevel::Command, format!("> {}", text));
        {
            let mut session = session.lock().await;
            session.append(echo.clone());
            session.history_mut().push(text);
        }

        if let Err(e) = self.channel.send(server_id, text).await {
            tracing::error!("Command for '{}' failed: {}", server_id, e);
            session
                .lock()
                .await
                .append(LogEntry::new(LogLevel::Error, format!("Command failed: {}", e)));
            self.events.publish(ServerEvent::OperationFailed {
                id: server_id.to_string(),
                action: Operation::Command,
                error: e.to_string(),
            });
            return Err(PanelError::OperationFailed {
                id: server_id.to_string(),
                action: Operation::Command,
                reason: e.to_string(),
            });
        }

        Ok(Some(echo))
    }

    pub async fn history_older(&self, server_id: &str) -> PanelResult<Option<String>> {
        let session = self.session(server_id)?;
        let mut session = session.lock().await;
        let shown = session.history_mut().older().map(str::to_string);
        Ok(shown)
    }

    pub async fn history_newer(&self, server_id: &str) -> PanelResult<Option<String>> {
        let session = self.session(server_id)?;
        let mut session = session.lock().await;
        let shown = session.history_mut().newer().map(str::to_string);
        Ok(shown)
    }

    pub async fn history(&self, server_id: &str) -> PanelResult<Vec<String>> {
        let session = self.session(server_id)?;
        let session = session.lock().await;
        let entries = session.history().entries().map(str::to_string).collect();
        Ok(entries)
    }

    /// Drops the session of a server that left the registry.
    pub fn remove(&self, server_id: &str) {
        self.sessions.remove(server_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::Server;
    use crate::supervisor::fakes::RecordingChannel;

    fn hub_with(status: ServerStatus) -> (ConsoleHub, RecordingChannel) {
        let registry = ServerRegistry::new(EventBus::new());
        registry
            .insert(Server::from_config(&ServerConfig {
                id: "srv1".to_string(),
                name: "DarkRP Main Server".to_string(),
                map: "rp_downtown_v4c_v2".to_string(),
                port: 27015,
                max_players: 32,
                max_ram_mb: 4096,
                autostart: false,
            }))
            .unwrap();
        registry
            .update("srv1", |s| match status {
                ServerStatus::Online => s.mark_online(Utc::now()),
                ServerStatus::Starting => s.mark_starting(),
                ServerStatus::Stopping => s.mark_stopping(),
                ServerStatus::Offline => s.mark_offline(),
            })
            .unwrap();
        let channel = RecordingChannel::default();
        let hub = ConsoleHub::new(registry, Arc::new(channel.clone()));
        (hub, channel)
    }

    #[test]
    fn older_walks_back_and_sticks_at_oldest() {
        let mut history = CommandHistory::default();
        for cmd in ["a", "b", "c"] {
            history.push(cmd);
        }

        assert_eq!(history.older(), Some("c"));
        assert_eq!(history.older(), Some("b"));
        assert_eq!(history.older(), Some("a"));
        assert_eq!(history.older(), Some("a"));

        assert_eq!(history.newer(), Some("b"));
        assert_eq!(history.newer(), Some("c"));
        assert_eq!(history.newer(), Some(""));
        assert_eq!(history.newer(), None);
        assert_eq!(history.cursor, None);
    }

    #[test]
    fn empty_history_does_not_move() {
        let mut history = CommandHistory::default();
        assert_eq!(history.older(), None);
        assert_eq!(history.newer(), None);
    }

    #[test]
    fn push_resets_cursor() {
        let mut history = CommandHistory::default();
        history.push("a");
        history.push("b");
        assert_eq!(history.older(), Some("b"));
        assert_eq!(history.older(), Some("a"));

        history.push("c");
        assert_eq!(history.cursor, None);
        assert_eq!(history.older(), Some("c"));
    }

    #[test]
    fn history_keeps_last_fifty() {
        let mut history = CommandHistory::default();
        for i in 0..51 {
            history.push(format!("cmd{}", i));
        }
        assert_eq!(history.len(), HISTORY_LIMIT);

        let mut oldest = None;
        for _ in 0..60 {
            oldest = history.older().map(str::to_string);
        }
        assert_eq!(oldest.as_deref(), Some("cmd1"));
        assert!(history.entries().all(|c| c != "cmd0"));
    }

    #[test]
    fn export_uses_bracketed_levels() {
        let mut session = ConsoleSession::new();
        session.append(LogEntry::new(LogLevel::Info, "Server started successfully"));
        session.append(LogEntry::new(LogLevel::Warning, "Player connection timeout"));

        let text = session.export();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] Server started successfully"));
        assert!(lines[1].ends_with("[WARNING] Player connection timeout"));
    }

    #[tokio::test]
    async fn submit_echoes_records_and_forwards() {
        let (hub, channel) = hub_with(ServerStatus::Online);

        let echo = hub.submit_command("srv1", "say Welcome").await.unwrap().unwrap();

        assert_eq!(echo.level, LogLevel::Command);
        assert_eq!(echo.message, "> say Welcome");
        assert_eq!(hub.logs("srv1").await.unwrap(), vec![echo]);
        assert_eq!(hub.history("srv1").await.unwrap(), vec!["say Welcome"]);
        assert_eq!(
            channel.sent(),
            vec![("srv1".to_string(), "say Welcome".to_string())]
        );
    }

    #[tokio::test]
    async fn blank_submission_is_a_no_op() {
        let (hub, channel) = hub_with(ServerStatus::Online);

        assert_eq!(hub.submit_command("srv1", "   \t").await, Ok(None));
        assert_eq!(hub.submit_command("srv1", "").await, Ok(None));

        assert!(hub.logs("srv1").await.unwrap().is_empty());
        assert!(hub.history("srv1").await.unwrap().is_empty());
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn offline_server_gets_error_line_not_forwarded() {
        let (hub, channel) = hub_with(ServerStatus::Offline);

        let result = hub.submit_command("srv1", "status").await;

        assert_eq!(result, Err(PanelError::NotRunning("srv1".to_string())));
        let logs = hub.logs("srv1").await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Error);
        assert!(hub.history("srv1").await.unwrap().is_empty());
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn channel_failure_is_logged_and_published() {
        let (hub, channel) = hub_with(ServerStatus::Online);
        let mut events = hub.events.subscribe();
        channel.fail_next("rcon refused");

        let result = hub.submit_command("srv1", "kick bob").await;

        assert!(matches!(
            result,
            Err(PanelError::OperationFailed {
                action: Operation::Command,
                ..
            })
        ));
        let levels: Vec<LogLevel> = hub
            .logs("srv1")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.level)
            .collect();
        assert_eq!(levels, vec![LogLevel::Command, LogLevel::Error]);
        assert!(matches!(
            events.try_recv().unwrap(),
            ServerEvent::OperationFailed { .. }
        ));
    }

    #[tokio::test]
    async fn sessions_navigate_independently() {
        let (hub, _) = hub_with(ServerStatus::Online);
        hub.submit_command("srv1", "a").await.unwrap();
        hub.submit_command("srv1", "b").await.unwrap();

        assert_eq!(hub.history_older("srv1").await.unwrap().as_deref(), Some("b"));
        assert_eq!(hub.history_older("srv1").await.unwrap().as_deref(), Some("a"));
        assert_eq!(hub.history_newer("srv1").await.unwrap().as_deref(), Some("b"));
        assert_eq!(
            hub.history_older("missing").await,
            Err(PanelError::NotFound("missing".to_string()))
        );
    }

    #[tokio::test]
    async fn clear_keeps_history() {
        let (hub, _) = hub_with(ServerStatus::Online);
        hub.submit_command("srv1", "status").await.unwrap();

        hub.clear_logs("srv1").await.unwrap();

        assert!(hub.logs("srv1").await.unwrap().is_empty());
        assert_eq!(hub.history("srv1").await.unwrap(), vec!["status"]);
    }

    #[tokio::test]
    async fn follow_returns_tail_then_live_entries() {
        let (hub, _) = hub_with(ServerStatus::Online);
        for i in 0..5 {
            hub.log("srv1", LogLevel::Info, format!("line {}", i)).await;
        }

        let (backlog, mut rx) = hub.follow("srv1", 2).await.unwrap();
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[1].message, "line 4");

        hub.log("srv1", LogLevel::Warning, "late").await;
        assert_eq!(rx.recv().await.unwrap().message, "late");
    }

    #[tokio::test]
    async fn export_names_file_after_server() {
        let (hub, _) = hub_with(ServerStatus::Online);
        hub.log("srv1", LogLevel::Info, "hello").await;

        let (name, text) = hub.export_logs("srv1").await.unwrap();
        assert!(name.starts_with("DarkRP Main Server_console_"));
        assert!(name.ends_with(".log"));
        assert!(text.ends_with("[INFO] hello"));
    }

    #[tokio::test]
    async fn logging_to_a_removed_server_leaves_no_session() {
        let (hub, _) = hub_with(ServerStatus::Online);
        hub.log("srv1", LogLevel::Info, "before").await;
        assert!(hub.sessions.contains_key("srv1"));

        hub.registry.remove("srv1").unwrap();
        hub.log("srv1", LogLevel::Info, "late").await;
        hub.remove("srv1");
        hub.log("srv1", LogLevel::Info, "later").await;

        assert!(!hub.sessions.contains_key("srv1"));
        assert_eq!(
            hub.logs("srv1").await,
            Err(PanelError::NotFound("srv1".to_string()))
        );
    }
}
