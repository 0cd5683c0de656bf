use dashmap::DashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{PanelError, PanelResult};
use crate::events::{EventBus, ServerEvent};
use crate::server::Server;

/// Authoritative id -> `Server` mapping.
///
/// Reads hand out clones. Writes to one id are serialized by the map's
/// shard lock, and every successful write is announced on the event bus.
#[derive(Clone)]
pub struct ServerRegistry {
    servers: Arc<DashMap<String, Server>>,
    order: Arc<RwLock<Vec<String>>>,
    events: EventBus,
}

impl ServerRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            servers: Arc::new(DashMap::new()),
            order: Arc::new(RwLock::new(Vec::new())),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn get(&self, id: &str) -> PanelResult<Server> {
        self.servers
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| PanelError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.servers.contains_key(id)
    }

    /// All servers in insertion order.
    pub fn list(&self) -> Vec<Server> {
        let order = self.order.read().unwrap_or_else(PoisonError::into_inner);
        order
            .iter()
            .filter_map(|id| self.servers.get(id).map(|r| r.value().clone()))
            .collect()
    }

    pub fn insert(&self, server: Server) -> PanelResult<Server> {
        let mut order = self.order.write().unwrap_or_else(PoisonError::into_inner);
        if self.servers.contains_key(&server.id) {
            return Err(PanelError::AlreadyExists(server.id));
        }
        order.push(server.id.clone());
        self.servers.insert(server.id.clone(), server.clone());
        drop(order);

        self.events.publish(ServerEvent::Added {
            server: server.clone(),
        });
        Ok(server)
    }

    pub fn remove(&self, id: &str) -> PanelResult<Server> {
        let mut order = self.order.write().unwrap_or_else(PoisonError::into_inner);
        let (_, server) = self
            .servers
            .remove(id)
            .ok_or_else(|| PanelError::NotFound(id.to_string()))?;
        order.retain(|s| s != id);
        drop(order);

        self.events.publish(ServerEvent::Removed { id: id.to_string() });
        Ok(server)
    }

    /// Applies `mutation` to the record for `id` and returns the new value.
    /// Reserved for the lifecycle controller.
    pub(crate) fn update(
        &self,
        id: &str,
        mutation: impl FnOnce(&mut Server),
    ) -> PanelResult<Server> {
        self.try_update(id, |server| {
            mutation(server);
            Ok(())
        })
    }

    /// Like `update`, but `mutation` may refuse. A refused mutation must
    /// leave the record untouched, and no event is published for it.
    pub(crate) fn try_update(
        &self,
        id: &str,
        mutation: impl FnOnce(&mut Server) -> PanelResult<()>,
    ) -> PanelResult<Server> {
        let updated = {
            let mut entry = self
                .servers
                .get_mut(id)
                .ok_or_else(|| PanelError::NotFound(id.to_string()))?;
            mutation(entry.value_mut())?;
            entry.value().clone()
        };

        self.events.publish(ServerEvent::Updated {
            server: updated.clone(),
        });
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::ServerStatus;

    fn server(id: &str) -> Server {
        Server::from_config(&ServerConfig {
            id: id.to_string(),
            name: format!("{} server", id),
            map: "gm_flatgrass".to_string(),
            port: 27017,
            max_players: 16,
            max_ram_mb: 1024,
            autostart: false,
        })
    }

    #[test]
    fn list_keeps_insertion_order() {
        let registry = ServerRegistry::new(EventBus::new());
        for id in ["srv3", "srv1", "srv2"] {
            registry.insert(server(id)).unwrap();
        }
        let ids: Vec<String> = registry.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["srv3", "srv1", "srv2"]);

        registry.remove("srv1").unwrap();
        let ids: Vec<String> = registry.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["srv3", "srv2"]);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let registry = ServerRegistry::new(EventBus::new());
        registry.insert(server("srv1")).unwrap();
        assert_eq!(
            registry.insert(server("srv1")),
            Err(PanelError::AlreadyExists("srv1".to_string()))
        );
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn unknown_ids_report_not_found() {
        let registry = ServerRegistry::new(EventBus::new());
        assert_eq!(
            registry.get("nope"),
            Err(PanelError::NotFound("nope".to_string()))
        );
        assert!(registry.update("nope", |_| {}).is_err());
        assert!(registry.remove("nope").is_err());
    }

    #[test]
    fn update_notifies_subscribers() {
        let registry = ServerRegistry::new(EventBus::new());
        registry.insert(server("srv1")).unwrap();
        let mut rx = registry.events().subscribe();

        registry.update("srv1", |s| s.mark_starting()).unwrap();

        match rx.try_recv().unwrap() {
            ServerEvent::Updated { server } => assert_eq!(server.status, ServerStatus::Starting),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn refused_update_changes_nothing_and_stays_silent() {
        let registry = ServerRegistry::new(EventBus::new());
        registry.insert(server("srv1")).unwrap();
        let mut rx = registry.events().subscribe();

        let result = registry.try_update("srv1", |_| Err(PanelError::NotRunning("srv1".into())));

        assert!(result.is_err());
        assert_eq!(registry.get("srv1").unwrap().status, ServerStatus::Offline);
        assert!(rx.try_recv().is_err());
    }
}
