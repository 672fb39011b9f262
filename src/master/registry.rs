//! Connection registry: tracks registered monitors and admin clients
//!
//! Monitors are indexed three ways:
//! - `by_id`: the primary record for each logical server id
//! - `by_type`: primaries grouped by declared server type, in registration order
//! - `slaves_by_id`: further processes sharing an id with a primary, told
//!   apart by the `host`/`port` of their info
//!
//! Admin clients live in their own map and never appear in the others.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::channel::{ChannelHandle, ChannelId};
use crate::protocol::{same_instance, ServerInfo};

// ─────────────────────────────────────────────────────────────────
// Connection Record
// ─────────────────────────────────────────────────────────────────

/// What sort of peer a connection belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Monitor,
    Client,
}

/// A registered peer and the channel it is reachable on
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: String,
    pub kind: PeerKind,
    /// Declared server type; `"client"` for admin clients
    pub server_type: String,
    pub pid: Option<u32>,
    /// Server info for monitors, the authenticated user for clients
    pub info: ServerInfo,
    pub channel: ChannelHandle,
}

impl ConnectionRecord {
    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }
}

/// Where [`ConnectionRegistry::add_connection`] filed a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// New primary for its id
    Primary,
    /// Replaced the primary describing the same instance
    SupersededPrimary,
    /// New slave for an id that already has a primary
    Slave,
    /// Replaced a slave describing the same instance
    SupersededSlave,
    Client,
}

impl Placement {
    pub fn is_primary(&self) -> bool {
        matches!(self, Placement::Primary | Placement::SupersededPrimary)
    }
}

// ─────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────

/// Registry of live connections, owned by one master agent
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    by_id: BTreeMap<String, ConnectionRecord>,
    by_type: BTreeMap<String, Vec<ConnectionRecord>>,
    slaves_by_id: HashMap<String, Vec<ConnectionRecord>>,
    clients: HashMap<String, ConnectionRecord>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// File a freshly authenticated connection
    ///
    /// An unknown id becomes the primary and joins its type bucket. A known
    /// id becomes a slave, unless the new info describes the same instance as
    /// the primary or an existing slave, in which case that record is
    /// replaced in place so a reconnecting process never leaves a duplicate.
    pub fn add_connection(
        &mut self,
        id: &str,
        server_type: &str,
        pid: Option<u32>,
        info: ServerInfo,
        channel: ChannelHandle,
        as_client: bool,
    ) -> (ConnectionRecord, Placement) {
        let record = ConnectionRecord {
            id: id.to_string(),
            kind: if as_client { PeerKind::Client } else { PeerKind::Monitor },
            server_type: server_type.to_string(),
            pid,
            info,
            channel,
        };

        if as_client {
            self.clients.insert(id.to_string(), record.clone());
            return (record, Placement::Client);
        }

        let primary_matches = match self.by_id.get(id) {
            None => {
                self.by_id.insert(id.to_string(), record.clone());
                self.by_type
                    .entry(server_type.to_string())
                    .or_default()
                    .push(record.clone());
                return (record, Placement::Primary);
            }
            Some(primary) => same_instance(&primary.info, &record.info),
        };

        if primary_matches {
            self.by_id.insert(id.to_string(), record.clone());
            for bucket in self.by_type.values_mut() {
                for entry in bucket.iter_mut().filter(|r| r.id == id) {
                    *entry = record.clone();
                }
            }
            return (record, Placement::SupersededPrimary);
        }

        let slaves = self.slaves_by_id.entry(id.to_string()).or_default();
        match slaves
            .iter_mut()
            .find(|slave| same_instance(&slave.info, &record.info))
        {
            Some(existing) => {
                *existing = record.clone();
                (record, Placement::SupersededSlave)
            }
            None => {
                slaves.push(record.clone());
                (record, Placement::Slave)
            }
        }
    }

    /// Remove the monitor record for `id` whose info matches `info`
    ///
    /// The primary is checked first, then the slaves. Empty type and slave
    /// buckets are pruned. Returns the removed record.
    pub fn remove_connection(
        &mut self,
        id: &str,
        server_type: &str,
        info: &ServerInfo,
    ) -> Option<ConnectionRecord> {
        self.remove_matching(id, server_type, info, None)
    }

    /// Like [`remove_connection`](Self::remove_connection), but only if the
    /// matching record still uses `channel_id`
    ///
    /// A record superseded by a newer channel is left in place when the old
    /// channel's disconnect arrives late.
    pub fn remove_channel(
        &mut self,
        id: &str,
        server_type: &str,
        info: &ServerInfo,
        channel_id: ChannelId,
    ) -> Option<ConnectionRecord> {
        self.remove_matching(id, server_type, info, Some(channel_id))
    }

    /// Remove an admin client, only if it still uses `channel_id`
    pub fn remove_client(&mut self, id: &str, channel_id: ChannelId) -> Option<ConnectionRecord> {
        match self.clients.get(id) {
            Some(record) if record.channel_id() == channel_id => self.clients.remove(id),
            _ => None,
        }
    }

    fn remove_matching(
        &mut self,
        id: &str,
        server_type: &str,
        info: &ServerInfo,
        channel_id: Option<ChannelId>,
    ) -> Option<ConnectionRecord> {
        let owns = |record: &ConnectionRecord| {
            same_instance(&record.info, info)
                && channel_id.map_or(true, |cid| record.channel_id() == cid)
        };

        if self.by_id.get(id).map_or(false, |primary| same_instance(&primary.info, info)) {
            if !self.by_id.get(id).map_or(false, owns) {
                return None;
            }
            let removed = self.by_id.remove(id);
            if let Some(bucket) = self.by_type.get_mut(server_type) {
                if let Some(pos) = bucket.iter().position(|r| r.id == id) {
                    bucket.remove(pos);
                }
                if bucket.is_empty() {
                    self.by_type.remove(server_type);
                }
            }
            return removed;
        }

        let slaves = self.slaves_by_id.get_mut(id)?;
        let removed = slaves
            .iter()
            .position(|slave| owns(slave))
            .map(|pos| slaves.remove(pos));
        if slaves.is_empty() {
            self.slaves_by_id.remove(id);
        }
        removed
    }

    // ─────────────────────────────────────────────────────────────
    // Lookups
    // ─────────────────────────────────────────────────────────────

    pub fn lookup_by_id(&self, id: &str) -> Option<&ConnectionRecord> {
        self.by_id.get(id)
    }

    /// Primaries of a declared type, in registration order
    pub fn lookup_by_type(&self, server_type: &str) -> &[ConnectionRecord] {
        self.by_type
            .get(server_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn lookup_slaves(&self, id: &str) -> &[ConnectionRecord] {
        self.slaves_by_id
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn lookup_client(&self, client_id: &str) -> Option<&ConnectionRecord> {
        self.clients.get(client_id)
    }

    /// The primary or slave for `id` whose info describes `info`'s instance
    pub fn lookup_instance(&self, id: &str, info: &ServerInfo) -> Option<&ConnectionRecord> {
        self.by_id
            .get(id)
            .filter(|primary| same_instance(&primary.info, info))
            .or_else(|| {
                self.lookup_slaves(id)
                    .iter()
                    .find(|slave| same_instance(&slave.info, info))
            })
    }

    /// All primaries, ordered by id
    pub fn primaries(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.by_id.values()
    }

    /// Every monitor record, primaries first
    pub fn all_monitors(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.by_id.values().chain(self.slaves_by_id.values().flatten())
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.by_id.keys().cloned().collect()
    }

    pub fn monitor_count(&self) -> usize {
        self.by_id.len() + self.slaves_by_id.values().map(Vec::len).sum::<usize>()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory;
    use serde_json::json;

    fn info(host: &str, port: u16) -> ServerInfo {
        serde_json::from_value(json!({"host": host, "port": port})).unwrap()
    }

    fn handle() -> ChannelHandle {
        memory::pair().0.handle
    }

    #[tokio::test]
    async fn test_primary_and_type_bucket() {
        let mut reg = ConnectionRegistry::new();
        let (_, placement) =
            reg.add_connection("conn-1", "connector", Some(10), info("a", 1), handle(), false);
        reg.add_connection("conn-2", "connector", Some(11), info("a", 2), handle(), false);
        reg.add_connection("area-1", "area", None, info("b", 1), handle(), false);

        assert_eq!(placement, Placement::Primary);
        let ids: Vec<_> = reg.lookup_by_type("connector").iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["conn-1", "conn-2"]);
        assert_eq!(reg.lookup_by_type("area").len(), 1);
        assert!(reg.lookup_by_type("gate").is_empty());
        assert_eq!(reg.server_ids(), vec!["area-1", "conn-1", "conn-2"]);
    }

    #[tokio::test]
    async fn test_duplicate_id_becomes_slave() {
        let mut reg = ConnectionRegistry::new();
        reg.add_connection("chat-1", "chat", None, info("h1", 100), handle(), false);
        let (slave, placement) =
            reg.add_connection("chat-1", "chat", None, info("h2", 200), handle(), false);

        assert_eq!(placement, Placement::Slave);
        assert_eq!(reg.lookup_slaves("chat-1").len(), 1);
        assert_eq!(reg.lookup_by_type("chat").len(), 1);
        assert_eq!(
            reg.lookup_instance("chat-1", &info("h2", 200)).unwrap().channel_id(),
            slave.channel_id()
        );
        assert_eq!(reg.monitor_count(), 2);
    }

    #[tokio::test]
    async fn test_same_slave_instance_is_idempotent() {
        let mut reg = ConnectionRegistry::new();
        reg.add_connection("chat-1", "chat", None, info("h1", 100), handle(), false);
        reg.add_connection("chat-1", "chat", None, info("h2", 200), handle(), false);
        let (again, placement) =
            reg.add_connection("chat-1", "chat", None, info("h2", 200), handle(), false);

        assert_eq!(placement, Placement::SupersededSlave);
        assert_eq!(reg.lookup_slaves("chat-1").len(), 1);
        assert_eq!(reg.lookup_slaves("chat-1")[0].channel_id(), again.channel_id());
    }

    #[tokio::test]
    async fn test_remove_primary_leaves_slave_addressable() {
        let mut reg = ConnectionRegistry::new();
        reg.add_connection("chat-1", "chat", None, info("h1", 100), handle(), false);
        reg.add_connection("chat-1", "chat", None, info("h2", 200), handle(), false);

        let removed = reg.remove_connection("chat-1", "chat", &info("h1", 100)).unwrap();
        assert_eq!(removed.info, info("h1", 100));
        assert!(reg.lookup_by_id("chat-1").is_none());
        assert!(reg.lookup_by_type("chat").is_empty());
        assert!(reg.lookup_instance("chat-1", &info("h2", 200)).is_some());
    }

    #[tokio::test]
    async fn test_remove_non_matching_info_removes_only_slave() {
        let mut reg = ConnectionRegistry::new();
        reg.add_connection("chat-1", "chat", None, info("h1", 100), handle(), false);
        reg.add_connection("chat-1", "chat", None, info("h2", 200), handle(), false);

        reg.remove_connection("chat-1", "chat", &info("h2", 200)).unwrap();
        assert!(reg.lookup_by_id("chat-1").is_some());
        assert!(reg.lookup_slaves("chat-1").is_empty());

        assert!(reg.remove_connection("chat-1", "chat", &info("h9", 9)).is_none());
        assert!(reg.lookup_by_id("chat-1").is_some());
    }

    #[tokio::test]
    async fn test_stale_channel_does_not_remove_superseding_record() {
        let mut reg = ConnectionRegistry::new();
        let (old, _) = reg.add_connection("gate-1", "gate", None, info("g", 1), handle(), false);
        let (new, placement) =
            reg.add_connection("gate-1", "gate", None, info("g", 1), handle(), false);
        assert_eq!(placement, Placement::SupersededPrimary);
        assert_eq!(reg.lookup_by_type("gate")[0].channel_id(), new.channel_id());

        assert!(reg.remove_channel("gate-1", "gate", &info("g", 1), old.channel_id()).is_none());
        assert!(reg.lookup_by_id("gate-1").is_some());

        assert!(reg.remove_channel("gate-1", "gate", &info("g", 1), new.channel_id()).is_some());
        assert!(reg.lookup_by_id("gate-1").is_none());
    }

    #[tokio::test]
    async fn test_clients_are_kept_apart() {
        let mut reg = ConnectionRegistry::new();
        let user: ServerInfo = serde_json::from_value(json!({"username": "admin", "level": 1})).unwrap();
        let (client, placement) = reg.add_connection("web-1", "client", None, user, handle(), true);

        assert_eq!(placement, Placement::Client);
        assert_eq!(client.kind, PeerKind::Client);
        assert!(reg.lookup_by_id("web-1").is_none());
        assert!(reg.lookup_by_type("client").is_empty());
        assert_eq!(reg.lookup_client("web-1").unwrap().info["level"], 1);

        assert!(reg.remove_client("web-1", client.channel_id() + 1000).is_none());
        assert!(reg.remove_client("web-1", client.channel_id()).is_some());
        assert_eq!(reg.client_count(), 0);
    }
}
