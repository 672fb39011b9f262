//! Pending request table and redelivery log
//!
//! Every request the master sends is recorded twice: a completion keyed by
//! `reqId`, and an outstanding entry under the target id. The outstanding
//! entries are replayed when a process registers again under that id, so a
//! request survives a monitor reconnect (at-least-once delivery).

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::protocol::{same_instance, ReqId, ServerInfo};

/// Completion side of an outstanding request
pub(crate) type Completion = oneshot::Sender<Result<Value>>;

/// A request kept for redelivery
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub module_id: String,
    pub body: Value,
    /// Set when the request was addressed to one instance of the id
    pub instance: Option<ServerInfo>,
}

impl OutboundRequest {
    /// Whether a record registering with `info` should receive this request
    /// on replay. Untargeted requests follow the primary.
    pub fn targets(&self, info: &ServerInfo, is_primary: bool) -> bool {
        match &self.instance {
            Some(instance) => same_instance(instance, info),
            None => is_primary,
        }
    }
}

/// Request ids, completions and the per-target redelivery log
#[derive(Debug)]
pub struct PendingTable {
    next_req_id: ReqId,
    completions: HashMap<ReqId, Completion>,
    outstanding: HashMap<String, BTreeMap<ReqId, OutboundRequest>>,
    /// Maximum outstanding entries per target; 0 disables the cap
    limit: usize,
}

impl PendingTable {
    pub fn new(limit: usize) -> Self {
        Self {
            next_req_id: 1,
            completions: HashMap::new(),
            outstanding: HashMap::new(),
            limit,
        }
    }

    /// Next request id; ids are never reused by this table
    pub fn allocate(&mut self) -> ReqId {
        let id = self.next_req_id;
        self.next_req_id += 1;
        id
    }

    /// Record a request sent to `target`
    ///
    /// Returns the oldest entry for `target` when the cap pushed it out. Its
    /// completion has not been fired; the caller decides what to tell it.
    pub(crate) fn insert(
        &mut self,
        target: &str,
        req_id: ReqId,
        request: OutboundRequest,
        completion: Completion,
    ) -> Option<(ReqId, Completion)> {
        self.completions.insert(req_id, completion);
        let log = self.outstanding.entry(target.to_string()).or_default();
        log.insert(req_id, request);

        if self.limit == 0 || log.len() <= self.limit {
            return None;
        }
        let (evicted, _) = log.pop_first()?;
        self.completions.remove(&evicted).map(|c| (evicted, c))
    }

    /// Settle `req_id` answered by `target`
    ///
    /// Only a request logged against `target` can be settled; a response for
    /// an id sent elsewhere leaves the entry alone. `None` means nobody here
    /// is waiting: a duplicate, stale or misdirected response.
    pub(crate) fn resolve(&mut self, target: &str, req_id: ReqId) -> Option<Completion> {
        let log = self.outstanding.get_mut(target)?;
        log.remove(&req_id)?;
        if log.is_empty() {
            self.outstanding.remove(target);
        }
        self.completions.remove(&req_id)
    }

    /// Outstanding requests for `target` in ascending id order
    pub fn outstanding_for(&self, target: &str) -> Vec<(ReqId, OutboundRequest)> {
        self.outstanding
            .get(target)
            .map(|log| log.iter().map(|(id, req)| (*id, req.clone())).collect())
            .unwrap_or_default()
    }

    /// Drop everything, handing back the completions still waiting
    pub(crate) fn drain(&mut self) -> Vec<Completion> {
        self.outstanding.clear();
        self.completions.drain().map(|(_, c)| c).collect()
    }

    /// Number of requests still waiting for a response
    pub fn len(&self) -> usize {
        self.completions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completions.is_empty()
    }

    pub fn outstanding_count(&self, target: &str) -> usize {
        self.outstanding.get(target).map_or(0, BTreeMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(module: &str) -> OutboundRequest {
        OutboundRequest {
            module_id: module.to_string(),
            body: json!({}),
            instance: None,
        }
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let mut table = PendingTable::new(0);
        assert_eq!(table.allocate(), 1);
        assert_eq!(table.allocate(), 2);
        assert_eq!(table.allocate(), 3);
    }

    #[test]
    fn test_resolve_clears_log_and_completion() {
        let mut table = PendingTable::new(0);
        let (tx, _rx) = oneshot::channel();
        let id = table.allocate();
        assert!(table.insert("conn-1", id, request("stats"), tx).is_none());
        assert_eq!(table.outstanding_count("conn-1"), 1);

        assert!(table.resolve("conn-1", id).is_some());
        assert_eq!(table.outstanding_count("conn-1"), 0);
        assert!(table.is_empty());

        // A second response for the same id is stale
        assert!(table.resolve("conn-1", id).is_none());
    }

    #[test]
    fn test_resolve_from_other_target_is_ignored() {
        let mut table = PendingTable::new(0);
        let (tx, _rx) = oneshot::channel();
        let id = table.allocate();
        table.insert("area-1", id, request("stats"), tx);

        assert!(table.resolve("area-2", id).is_none());
        assert_eq!(table.outstanding_count("area-1"), 1);
        assert_eq!(table.len(), 1);

        assert!(table.resolve("area-1", id).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_outstanding_in_id_order() {
        let mut table = PendingTable::new(0);
        for module in ["a", "b", "c"] {
            let (tx, _rx) = oneshot::channel();
            let id = table.allocate();
            table.insert("area-1", id, request(module), tx);
        }
        let modules: Vec<_> = table
            .outstanding_for("area-1")
            .into_iter()
            .map(|(_, r)| r.module_id)
            .collect();
        assert_eq!(modules, vec!["a", "b", "c"]);
        assert!(table.outstanding_for("area-2").is_empty());
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let mut table = PendingTable::new(2);
        let mut receivers = Vec::new();
        let mut evicted = None;
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            receivers.push(rx);
            let id = table.allocate();
            evicted = table.insert("gate-1", id, request("x"), tx);
        }

        let (id, _completion) = evicted.unwrap();
        assert_eq!(id, 1);
        assert_eq!(table.outstanding_count("gate-1"), 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_drain_returns_waiters() {
        let mut table = PendingTable::new(0);
        for target in ["a", "b"] {
            let (tx, _rx) = oneshot::channel();
            let id = table.allocate();
            table.insert(target, id, request("m"), tx);
        }
        assert_eq!(table.drain().len(), 2);
        assert!(table.outstanding_for("a").is_empty());
    }

    #[test]
    fn test_instance_targeting() {
        let info: ServerInfo = serde_json::from_value(json!({"host": "h", "port": 2})).unwrap();
        let other: ServerInfo = serde_json::from_value(json!({"host": "h", "port": 3})).unwrap();

        let untargeted = request("m");
        assert!(untargeted.targets(&info, true));
        assert!(!untargeted.targets(&info, false));

        let targeted = OutboundRequest {
            instance: Some(info.clone()),
            ..request("m")
        };
        assert!(targeted.targets(&info, false));
        assert!(!targeted.targets(&other, true));
    }
}
