//! Longest-prefix routing over interledger addresses.

use std::sync::Arc;

use codec::packet::Address;
use parking_lot::RwLock;

use crate::PeerId;

/// One routing entry. Lower priority values win among equal-length
/// prefixes; remaining ties keep their insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub prefix: Vec<u8>,
    pub next_hop: PeerId,
    pub priority: u32,
}

/// Longest-byte-prefix matcher.
///
/// The table keeps a sorted snapshot behind an `Arc`. Lookups clone the
/// snapshot pointer and scan it without holding any lock, so they never
/// see a partially applied update and never block each other; `update`
/// swaps the pointer atomically.
pub struct RoutingTable {
    snapshot: RwLock<Arc<Vec<Route>>>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }
}

impl RoutingTable {
    /// Atomically replaces the whole table.
    ///
    /// # Example
    ///
    /// ```
    /// use codec::packet::Address;
    /// use ilp_connector_service::routing::{Route, RoutingTable};
    ///
    /// let table = RoutingTable::default();
    /// table.update(vec![
    ///     Route {
    ///         prefix: b"g.".to_vec(),
    ///         next_hop: "b".to_string(),
    ///         priority: 0,
    ///     },
    ///     Route {
    ///         prefix: b"g.carol".to_vec(),
    ///         next_hop: "c".to_string(),
    ///         priority: 0,
    ///     },
    /// ]);
    ///
    /// let dest = Address::new("g.carol.shop").unwrap();
    /// assert_eq!(table.lookup(&dest).unwrap().next_hop, "c");
    ///
    /// let dest = Address::new("g.alice").unwrap();
    /// assert_eq!(table.lookup(&dest).unwrap().next_hop, "b");
    /// ```
    pub fn update(&self, mut routes: Vec<Route>) {
        // The sort is stable, so equal (length, priority) pairs keep
        // their insertion order and lookups can simply take the first
        // matching entry.
        routes.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then(a.priority.cmp(&b.priority))
        });

        *self.snapshot.write() = Arc::new(routes);
    }

    /// The route with the longest prefix of `destination`, if any.
    ///
    /// # Example
    ///
    /// ```
    /// use codec::packet::Address;
    /// use ilp_connector_service::routing::RoutingTable;
    ///
    /// let table = RoutingTable::default();
    /// let dest = Address::new("g.anywhere").unwrap();
    /// assert!(table.lookup(&dest).is_none());
    /// ```
    pub fn lookup(&self, destination: &Address) -> Option<Route> {
        let snapshot = self.snapshot.read().clone();
        snapshot
            .iter()
            .find(|it| destination.starts_with(&it.prefix))
            .cloned()
    }

    pub fn snapshot(&self) -> Arc<Vec<Route>> {
        self.snapshot.read().clone()
    }
}
