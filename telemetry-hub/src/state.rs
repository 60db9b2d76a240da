//! Replayable snapshots of the network, folded from the event stream.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use serde_json::Value;

/// Settlement history kept for late subscribers.
const SETTLEMENT_HISTORY: usize = 100;

/// How long a settled channel stays visible.
const CHANNEL_RETENTION: Duration = Duration::from_secs(5 * 60);

struct Channel {
    event: Value,
    settled_at: Option<Instant>,
}

/// State folded from ingested events.
///
/// Everything here is replayed to late-joining subscribers: the last
/// `NodeStatus` per node, the last balance per account, a bounded
/// settlement history, and the live channel set.
#[derive(Default)]
pub struct HubState {
    node_status: AHashMap<String, Value>,
    balances: AHashMap<(String, String, String), Value>,
    settlements: VecDeque<Value>,
    channels: AHashMap<String, Channel>,
}

fn field(event: &Value, name: &str) -> String {
    event
        .get(name)
        .and_then(|it| it.as_str())
        .unwrap_or_default()
        .to_string()
}

impl HubState {
    /// Folds one validated event into the snapshots.
    pub fn apply(&mut self, kind: &str, node_id: &str, event: &Value) {
        match kind {
            "NodeStatus" => {
                self.node_status.insert(node_id.to_string(), event.clone());
            }
            "AccountBalance" => {
                let key = (
                    node_id.to_string(),
                    field(event, "peer"),
                    field(event, "token"),
                );

                self.balances.insert(key, event.clone());
            }
            "SettlementTriggered" | "SettlementCompleted" => {
                if self.settlements.len() >= SETTLEMENT_HISTORY {
                    self.settlements.pop_front();
                }

                self.settlements.push_back(event.clone());
            }
            "ChannelOpened" => {
                self.channels.insert(
                    field(event, "channelId"),
                    Channel {
                        event: event.clone(),
                        settled_at: None,
                    },
                );
            }
            "ChannelBalanceUpdate" => {
                if let Some(channel) = self.channels.get_mut(&field(event, "channelId")) {
                    if let (Some(state), Some(balance)) =
                        (channel.event.as_object_mut(), event.get("balance"))
                    {
                        state.insert("balance".to_string(), balance.clone());
                    }
                }
            }
            "ChannelSettled" => {
                if let Some(channel) = self.channels.get_mut(&field(event, "channelId")) {
                    if let Some(state) = channel.event.as_object_mut() {
                        state.insert("settled".to_string(), Value::Bool(true));
                    }

                    channel.settled_at = Some(Instant::now());
                }
            }
            _ => {}
        }
    }

    /// Evicts channels that finished their post-settlement retention.
    pub fn sweep(&mut self) {
        self.channels.retain(|_, it| {
            it.settled_at
                .map(|at| at.elapsed() < CHANNEL_RETENTION)
                .unwrap_or(true)
        });
    }

    /// The cached `NodeStatus` events, one per known node.
    pub fn node_status_events(&self) -> Vec<Value> {
        self.node_status.values().cloned().collect()
    }

    /// The current channel set, for `InitialChannelState`.
    pub fn channel_events(&self) -> Vec<Value> {
        self.channels.values().map(|it| it.event.clone()).collect()
    }

    pub fn settlement_events(&self) -> Vec<Value> {
        self.settlements.iter().cloned().collect()
    }

    pub fn balance_events(&self) -> Vec<Value> {
        self.balances.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply(state: &mut HubState, event: Value) {
        let kind = field(&event, "type");
        let node = field(&event, "nodeId");
        state.apply(&kind, &node, &event);
    }

    #[test]
    fn node_status_replaces_prior() {
        let mut state = HubState::default();
        apply(&mut state, json!({"type": "NodeStatus", "nodeId": "a", "status": "starting"}));
        apply(&mut state, json!({"type": "NodeStatus", "nodeId": "a", "status": "healthy"}));
        apply(&mut state, json!({"type": "NodeStatus", "nodeId": "b", "status": "healthy"}));

        let events = state.node_status_events();
        assert_eq!(events.len(), 2);
        assert!(
            events
                .iter()
                .filter(|it| it["nodeId"] == "a")
                .all(|it| it["status"] == "healthy")
        );
    }

    #[test]
    fn balances_key_on_node_peer_token() {
        let mut state = HubState::default();
        apply(&mut state, json!({"type": "AccountBalance", "nodeId": "a", "peer": "b", "token": "xrp", "balance": 1}));
        apply(&mut state, json!({"type": "AccountBalance", "nodeId": "a", "peer": "b", "token": "xrp", "balance": 5}));
        apply(&mut state, json!({"type": "AccountBalance", "nodeId": "a", "peer": "b", "token": "eth", "balance": 9}));

        let events = state.balance_events();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn settlements_are_bounded() {
        let mut state = HubState::default();
        for n in 0..150 {
            apply(&mut state, json!({"type": "SettlementTriggered", "nodeId": "a", "amount": n}));
        }

        let events = state.settlement_events();
        assert_eq!(events.len(), 100);
        assert_eq!(events[0]["amount"], 50);
    }

    #[test]
    fn channel_lifecycle() {
        let mut state = HubState::default();
        apply(&mut state, json!({"type": "ChannelOpened", "nodeId": "a", "channelId": "ch-1", "capacity": 100, "balance": 0}));
        apply(&mut state, json!({"type": "ChannelBalanceUpdate", "nodeId": "a", "channelId": "ch-1", "balance": 40}));

        let events = state.channel_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["balance"], 40);
        assert_eq!(events[0]["capacity"], 100);

        apply(&mut state, json!({"type": "ChannelSettled", "nodeId": "a", "channelId": "ch-1"}));
        let events = state.channel_events();
        assert_eq!(events[0]["settled"], true);

        // Still visible until the retention window runs out.
        state.sweep();
        assert_eq!(state.channel_events().len(), 1);
    }

    #[test]
    fn update_for_unknown_channel_is_ignored() {
        let mut state = HubState::default();
        apply(&mut state, json!({"type": "ChannelBalanceUpdate", "nodeId": "a", "channelId": "nope", "balance": 40}));
        assert!(state.channel_events().is_empty());
    }
}
