//! Client session support
//!
//! Everything the connection task needs to keep a session alive across
//! transport loss: packet id allocation, topic alias tables, in-flight
//! packet stores and the resubscribe/offline bookkeeping.

mod alias;
mod packet_id;
mod store;

pub use alias::{AliasAssignment, TopicAliasRecv, TopicAliasSend};
pub use packet_id::{CyclicIdProvider, FreeListIdProvider, PacketIdProvider};
pub use store::{FjallStore, MemoryStore, PacketStore, StoreError};

use std::collections::VecDeque;

use crate::protocol::{Packet, Subscription};

/// Volatile per-session state owned by the connection task.
///
/// The subscription table feeds resubscription after a reconnect where the
/// broker did not resume the session; the offline queue holds operations
/// issued while no transport was up.
#[derive(Default)]
pub struct SessionState {
    subscriptions: Vec<Subscription>,
    offline: VecDeque<Packet>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record granted subscriptions for later resubscription. A repeated
    /// filter replaces the previous entry.
    pub fn record_subscriptions(&mut self, subs: &[Subscription]) {
        for sub in subs {
            match self
                .subscriptions
                .iter_mut()
                .find(|s| s.filter == sub.filter)
            {
                Some(existing) => existing.options = sub.options,
                None => self.subscriptions.push(sub.clone()),
            }
        }
    }

    pub fn remove_subscriptions(&mut self, filters: &[String]) {
        self.subscriptions
            .retain(|s| !filters.iter().any(|f| *f == s.filter));
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn queue_offline(&mut self, packet: Packet) {
        self.offline.push_back(packet);
    }

    pub fn drain_offline(&mut self) -> impl Iterator<Item = Packet> + '_ {
        self.offline.drain(..)
    }

    /// Drop queued packets that no longer have a pending operation.
    pub fn retain_offline<F>(&mut self, f: F)
    where
        F: FnMut(&Packet) -> bool,
    {
        self.offline.retain(f);
    }

    pub fn offline_len(&self) -> usize {
        self.offline.len()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
        self.offline.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::protocol::{QoS, SubscriptionOptions};

    fn sub(filter: &str, qos: QoS) -> Subscription {
        Subscription {
            filter: filter.to_string(),
            options: SubscriptionOptions::at_qos(qos),
        }
    }

    #[test]
    fn repeated_filter_replaces_options() {
        let mut state = SessionState::new();
        state.record_subscriptions(&[sub("a/b", QoS::AtMostOnce)]);
        state.record_subscriptions(&[sub("a/b", QoS::ExactlyOnce), sub("c", QoS::AtLeastOnce)]);

        assert_eq!(state.subscriptions().len(), 2);
        assert_eq!(state.subscriptions()[0].options.qos, QoS::ExactlyOnce);
    }

    #[test]
    fn unsubscribe_removes_entries() {
        let mut state = SessionState::new();
        state.record_subscriptions(&[sub("a", QoS::AtMostOnce), sub("b", QoS::AtMostOnce)]);
        state.remove_subscriptions(&["a".to_string()]);
        assert_eq!(state.subscriptions().len(), 1);
        assert_eq!(state.subscriptions()[0].filter, "b");
    }

    #[test]
    fn offline_queue_preserves_order() {
        let mut state = SessionState::new();
        state.queue_offline(Packet::PingReq);
        state.queue_offline(Packet::PingResp);
        let drained: Vec<_> = state.drain_offline().collect();
        assert_eq!(drained, vec![Packet::PingReq, Packet::PingResp]);
        assert_eq!(state.offline_len(), 0);
    }
}
