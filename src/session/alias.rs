//! Topic alias tables (MQTT v5)
//!
//! A v5 peer may replace the topic string of a PUBLISH with a small
//! integer alias once the mapping has been sent. Each direction keeps its
//! own table, bounded by the maximum the receiving side advertised.

use std::sync::Arc;

use ahash::AHashMap;

/// Outbound alias assignment, bounded by the broker's advertised maximum.
///
/// When the table is full the least-recently-used mapping is evicted and
/// its alias reassigned; every lookup refreshes recency.
#[derive(Debug)]
pub struct TopicAliasSend {
    max: u16,
    by_topic: AHashMap<Arc<str>, u16>,
    by_alias: AHashMap<u16, (Arc<str>, u64)>,
    clock: u64,
}

/// Result of an outbound alias lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasAssignment {
    /// The topic already has an alias; send the alias with an empty topic.
    Existing(u16),
    /// A fresh alias was assigned; send both topic and alias.
    New(u16),
}

impl TopicAliasSend {
    /// `max` is the broker's Topic Alias Maximum. Callers must not build a
    /// table when the broker advertised 0.
    pub fn new(max: u16) -> Self {
        debug_assert!(max > 0);
        Self {
            max,
            by_topic: AHashMap::new(),
            by_alias: AHashMap::new(),
            clock: 0,
        }
    }

    pub fn max(&self) -> u16 {
        self.max
    }

    /// Alias for `topic`, assigning one (and evicting if full) when absent.
    pub fn alias_for(&mut self, topic: &Arc<str>) -> AliasAssignment {
        self.clock += 1;

        if let Some(&alias) = self.by_topic.get(topic) {
            if let Some(entry) = self.by_alias.get_mut(&alias) {
                entry.1 = self.clock;
            }
            return AliasAssignment::Existing(alias);
        }

        let alias = if (self.by_alias.len() as u16) < self.max {
            self.by_alias.len() as u16 + 1
        } else {
            // Full: reassign the coldest alias
            let alias = self
                .by_alias
                .iter()
                .min_by_key(|(_, (_, stamp))| *stamp)
                .map(|(&alias, _)| alias)
                .unwrap_or(1);
            if let Some((old_topic, _)) = self.by_alias.remove(&alias) {
                self.by_topic.remove(&old_topic);
            }
            alias
        };

        self.by_topic.insert(topic.clone(), alias);
        self.by_alias.insert(alias, (topic.clone(), self.clock));
        AliasAssignment::New(alias)
    }
}

/// Inbound alias table: alias -> topic, bounded by our own advertised
/// maximum. The broker controls assignment; we only record and resolve.
#[derive(Debug)]
pub struct TopicAliasRecv {
    max: u16,
    map: AHashMap<u16, Arc<str>>,
}

impl TopicAliasRecv {
    pub fn new(max: u16) -> Self {
        Self {
            max,
            map: AHashMap::new(),
        }
    }

    /// Record an alias -> topic mapping. Returns false for alias 0 or an
    /// alias above our maximum; the caller treats that as a protocol error.
    pub fn register(&mut self, alias: u16, topic: Arc<str>) -> bool {
        if alias == 0 || alias > self.max {
            return false;
        }
        self.map.insert(alias, topic);
        true
    }

    /// Topic for a previously registered alias.
    pub fn resolve(&self, alias: u16) -> Option<Arc<str>> {
        if alias == 0 || alias > self.max {
            return None;
        }
        self.map.get(&alias).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn topic(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    #[test]
    fn send_assigns_then_reuses() {
        let mut table = TopicAliasSend::new(10);
        let t = topic("a/b");
        assert_eq!(table.alias_for(&t), AliasAssignment::New(1));
        assert_eq!(table.alias_for(&t), AliasAssignment::Existing(1));
        assert_eq!(table.alias_for(&topic("c/d")), AliasAssignment::New(2));
    }

    #[test]
    fn send_evicts_least_recently_used() {
        let mut table = TopicAliasSend::new(2);
        let a = topic("a");
        let b = topic("b");
        assert_eq!(table.alias_for(&a), AliasAssignment::New(1));
        assert_eq!(table.alias_for(&b), AliasAssignment::New(2));
        // Touch "a" so "b" becomes the eviction victim
        assert_eq!(table.alias_for(&a), AliasAssignment::Existing(1));
        assert_eq!(table.alias_for(&topic("c")), AliasAssignment::New(2));
        // "b" lost its alias, "a" kept its own
        assert_eq!(table.alias_for(&a), AliasAssignment::Existing(1));
        assert_eq!(table.alias_for(&b), AliasAssignment::New(2));
    }

    #[test]
    fn recv_round_trips() {
        let mut table = TopicAliasRecv::new(5);
        assert!(table.register(3, topic("x/y")));
        assert_eq!(table.resolve(3).as_deref(), Some("x/y"));
        // Re-registration overwrites
        assert!(table.register(3, topic("z")));
        assert_eq!(table.resolve(3).as_deref(), Some("z"));
    }

    #[test]
    fn recv_rejects_out_of_range() {
        let mut table = TopicAliasRecv::new(5);
        assert!(!table.register(0, topic("a")));
        assert!(!table.register(6, topic("a")));
        assert_eq!(table.resolve(0), None);
        assert_eq!(table.resolve(1), None);
    }
}
