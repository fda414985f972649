//! Packet identifier allocation
//!
//! QoS > 0 publishes and subscribe/unsubscribe requests each need a packet
//! id in 1..=65535 that is unique among in-flight operations. Two
//! strategies are provided: a wrapping counter that never reuses an id
//! until the space wraps around, and a free-list that hands back the lowest
//! vacant id immediately after release.

use std::collections::BTreeMap;

use ahash::AHashSet;

/// Allocator for MQTT packet identifiers.
///
/// Implementations never return 0. `allocate` returns `None` once all
/// 65535 ids are in flight.
pub trait PacketIdProvider: Send + Sync {
    /// Take the next free id and mark it in flight.
    fn allocate(&mut self) -> Option<u16>;

    /// Mark a specific id as in flight. Returns false if it already is.
    fn register(&mut self, id: u16) -> bool;

    /// Release an id back to the pool.
    fn deallocate(&mut self, id: u16);

    /// Release every id.
    fn clear(&mut self);
}

/// Wrapping-counter allocator.
///
/// Ids are handed out in sequence 1, 2, .. 65535, 1, .. and a released id
/// is not reused until the counter wraps back around to it. This keeps
/// recently-freed ids cold, which makes stale acks from a slow broker easy
/// to spot in logs.
#[derive(Debug)]
pub struct CyclicIdProvider {
    next: u16,
    in_flight: AHashSet<u16>,
}

impl CyclicIdProvider {
    pub fn new() -> Self {
        Self {
            next: 1,
            in_flight: AHashSet::new(),
        }
    }

    fn advance(&mut self) {
        self.next = if self.next == u16::MAX { 1 } else { self.next + 1 };
    }
}

impl Default for CyclicIdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdProvider for CyclicIdProvider {
    fn allocate(&mut self) -> Option<u16> {
        if self.in_flight.len() == u16::MAX as usize {
            return None;
        }
        // Skip over ids still in flight
        loop {
            let candidate = self.next;
            self.advance();
            if self.in_flight.insert(candidate) {
                return Some(candidate);
            }
        }
    }

    fn register(&mut self, id: u16) -> bool {
        if id == 0 {
            return false;
        }
        self.in_flight.insert(id)
    }

    fn deallocate(&mut self, id: u16) {
        self.in_flight.remove(&id);
    }

    fn clear(&mut self) {
        self.in_flight.clear();
        self.next = 1;
    }
}

/// Free-list allocator.
///
/// Vacant ids are kept as an ordered set of contiguous ranges
/// (`start -> end`, inclusive). `allocate` takes the lowest free id and
/// `deallocate` coalesces the released id with neighbouring ranges, so the
/// map stays small even under heavy churn. Released ids are immediately
/// reusable.
#[derive(Debug)]
pub struct FreeListIdProvider {
    /// start -> end (inclusive) of each vacant range, non-overlapping
    free: BTreeMap<u16, u16>,
}

impl FreeListIdProvider {
    pub fn new() -> Self {
        let mut free = BTreeMap::new();
        free.insert(1, u16::MAX);
        Self { free }
    }
}

impl Default for FreeListIdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdProvider for FreeListIdProvider {
    fn allocate(&mut self) -> Option<u16> {
        let (&start, &end) = self.free.iter().next()?;
        self.free.remove(&start);
        if start < end {
            self.free.insert(start + 1, end);
        }
        Some(start)
    }

    fn register(&mut self, id: u16) -> bool {
        if id == 0 {
            return false;
        }
        // The containing range, if any, is the last one starting at or
        // before `id`.
        let (&start, &end) = match self.free.range(..=id).next_back() {
            Some(entry) if *entry.1 >= id => entry,
            _ => return false,
        };

        self.free.remove(&start);
        if start < id {
            self.free.insert(start, id - 1);
        }
        if id < end {
            self.free.insert(id + 1, end);
        }
        true
    }

    fn deallocate(&mut self, id: u16) {
        if id == 0 {
            return;
        }
        // Already free?
        if let Some((_, &end)) = self.free.range(..=id).next_back() {
            if end >= id {
                return;
            }
        }

        let mut start = id;
        let mut end = id;

        // Merge with the range ending at id - 1
        if let Some((&prev_start, &prev_end)) = self.free.range(..id).next_back() {
            if prev_end + 1 == id {
                self.free.remove(&prev_start);
                start = prev_start;
            }
        }
        // Merge with the range starting at id + 1
        if id < u16::MAX {
            if let Some(&next_end) = self.free.get(&(id + 1)) {
                self.free.remove(&(id + 1));
                end = next_end;
            }
        }

        self.free.insert(start, end);
    }

    fn clear(&mut self) {
        self.free.clear();
        self.free.insert(1, u16::MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cyclic_never_returns_zero_and_counts_up() {
        let mut alloc = CyclicIdProvider::new();
        assert_eq!(alloc.allocate(), Some(1));
        assert_eq!(alloc.allocate(), Some(2));
        assert_eq!(alloc.allocate(), Some(3));
    }

    #[test]
    fn cyclic_does_not_reuse_until_wrap() {
        let mut alloc = CyclicIdProvider::new();
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        alloc.deallocate(a);
        // The freed id must not come back before the counter wraps
        assert_eq!(alloc.allocate(), Some(b + 1));
    }

    #[test]
    fn cyclic_skips_registered_ids() {
        let mut alloc = CyclicIdProvider::new();
        assert!(alloc.register(1));
        assert!(alloc.register(2));
        assert!(!alloc.register(2));
        assert_eq!(alloc.allocate(), Some(3));
    }

    #[test]
    fn cyclic_wraps_at_max() {
        let mut alloc = CyclicIdProvider::new();
        alloc.next = u16::MAX;
        assert_eq!(alloc.allocate(), Some(u16::MAX));
        assert_eq!(alloc.allocate(), Some(1));
    }

    #[test]
    fn free_list_reuses_after_deallocate() {
        let mut alloc = FreeListIdProvider::new();
        assert_eq!(alloc.allocate(), Some(1));
        assert_eq!(alloc.allocate(), Some(2));
        assert_eq!(alloc.allocate(), Some(3));
        alloc.deallocate(2);
        assert_eq!(alloc.allocate(), Some(2));
        assert_eq!(alloc.allocate(), Some(4));
    }

    #[test]
    fn free_list_register_splits_range() {
        let mut alloc = FreeListIdProvider::new();
        assert!(alloc.register(100));
        assert!(!alloc.register(100));
        assert_eq!(alloc.allocate(), Some(1));
        alloc.deallocate(100);
        assert!(alloc.register(100));
    }

    #[test]
    fn free_list_coalesces_neighbours() {
        let mut alloc = FreeListIdProvider::new();
        for _ in 0..5 {
            alloc.allocate();
        }
        // Free 2 and 4, then 3; 2..=4 must merge into the leading range
        alloc.deallocate(2);
        alloc.deallocate(4);
        alloc.deallocate(3);
        assert_eq!(alloc.free.len(), 2);
        assert_eq!(alloc.free.get(&2), Some(&4));
        alloc.deallocate(1);
        alloc.deallocate(5);
        assert_eq!(alloc.free.len(), 1);
        assert_eq!(alloc.free.get(&1), Some(&u16::MAX));
    }

    #[test]
    fn free_list_double_deallocate_is_noop() {
        let mut alloc = FreeListIdProvider::new();
        assert_eq!(alloc.allocate(), Some(1));
        alloc.deallocate(1);
        alloc.deallocate(1);
        assert_eq!(alloc.allocate(), Some(1));
        assert_eq!(alloc.allocate(), Some(2));
    }

    #[test]
    fn providers_are_send_and_sync() {
        // Boxed providers cross thread boundaries inside spawned tasks
        fn assert_bounds<T: Send + Sync + ?Sized>() {}
        assert_bounds::<dyn PacketIdProvider>();
        assert_bounds::<CyclicIdProvider>();
        assert_bounds::<FreeListIdProvider>();
    }

    #[test]
    fn zero_is_never_valid() {
        let mut cyclic = CyclicIdProvider::new();
        let mut free = FreeListIdProvider::new();
        assert!(!cyclic.register(0));
        assert!(!free.register(0));
        for _ in 0..70_000u32 {
            match free.allocate() {
                Some(id) => assert_ne!(id, 0),
                None => break,
            }
        }
    }
}
