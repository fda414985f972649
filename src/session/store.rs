//! In-flight packet stores
//!
//! QoS 1/2 delivery needs the outbound publish (and the PUBREL marker for
//! QoS 2) to survive until the final ack, and for durable sessions to
//! survive a process restart. The store holds packets keyed by packet id
//! and replays them in insertion order after a reconnect.

use std::fmt;
use std::path::Path;

use ahash::AHashMap;
use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use parking_lot::Mutex;

use crate::codec::{Decoder, Encoder};
use crate::protocol::{Packet, ProtocolVersion};

/// Store failure. Carries a message rather than a backend-specific error
/// type so the trait stays object-safe across backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store error: {}", self.0)
    }
}

impl std::error::Error for StoreError {}

impl From<fjall::Error> for StoreError {
    fn from(e: fjall::Error) -> Self {
        StoreError(e.to_string())
    }
}

impl From<StoreError> for crate::protocol::ClientError {
    fn from(e: StoreError) -> Self {
        crate::protocol::ClientError::Store(e.0)
    }
}

/// Packet store keyed by packet id.
///
/// `put` on an id that is already present replaces the packet in place,
/// keeping its original replay slot. `iter` returns a snapshot in
/// insertion order.
#[async_trait]
pub trait PacketStore: Send + Sync {
    async fn put(&self, packet: Packet) -> Result<(), StoreError>;
    async fn get(&self, packet_id: u16) -> Result<Option<Packet>, StoreError>;
    async fn del(&self, packet_id: u16) -> Result<Option<Packet>, StoreError>;
    async fn iter(&self) -> Result<Vec<Packet>, StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
    async fn close(&self) -> Result<(), StoreError>;
}

fn id_of(packet: &Packet) -> Result<u16, StoreError> {
    packet
        .packet_id()
        .ok_or_else(|| StoreError("stored packet must carry a packet id".to_string()))
}

/// Volatile store: map plus insertion-order index.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    packets: AHashMap<u16, Packet>,
    order: Vec<u16>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PacketStore for MemoryStore {
    async fn put(&self, packet: Packet) -> Result<(), StoreError> {
        let id = id_of(&packet)?;
        let mut inner = self.inner.lock();
        if inner.packets.insert(id, packet).is_none() {
            inner.order.push(id);
        }
        Ok(())
    }

    async fn get(&self, packet_id: u16) -> Result<Option<Packet>, StoreError> {
        Ok(self.inner.lock().packets.get(&packet_id).cloned())
    }

    async fn del(&self, packet_id: u16) -> Result<Option<Packet>, StoreError> {
        let mut inner = self.inner.lock();
        let removed = inner.packets.remove(&packet_id);
        if removed.is_some() {
            inner.order.retain(|&id| id != packet_id);
        }
        Ok(removed)
    }

    async fn iter(&self) -> Result<Vec<Packet>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.packets.get(id).cloned())
            .collect())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.packets.clear();
        inner.order.clear();
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Durable store backed by a fjall keyspace.
///
/// Packets are persisted in their MQTT wire encoding. Keys in the packet
/// partition are `seq (u64 BE) || packet id (u16 BE)` so a plain key scan
/// yields insertion order; an index partition maps packet id to its key so
/// a replace keeps the original sequence slot.
pub struct FjallStore {
    keyspace: Keyspace,
    packets: PartitionHandle,
    index: PartitionHandle,
    version: ProtocolVersion,
    next_seq: Mutex<u64>,
}

impl FjallStore {
    /// Open (or create) a store at `path`. `version` selects the wire
    /// shape packets are persisted in and must match the session's
    /// negotiated protocol version.
    pub fn open<P: AsRef<Path>>(path: P, version: ProtocolVersion) -> Result<Self, StoreError> {
        let keyspace = Config::new(path).open()?;
        let packets = keyspace.open_partition("packets", PartitionCreateOptions::default())?;
        let index = keyspace.open_partition("packet_index", PartitionCreateOptions::default())?;

        // Resume the sequence counter past the highest persisted key
        let next_seq = match packets.last_key_value()? {
            Some((key, _)) if key.len() >= 8 => {
                let mut seq = [0u8; 8];
                seq.copy_from_slice(&key[..8]);
                u64::from_be_bytes(seq) + 1
            }
            _ => 0,
        };

        Ok(Self {
            keyspace,
            packets,
            index,
            version,
            next_seq: Mutex::new(next_seq),
        })
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Packet, StoreError> {
        let mut decoder = Decoder::new(self.version);
        decoder.feed(bytes);
        match decoder.next() {
            Ok(Some(packet)) => Ok(packet),
            Ok(None) => Err(StoreError("truncated packet in store".to_string())),
            Err(e) => Err(StoreError(format!("corrupt packet in store: {e}"))),
        }
    }

    fn key_for(&self, packet_id: u16) -> Result<Option<[u8; 10]>, StoreError> {
        match self.index.get(packet_id.to_be_bytes())? {
            Some(key) if key.len() == 10 => {
                let mut out = [0u8; 10];
                out.copy_from_slice(&key);
                Ok(Some(out))
            }
            Some(_) => Err(StoreError("corrupt index entry".to_string())),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl PacketStore for FjallStore {
    async fn put(&self, packet: Packet) -> Result<(), StoreError> {
        let id = id_of(&packet)?;
        let wire = Encoder::new(self.version)
            .encode_to_bytes(&packet)
            .map_err(|e| StoreError(format!("unencodable packet: {e}")))?;

        // Reuse the existing sequence slot on replace
        let key = match self.key_for(id)? {
            Some(key) => key,
            None => {
                let mut seq = self.next_seq.lock();
                let mut key = [0u8; 10];
                key[..8].copy_from_slice(&seq.to_be_bytes());
                key[8..].copy_from_slice(&id.to_be_bytes());
                *seq += 1;
                key
            }
        };

        self.packets.insert(key, &wire[..])?;
        self.index.insert(id.to_be_bytes(), key)?;
        self.keyspace.persist(PersistMode::Buffer)?;
        Ok(())
    }

    async fn get(&self, packet_id: u16) -> Result<Option<Packet>, StoreError> {
        let Some(key) = self.key_for(packet_id)? else {
            return Ok(None);
        };
        match self.packets.get(key)? {
            Some(bytes) => Ok(Some(self.decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn del(&self, packet_id: u16) -> Result<Option<Packet>, StoreError> {
        let Some(key) = self.key_for(packet_id)? else {
            return Ok(None);
        };
        let previous = match self.packets.get(key)? {
            Some(bytes) => Some(self.decode_value(&bytes)?),
            None => None,
        };
        self.packets.remove(key)?;
        self.index.remove(packet_id.to_be_bytes())?;
        Ok(previous)
    }

    async fn iter(&self) -> Result<Vec<Packet>, StoreError> {
        let mut result = Vec::new();
        for item in self.packets.iter() {
            let (_, value) = item?;
            result.push(self.decode_value(&value)?);
        }
        Ok(result)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        for item in self.packets.keys() {
            self.packets.remove(item?)?;
        }
        for item in self.index.keys() {
            self.index.remove(item?)?;
        }
        *self.next_seq.lock() = 0;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}
