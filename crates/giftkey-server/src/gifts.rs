//! Ingest-and-drain relay for gift events.
//!
//! A producer (the webhook caller) ingests payloads; a polling consumer
//! drains them. Drained events are removed in the same store transaction
//! that selected them, so each event is delivered at most once.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::store::{GiftEvent, GiftStore};

pub const MAX_PARTITION_LEN: usize = 128;

/// The event stream a gift belongs to. `Global` is the single-tenant stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Partition {
    Global,
    Client(String),
}

impl Partition {
    /// Validate an explicitly supplied partition name.
    pub fn client(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_PARTITION_LEN {
            return Err(Error::InvalidInput(format!(
                "partition must be 1–{MAX_PARTITION_LEN} characters"
            )));
        }
        Ok(Self::Client(name))
    }

    /// Storage name; the global stream uses the reserved empty name.
    fn storage_key(&self) -> &str {
        match self {
            Self::Global => "",
            Self::Client(name) => name,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Client(name) => f.write_str(name),
        }
    }
}

#[derive(Clone)]
pub struct GiftRelay {
    store: Arc<dyn GiftStore>,
}

impl GiftRelay {
    pub fn new(store: Arc<dyn GiftStore>) -> Self {
        Self { store }
    }

    /// Durably append `payload`. Returns the assigned sequence number.
    pub fn ingest(&self, partition: &Partition, payload: Map<String, Value>, now: i64) -> Result<u64> {
        if payload.is_empty() {
            return Err(Error::InvalidInput("gift payload must not be empty".into()));
        }
        let event = self.store.append(partition.storage_key(), &payload, now)?;
        let payload = Value::Object(payload);
        info!(%partition, seq = event.seq, %payload, "gift received");
        Ok(event.seq)
    }

    /// Remove and return up to `limit` events, oldest first. An empty
    /// partition yields an empty vector.
    pub fn drain(&self, partition: &Partition, limit: Option<usize>) -> Result<Vec<GiftEvent>> {
        let events = self.store.take(partition.storage_key(), limit)?;
        if !events.is_empty() {
            debug!(%partition, count = events.len(), "gifts drained");
        }
        Ok(events)
    }

    /// Drop every pending event without returning them.
    pub fn clear(&self, partition: &Partition) -> Result<usize> {
        let cleared = self.store.clear(partition.storage_key())?;
        info!(%partition, cleared, "gifts cleared");
        Ok(cleared)
    }

    pub fn pending(&self, partition: &Partition) -> Result<usize> {
        self.store.pending(partition.storage_key())
    }
}
