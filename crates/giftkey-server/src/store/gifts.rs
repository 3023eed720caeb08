use anyhow::{Context, Result};
use redb::{ReadableTable, TableDefinition};
use serde_json::{Map, Value};

use super::model::GiftEvent;
use super::GiftStore;
use crate::error::Error;

/// (partition, seq) → JSON-encoded [`GiftEvent`].
pub(crate) const GIFTS: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("gifts");

/// partition → last sequence number handed out. Never reset, so sequence
/// numbers are not reused after a drain.
pub(crate) const GIFT_SEQ: TableDefinition<&str, u64> = TableDefinition::new("gift_seq");

impl super::db::Store {
    pub fn append_gift(
        &self,
        partition: &str,
        payload: &Map<String, Value>,
        received_at: i64,
    ) -> Result<GiftEvent> {
        let write_txn = self.db.begin_write()?;
        let event = {
            let mut seqs = write_txn.open_table(GIFT_SEQ)?;
            let last = seqs.get(partition)?.map(|g| g.value()).unwrap_or(0);
            let seq = last.checked_add(1).context("gift sequence overflow")?;
            seqs.insert(partition, seq)?;

            let event = GiftEvent {
                seq,
                received_at,
                payload: payload.clone(),
            };
            let bytes = serde_json::to_vec(&event).context("encode gift event")?;
            let mut gifts = write_txn.open_table(GIFTS)?;
            gifts.insert((partition, seq), bytes.as_slice())?;
            event
        };
        write_txn.commit()?;
        Ok(event)
    }

    /// Select and remove in one write transaction. Nothing is returned unless
    /// the commit succeeds.
    pub fn take_gifts(&self, partition: &str, limit: Option<usize>) -> Result<Vec<GiftEvent>> {
        let limit = limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let write_txn = self.db.begin_write()?;
        let events = {
            let mut gifts = write_txn.open_table(GIFTS)?;

            let mut events = Vec::new();
            for item in gifts.range((partition, 0u64)..=(partition, u64::MAX))? {
                let (_k, v) = item?;
                let event: GiftEvent =
                    serde_json::from_slice(v.value()).context("decode gift event")?;
                events.push(event);
                if events.len() >= limit {
                    break;
                }
            }

            for event in &events {
                gifts.remove((partition, event.seq))?;
            }
            events
        };
        write_txn.commit().context("commit gift drain")?;
        Ok(events)
    }

    pub fn clear_gifts(&self, partition: &str) -> Result<usize> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut gifts = write_txn.open_table(GIFTS)?;

            let mut seqs = Vec::new();
            for item in gifts.range((partition, 0u64)..=(partition, u64::MAX))? {
                let (k, _v) = item?;
                seqs.push(k.value().1);
            }
            for seq in &seqs {
                gifts.remove((partition, *seq))?;
            }
            seqs.len()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn count_gifts(&self, partition: &str) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let gifts = read_txn.open_table(GIFTS)?;
        let mut count = 0;
        for item in gifts.range((partition, 0u64)..=(partition, u64::MAX))? {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

impl GiftStore for super::db::Store {
    fn append(
        &self,
        partition: &str,
        payload: &Map<String, Value>,
        received_at: i64,
    ) -> crate::error::Result<GiftEvent> {
        self.append_gift(partition, payload, received_at)
            .map_err(Error::storage)
    }

    fn take(&self, partition: &str, limit: Option<usize>) -> crate::error::Result<Vec<GiftEvent>> {
        self.take_gifts(partition, limit).map_err(Error::storage)
    }

    fn clear(&self, partition: &str) -> crate::error::Result<usize> {
        self.clear_gifts(partition).map_err(Error::storage)
    }

    fn pending(&self, partition: &str) -> crate::error::Result<usize> {
        self.count_gifts(partition).map_err(Error::storage)
    }
}
