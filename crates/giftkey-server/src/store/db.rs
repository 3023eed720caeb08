use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use super::model::{KeyPatch, KeyState, LicenseKey};
use super::KeyStore;
use crate::error::Error;

pub(crate) const LICENSE_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("license_keys");

/// Handle to the redb database holding license keys and gift events.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
}

impl Store {
    /// Open or create the database and make sure every table exists.
    ///
    /// Failure here is fatal: nothing may be served without a store.
    pub fn open(path: &Path) -> crate::error::Result<Self> {
        Self::open_inner(path).map_err(|e| Error::Fatal(format!("{e:#}")))
    }

    fn open_inner(path: &Path) -> Result<Self> {
        let db = Database::create(path)
            .with_context(|| format!("open database at {}", path.display()))?;

        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(LICENSE_KEYS)?;
            write_txn.open_table(super::gifts::GIFTS)?;
            write_txn.open_table(super::gifts::GIFT_SEQ)?;
        }
        write_txn.commit().context("create tables")?;

        debug!(path = %path.display(), "store opened");
        Ok(Self { db: Arc::new(db) })
    }

    pub fn get_key(&self, id: &str) -> Result<Option<LicenseKey>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LICENSE_KEYS)?;
        let record = match table.get(id)? {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        };
        Ok(record)
    }

    pub fn insert_key(&self, record: &LicenseKey) -> Result<bool> {
        let bytes = encode(record)?;

        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(LICENSE_KEYS)?;
            if table.get(record.id.as_str())?.is_some() {
                false
            } else {
                table.insert(record.id.as_str(), bytes.as_slice())?;
                true
            }
        };
        write_txn.commit()?;
        Ok(inserted)
    }

    /// Read, compare and write inside one write transaction. redb runs write
    /// transactions one at a time, so the comparison cannot go stale.
    pub fn update_key_if(&self, id: &str, expected: KeyState, patch: &KeyPatch) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let applied = {
            let mut table = write_txn.open_table(LICENSE_KEYS)?;
            let current = match table.get(id)? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            match current {
                Some(mut record) if record.state == expected => {
                    patch.apply(&mut record);
                    let bytes = encode(&record)?;
                    table.insert(id, bytes.as_slice())?;
                    true
                }
                _ => false,
            }
        };
        if applied {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(applied)
    }

    pub fn remove_key_if(
        &self,
        id: &str,
        predicate: &dyn Fn(&LicenseKey) -> bool,
    ) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(LICENSE_KEYS)?;
            let matches = match table.get(id)? {
                Some(guard) => predicate(&decode(guard.value())?),
                None => false,
            };
            if matches {
                table.remove(id)?;
            }
            matches
        };
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn list_keys(&self, predicate: &dyn Fn(&LicenseKey) -> bool) -> Result<Vec<LicenseKey>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LICENSE_KEYS)?;

        let mut records = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            let record = decode(v.value())?;
            if predicate(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

impl KeyStore for Store {
    fn get(&self, id: &str) -> crate::error::Result<Option<LicenseKey>> {
        self.get_key(id).map_err(Error::storage)
    }

    fn put(&self, record: &LicenseKey) -> crate::error::Result<bool> {
        self.insert_key(record).map_err(Error::storage)
    }

    fn conditional_update(
        &self,
        id: &str,
        expected: KeyState,
        patch: &KeyPatch,
    ) -> crate::error::Result<bool> {
        self.update_key_if(id, expected, patch).map_err(Error::storage)
    }

    fn delete(&self, id: &str) -> crate::error::Result<bool> {
        self.remove_key_if(id, &|_| true).map_err(Error::storage)
    }

    fn delete_if(
        &self,
        id: &str,
        predicate: &dyn Fn(&LicenseKey) -> bool,
    ) -> crate::error::Result<bool> {
        self.remove_key_if(id, predicate).map_err(Error::storage)
    }

    fn scan(
        &self,
        predicate: &dyn Fn(&LicenseKey) -> bool,
    ) -> crate::error::Result<Vec<LicenseKey>> {
        self.list_keys(predicate).map_err(Error::storage)
    }
}

fn encode(record: &LicenseKey) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode license key")
}

fn decode(bytes: &[u8]) -> Result<LicenseKey> {
    let (record, _): (LicenseKey, _) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .context("bincode decode license key")?;
    Ok(record)
}
