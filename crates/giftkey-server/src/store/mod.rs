pub mod db;
pub mod gifts;
pub mod model;

use serde_json::{Map, Value};

use crate::error::Result;

pub use db::Store;
pub use model::{GiftEvent, KeyPatch, KeyState, LicenseKey};

/// Persistent mapping from key id to license key record.
///
/// Implementations must make `put`, `conditional_update` and `delete_if`
/// atomic with respect to each other for the same id.
pub trait KeyStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<LicenseKey>>;

    /// Insert if absent. Returns false when the id is already taken.
    fn put(&self, record: &LicenseKey) -> Result<bool>;

    /// Apply `patch` only if the record exists and its persisted state still
    /// equals `expected`. Returns whether the patch was applied.
    fn conditional_update(&self, id: &str, expected: KeyState, patch: &KeyPatch) -> Result<bool>;

    /// Returns true if the record existed.
    fn delete(&self, id: &str) -> Result<bool>;

    /// Delete only if the current record satisfies `predicate`.
    fn delete_if(&self, id: &str, predicate: &dyn Fn(&LicenseKey) -> bool) -> Result<bool>;

    fn scan(&self, predicate: &dyn Fn(&LicenseKey) -> bool) -> Result<Vec<LicenseKey>>;
}

/// Partitioned, append-only gift event storage with remove-on-read.
pub trait GiftStore: Send + Sync {
    /// Append and assign the next sequence number for `partition`.
    fn append(&self, partition: &str, payload: &Map<String, Value>, received_at: i64)
        -> Result<GiftEvent>;

    /// Remove and return up to `limit` events, oldest first. Either every
    /// returned event is removed or the call fails.
    fn take(&self, partition: &str, limit: Option<usize>) -> Result<Vec<GiftEvent>>;

    /// Drop every event in `partition`, returning how many were dropped.
    fn clear(&self, partition: &str) -> Result<usize>;

    fn pending(&self, partition: &str) -> Result<usize>;
}
