//! License key lifecycle: creation, first-use activation and binding,
//! heartbeats, and time-based expiry.
//!
//! Every state transition goes through [`KeyManager`]. Read-modify-write
//! sequences are expressed as conditional updates against the
//! [`KeyStore`]; a caller that loses a race re-reads the record and resolves
//! again instead of holding a lock across store I/O.

mod view;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::{KeyPatch, KeyState, KeyStore, LicenseKey};

pub use view::{format_remaining, KeyView};

/// How long after the last heartbeat a key still counts as online.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(300);

pub const DEFAULT_KEY_DURATION_DAYS: u32 = 7;

pub const MAX_KEY_ID_LEN: usize = 128;

/// Ids shadowed by the static `/keys/...` routes; such keys could never be
/// described or deleted over HTTP.
pub const RESERVED_KEY_IDS: &[&str] = &["verify", "heartbeat", "sweep"];

/// Upper bound on re-read/retry rounds after a lost conditional update. A
/// key can leave `Pending` only once, so two rounds settle any race; the
/// rest is slack.
const MAX_UPDATE_ATTEMPTS: usize = 4;

/// When a key's countdown starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationWindowPolicy {
    StartsAtCreation,
    #[default]
    StartsAtFirstVerify,
}

impl FromStr for ActivationWindowPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "creation" | "starts-at-creation" | "starts_at_creation" => Ok(Self::StartsAtCreation),
            "first-verify" | "starts-at-first-verify" | "starts_at_first_verify" => {
                Ok(Self::StartsAtFirstVerify)
            }
            other => Err(format!(
                "unknown activation window {other:?} (expected \"creation\" or \"first-verify\")"
            )),
        }
    }
}

impl fmt::Display for ActivationWindowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StartsAtCreation => "creation",
            Self::StartsAtFirstVerify => "first-verify",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    pub liveness_timeout: Duration,
    pub default_duration_days: u32,
    pub window_policy: ActivationWindowPolicy,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: LIVENESS_TIMEOUT,
            default_duration_days: DEFAULT_KEY_DURATION_DAYS,
            window_policy: ActivationWindowPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    NotFound,
    /// The key was past its expiry and has been removed.
    Expired,
    ActivatedNow { expires_at: i64 },
    ValidSameIdentity { expires_at: Option<i64> },
    RejectedOtherIdentity,
}

impl VerifyOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::ActivatedNow { .. } | Self::ValidSameIdentity { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::ActivatedNow { .. } => "activated",
            Self::ValidSameIdentity { .. } => "valid",
            Self::RejectedOtherIdentity => "rejected_other_identity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    NotFound,
    Expired,
    /// The key exists but was never verified. Heartbeats never activate.
    NotActivated,
    RejectedOtherIdentity,
    Accepted,
}

impl HeartbeatOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::NotActivated => "not_activated",
            Self::RejectedOtherIdentity => "rejected_other_identity",
            Self::Accepted => "accepted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Sole writer of license key records.
#[derive(Clone)]
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    config: LifecycleConfig,
}

impl KeyManager {
    pub fn new(store: Arc<dyn KeyStore>, config: LifecycleConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Create a pending key. A random id is generated when none is given and
    /// the configured default duration is used when none is given.
    pub fn create(
        &self,
        id: Option<String>,
        duration_days: Option<u32>,
        now: i64,
    ) -> Result<LicenseKey> {
        let id = match id {
            Some(id) => validate_key_id(id)?,
            None => generate_key_id(),
        };
        let duration_days = duration_days.unwrap_or(self.config.default_duration_days);
        if duration_days == 0 {
            return Err(Error::InvalidInput("duration_days must be at least 1".into()));
        }

        let mut record = LicenseKey::pending(id, duration_days, now, None);
        if self.config.window_policy == ActivationWindowPolicy::StartsAtCreation {
            record.expires_at = Some(now + record.duration_secs());
        }

        if !self.store.put(&record)? {
            return Err(Error::Conflict(format!("key {} already exists", record.id)));
        }
        debug!(key = %record.id, duration_days, "key created");
        Ok(record)
    }

    pub fn verify(&self, id: &str, identity: &str, now: i64) -> Result<VerifyOutcome> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let Some(record) = self.store.get(id)? else {
                return Ok(VerifyOutcome::NotFound);
            };
            if record.is_expired(now) {
                self.expire(id, now)?;
                return Ok(VerifyOutcome::Expired);
            }

            match record.state {
                KeyState::Pending => {
                    let expires_at = record
                        .expires_at
                        .unwrap_or(now + record.duration_secs());
                    let patch = KeyPatch::activate(identity, now, Some(expires_at));
                    if self
                        .store
                        .conditional_update(id, KeyState::Pending, &patch)?
                    {
                        debug!(key = %id, identity, expires_at, "key activated");
                        return Ok(VerifyOutcome::ActivatedNow { expires_at });
                    }
                }
                _ => {
                    if record.bound_identity.as_deref() != Some(identity) {
                        return Ok(VerifyOutcome::RejectedOtherIdentity);
                    }
                    if self.store.conditional_update(
                        id,
                        KeyState::Active,
                        &KeyPatch::heartbeat(now),
                    )? {
                        return Ok(VerifyOutcome::ValidSameIdentity {
                            expires_at: record.expires_at,
                        });
                    }
                }
            }
            debug!(key = %id, "lost conditional update, re-reading");
        }
        Err(Error::Transient(format!("key {id} is under heavy contention")))
    }

    pub fn heartbeat(&self, id: &str, identity: &str, now: i64) -> Result<HeartbeatOutcome> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let Some(record) = self.store.get(id)? else {
                return Ok(HeartbeatOutcome::NotFound);
            };
            if record.is_expired(now) {
                self.expire(id, now)?;
                return Ok(HeartbeatOutcome::Expired);
            }
            if record.state == KeyState::Pending {
                return Ok(HeartbeatOutcome::NotActivated);
            }
            if record.bound_identity.as_deref() != Some(identity) {
                return Ok(HeartbeatOutcome::RejectedOtherIdentity);
            }
            if self
                .store
                .conditional_update(id, KeyState::Active, &KeyPatch::heartbeat(now))?
            {
                return Ok(HeartbeatOutcome::Accepted);
            }
        }
        Err(Error::Transient(format!("key {id} is under heavy contention")))
    }

    pub fn delete(&self, id: &str) -> Result<DeleteOutcome> {
        if self.store.delete(id)? {
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::NotFound)
        }
    }

    /// Delete every key whose expiry is at or before `now`. Returns how many
    /// records this call removed; a second call at the same instant returns 0.
    pub fn sweep_expired(&self, now: i64) -> Result<usize> {
        let expired = self.store.scan(&|r| r.is_expired(now))?;
        let mut removed = 0;
        for record in expired {
            if self.expire(&record.id, now)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn describe(&self, id: &str, now: i64) -> Result<Option<KeyView>> {
        let timeout = self.liveness_timeout_secs();
        Ok(self
            .store
            .get(id)?
            .map(|record| KeyView::project(&record, now, timeout)))
    }

    /// All keys, oldest first.
    pub fn list(&self, now: i64) -> Result<Vec<KeyView>> {
        let timeout = self.liveness_timeout_secs();
        let mut records = self.store.scan(&|_| true)?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records
            .iter()
            .map(|record| KeyView::project(record, now, timeout))
            .collect())
    }

    fn liveness_timeout_secs(&self) -> i64 {
        self.config.liveness_timeout.as_secs() as i64
    }

    /// Remove `id` only if the stored record is still expired, so a key that
    /// was deleted and re-created in the meantime survives.
    fn expire(&self, id: &str, now: i64) -> Result<bool> {
        let removed = self.store.delete_if(id, &|r| r.is_expired(now))?;
        if removed {
            debug!(key = %id, "expired key removed");
        }
        Ok(removed)
    }
}

fn validate_key_id(id: String) -> Result<String> {
    let id = id.trim().to_owned();
    if id.is_empty() || id.len() > MAX_KEY_ID_LEN {
        return Err(Error::InvalidInput(format!(
            "key id must be 1–{MAX_KEY_ID_LEN} characters"
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(Error::InvalidInput("key id must not contain control characters".into()));
    }
    if id.contains('/') || RESERVED_KEY_IDS.contains(&id.as_str()) {
        return Err(Error::InvalidInput(format!("key id {id:?} is reserved")));
    }
    Ok(id)
}

/// Generate a key id: 16 random uppercase hex chars.
pub fn generate_key_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 8] = rng.gen();
    hex::encode_upper(bytes)
}

#[cfg(test)]
mod tests;
