use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const SECS_PER_DAY: i64 = 86_400;

/// Persisted lifecycle state of a license key.
///
/// `Expired` is never written; it is derived from `expires_at` at read time.
/// Deleted keys are simply absent from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Pending,
    Active,
    Expired,
}

impl KeyState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseKey {
    pub id: String,
    pub duration_days: u32,
    pub created_at: i64,
    pub state: KeyState,
    pub bound_identity: Option<String>,
    pub expires_at: Option<i64>,
    pub last_heartbeat_at: Option<i64>,
}

impl LicenseKey {
    /// A freshly created key. `expires_at` is only known up front when the
    /// countdown starts at creation.
    pub fn pending(id: String, duration_days: u32, created_at: i64, expires_at: Option<i64>) -> Self {
        Self {
            id,
            duration_days,
            created_at,
            state: KeyState::Pending,
            bound_identity: None,
            expires_at,
            last_heartbeat_at: None,
        }
    }

    pub fn duration_secs(&self) -> i64 {
        i64::from(self.duration_days) * SECS_PER_DAY
    }

    /// Returns true once `now` has reached `expires_at`. Keys without a
    /// countdown never expire.
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(exp) if now >= exp)
    }

    pub fn effective_state(&self, now: i64) -> KeyState {
        if self.is_expired(now) {
            KeyState::Expired
        } else {
            self.state
        }
    }

    /// True iff the last heartbeat is younger than `timeout_secs`.
    pub fn is_online(&self, now: i64, timeout_secs: i64) -> bool {
        matches!(self.last_heartbeat_at, Some(hb) if now - hb < timeout_secs)
    }
}

/// Field updates applied by a conditional update. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPatch {
    pub state: Option<KeyState>,
    pub bound_identity: Option<String>,
    pub expires_at: Option<i64>,
    pub last_heartbeat_at: Option<i64>,
}

impl KeyPatch {
    pub fn activate(identity: &str, now: i64, expires_at: Option<i64>) -> Self {
        Self {
            state: Some(KeyState::Active),
            bound_identity: Some(identity.to_owned()),
            expires_at,
            last_heartbeat_at: Some(now),
        }
    }

    pub fn heartbeat(now: i64) -> Self {
        Self {
            last_heartbeat_at: Some(now),
            ..Self::default()
        }
    }

    /// Apply to `record`. The bound identity and expiry are set-once, and the
    /// heartbeat timestamp never moves backwards.
    pub fn apply(&self, record: &mut LicenseKey) {
        if let Some(state) = self.state {
            record.state = state;
        }
        if let Some(identity) = &self.bound_identity {
            if record.bound_identity.is_none() {
                record.bound_identity = Some(identity.clone());
            }
        }
        if let Some(exp) = self.expires_at {
            if record.expires_at.is_none() {
                record.expires_at = Some(exp);
            }
        }
        if let Some(hb) = self.last_heartbeat_at {
            let merged = record.last_heartbeat_at.map_or(hb, |cur| cur.max(hb));
            record.last_heartbeat_at = Some(merged);
        }
    }
}

/// A stored gift event. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GiftEvent {
    pub seq: u64,
    pub received_at: i64,
    pub payload: Map<String, Value>,
}
