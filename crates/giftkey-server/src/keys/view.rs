use serde::Serialize;

use crate::store::{KeyState, LicenseKey};

/// Read-only projection of a key for admin listings. `online` and the
/// remaining time are computed against the caller's `now`, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyView {
    pub id: String,
    pub state: KeyState,
    pub duration_days: u32,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub last_heartbeat_at: Option<i64>,
    pub bound_identity: Option<String>,
    /// Seconds until expiry, clamped at zero. `None` while the countdown has
    /// not started.
    pub remaining_seconds: Option<i64>,
    pub remaining: String,
    pub online: bool,
}

impl KeyView {
    pub fn project(record: &LicenseKey, now: i64, liveness_timeout_secs: i64) -> Self {
        let remaining_seconds = record.expires_at.map(|exp| (exp - now).max(0));
        Self {
            id: record.id.clone(),
            state: record.effective_state(now),
            duration_days: record.duration_days,
            created_at: record.created_at,
            expires_at: record.expires_at,
            last_heartbeat_at: record.last_heartbeat_at,
            bound_identity: record.bound_identity.clone(),
            remaining_seconds,
            remaining: format_remaining(remaining_seconds),
            online: record.is_online(now, liveness_timeout_secs),
        }
    }
}

/// Human-readable remaining time, e.g. `"2d 3h 15m"`.
pub fn format_remaining(secs: Option<i64>) -> String {
    let Some(secs) = secs else {
        return "not started".to_owned();
    };
    if secs <= 0 {
        return "expired".to_owned();
    }
    if secs < 60 {
        return "<1m".to_owned();
    }

    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}
