use std::sync::{Arc, Mutex};

use super::*;
use crate::store::Store;

const HOUR: i64 = 3_600;
const DAY: i64 = 86_400;
const T0: i64 = 1_700_000_000;

fn manager_with(policy: ActivationWindowPolicy) -> (tempfile::TempDir, KeyManager) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("giftkey.db")).unwrap();
    let config = LifecycleConfig {
        window_policy: policy,
        ..LifecycleConfig::default()
    };
    (dir, KeyManager::new(Arc::new(store), config))
}

fn manager() -> (tempfile::TempDir, KeyManager) {
    manager_with(ActivationWindowPolicy::StartsAtFirstVerify)
}

#[test]
fn activation_binding_and_lazy_expiry() {
    let (_dir, keys) = manager();
    let created = keys.create(Some("ABC".into()), Some(1), T0 - HOUR).unwrap();
    assert_eq!(created.state, KeyState::Pending);
    assert_eq!(created.expires_at, None);

    assert_eq!(
        keys.verify("ABC", "user1", T0).unwrap(),
        VerifyOutcome::ActivatedNow { expires_at: T0 + DAY }
    );
    assert_eq!(
        keys.verify("ABC", "user2", T0 + HOUR).unwrap(),
        VerifyOutcome::RejectedOtherIdentity
    );
    assert_eq!(
        keys.verify("ABC", "user1", T0 + 2 * HOUR).unwrap(),
        VerifyOutcome::ValidSameIdentity { expires_at: Some(T0 + DAY) }
    );
    assert_eq!(
        keys.verify("ABC", "user1", T0 + 25 * HOUR).unwrap(),
        VerifyOutcome::Expired
    );
    assert!(keys.describe("ABC", T0 + 25 * HOUR).unwrap().is_none());
    assert_eq!(
        keys.verify("ABC", "user1", T0 + 26 * HOUR).unwrap(),
        VerifyOutcome::NotFound
    );
}

#[test]
fn rejected_identity_does_not_mutate() {
    let (_dir, keys) = manager();
    keys.create(Some("ABC".into()), Some(1), T0).unwrap();
    keys.verify("ABC", "user1", T0).unwrap();
    keys.verify("ABC", "user2", T0 + 100).unwrap();

    let view = keys.describe("ABC", T0 + 100).unwrap().unwrap();
    assert_eq!(view.bound_identity.as_deref(), Some("user1"));
    assert_eq!(view.last_heartbeat_at, Some(T0));
}

#[test]
fn countdown_starting_at_creation() {
    let (_dir, keys) = manager_with(ActivationWindowPolicy::StartsAtCreation);
    let created = keys.create(Some("ABC".into()), Some(2), T0).unwrap();
    assert_eq!(created.expires_at, Some(T0 + 2 * DAY));

    assert_eq!(
        keys.verify("ABC", "user1", T0 + DAY).unwrap(),
        VerifyOutcome::ActivatedNow { expires_at: T0 + 2 * DAY }
    );
}

#[test]
fn unverified_key_can_expire_when_countdown_starts_at_creation() {
    let (_dir, keys) = manager_with(ActivationWindowPolicy::StartsAtCreation);
    keys.create(Some("ABC".into()), Some(1), T0).unwrap();
    assert_eq!(keys.verify("ABC", "user1", T0 + DAY).unwrap(), VerifyOutcome::Expired);
}

#[test]
fn create_rejects_duplicates_and_bad_input() {
    let (_dir, keys) = manager();
    keys.create(Some("ABC".into()), None, T0).unwrap();
    assert!(matches!(
        keys.create(Some("ABC".into()), None, T0),
        Err(Error::Conflict(_))
    ));
    assert!(matches!(
        keys.create(Some("   ".into()), None, T0),
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        keys.create(Some("XYZ".into()), Some(0), T0),
        Err(Error::InvalidInput(_))
    ));
}

#[test]
fn route_names_cannot_be_key_ids() {
    let (_dir, keys) = manager();
    for id in RESERVED_KEY_IDS.iter().copied().chain(["a/b"]) {
        assert!(
            matches!(keys.create(Some(id.into()), None, T0), Err(Error::InvalidInput(_))),
            "{id} should be rejected"
        );
    }
    // Only exact route names are reserved.
    keys.create(Some("Sweep".into()), None, T0).unwrap();
    keys.create(Some("verify-2".into()), None, T0).unwrap();
}

#[test]
fn create_fills_in_defaults() {
    let (_dir, keys) = manager();
    let created = keys.create(None, None, T0).unwrap();
    assert_eq!(created.id.len(), 16);
    assert_eq!(created.duration_days, DEFAULT_KEY_DURATION_DAYS);
}

#[test]
fn heartbeat_never_activates() {
    let (_dir, keys) = manager();
    keys.create(Some("ABC".into()), Some(1), T0).unwrap();
    assert_eq!(
        keys.heartbeat("ABC", "user1", T0).unwrap(),
        HeartbeatOutcome::NotActivated
    );
    assert_eq!(
        keys.describe("ABC", T0).unwrap().unwrap().state,
        KeyState::Pending
    );
    assert_eq!(
        keys.heartbeat("missing", "user1", T0).unwrap(),
        HeartbeatOutcome::NotFound
    );
}

#[test]
fn heartbeat_tracks_liveness() {
    let (_dir, keys) = manager();
    keys.create(Some("ABC".into()), Some(1), T0).unwrap();
    keys.verify("ABC", "user1", T0).unwrap();

    let timeout = LIVENESS_TIMEOUT.as_secs() as i64;
    assert!(!keys.describe("ABC", T0 + timeout).unwrap().unwrap().online);

    assert_eq!(
        keys.heartbeat("ABC", "user1", T0 + timeout).unwrap(),
        HeartbeatOutcome::Accepted
    );
    assert!(keys.describe("ABC", T0 + timeout + 10).unwrap().unwrap().online);
    assert_eq!(
        keys.heartbeat("ABC", "user2", T0 + timeout).unwrap(),
        HeartbeatOutcome::RejectedOtherIdentity
    );
}

#[test]
fn heartbeat_after_expiry_removes_key() {
    let (_dir, keys) = manager();
    keys.create(Some("ABC".into()), Some(1), T0).unwrap();
    keys.verify("ABC", "user1", T0).unwrap();
    assert_eq!(
        keys.heartbeat("ABC", "user1", T0 + DAY).unwrap(),
        HeartbeatOutcome::Expired
    );
    assert!(keys.list(T0 + DAY).unwrap().is_empty());
}

#[test]
fn sweep_is_idempotent() {
    let (_dir, keys) = manager();
    for id in ["a", "b", "c"] {
        keys.create(Some(id.into()), Some(1), T0).unwrap();
    }
    keys.verify("a", "u", T0).unwrap();
    keys.verify("b", "u", T0 + HOUR).unwrap();

    assert_eq!(keys.sweep_expired(T0 + DAY).unwrap(), 1);
    assert_eq!(keys.sweep_expired(T0 + DAY).unwrap(), 0);
    assert_eq!(keys.sweep_expired(T0 + DAY + HOUR).unwrap(), 1);

    // "c" was never verified, so its countdown never started.
    let left: Vec<_> = keys.list(T0 + 30 * DAY).unwrap().into_iter().map(|v| v.id).collect();
    assert_eq!(left, vec!["c".to_string()]);
}

#[test]
fn delete_is_unconditional() {
    let (_dir, keys) = manager();
    keys.create(Some("ABC".into()), Some(1), T0).unwrap();
    keys.verify("ABC", "user1", T0).unwrap();
    assert_eq!(keys.delete("ABC").unwrap(), DeleteOutcome::Deleted);
    assert_eq!(keys.delete("ABC").unwrap(), DeleteOutcome::NotFound);
    assert_eq!(keys.verify("ABC", "user1", T0).unwrap(), VerifyOutcome::NotFound);
}

#[test]
fn concurrent_first_verify_activates_once() {
    let (_dir, keys) = manager();
    keys.create(Some("RACE".into()), Some(1), T0).unwrap();

    let outcomes: Vec<(String, VerifyOutcome)> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let keys = keys.clone();
                s.spawn(move || {
                    let identity = format!("client-{i}");
                    let outcome = keys.verify("RACE", &identity, T0).unwrap();
                    (identity, outcome)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<_> = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, VerifyOutcome::ActivatedNow { .. }))
        .collect();
    assert_eq!(winners.len(), 1);
    let winner = &winners[0].0;

    for (identity, outcome) in &outcomes {
        if identity != winner {
            assert_eq!(*outcome, VerifyOutcome::RejectedOtherIdentity);
        }
    }
    let view = keys.describe("RACE", T0).unwrap().unwrap();
    assert_eq!(view.bound_identity.as_ref(), Some(winner));
}

#[test]
fn sweeps_racing_client_calls_stay_consistent() {
    let (_dir, keys) = manager();
    let fresh: Vec<String> = (0..4).map(|i| format!("fresh-{i}")).collect();
    let stale: Vec<String> = (0..4).map(|i| format!("stale-{i}")).collect();
    for id in &fresh {
        keys.create(Some(id.clone()), Some(2), T0).unwrap();
    }
    for id in &stale {
        keys.create(Some(id.clone()), Some(1), T0 - DAY).unwrap();
        keys.verify(id, "owner", T0 - DAY).unwrap();
    }

    std::thread::scope(|s| {
        let sweepers: Vec<_> = (0..2)
            .map(|_| {
                let keys = keys.clone();
                s.spawn(move || (0..5).map(|_| keys.sweep_expired(T0).unwrap()).sum::<usize>())
            })
            .collect();

        let mut fresh_verifies = Vec::new();
        for id in &fresh {
            for c in 0..3 {
                let keys = keys.clone();
                let id = id.clone();
                fresh_verifies.push(s.spawn(move || {
                    (id.clone(), keys.verify(&id, &format!("client-{c}"), T0).unwrap())
                }));
            }
        }

        let mut stale_calls = Vec::new();
        for id in &stale {
            let keys_v = keys.clone();
            let keys_h = keys.clone();
            let id_v = id.clone();
            let id_h = id.clone();
            stale_calls.push(s.spawn(move || keys_v.verify(&id_v, "owner", T0).unwrap().as_str()));
            stale_calls.push(s.spawn(move || keys_h.heartbeat(&id_h, "owner", T0).unwrap().as_str()));
        }

        let swept: usize = sweepers.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(swept <= stale.len());

        // Stale keys: whichever call reaches them first removes them; the
        // others must see either the expiry or the absence, never validity.
        for h in stale_calls {
            let outcome = h.join().unwrap();
            assert!(outcome == "expired" || outcome == "not_found", "{outcome}");
        }

        // Fresh keys: sweeps never touch them and exactly one client wins each.
        let outcomes: Vec<_> = fresh_verifies.into_iter().map(|h| h.join().unwrap()).collect();
        for id in &fresh {
            let per_key: Vec<_> = outcomes.iter().filter(|(k, _)| k == id).map(|(_, o)| *o).collect();
            let activated = per_key
                .iter()
                .filter(|o| matches!(o, VerifyOutcome::ActivatedNow { .. }))
                .count();
            assert_eq!(activated, 1, "{id}");
            assert!(per_key.iter().all(|o| matches!(
                o,
                VerifyOutcome::ActivatedNow { .. } | VerifyOutcome::RejectedOtherIdentity
            )));
        }
    });

    for id in &stale {
        assert!(keys.describe(id, T0).unwrap().is_none());
    }
    for id in &fresh {
        assert_eq!(keys.describe(id, T0).unwrap().unwrap().state, KeyState::Active);
    }
    assert_eq!(keys.sweep_expired(T0).unwrap(), 0);
}

/// Replaces the key with a fresh pending one right after each scan, the way
/// an admin delete + create could land between a sweep's scan and delete.
struct RecreateAfterScan {
    inner: Store,
    replacement: Mutex<Option<LicenseKey>>,
}

impl KeyStore for RecreateAfterScan {
    fn get(&self, id: &str) -> Result<Option<LicenseKey>> {
        self.inner.get(id)
    }
    fn put(&self, record: &LicenseKey) -> Result<bool> {
        self.inner.put(record)
    }
    fn conditional_update(&self, id: &str, expected: KeyState, patch: &KeyPatch) -> Result<bool> {
        self.inner.conditional_update(id, expected, patch)
    }
    fn delete(&self, id: &str) -> Result<bool> {
        self.inner.delete(id)
    }
    fn delete_if(&self, id: &str, predicate: &dyn Fn(&LicenseKey) -> bool) -> Result<bool> {
        self.inner.delete_if(id, predicate)
    }
    fn scan(&self, predicate: &dyn Fn(&LicenseKey) -> bool) -> Result<Vec<LicenseKey>> {
        let found = self.inner.scan(predicate)?;
        if let Some(record) = self.replacement.lock().unwrap().take() {
            self.inner.delete(&record.id)?;
            self.inner.put(&record)?;
        }
        Ok(found)
    }
}

#[test]
fn sweep_spares_key_recreated_after_scan() {
    let dir = tempfile::tempdir().unwrap();
    let inner = Store::open(&dir.path().join("giftkey.db")).unwrap();
    inner.put(&LicenseKey::pending("ABC".into(), 1, T0 - 2 * DAY, Some(T0 - DAY))).unwrap();

    let store = Arc::new(RecreateAfterScan {
        inner,
        replacement: Mutex::new(Some(LicenseKey::pending("ABC".into(), 3, T0, None))),
    });
    let keys = KeyManager::new(store, LifecycleConfig::default());

    assert_eq!(keys.sweep_expired(T0).unwrap(), 0);
    let view = keys.describe("ABC", T0).unwrap().unwrap();
    assert_eq!(view.state, KeyState::Pending);
    assert_eq!(view.duration_days, 3);
    assert_eq!(keys.verify("ABC", "user1", T0).unwrap(), VerifyOutcome::ActivatedNow { expires_at: T0 + 3 * DAY });
}

#[test]
fn list_is_ordered_by_creation() {
    let (_dir, keys) = manager();
    keys.create(Some("late".into()), Some(1), T0 + 10).unwrap();
    keys.create(Some("early".into()), Some(1), T0).unwrap();
    let ids: Vec<_> = keys.list(T0 + 20).unwrap().into_iter().map(|v| v.id).collect();
    assert_eq!(ids, vec!["early".to_string(), "late".to_string()]);
}

#[test]
fn policy_parses_from_config_strings() {
    assert_eq!(
        "creation".parse::<ActivationWindowPolicy>().unwrap(),
        ActivationWindowPolicy::StartsAtCreation
    );
    assert_eq!(
        "First-Verify".parse::<ActivationWindowPolicy>().unwrap(),
        ActivationWindowPolicy::StartsAtFirstVerify
    );
    assert!("tomorrow".parse::<ActivationWindowPolicy>().is_err());
}

struct UnavailableStore;

impl KeyStore for UnavailableStore {
    fn get(&self, _id: &str) -> Result<Option<LicenseKey>> {
        Err(Error::Transient("timed out".into()))
    }
    fn put(&self, _record: &LicenseKey) -> Result<bool> {
        Err(Error::Transient("timed out".into()))
    }
    fn conditional_update(&self, _: &str, _: KeyState, _: &KeyPatch) -> Result<bool> {
        Err(Error::Transient("timed out".into()))
    }
    fn delete(&self, _id: &str) -> Result<bool> {
        Err(Error::Transient("timed out".into()))
    }
    fn delete_if(&self, _: &str, _: &dyn Fn(&LicenseKey) -> bool) -> Result<bool> {
        Err(Error::Transient("timed out".into()))
    }
    fn scan(&self, _: &dyn Fn(&LicenseKey) -> bool) -> Result<Vec<LicenseKey>> {
        Err(Error::Transient("timed out".into()))
    }
}

#[test]
fn storage_failures_are_not_reported_as_not_found() {
    let keys = KeyManager::new(Arc::new(UnavailableStore), LifecycleConfig::default());
    assert!(keys.verify("ABC", "user1", T0).unwrap_err().is_transient());
    assert!(keys.heartbeat("ABC", "user1", T0).unwrap_err().is_transient());
    assert!(keys.sweep_expired(T0).unwrap_err().is_transient());
}
