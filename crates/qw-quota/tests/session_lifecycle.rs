mod common;

use chrono::{DateTime, TimeZone, Utc};
use common::FlakyStore;
use qw_quota::{
    AccountantConfig, MemoryStore, QuotaObservation, QuotaStore, SessionAccountant, Snapshot,
    SqliteStore, StoreError,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_767_225_600 + secs, 0).single().unwrap()
}

fn snap(secs: i64, quotas: &[(&str, f64)]) -> Snapshot {
    quotas.iter().fold(Snapshot::new("codex", at(secs)), |snapshot, (key, usage)| {
        snapshot.with_quota(*key, QuotaObservation::new(*usage))
    })
}

fn stores() -> Vec<(&'static str, Arc<dyn QuotaStore>)> {
    vec![
        ("memory", Arc::new(MemoryStore::new()) as Arc<dyn QuotaStore>),
        ("sqlite", Arc::new(SqliteStore::in_memory().unwrap()) as Arc<dyn QuotaStore>),
    ]
}

fn accountant(store: Arc<dyn QuotaStore>) -> SessionAccountant {
    SessionAccountant::new("codex", store, AccountantConfig::default())
}

#[test]
fn orphaned_session_is_closed_on_startup() {
    for (name, store) in stores() {
        let orphan = Uuid::new_v4();
        store
            .open_session(orphan, "codex", at(0), Duration::from_secs(600))
            .unwrap();
        store
            .open_session(Uuid::new_v4(), "anthropic", at(0), Duration::from_secs(600))
            .unwrap();

        let mut accountant = accountant(store.clone());
        assert_eq!(accountant.recover().unwrap(), 1, "{name}");

        assert!(store.active_session("codex").unwrap().is_none(), "{name}");
        let history = store.session_history("codex", 10).unwrap();
        assert_eq!(history[0].id, orphan, "{name}");
        assert!(history[0].ended_at.is_some(), "{name}");
        // Other providers' sessions are not ours to close.
        assert!(store.active_session("anthropic").unwrap().is_some(), "{name}");
    }
}

#[test]
fn first_touch_recovers_before_opening() {
    let store: Arc<dyn QuotaStore> = Arc::new(MemoryStore::new());
    let orphan = Uuid::new_v4();
    store
        .open_session(orphan, "codex", at(0), Duration::from_secs(600))
        .unwrap();

    let mut accountant = accountant(store.clone());
    let report = accountant.touch(&snap(100, &[("primary", 1.0)]));
    assert!(report.opened);
    assert_ne!(report.session_id, orphan);

    let open: Vec<_> = store
        .session_history("codex", 10)
        .unwrap()
        .into_iter()
        .filter(|s| s.is_open())
        .collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, report.session_id);
}

#[test]
fn max_usage_never_decreases() {
    for (name, store) in stores() {
        let mut accountant = accountant(store.clone());
        let sequence = [
            snap(0, &[("primary", 10.0)]),
            snap(60, &[("primary", 40.0), ("secondary", 2.0)]),
            snap(120, &[("primary", 5.0), ("secondary", 1.0)]),
            snap(180, &[("secondary", 9.0)]),
        ];
        let mut previous: BTreeMap<String, f64> = BTreeMap::new();
        let mut id = None;
        for snapshot in &sequence {
            let report = accountant.touch(snapshot);
            assert!(report.warnings.is_empty(), "{name}");
            id.get_or_insert(report.session_id);
            let current = accountant.current().unwrap().max_usage.clone();
            for (key, value) in &previous {
                assert!(current[key] >= *value, "{name}: {key} went down");
            }
            previous = current;
        }

        let stored = store.active_session("codex").unwrap().unwrap();
        assert_eq!(Some(stored.id), id, "{name}");
        assert_eq!(stored.snapshot_count, 4, "{name}");
        assert_eq!(stored.max_usage.get("primary"), Some(&40.0), "{name}");
        assert_eq!(stored.max_usage.get("secondary"), Some(&9.0), "{name}");
    }
}

#[test]
fn idle_gap_rolls_over_to_new_session() {
    for (name, store) in stores() {
        let mut accountant = accountant(store.clone());
        let first = accountant.touch(&snap(0, &[("primary", 3.0)]));
        accountant.touch(&snap(120, &[("primary", 8.0)]));
        let next = accountant.touch(&snap(2_000, &[("primary", 1.0)]));

        assert!(next.opened, "{name}");
        assert_ne!(next.session_id, first.session_id, "{name}");

        let history = store.session_history("codex", 10).unwrap();
        assert_eq!(history.len(), 2, "{name}");
        let old = history.iter().find(|s| s.id == first.session_id).unwrap();
        assert_eq!(old.ended_at, Some(at(120)), "{name}");
        assert_eq!(old.max_usage.get("primary"), Some(&8.0), "{name}");

        let new = store.active_session("codex").unwrap().unwrap();
        assert_eq!(new.started_at, at(2_000), "{name}");
        assert_eq!(new.max_usage.get("primary"), Some(&1.0), "{name}");
    }
}

#[test]
fn graceful_close_leaves_nothing_open() {
    for (name, store) in stores() {
        let mut accountant = accountant(store.clone());
        accountant.touch(&snap(0, &[("primary", 3.0)]));
        let report = accountant.close(at(30));
        assert!(report.warnings.is_empty(), "{name}");
        assert_eq!(report.session.unwrap().ended_at, Some(at(30)), "{name}");
        assert!(store.active_session("codex").unwrap().is_none(), "{name}");
    }
}

#[test]
fn store_rejects_touch_after_close() {
    for (name, store) in stores() {
        let id = Uuid::new_v4();
        store
            .open_session(id, "codex", at(0), Duration::from_secs(60))
            .unwrap();
        assert!(store.close_session(id, at(10)).unwrap(), "{name}");
        assert!(!store.close_session(id, at(20)).unwrap(), "{name}");

        let err = store.touch_session(id, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, StoreError::SessionClosed(_)), "{name}");

        let session = store.session_history("codex", 1).unwrap().remove(0);
        assert_eq!(session.ended_at, Some(at(10)), "{name}");
        assert_eq!(session.snapshot_count, 0, "{name}");
    }
}

#[test]
fn store_allows_one_open_session_per_provider() {
    for (name, store) in stores() {
        let first = Uuid::new_v4();
        store
            .open_session(first, "codex", at(0), Duration::from_secs(600))
            .unwrap();
        let err = store
            .open_session(Uuid::new_v4(), "codex", at(10), Duration::from_secs(600))
            .unwrap_err();
        assert!(matches!(err, StoreError::SessionAlreadyOpen(_)), "{name}");
        store
            .open_session(Uuid::new_v4(), "anthropic", at(10), Duration::from_secs(600))
            .unwrap();

        assert!(store.close_session(first, at(20)).unwrap(), "{name}");
        let next = Uuid::new_v4();
        store
            .open_session(next, "codex", at(30), Duration::from_secs(600))
            .unwrap();
        assert_eq!(store.active_session("codex").unwrap().unwrap().id, next, "{name}");
    }
}

#[test]
fn idle_close_lost_to_outage_is_written_before_next_open() {
    let store = Arc::new(FlakyStore::new());
    let mut accountant = accountant(store.clone());
    let first = accountant.touch(&snap(0, &[("primary", 3.0)]));

    store.set_failing(true);
    let during = accountant.touch(&snap(2_000, &[("primary", 1.0)]));
    assert!(during.opened);
    let ops: Vec<_> = during.warnings.iter().map(|w| w.op).collect();
    assert_eq!(ops, vec!["close_session"]);
    assert_eq!(accountant.unsaved_closes(), 1);
    assert_eq!(store.active_session("codex").unwrap().unwrap().id, first.session_id);

    store.set_failing(false);
    let after = accountant.touch(&snap(2_060, &[("primary", 4.0)]));
    assert!(after.warnings.is_empty());
    assert!(!after.opened);
    assert_eq!(after.session_id, during.session_id);
    assert_eq!(accountant.unsaved_closes(), 0);

    let history = store.session_history("codex", 10).unwrap();
    assert_eq!(history.len(), 2);
    let old = history.iter().find(|s| s.id == first.session_id).unwrap();
    assert_eq!(old.ended_at, Some(at(0)));
    let current = store.active_session("codex").unwrap().unwrap();
    assert_eq!(current.id, during.session_id);
    assert_eq!(current.started_at, at(2_000));
    assert_eq!(current.max_usage.get("primary"), Some(&4.0));
}
