#![forbid(unsafe_code)]

use meshwire_core::{LifecycleEvent, ObjectKey, ObjectState};
use meshwire_kubehub::EventTranslator;

fn obj(name: &str, rv: &str, active: &str) -> ObjectState {
    ObjectState::from_raw(serde_json::json!({
        "metadata": { "name": name, "namespace": "mesh", "resourceVersion": rv },
        "status": { "conditions": [{ "type": "VirtualNodeActive", "status": active }] }
    }))
    .unwrap()
}

fn key(name: &str) -> ObjectKey { ObjectKey::new("mesh", name) }

#[test]
fn first_sight_is_create_then_update_with_old_state() {
    let mut t = EventTranslator::new();
    let created = t.applied(obj("a", "1", "False")).unwrap();
    assert!(matches!(created, LifecycleEvent::Created(ref s) if s.key == key("a")));

    match t.applied(obj("a", "2", "True")) {
        Some(LifecycleEvent::Updated { old, new }) => {
            assert_eq!(old.resource_version(), Some("1"));
            assert_eq!(new.resource_version(), Some("2"));
        }
        other => panic!("expected update, got {:?}", other),
    }
}

#[test]
fn redelivery_at_same_version_is_dropped() {
    let mut t = EventTranslator::new();
    t.applied(obj("a", "1", "True"));
    assert_eq!(t.applied(obj("a", "1", "True")), None);
}

#[test]
fn delete_forgets_object() {
    let mut t = EventTranslator::new();
    t.applied(obj("a", "1", "True"));
    let ev = t.deleted(obj("a", "2", "True"));
    assert!(matches!(ev, LifecycleEvent::Deleted(_)));
    assert!(t.is_empty());
    assert!(matches!(t.applied(obj("a", "3", "True")), Some(LifecycleEvent::Created(_))));
}

#[test]
fn relist_diffs_against_last_view() {
    let mut t = EventTranslator::new();
    t.applied(obj("a", "1", "False"));
    t.applied(obj("b", "1", "True"));
    t.applied(obj("c", "1", "True"));

    let out = t.restarted(vec![obj("a", "5", "True"), obj("b", "1", "True"), obj("d", "1", "True")]);
    let summary: Vec<(&str, String)> = out
        .iter()
        .map(|ev| (ev.label(), ev.key().map(|k| k.name.clone()).unwrap_or_default()))
        .collect();
    assert_eq!(
        summary,
        vec![("delete", "c".to_string()), ("update", "a".to_string()), ("create", "d".to_string())]
    );
    assert_eq!(t.len(), 3);
}

#[test]
fn resync_marks_every_known_object() {
    let mut t = EventTranslator::new();
    t.applied(obj("b", "1", "True"));
    t.applied(obj("a", "1", "True"));
    assert_eq!(
        t.resync(),
        vec![LifecycleEvent::Resynced(Some(key("a"))), LifecycleEvent::Resynced(Some(key("b")))]
    );
}
