#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use meshwire_core::{DependencyKind, LifecycleEvent, ObjectKey, ObjectState};
use meshwire_index::{spawn_indexer, MemoryIndex, Reference, ReferenceIndex, VirtualServiceReferences};
use tokio::sync::mpsc;

fn vs(name: &str, node: Option<&str>) -> ObjectState {
    let mut raw = serde_json::json!({ "metadata": { "name": name, "namespace": "mesh" }, "spec": {} });
    if let Some(n) = node {
        raw["spec"] = serde_json::json!({ "provider": { "virtualNode": { "virtualNodeRef": { "name": n } } } });
    }
    ObjectState::from_raw(raw).unwrap()
}

fn key(name: &str) -> ObjectKey { ObjectKey::new("mesh", name) }

fn node_ref(name: &str) -> Vec<Reference> {
    vec![Reference::new(DependencyKind::VirtualNode, key(name))]
}

#[tokio::test]
async fn indexer_tracks_dependent_lifecycle() {
    let index = Arc::new(MemoryIndex::new());
    let (tx, rx) = mpsc::channel(16);
    let task = spawn_indexer(Arc::clone(&index), VirtualServiceReferences, rx);

    let seq = vec![
        LifecycleEvent::Created(vs("svc1", Some("node-a"))),
        LifecycleEvent::Created(vs("svc2", Some("node-a"))),
        LifecycleEvent::Created(vs("svc3", None)),
        // svc2 moves to node-b
        LifecycleEvent::Updated { old: vs("svc2", Some("node-a")), new: vs("svc2", Some("node-b")) },
        LifecycleEvent::Resynced(Some(key("svc1"))),
        LifecycleEvent::Deleted(vs("svc1", Some("node-a"))),
        LifecycleEvent::Created(vs("svc4", Some("node-a"))),
    ];
    for ev in seq { tx.send(ev).await.unwrap(); }
    drop(tx);
    task.await.unwrap();

    let a = index.fetch(DependencyKind::VirtualNode, &key("node-a")).await.unwrap();
    let b = index.fetch(DependencyKind::VirtualNode, &key("node-b")).await.unwrap();
    assert_eq!(a, BTreeSet::from([key("svc4")]));
    assert_eq!(b, BTreeSet::from([key("svc2")]));
    assert_eq!(index.len(), 2, "svc3 declares nothing and svc1 is gone");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_and_readers_converge() {
    let index = Arc::new(MemoryIndex::new());
    let mut handles = Vec::new();
    for w in 0..8 {
        let idx = Arc::clone(&index);
        handles.push(tokio::spawn(async move {
            for i in 0..50 {
                let svc = key(&format!("svc-{w}-{i}"));
                idx.set_references(&svc, node_ref("hot"));
                if i % 2 == 1 {
                    idx.remove_referrer(&svc);
                }
            }
        }));
    }
    for _ in 0..4 {
        let idx = Arc::clone(&index);
        handles.push(tokio::spawn(async move {
            for _ in 0..200 {
                let got = idx.fetch(DependencyKind::VirtualNode, &key("hot")).await.unwrap();
                assert!(got.iter().all(|k| k.name.starts_with("svc-")));
                tokio::task::yield_now().await;
            }
        }));
    }
    for h in handles { h.await.unwrap(); }
    let got = index.referrers_of(DependencyKind::VirtualNode, &key("hot"));
    assert_eq!(got.len(), 8 * 25);
}
