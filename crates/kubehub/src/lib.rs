//! meshwire kubehub: list+watch wiring that emits typed lifecycle events.
//!
//! The kube watcher only reports "applied" and "deleted"; [`EventTranslator`] keeps the
//! last state seen per object so updates carry both the old and the new snapshot.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::{Stream, StreamExt};
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use meshwire_core::{LifecycleEvent, ObjectKey, ObjectState};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const VIRTUAL_NODE_GVK: &str = "appmesh.k8s.aws/v1beta2/VirtualNode";
pub const VIRTUAL_SERVICE_GVK: &str = "appmesh.k8s.aws/v1beta2/VirtualService";

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

async fn dynamic_api(gvk_key: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
    let client = Client::try_default().await?;
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    Ok(match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    })
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

pub fn state_from(obj: &DynamicObject) -> Result<ObjectState> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    ObjectState::from_raw(raw).ok_or_else(|| anyhow!("object missing metadata.name"))
}

/// Turns applied/deleted/relist notifications into created/updated/deleted/resynced events.
#[derive(Debug, Default)]
pub struct EventTranslator {
    seen: FxHashMap<ObjectKey, ObjectState>,
}

impl EventTranslator {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.seen.len() }

    pub fn is_empty(&self) -> bool { self.seen.is_empty() }

    /// `None` when the object is redelivered at an unchanged resourceVersion.
    pub fn applied(&mut self, state: ObjectState) -> Option<LifecycleEvent> {
        match self.seen.insert(state.key.clone(), state.clone()) {
            None => Some(LifecycleEvent::Created(state)),
            Some(old) => {
                let unchanged = matches!(
                    (old.resource_version(), state.resource_version()),
                    (Some(a), Some(b)) if a == b
                );
                if unchanged {
                    None
                } else {
                    Some(LifecycleEvent::Updated { old, new: state })
                }
            }
        }
    }

    pub fn deleted(&mut self, state: ObjectState) -> LifecycleEvent {
        self.seen.remove(&state.key);
        LifecycleEvent::Deleted(state)
    }

    /// A relist replaces the whole view: objects missing from it were deleted while the
    /// watch was down.
    pub fn restarted(&mut self, list: Vec<ObjectState>) -> Vec<LifecycleEvent> {
        let present: FxHashSet<ObjectKey> = list.iter().map(|s| s.key.clone()).collect();
        let mut gone: Vec<ObjectKey> = self.seen.keys().filter(|k| !present.contains(*k)).cloned().collect();
        gone.sort();
        let mut out = Vec::with_capacity(list.len() + gone.len());
        for key in gone {
            if let Some(last) = self.seen.remove(&key) {
                out.push(LifecycleEvent::Deleted(last));
            }
        }
        out.extend(list.into_iter().filter_map(|s| self.applied(s)));
        out
    }

    /// One non-differential marker per known object.
    pub fn resync(&self) -> Vec<LifecycleEvent> {
        let mut keys: Vec<&ObjectKey> = self.seen.keys().collect();
        keys.sort();
        keys.into_iter().map(|k| LifecycleEvent::Resynced(Some(k.clone()))).collect()
    }

    pub fn translate(&mut self, ev: Event<DynamicObject>) -> Result<Vec<LifecycleEvent>> {
        Ok(match ev {
            Event::Applied(o) => self.applied(state_from(&o)?).into_iter().collect(),
            Event::Deleted(o) => vec![self.deleted(state_from(&o)?)],
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                let states = list.iter().map(state_from).collect::<Result<Vec<_>>>()?;
                self.restarted(states)
            }
        })
    }
}

/// One-shot list of a GVK, for commands that need the current state only.
pub async fn list_states(gvk_key: &str, namespace: Option<&str>) -> Result<Vec<ObjectState>> {
    let api = dynamic_api(gvk_key, namespace).await?;
    let list = api.list(&ListParams::default()).await.with_context(|| format!("listing {}", gvk_key))?;
    list.items.iter().map(state_from).collect()
}

/// List+watch a GVK and send lifecycle events into `tx` until `cancel` fires or the
/// receiver goes away. Watch errors are retried with kube's default backoff.
/// `resync_every` emits periodic resync markers.
pub async fn start_watcher(
    gvk_key: &str,
    namespace: Option<&str>,
    resync_every: Option<Duration>,
    tx: mpsc::Sender<LifecycleEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let api = dynamic_api(gvk_key, namespace).await?;
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    info!(gvk = %gvk_key, ns = ?namespace, resync = ?resync_every, "watcher started");
    pump_events(stream, gvk_key, resync_every, tx, cancel).await;
    Ok(())
}

/// Translate a watch stream into lifecycle events. A failed item is logged and skipped;
/// only cancellation, a dropped receiver or the end of the stream stop the pump.
pub async fn pump_events<S, E>(
    stream: S,
    gvk_key: &str,
    resync_every: Option<Duration>,
    tx: mpsc::Sender<LifecycleEvent>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<Event<DynamicObject>, E>>,
    E: std::fmt::Display,
{
    futures::pin_mut!(stream);
    let mut translator = EventTranslator::new();
    let mut resync = resync_every.map(|d| {
        let mut t = tokio::time::interval_at(tokio::time::Instant::now() + d, d);
        t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        t
    });
    let gvk_label = gvk_key.to_string();
    loop {
        let events = tokio::select! {
            _ = cancel.cancelled() => {
                info!(gvk = %gvk_key, "watcher cancelled");
                return;
            }
            _ = async {
                match resync.as_mut() {
                    Some(t) => { t.tick().await; }
                    None => futures::future::pending::<()>().await,
                }
            } => translator.resync(),
            next = stream.next() => match next {
                Some(Ok(ev)) => match translator.translate(ev) {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(gvk = %gvk_key, error = ?e, "skipping untranslatable watch event");
                        continue;
                    }
                },
                Some(Err(e)) => {
                    metrics::counter!("watch_errors_total", 1u64, "gvk" => gvk_label.clone());
                    warn!(gvk = %gvk_key, error = %e, "watch error; retrying");
                    continue;
                }
                None => break,
            },
        };
        metrics::counter!("watch_events_total", events.len() as u64, "gvk" => gvk_label.clone());
        for ev in events {
            if tx.send(ev).await.is_err() {
                debug!(gvk = %gvk_key, "event receiver dropped; stopping watcher");
                return;
            }
        }
    }
    warn!(gvk = %gvk_key, "watcher stream ended");
}
