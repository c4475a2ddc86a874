use std::sync::Arc;

use futures::StreamExt;
use meshwire_core::LifecycleEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::EventHandler;

/// Feed events from `rx` into `handler` with up to `concurrency` calls in flight.
/// Stops when the channel closes or `cancel` fires; in-flight lookups see the same token.
pub fn spawn_dispatch(
    handler: Arc<dyn EventHandler>,
    rx: mpsc::Receiver<LifecycleEvent>,
    concurrency: usize,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let stop = cancel.clone();
        let events = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) })
            .take_until(async move { stop.cancelled().await });
        events
            .for_each_concurrent(concurrency.max(1), |ev| {
                let handler = Arc::clone(&handler);
                let cancel = cancel.clone();
                async move {
                    let label = ev.label();
                    let key = ev.key().cloned();
                    let outcome = handler.handle(ev, &cancel).await;
                    debug!(event = label, key = ?key, outcome = ?outcome, "dispatched");
                }
            })
            .await;
        info!("dispatch loop stopped");
    })
}
