use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use crate::codec::{unflatten, Configuration};
use crate::sdk::AuthGuard;
use crate::{Cursor, Error};

/// Cancellation handle for one polling task.
pub(crate) struct WatchHandle {
    subtree: String,
    stop: watch::Sender<bool>,
}

impl WatchHandle {
    pub(crate) fn stop(&self) {
        debug!("Stopping watch on {}", self.subtree);
        self.stop.send_replace(true);
    }

    /// Whether the polling task has already exited.
    pub(crate) fn is_finished(&self) -> bool {
        self.stop.is_closed()
    }
}

/// Keeps the live-task counter accurate however the task ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Sent,
    Stopped,
    Closed,
}

struct WatchTask<T> {
    store: Arc<AuthGuard>,
    subtree: String,
    updates: mpsc::Sender<T>,
    errors: mpsc::Sender<Error>,
    retry_interval: Duration,
    stop: watch::Receiver<bool>,
}

/// Starts a polling task that publishes `T` decoded from `subtree` on every change.
///
/// The first successful fetch is always published. Fetch and decode failures
/// go to `errors` and polling continues after `retry_interval`. The task ends
/// when the returned handle is stopped or dropped, or when either receiver is
/// gone.
pub(crate) fn spawn<T: Configuration>(
    store: Arc<AuthGuard>,
    subtree: String,
    updates: mpsc::Sender<T>,
    errors: mpsc::Sender<Error>,
    retry_interval: Duration,
    active: Arc<AtomicUsize>,
) -> WatchHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let guard = ActiveGuard::new(active);
    let task = WatchTask {
        store,
        subtree: subtree.clone(),
        updates,
        errors,
        retry_interval,
        stop: stop_rx,
    };

    tokio::spawn(async move {
        let _guard = guard;
        task.run().await;
    });

    WatchHandle { subtree, stop: stop_tx }
}

impl<T: Configuration> WatchTask<T> {
    async fn run(mut self) {
        info!("Watching {} for changes", self.subtree);
        let mut cursor: Option<Cursor> = None;

        loop {
            if *self.stop.borrow() {
                break;
            }

            let fetched = tokio::select! {
                biased;
                _ = self.stop.changed() => break,
                res = self.store.fetch_changed(&self.subtree, cursor) => res,
            };

            let delivery = match fetched {
                Ok(change) if !change.changed => {
                    debug!("No change under {}", self.subtree);
                    continue;
                }
                Ok(change) => match unflatten::<T>(&change.pairs) {
                    Ok(config) => {
                        let delivery = deliver(&mut self.stop, &self.updates, config).await;
                        if delivery == Delivery::Sent {
                            debug!("Published update for {} at {:?}", self.subtree, change.cursor);
                            cursor = change.cursor;
                        }
                        delivery
                    }
                    Err(e) => self.report(e).await,
                },
                Err(e) => self.report(e).await,
            };

            if delivery != Delivery::Sent {
                break;
            }
        }

        info!("Stopped watching {}", self.subtree);
    }

    /// Sends `e` to the error channel, then pauses before the next attempt.
    async fn report(&mut self, e: Error) -> Delivery {
        warn!("Watch on {} failed: {}", self.subtree, e);
        let delivery = deliver(&mut self.stop, &self.errors, e).await;
        if delivery != Delivery::Sent {
            return delivery;
        }
        tokio::select! {
            biased;
            _ = self.stop.changed() => Delivery::Stopped,
            _ = tokio::time::sleep(self.retry_interval) => Delivery::Sent,
        }
    }
}

async fn deliver<V>(stop: &mut watch::Receiver<bool>, tx: &mpsc::Sender<V>, value: V) -> Delivery {
    tokio::select! {
        biased;
        _ = stop.changed() => Delivery::Stopped,
        res = tx.send(value) => match res {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Closed,
        },
    }
}
