//! Closes flows whose cancellation context fires.
//!
//! One watcher task serves every registered flow. Registrations are picked
//! up in batches, at most one `throttle` after the first of them.
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use log::*;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use crate::config::DEFAULT_MONITOR_THROTTLE;

type Closer = Box<dyn FnOnce() + Send>;

struct Entry {
    ctx: CancellationToken,
    removed: CancellationToken,
    closer: Closer,
    watched: bool,
}

struct Inner {
    entries: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    changed: Notify,
    throttle: Duration,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct ConnectionMonitor {
    inner: Arc<Inner>,
}

/// Registration of one flow; dropping it unregisters the flow.
#[derive(Debug)]
pub struct MonitorEntry {
    id: u64,
    monitor: ConnectionMonitor,
}

impl Drop for MonitorEntry {
    fn drop(&mut self) {
        self.monitor.remove(self.id);
    }
}

impl fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("entries", &self.len())
            .field("throttle", &self.inner.throttle)
            .finish()
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_MONITOR_THROTTLE)
    }
}

impl ConnectionMonitor {
    pub fn new(throttle: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                changed: Notify::new(),
                throttle,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Calls `closer` once `ctx` is cancelled, unless the returned entry is
    /// dropped first.
    pub fn add<F>(&self, ctx: CancellationToken, closer: F) -> MonitorEntry
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = MonitorEntry {
            id,
            monitor: self.clone(),
        };
        {
            // close() cancels before draining, so a check under the lock
            // either sees the cancel or lands in the drained map.
            let mut entries = self.inner.entries.lock();
            if !self.inner.cancel.is_cancelled() {
                entries.insert(
                    id,
                    Entry {
                        ctx,
                        removed: CancellationToken::new(),
                        closer: Box::new(closer),
                        watched: false,
                    },
                );
                drop(entries);
                self.inner.changed.notify_one();
                return entry;
            }
        }
        closer();
        entry
    }

    fn remove(&self, id: u64) {
        if let Some(entry) = self.inner.entries.lock().remove(&id) {
            entry.removed.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn start(&self) {
        tokio::spawn(self.inner.clone().watch());
    }

    /// Closes every registered flow and stops watching.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.close_all();
    }
}

impl Inner {
    async fn watch(self: Arc<Self>) {
        let mut waiting: FuturesUnordered<BoxFuture<'static, (u64, bool)>> = FuturesUnordered::new();
        self.rebuild(&mut waiting);
        let mut rebuild_at: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.close_all();
                    return;
                }
                _ = self.changed.notified(), if rebuild_at.is_none() => {
                    rebuild_at = Some(Instant::now() + self.throttle);
                }
                _ = sleep_until(rebuild_at), if rebuild_at.is_some() => {
                    rebuild_at = None;
                    self.rebuild(&mut waiting);
                }
                Some((id, fired)) = waiting.next(), if !waiting.is_empty() => {
                    if fired {
                        self.close_entry(id);
                    }
                }
            }
        }
    }

    fn rebuild(&self, waiting: &mut FuturesUnordered<BoxFuture<'static, (u64, bool)>>) {
        let mut entries = self.entries.lock();
        for (id, entry) in entries.iter_mut().filter(|(_, entry)| !entry.watched) {
            entry.watched = true;
            let (id, ctx, removed) = (*id, entry.ctx.clone(), entry.removed.clone());
            waiting.push(
                async move {
                    tokio::select! {
                        _ = ctx.cancelled() => (id, true),
                        _ = removed.cancelled() => (id, false),
                    }
                }
                .boxed(),
            );
        }
        trace!("monitor: watching {} connections", entries.len());
    }

    fn close_entry(&self, id: u64) {
        let entry = self.entries.lock().remove(&id);
        if let Some(entry) = entry {
            debug!("monitor: context of connection {} cancelled", id);
            (entry.closer)();
        }
    }

    fn close_all(&self) {
        let entries: Vec<Entry> = self.entries.lock().drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            entry.removed.cancel();
            (entry.closer)();
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn flag() -> (Arc<AtomicBool>, impl FnOnce() + Send + 'static) {
        let closed = Arc::new(AtomicBool::new(false));
        let set = closed.clone();
        (closed, move || set.store(true, Ordering::SeqCst))
    }

    #[tokio::test(start_paused = true)]
    async fn closes_only_cancelled() {
        let monitor = ConnectionMonitor::new(Duration::from_secs(1));
        monitor.start();
        let mut flows = vec![];
        for _ in 0..3 {
            let ctx = CancellationToken::new();
            let (closed, closer) = flag();
            let entry = monitor.add(ctx.clone(), closer);
            flows.push((ctx, closed, entry));
        }
        assert_eq!(monitor.len(), 3);

        flows[1].0.cancel();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let closed: Vec<bool> = flows.iter().map(|(_, c, _)| c.load(Ordering::SeqCst)).collect();
        assert_eq!(closed, [false, true, false]);
        assert_eq!(monitor.len(), 2);

        monitor.close();
        assert!(flows.iter().all(|(_, c, _)| c.load(Ordering::SeqCst)));
        assert!(monitor.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_entry_not_closed() {
        let monitor = ConnectionMonitor::new(Duration::from_millis(100));
        monitor.start();
        let ctx = CancellationToken::new();
        let (closed, closer) = flag();
        let entry = monitor.add(ctx.clone(), closer);
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(entry);
        assert!(monitor.is_empty());
        ctx.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn registered_after_cancel() {
        let monitor = ConnectionMonitor::default();
        monitor.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let ctx = CancellationToken::new();
        ctx.cancel();
        let (closed, closer) = flag();
        let _entry = monitor.add(ctx, closer);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!closed.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn close_races_with_add() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Barrier;

        let monitor = ConnectionMonitor::default();
        let closed = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(5));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let monitor = monitor.clone();
                let closed = closed.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    (0..200)
                        .map(|_| {
                            let closed = closed.clone();
                            monitor.add(CancellationToken::new(), move || {
                                closed.fetch_add(1, Ordering::SeqCst);
                            })
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        barrier.wait();
        monitor.close();
        let entries: Vec<MonitorEntry> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
        assert_eq!(closed.load(Ordering::SeqCst), 800);
        assert!(monitor.is_empty());
        drop(entries);
    }

    #[test]
    fn add_after_close() {
        let monitor = ConnectionMonitor::default();
        monitor.close();
        let (closed, closer) = flag();
        let _entry = monitor.add(CancellationToken::new(), closer);
        assert!(closed.load(Ordering::SeqCst));
        assert!(monitor.is_empty());
    }
}
