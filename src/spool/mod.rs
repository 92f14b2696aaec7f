pub mod store;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::batch::Batch;
use crate::config::SpoolConfig;
use crate::delivery::DeliveryError;

pub use store::{FileStore, MemoryStore, SpoolStore};

/// One undelivered batch as persisted in the spool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoolEntry {
    /// Monotonic position in the queue, never reused.
    pub seq: u64,
    pub enqueued_at: DateTime<Utc>,
    /// Failed replay attempts so far.
    pub attempt_count: u32,
    pub batch: Batch,
}

/// Result of one [`Spool::flush`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Entries confirmed delivered and removed.
    pub delivered: usize,
    /// Entries still queued afterwards.
    pub remaining: usize,
    /// Error that stopped the pass early, if any.
    pub stopped_by: Option<DeliveryError>,
}

struct Inner {
    entries: VecDeque<SpoolEntry>,
    store: Box<dyn SpoolStore>,
    next_seq: u64,
    durable: bool,
}

impl Inner {
    /// After a store failure, try to bring the store back in line with the
    /// in-memory queue by rewriting it whole.
    fn resync(&mut self) {
        if self.durable || !self.store.is_persistent() {
            return;
        }

        match self.store.rewrite(&self.entries, self.next_seq) {
            Ok(()) => {
                self.durable = true;
                info!(entries = self.entries.len(), "spool store recovered, queue rewritten");
            }
            Err(e) => {
                debug!(error = %e, "spool store still unavailable");
            }
        }
    }

    /// Persist removal of everything before `cursor`. A store failure
    /// leaves the in-memory queue authoritative until the next successful
    /// [`Inner::resync`].
    fn persist_removal(&mut self, cursor: u64) {
        if !self.durable {
            return;
        }
        if let Err(e) = self.store.remove_before(cursor, &self.entries) {
            error!(error = %e, "spool store failed, continuing in memory until it recovers");
            self.durable = false;
        }
    }

    fn persist_append(&mut self, entry: &SpoolEntry) {
        if !self.durable {
            return;
        }
        if let Err(e) = self.store.append(entry) {
            error!(error = %e, "spool store failed, continuing in memory until it recovers");
            self.durable = false;
        }
    }
}

/// Clears the in-progress flag even if the flush future is dropped.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Bounded FIFO of batches that could not be delivered.
///
/// Access is serialized internally, so a shared reference is enough for
/// every operation. At most one flush runs at a time.
pub struct Spool {
    inner: Mutex<Inner>,
    capacity: usize,
    flushing: AtomicBool,
}

impl Spool {
    /// Open the spool described by `cfg` and load any backlog.
    pub fn open(cfg: &SpoolConfig) -> Result<Self> {
        let store: Box<dyn SpoolStore> = match &cfg.path {
            Some(path) => Box::new(FileStore::new(path)),
            None => Box::new(MemoryStore),
        };

        Self::with_store(store, cfg.max_entries)
    }

    /// Build a spool over `store`, loading what it already holds.
    pub fn with_store(mut store: Box<dyn SpoolStore>, capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        let (loaded, next_seq) = store.load().context("loading spool backlog")?;

        let mut inner = Inner {
            entries: loaded.into(),
            durable: store.is_persistent(),
            store,
            next_seq,
        };

        if inner.entries.len() > capacity {
            let excess = inner.entries.len() - capacity;
            inner.entries.drain(..excess);
            warn!(
                evicted = excess,
                capacity, "spool backlog exceeds capacity, dropped oldest entries"
            );
            if let Some(head) = inner.entries.front() {
                let cursor = head.seq;
                inner.persist_removal(cursor);
            }
        }

        if !inner.entries.is_empty() {
            info!(entries = inner.entries.len(), "loaded spool backlog");
        }

        Ok(Self {
            inner: Mutex::new(inner),
            capacity,
            flushing: AtomicBool::new(false),
        })
    }

    /// Like [`Spool::open`], but a spool that cannot be opened degrades to
    /// an in-memory queue instead of failing.
    pub fn open_or_memory(cfg: &SpoolConfig) -> Self {
        match Self::open(cfg) {
            Ok(spool) => spool,
            Err(e) => {
                error!(
                    path = ?cfg.path,
                    error = format!("{e:#}"),
                    "cannot open spool, queueing in memory only",
                );
                Self::in_memory(cfg.max_entries)
            }
        }
    }

    /// Spool with no backing storage.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                store: Box::new(MemoryStore),
                next_seq: 0,
                durable: false,
            }),
            capacity: capacity.max(1),
            flushing: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether entries are currently written through to durable storage.
    pub fn is_durable(&self) -> bool {
        self.inner.lock().durable
    }

    /// Copy of the queued entries, oldest first.
    pub fn snapshot(&self) -> Vec<SpoolEntry> {
        self.inner.lock().entries.iter().cloned().collect()
    }

    /// Append `batch`, evicting the oldest entry first when full.
    /// Returns the number of entries evicted.
    pub fn enqueue(&self, batch: Batch) -> usize {
        let mut inner = self.inner.lock();
        inner.resync();
        let mut evicted = 0;

        while inner.entries.len() >= self.capacity {
            let Some(old) = inner.entries.pop_front() else {
                break;
            };
            evicted += 1;
            warn!(
                seq = old.seq,
                enqueued_at = %old.enqueued_at,
                batch_time = %old.batch.timestamp,
                capacity = self.capacity,
                "spool full, evicted oldest batch (data lost)",
            );
            inner.persist_removal(old.seq + 1);
        }

        let entry = SpoolEntry {
            seq: inner.next_seq,
            enqueued_at: Utc::now(),
            attempt_count: 0,
            batch,
        };
        inner.next_seq += 1;

        inner.persist_append(&entry);
        debug!(seq = entry.seq, fields = entry.batch.len(), "batch spooled");
        inner.entries.push_back(entry);

        evicted
    }

    /// Replay queued batches oldest first through `deliver`.
    ///
    /// Each entry is removed right after its delivery is confirmed. The
    /// pass stops at the first failure, leaving that entry and everything
    /// behind it queued. Returns immediately if another flush is running.
    pub async fn flush<F, Fut>(&self, mut deliver: F) -> FlushReport
    where
        F: FnMut(Batch) -> Fut,
        Fut: Future<Output = Result<(), DeliveryError>>,
    {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("spool flush already running");
            return FlushReport {
                remaining: self.len(),
                ..Default::default()
            };
        }

        let report = {
            let _guard = FlushGuard(&self.flushing);
            self.flush_inner(&mut deliver).await
        };

        if report.delivered > 0 {
            info!(
                delivered = report.delivered,
                remaining = report.remaining,
                "replayed spooled batches",
            );
        }

        report
    }

    async fn flush_inner<F, Fut>(&self, deliver: &mut F) -> FlushReport
    where
        F: FnMut(Batch) -> Fut,
        Fut: Future<Output = Result<(), DeliveryError>>,
    {
        let mut report = FlushReport::default();
        self.inner.lock().resync();

        loop {
            let head = {
                let inner = self.inner.lock();
                inner.entries.front().map(|e| (e.seq, e.batch.clone()))
            };

            let Some((seq, batch)) = head else {
                break;
            };

            match deliver(batch).await {
                Ok(()) => {
                    let mut inner = self.inner.lock();
                    // The entry may have been evicted while the write was in flight.
                    if inner.entries.front().is_some_and(|e| e.seq == seq) {
                        inner.entries.pop_front();
                        inner.persist_removal(seq + 1);
                    }
                    report.delivered += 1;
                }
                Err(e) => {
                    let mut inner = self.inner.lock();
                    if !matches!(e, DeliveryError::Cancelled | DeliveryError::DeadlineExceeded) {
                        if let Some(head) = inner.entries.front_mut().filter(|h| h.seq == seq) {
                            head.attempt_count = head.attempt_count.saturating_add(1);
                        }
                    }
                    debug!(seq, error = %e, "spool replay stopped");
                    report.stopped_by = Some(e);
                    break;
                }
            }
        }

        report.remaining = self.len();
        report
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::metric::Metric;

    fn batch(minute: i64) -> Batch {
        Batch {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
                + chrono::Duration::minutes(minute),
            host_tag: "lab".to_string(),
            fields: BTreeMap::from([(Metric::Humidity, 40.0 + minute as f64)]),
        }
    }

    fn memory_spool(capacity: usize) -> Spool {
        Spool::with_store(Box::new(MemoryStore), capacity).unwrap()
    }

    fn refused() -> DeliveryError {
        DeliveryError::Connect("refused".to_string())
    }

    #[test]
    fn test_enqueue_evicts_exactly_oldest() {
        let spool = memory_spool(3);
        for m in 0..3 {
            assert_eq!(spool.enqueue(batch(m)), 0);
        }
        assert_eq!(spool.enqueue(batch(3)), 1);

        let minutes: Vec<i64> = spool
            .snapshot()
            .iter()
            .map(|e| (e.batch.timestamp - batch(0).timestamp).num_minutes())
            .collect();
        assert_eq!(minutes, vec![1, 2, 3]);
        assert_eq!(spool.len(), 3);
    }

    #[tokio::test]
    async fn test_flush_drains_in_order() {
        let spool = memory_spool(10);
        for m in 0..3 {
            spool.enqueue(batch(m));
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let report = spool
            .flush(|b| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push(b.timestamp);
                    Ok(())
                }
            })
            .await;

        assert_eq!(report.delivered, 3);
        assert_eq!(report.remaining, 0);
        assert!(spool.is_empty());
        let seen = seen.lock();
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_flush_stops_at_first_failure() {
        let spool = memory_spool(10);
        for m in 0..4 {
            spool.enqueue(batch(m));
        }

        let mut calls = 0;
        let report = spool
            .flush(|_| {
                calls += 1;
                let outcome = if calls == 3 { Err(refused()) } else { Ok(()) };
                async move { outcome }
            })
            .await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.remaining, 2);
        assert_eq!(report.stopped_by, Some(refused()));
        assert_eq!(calls, 3);

        let left = spool.snapshot();
        assert_eq!(left[0].batch, batch(2));
        assert_eq!(left[0].attempt_count, 1);
        assert_eq!(left[1].batch, batch(3));
        assert_eq!(left[1].attempt_count, 0);
    }

    #[tokio::test]
    async fn test_deadline_stop_does_not_count_attempt() {
        let spool = memory_spool(10);
        spool.enqueue(batch(0));

        let report = spool
            .flush(|_| async { Err(DeliveryError::DeadlineExceeded) })
            .await;

        assert_eq!(report.delivered, 0);
        assert_eq!(spool.snapshot()[0].attempt_count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_flush_is_refused() {
        let spool = Arc::new(memory_spool(10));
        spool.enqueue(batch(0));

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(Mutex::new(Some(release_rx)));

        let first = {
            let spool = Arc::clone(&spool);
            let release_rx = Arc::clone(&release_rx);
            tokio::spawn(async move {
                spool
                    .flush(move |_| {
                        let rx = release_rx.lock().take();
                        async move {
                            if let Some(rx) = rx {
                                let _ = rx.await;
                            }
                            Ok(())
                        }
                    })
                    .await
            })
        };

        while !spool.flushing.load(Ordering::Acquire) {
            tokio::task::yield_now().await;
        }

        let second = spool.flush(|_| async { Ok(()) }).await;
        assert_eq!(second.delivered, 0);
        assert_eq!(second.remaining, 1);

        release_tx.send(()).unwrap();
        let first = first.await.unwrap();
        assert_eq!(first.delivered, 1);
        assert!(spool.is_empty());
    }

    #[test]
    fn test_file_backed_spool_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SpoolConfig {
            path: Some(dir.path().join("spool.jsonl")),
            max_entries: 5,
        };

        {
            let spool = Spool::open(&cfg).unwrap();
            spool.enqueue(batch(0));
            spool.enqueue(batch(1));
        }

        let spool = Spool::open(&cfg).unwrap();
        assert_eq!(spool.len(), 2);
        assert_eq!(spool.snapshot()[0].batch, batch(0));
        assert!(spool.is_durable());

        spool.enqueue(batch(2));
        let seqs: Vec<u64> = spool.snapshot().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_reopen_with_smaller_capacity_trims_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = SpoolConfig {
            path: Some(dir.path().join("spool.jsonl")),
            max_entries: 5,
        };

        {
            let spool = Spool::open(&cfg).unwrap();
            for m in 0..5 {
                spool.enqueue(batch(m));
            }
        }

        cfg.max_entries = 2;
        let spool = Spool::open(&cfg).unwrap();
        assert_eq!(spool.len(), 2);
        assert_eq!(spool.snapshot()[0].batch, batch(3));

        drop(spool);
        let entries = FileStore::inspect(cfg.path.as_deref().unwrap()).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_store_failure_recovers_on_next_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spool.jsonl");
        let spool = Spool::with_store(Box::new(FileStore::new(&path)), 10).unwrap();
        spool.enqueue(batch(0));
        spool.enqueue(batch(1));

        // A directory squatting on the temp name makes every cursor write fail.
        let blocker = dir.path().join("spool.jsonl.ack.tmp");
        std::fs::create_dir(&blocker).unwrap();

        let report = spool.flush(|_| async { Ok(()) }).await;
        assert_eq!(report.delivered, 2);
        assert!(spool.is_empty());
        assert!(!spool.is_durable());

        std::fs::remove_dir(&blocker).unwrap();
        spool.enqueue(batch(2));
        spool.enqueue(batch(3));
        assert!(spool.is_durable());
        drop(spool);

        let reopened = Spool::with_store(Box::new(FileStore::new(&path)), 10).unwrap();
        let batches: Vec<Batch> = reopened.snapshot().into_iter().map(|e| e.batch).collect();
        assert_eq!(batches, vec![batch(2), batch(3)]);
        assert!(reopened.is_durable());
    }

    #[tokio::test]
    async fn test_store_failure_recovers_on_next_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spool.jsonl");
        let spool = Spool::with_store(Box::new(FileStore::new(&path)), 10).unwrap();
        for m in 0..3 {
            spool.enqueue(batch(m));
        }

        let blocker = dir.path().join("spool.jsonl.ack.tmp");
        std::fs::create_dir(&blocker).unwrap();

        let mut budget = 1;
        let report = spool
            .flush(|_| {
                let ok = budget > 0;
                budget -= 1;
                async move {
                    if ok {
                        Ok(())
                    } else {
                        Err(refused())
                    }
                }
            })
            .await;
        assert_eq!(report.delivered, 1);
        assert!(!spool.is_durable());

        std::fs::remove_dir(&blocker).unwrap();
        let report = spool.flush(|_| async { Err(refused()) }).await;
        assert_eq!(report.remaining, 2);
        assert!(spool.is_durable());
        drop(spool);

        let reopened = Spool::with_store(Box::new(FileStore::new(&path)), 10).unwrap();
        let batches: Vec<Batch> = reopened.snapshot().into_iter().map(|e| e.batch).collect();
        assert_eq!(batches, vec![batch(1), batch(2)]);
    }

    #[test]
    fn test_unopenable_spool_falls_back_to_memory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let cfg = SpoolConfig {
            path: Some(file.path().join("spool.jsonl")),
            max_entries: 2,
        };
        assert!(Spool::open(&cfg).is_err());

        let spool = Spool::open_or_memory(&cfg);
        assert!(!spool.is_durable());
        assert_eq!(spool.capacity(), 2);

        spool.enqueue(batch(0));
        spool.enqueue(batch(1));
        assert_eq!(spool.enqueue(batch(2)), 1);
        assert_eq!(spool.snapshot()[0].batch, batch(1));
    }

    #[test]
    fn test_memory_spool_is_never_durable() {
        let spool = memory_spool(4);
        spool.enqueue(batch(0));
        assert!(!spool.is_durable());
        assert!(!Spool::in_memory(4).is_durable());
    }
}
