//! Parallel document prefetch.
//!
//! Retrieval is the read-parallel half of the loop: all documents a
//! target needs are fetched by a small bounded worker pool while the
//! commit path stays single-threaded. Every request gets its own
//! timeout, counted from the moment a worker starts it. A document that
//! misses it is reported as a timeout, and jobs the caller stopped
//! waiting for are dropped by whichever worker picks them up later.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tracing::{debug, warn};

use crate::collab::{DocumentId, DocumentStore, ParsedDocument};
use crate::config::ControlConfig;
use crate::error::{CollaboratorError, PkbError, PkbResult};

/// Result of fetching one document.
pub type FetchResult = Result<Arc<ParsedDocument>, CollaboratorError>;

enum Reply {
    Started(DocumentId, Instant),
    Done(DocumentId, FetchResult),
}

struct Job {
    id: DocumentId,
    /// Set once the caller stopped listening for this batch.
    abandoned: Arc<AtomicBool>,
    reply: Sender<Reply>,
}

/// Marks a batch abandoned when the caller returns, however it returns.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Bounded worker pool fetching documents from a [`DocumentStore`].
pub struct DocumentFetcher {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    timeout: Duration,
}

impl DocumentFetcher {
    /// Starts `workers` fetch threads over a queue of `queue_capacity` jobs.
    ///
    /// # Errors
    /// `PkbError::Internal` if a worker thread cannot be spawned.
    pub fn start(
        store: Arc<dyn DocumentStore>,
        workers: usize,
        queue_capacity: usize,
        timeout: Duration,
    ) -> PkbResult<Self> {
        let workers = workers.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity.max(1));

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let store = Arc::clone(&store);
            let handle = thread::Builder::new()
                .name(format!("pkbp-fetch-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if job.abandoned.load(Ordering::Acquire) {
                            debug!(document = %job.id, "skipping abandoned fetch");
                            continue;
                        }
                        let _ = job.reply.send(Reply::Started(job.id.clone(), Instant::now()));
                        let result = store.get(&job.id);
                        let _ = job.reply.send(Reply::Done(job.id, result));
                    }
                })
                .map_err(|e| PkbError::internal(format!("failed to spawn fetch worker: {e}")))?;
            handles.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            workers: handles,
            timeout,
        })
    }

    /// Starts a pool sized by the control configuration.
    ///
    /// # Errors
    /// See [`DocumentFetcher::start`].
    pub fn from_config(store: Arc<dyn DocumentStore>, config: &ControlConfig) -> PkbResult<Self> {
        Self::start(
            store,
            config.fetch_workers,
            config.fetch_queue_capacity,
            Duration::from_millis(config.fetch_timeout_ms),
        )
    }

    /// Per-request deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    fn timeout_error(&self) -> CollaboratorError {
        CollaboratorError::Timeout {
            duration_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn disconnected() -> CollaboratorError {
        CollaboratorError::Disconnected {
            what: "document fetcher".to_string(),
        }
    }

    /// Fetches every document of `ids`. Each id maps to its document or
    /// to the failure that prevented fetching it.
    ///
    /// A request times out once a worker has spent the configured timeout
    /// on it. Requests still queued time out when no worker made progress
    /// for that long. Whatever is outstanding on return is abandoned.
    pub fn fetch_all(&self, ids: &BTreeSet<DocumentId>) -> BTreeMap<DocumentId, FetchResult> {
        let mut out = BTreeMap::new();
        let Some(tx) = self.tx.as_ref() else {
            for id in ids {
                out.insert(id.clone(), Err(Self::disconnected()));
            }
            return out;
        };

        let abandoned = Arc::new(AtomicBool::new(false));
        let _guard = AbandonOnDrop(Arc::clone(&abandoned));
        let (reply_tx, reply_rx) = unbounded();
        let mut queued: BTreeSet<DocumentId> = BTreeSet::new();
        for id in ids {
            let job = Job {
                id: id.clone(),
                abandoned: Arc::clone(&abandoned),
                reply: reply_tx.clone(),
            };
            match tx.send_timeout(job, self.timeout) {
                Ok(()) => {
                    queued.insert(id.clone());
                }
                Err(SendTimeoutError::Timeout(_)) => {
                    out.insert(id.clone(), Err(self.timeout_error()));
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    out.insert(id.clone(), Err(Self::disconnected()));
                }
            }
        }
        drop(reply_tx);

        // Deadline per running request.
        let mut running: BTreeMap<DocumentId, Instant> = BTreeMap::new();
        let mut idle_deadline = Instant::now() + self.timeout;
        while !(queued.is_empty() && running.is_empty()) {
            let mut next = running.values().min().copied();
            if !queued.is_empty() {
                next = Some(next.map_or(idle_deadline, |d| d.min(idle_deadline)));
            }
            let Some(next) = next else { break };

            match reply_rx.recv_deadline(next) {
                Ok(Reply::Started(id, at)) => {
                    if queued.remove(&id) {
                        running.insert(id, at + self.timeout);
                    }
                    idle_deadline = Instant::now() + self.timeout;
                }
                Ok(Reply::Done(id, result)) => {
                    if running.remove(&id).is_some() || queued.remove(&id) {
                        out.insert(id, result);
                    }
                    idle_deadline = Instant::now() + self.timeout;
                }
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    running.retain(|id, deadline| {
                        if *deadline > now {
                            return true;
                        }
                        out.insert(id.clone(), Err(self.timeout_error()));
                        false
                    });
                    if now >= idle_deadline {
                        for id in std::mem::take(&mut queued) {
                            out.insert(id, Err(self.timeout_error()));
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for id in queued.into_iter().chain(running.into_keys()) {
            out.insert(id, Err(Self::disconnected()));
        }
        out
    }

    /// Fetches a single document.
    ///
    /// # Errors
    /// The collaborator failure, or a timeout.
    pub fn fetch(&self, id: &DocumentId) -> FetchResult {
        let ids: BTreeSet<DocumentId> = [id.clone()].into_iter().collect();
        self.fetch_all(&ids)
            .remove(id)
            .unwrap_or_else(|| Err(self.timeout_error()))
    }
}

impl Drop for DocumentFetcher {
    fn drop(&mut self) {
        // Closing the queue lets workers drain and exit. A worker stuck in
        // the store gets one request timeout to finish, then is detached.
        self.tx = None;
        let deadline = Instant::now() + self.timeout;
        for handle in self.workers.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(2));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(
                    worker = handle.thread().name().unwrap_or("unnamed"),
                    "fetch worker still busy at shutdown, detaching"
                );
            }
        }
    }
}

impl std::fmt::Debug for DocumentFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentFetcher")
            .field("workers", &self.workers.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::collab::InMemoryDocumentStore;

    struct SlowStore {
        delay: Duration,
    }

    impl DocumentStore for SlowStore {
        fn get(&self, id: &DocumentId) -> FetchResult {
            thread::sleep(self.delay);
            Ok(Arc::new(ParsedDocument::new(id.clone(), Vec::new())))
        }
    }

    fn store() -> Arc<InMemoryDocumentStore> {
        let store = InMemoryDocumentStore::new();
        for id in ["D1", "D2", "D3"] {
            store
                .insert(ParsedDocument::from_tagged(id, &["Jane/NNP/PERSON spoke/VBD/O"]).unwrap())
                .unwrap();
        }
        Arc::new(store)
    }

    #[test]
    fn test_fetch_all_reports_per_document() {
        let fetcher = DocumentFetcher::start(store(), 2, 1, Duration::from_secs(5)).unwrap();
        let ids: BTreeSet<DocumentId> = ["D1", "D2", "D3", "missing"].into_iter().map(DocumentId::from).collect();
        let out = fetcher.fetch_all(&ids);
        assert_eq!(out.len(), 4);
        assert!(out[&DocumentId::from("D1")].is_ok());
        assert!(out[&DocumentId::from("D3")].is_ok());
        assert!(matches!(
            out[&DocumentId::from("missing")],
            Err(CollaboratorError::DocumentNotFound { .. })
        ));
    }

    #[test]
    fn test_fetch_timeout() {
        let slow = Arc::new(SlowStore {
            delay: Duration::from_millis(300),
        });
        let fetcher = DocumentFetcher::start(slow, 1, 4, Duration::from_millis(20)).unwrap();
        let err = fetcher.fetch(&DocumentId::from("D1")).unwrap_err();
        assert_eq!(err, CollaboratorError::Timeout { duration_ms: 20 });
    }

    struct CountingStore {
        delay: Duration,
        calls: AtomicUsize,
    }

    impl DocumentStore for CountingStore {
        fn get(&self, id: &DocumentId) -> FetchResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            Ok(Arc::new(ParsedDocument::new(id.clone(), Vec::new())))
        }
    }

    #[test]
    fn test_timed_out_jobs_are_not_run() {
        let slow = Arc::new(CountingStore {
            delay: Duration::from_millis(100),
            calls: AtomicUsize::new(0),
        });
        let fetcher = DocumentFetcher::start(slow.clone(), 1, 8, Duration::from_millis(30)).unwrap();
        let ids: BTreeSet<DocumentId> = ["D1", "D2", "D3", "D4"].into_iter().map(DocumentId::from).collect();
        let out = fetcher.fetch_all(&ids);
        assert_eq!(out.len(), 4);
        for result in out.values() {
            assert_eq!(result, &Err(CollaboratorError::Timeout { duration_ms: 30 }));
        }

        // The first job was already running; the three queued behind it
        // were abandoned and are skipped.
        thread::sleep(Duration::from_millis(300));
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_each_request_gets_full_timeout() {
        // One worker, 60ms per document, 100ms per request: the batch takes
        // longer than one timeout yet no single request does.
        let slow = Arc::new(CountingStore {
            delay: Duration::from_millis(60),
            calls: AtomicUsize::new(0),
        });
        let fetcher = DocumentFetcher::start(slow, 1, 1, Duration::from_millis(100)).unwrap();
        let ids: BTreeSet<DocumentId> = ["D1", "D2", "D3"].into_iter().map(DocumentId::from).collect();
        let out = fetcher.fetch_all(&ids);
        assert_eq!(out.len(), 3);
        for result in out.values() {
            assert!(result.is_ok());
        }
    }

    #[test]
    fn test_drop_does_not_wait_on_stuck_store() {
        let stuck = Arc::new(SlowStore {
            delay: Duration::from_secs(10),
        });
        let fetcher = DocumentFetcher::start(stuck, 1, 4, Duration::from_millis(20)).unwrap();
        assert!(fetcher.fetch(&DocumentId::from("D1")).is_err());
        let started = Instant::now();
        drop(fetcher);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_zero_workers_still_serves() {
        let fetcher = DocumentFetcher::start(store(), 0, 0, Duration::from_secs(5)).unwrap();
        assert!(fetcher.fetch(&DocumentId::from("D2")).is_ok());
    }
}
