use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;

use crate::{database::StoreInner, types::Revision, utils::HandyRwLock};

/// A pinned snapshot. Construction captures the `(name, header offset)`
/// map by value; every navigation afterwards goes through those offsets,
/// so later commits and page reclamations are invisible to the reader.
///
/// Cheap to clone; all clones share the closed flag.
#[derive(Clone)]
pub struct ReadTransaction {
    inner: Arc<ReadInner>,
}

struct ReadInner {
    revision: Revision,
    headers: HashMap<String, i64>,
    created_at: Instant,
    closed: AtomicBool,
}

impl ReadTransaction {
    /// Snapshot the current revision and register with the reader queue.
    pub(crate) fn begin(store: &StoreInner) -> Self {
        let (revision, headers) = {
            let state = store.state.rl();
            (state.revision, state.headers.clone())
        };
        let txn = Self::detached(revision, headers);
        store.readers.register(txn.clone());
        txn
    }

    /// Pin a specific historical revision with an explicit header map.
    pub(crate) fn pinned(
        store: &StoreInner,
        revision: Revision,
        headers: HashMap<String, i64>,
    ) -> Self {
        let txn = Self::detached(revision, headers);
        store.readers.register(txn.clone());
        txn
    }

    /// A snapshot that is not registered anywhere; used for bootstrap
    /// scans before the store exists.
    pub(crate) fn detached(revision: Revision, headers: HashMap<String, i64>) -> Self {
        Self {
            inner: Arc::new(ReadInner {
                revision,
                headers,
                created_at: Instant::now(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn revision(&self) -> Revision {
        self.inner.revision
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_expired(&self, timeout: Duration) -> bool {
        self.inner.created_at.elapsed() > timeout
    }

    pub(crate) fn header_of(&self, name: &str) -> Option<i64> {
        self.inner.headers.get(name).copied()
    }
}

/// Registry of live read transactions. Registration is a lock-free queue
/// push so readers never contend with each other; the reaper and the
/// reclaimer drain the queue into a plain list when they need to look at
/// everything.
pub(crate) struct ReaderRegistry {
    incoming: SegQueue<ReadTransaction>,
    live: Mutex<Vec<ReadTransaction>>,
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self {
            incoming: SegQueue::new(),
            live: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, txn: ReadTransaction) {
        self.incoming.push(txn);
    }

    /// Close every reader older than `timeout` and drop closed ones.
    /// Returns how many the sweep closed.
    pub fn sweep_expired(&self, timeout: Duration) -> usize {
        let mut live = self.live.lock().unwrap();
        while let Some(txn) = self.incoming.pop() {
            live.push(txn);
        }
        let mut closed = 0;
        live.retain(|txn| {
            if txn.is_closed() {
                return false;
            }
            if txn.is_expired(timeout) {
                txn.close();
                closed += 1;
                return false;
            }
            true
        });
        closed
    }

    /// Smallest revision any live reader still pins.
    pub fn oldest_live_revision(&self) -> Option<Revision> {
        let mut live = self.live.lock().unwrap();
        while let Some(txn) = self.incoming.pop() {
            live.push(txn);
        }
        live.retain(|txn| !txn.is_closed());
        live.iter().map(|txn| txn.revision()).min()
    }

    pub fn live_count(&self) -> usize {
        let mut live = self.live.lock().unwrap();
        while let Some(txn) = self.incoming.pop() {
            live.push(txn);
        }
        live.retain(|txn| !txn.is_closed());
        live.len()
    }
}
