use super::format::{self, PersistedEntry};
use crate::error::{Error, Result};
use crate::store::EntryStore;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

enum FlushSignal {
    Dirty,
    Stop,
}

/// Cheap handle the entry store uses to request a flush
#[derive(Clone)]
pub struct FlushHandle {
    tx: Sender<FlushSignal>,
}

impl FlushHandle {
    /// Never blocks; bursts coalesce into one pending signal
    pub fn schedule(&self) {
        match self.tx.try_send(FlushSignal::Dirty) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                debug!("Persistence flusher stopped, dropping flush request");
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct FlushStats {
    pub flushes: AtomicU64,
    pub failures: AtomicU64,
}

struct SnapshotWriter {
    path: PathBuf,
    store: Arc<EntryStore>,
    // serializes the background flusher and flush_now
    io_lock: Mutex<()>,
    stats: FlushStats,
}

impl SnapshotWriter {
    /// The snapshot is taken under `io_lock`, so the file always ends up
    /// holding the newest snapshot of any writer
    fn flush(&self) -> Result<usize> {
        let _io = self.io_lock.lock();
        let snapshot = self.store.persistent_snapshot();
        write_snapshot(&self.path, &snapshot)?;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(snapshot.len())
    }
}

/// Commits the persistent subset of the store to the durable file
pub struct PersistenceEngine {
    writer: Arc<SnapshotWriter>,
    handle: FlushHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceEngine {
    /// Start the background flusher and hook it into `store`
    pub fn start(store: Arc<EntryStore>, path: impl Into<PathBuf>, interval: Duration) -> Self {
        let (tx, rx) = bounded(1);
        let handle = FlushHandle { tx };
        let writer = Arc::new(SnapshotWriter {
            path: path.into(),
            store: Arc::clone(&store),
            io_lock: Mutex::new(()),
            stats: FlushStats::default(),
        });

        let worker_writer = Arc::clone(&writer);
        let worker = thread::Builder::new()
            .name("persist-flush".to_string())
            .spawn(move || run_flusher(worker_writer, rx, interval));

        let worker = match worker {
            Ok(worker) => Some(worker),
            Err(e) => {
                error!("Failed to spawn persistence flusher: {}", e);
                None
            }
        };

        store.attach_flush(handle.clone());

        Self {
            writer,
            handle,
            worker: Mutex::new(worker),
        }
    }

    pub fn path(&self) -> &Path {
        &self.writer.path
    }

    /// Debounced flush request
    pub fn schedule_flush(&self) {
        self.handle.schedule();
    }

    /// Write the current persistent entries now, blocking
    pub fn flush_now(&self) -> Result<usize> {
        let count = self.writer.flush()?;
        debug!(
            "Flushed {} persistent entries to {}",
            count,
            self.writer.path.display()
        );
        Ok(count)
    }

    pub fn flush_count(&self) -> u64 {
        self.writer.stats.flushes.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.writer.stats.failures.load(Ordering::Relaxed)
    }

    /// Stop the background flusher and write a final snapshot
    pub fn shutdown(&self) -> Result<usize> {
        if let Some(worker) = self.worker.lock().take() {
            let _ = self.handle.tx.send(FlushSignal::Stop);
            if worker.join().is_err() {
                error!("Persistence flusher panicked");
            }
        }
        self.flush_now()
    }
}

fn run_flusher(writer: Arc<SnapshotWriter>, rx: Receiver<FlushSignal>, interval: Duration) {
    let mut dirty = false;

    loop {
        let signal = if dirty {
            // a failed flush is retried after one interval
            rx.recv_timeout(interval)
        } else {
            rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
        };

        match signal {
            Ok(FlushSignal::Dirty) => {
                dirty = true;
                // coalesce the burst until the window closes
                let deadline = Instant::now() + interval;
                loop {
                    match rx.recv_deadline(deadline) {
                        Ok(FlushSignal::Dirty) => continue,
                        Ok(FlushSignal::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                        Err(RecvTimeoutError::Timeout) => break,
                    }
                }
            }
            Ok(FlushSignal::Stop) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if dirty {
            match writer.flush() {
                Ok(count) => {
                    dirty = false;
                    debug!(
                        "Flushed {} persistent entries to {}",
                        count,
                        writer.path.display()
                    );
                }
                Err(e) => {
                    writer.stats.failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Persistence flush failed, will retry: {}", e);
                }
            }
        }
    }
}

/// Write entries to a sibling temp file, then rename over `path`
pub fn write_snapshot(path: &Path, entries: &[PersistedEntry]) -> Result<()> {
    let text = format::encode(entries)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, text.as_bytes())
        .and_then(|_| fs::rename(&tmp, path))
        .map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::Persistence(format!("{}: {}", path.display(), e))
        })
}

/// Read the durable store; a missing file is an empty store
pub fn load(path: &Path) -> Result<Vec<PersistedEntry>> {
    match fs::read_to_string(path) {
        Ok(text) => format::decode(&text),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::Persistence(format!("{}: {}", path.display(), e))),
    }
}

/// Like [`load`], but never fails: unreadable state means an empty store
pub fn load_or_empty(path: &Path) -> Vec<PersistedEntry> {
    match load(path) {
        Ok(entries) => {
            info!(
                "Loaded {} persistent entries from {}",
                entries.len(),
                path.display()
            );
            entries
        }
        Err(e) => {
            warn!(
                "Ignoring unreadable store file {}, starting empty: {}",
                path.display(),
                e
            );
            Vec::new()
        }
    }
}

/// Create an empty store file if none exists; returns true if created
pub fn ensure_store_file(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    fs::write(path, b"[]").map_err(|e| Error::Persistence(format!("{}: {}", path.display(), e)))?;
    Ok(true)
}
