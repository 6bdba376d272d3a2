use crate::error::Result;
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How often the monitor sweeps when no interval is given
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// The outcome of one retention index sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct PurgeEvent {
    pub collection: String,
    pub index: String,
    /// Documents whose indexed date is before this instant were removed
    pub cutoff: DateTime<Utc>,
    pub removed: usize,
}

/// Background expiry of documents covered by retention indexes.
///
/// The monitor owns its own connection to the store file and sweeps at a fixed
/// interval. Sweeps that removed documents are reported through `event_rx`.
/// Deletion is eventual: a document can outlive its horizon by up to one interval.
pub struct RetentionMonitor {
    stop_tx: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
    /// Receiver for sweeps that removed at least one document
    pub event_rx: mpsc::Receiver<PurgeEvent>,
}

impl RetentionMonitor {
    /// Start sweeping the store at `path` every `interval`. The first sweep runs
    /// immediately.
    pub fn start(path: &Path, interval: Duration) -> Result<Self> {
        // Open once up front so a bad path fails here, not in the thread.
        let store = Store::open(path)?;
        let path: PathBuf = path.to_path_buf();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (event_tx, event_rx) = mpsc::channel::<PurgeEvent>();

        let thread = std::thread::spawn(move || {
            log::info!("Retention monitor started on {} (every {:?})", path.display(), interval);
            loop {
                match store.purge_expired(Utc::now()) {
                    Ok(events) => {
                        for event in events.into_iter().filter(|e| e.removed > 0) {
                            log::info!(
                                "Expired {} document(s) from {} via {}",
                                event.removed,
                                event.collection,
                                event.index
                            );
                            // keep sweeping even if nobody listens
                            let _ = event_tx.send(event);
                        }
                    }
                    Err(e) => log::warn!("Retention sweep failed: {e}"),
                }

                match stop_rx.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            log::info!("Retention monitor stopped");
        });

        Ok(RetentionMonitor {
            stop_tx,
            thread: Some(thread),
            event_rx,
        })
    }

    /// Stop sweeping and wait for the background thread to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Retention monitor thread panicked");
            }
        }
    }
}

impl Drop for RetentionMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
