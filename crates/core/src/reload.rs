//! Lazy, request-driven configuration reload.
//!
//! There is no watcher thread. Each login calls
//! [`ReloadSupervisor::maybe_reload`], which at most once per check interval
//! stats the backing file and, only when its modification time changed,
//! parses a fresh [`Snapshot`] and publishes it with a single atomic swap.
//!
//! ```text
//!   Idle ── reload.config = false ──▶ always the current snapshot
//!   Armed:
//!     now < last_checked + interval ─▶ current snapshot (no I/O)
//!     mtime unchanged ───────────────▶ current snapshot (one stat)
//!     mtime changed, parse ok ───────▶ publish new snapshot
//!     mtime changed, parse failed ───▶ warn, keep current snapshot
//! ```
//!
//! Readers that already hold an `Arc<Snapshot>` keep using it; the old
//! snapshot is freed when the last of them drops it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Instant, SystemTime};

use arc_swap::ArcSwap;
use tracing::{debug, error, info, trace, warn};

use crate::config::load_snapshot;
use crate::snapshot::{Provenance, Snapshot};

/// Bookkeeping for the polling state machine. Touched by at most one thread
/// at a time.
#[derive(Debug)]
struct ReloadState {
    last_checked: Instant,
    /// Modification time of the last file contents that were parsed,
    /// successfully or not.
    last_seen: Option<SystemTime>,
}

/// Owns the current snapshot and decides when to replace it.
#[derive(Debug)]
pub struct ReloadSupervisor {
    current: ArcSwap<Snapshot>,
    state: Mutex<ReloadState>,
}

impl ReloadSupervisor {
    /// Start from an already built snapshot.
    pub fn new(snapshot: Snapshot) -> Self {
        let last_seen = snapshot.provenance.last_modified;
        Self {
            current: ArcSwap::from_pointee(snapshot),
            state: Mutex::new(ReloadState {
                last_checked: Instant::now(),
                last_seen,
            }),
        }
    }

    /// Load the initial snapshot from `path`.
    ///
    /// A file that cannot be read or parsed yields an empty snapshot rather
    /// than an error; logins proceed with default roles only.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match load_snapshot(path, None) {
            Ok((snapshot, _warnings)) => Self::new(snapshot),
            Err(e) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    "could not load configuration, starting with an empty snapshot"
                );
                Self::new(Snapshot {
                    provenance: Provenance {
                        path: Some(PathBuf::from(path)),
                        ..Provenance::default()
                    },
                    ..Snapshot::empty()
                })
            }
        }
    }

    /// The snapshot currently published. Never blocks.
    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Check the backing file if the interval has elapsed and publish a new
    /// snapshot when it changed. Returns the snapshot the caller should use
    /// for the rest of its request.
    pub fn maybe_reload(&self) -> Arc<Snapshot> {
        let current = self.current.load_full();
        if !current.settings.reload.enabled || current.provenance.path.is_none() {
            return current;
        }

        // Another request is already checking; it will publish if needed.
        let mut state = match self.state.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return current,
        };

        // The previous holder of the lock may have published since the load
        // above; build on whatever is current now.
        let current = self.current.load_full();
        let reload = current.settings.reload;
        if !reload.enabled {
            return current;
        }
        let Some(path) = current.provenance.path.clone() else {
            return current;
        };

        let now = Instant::now();
        if now.duration_since(state.last_checked) < reload.check_interval() {
            return current;
        }
        state.last_checked = now;

        let modified = match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot stat configuration file");
                return current;
            }
        };
        if state.last_seen == Some(modified) {
            trace!(path = %path.display(), "configuration unchanged");
            return current;
        }
        state.last_seen = Some(modified);

        debug!(path = %path.display(), "configuration file changed, reloading");
        match load_snapshot(&path, Some(&current)) {
            Ok((snapshot, warnings)) => {
                let next = Arc::new(snapshot);
                self.current.store(Arc::clone(&next));
                info!(
                    path = %path.display(),
                    generation = next.provenance.generation,
                    warnings = warnings.len(),
                    "configuration reloaded"
                );
                next
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    generation = current.provenance.generation,
                    "configuration reload failed, keeping previous snapshot"
                );
                current
            }
        }
    }
}
