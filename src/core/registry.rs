//! Capacity-bounded occupant registry.
//!
//! All state lives behind one `parking_lot::RwLock`. Reads share it; admit,
//! release and rate changes take it exclusively, drop it, and only then
//! persist the snapshot under a separate persistence lock so file I/O never
//! blocks readers.
//!
//! Admission when full is a blocking wait on `capacity_freed`, paired with
//! the `capacity_gate` mutex. A waiting admitter holds the gate from its
//! capacity check until it parks on the condvar, and `release` takes the gate
//! before signalling, so a release cannot slip in between check and wait.
//! [`Registry::close`] wakes every parked admitter so shutdown never waits
//! out a client-chosen deadline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::core::{Category, OccupantRecord, RateTable, RegistryError};
use crate::infra::snapshot::{self, SnapshotError, SnapshotImage};
use crate::util::clock::{Clock, SystemClock};

/// Point-in-time occupancy summary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    /// Total slots.
    pub capacity: usize,
    /// Slots in use.
    pub occupied: usize,
    /// Free slots.
    pub available: usize,
    /// Hourly rate for small vehicles.
    pub small_rate: f64,
    /// Hourly rate for large vehicles.
    pub large_rate: f64,
}

/// Active set plus append-only history.
///
/// `present.len()` is the occupied count, so it can never drift from the
/// number of present records.
struct RegistryState {
    capacity: usize,
    rates: RateTable,
    present: HashMap<String, OccupantRecord>,
    history: Vec<OccupantRecord>,
    /// Key -> index of its most recent entry in `history`.
    last_released: HashMap<String, usize>,
}

impl RegistryState {
    fn empty(capacity: usize, rates: RateTable) -> Self {
        Self {
            capacity,
            rates,
            present: HashMap::new(),
            history: Vec::new(),
            last_released: HashMap::new(),
        }
    }

    fn push_history(&mut self, record: OccupantRecord) {
        self.last_released
            .insert(record.key.clone(), self.history.len());
        self.history.push(record);
    }

    fn is_full(&self) -> bool {
        self.present.len() >= self.capacity
    }
}

/// Thread-safe registry of occupants with a fixed capacity.
pub struct Registry {
    state: RwLock<RegistryState>,
    capacity_gate: Mutex<()>,
    capacity_freed: Condvar,
    persist_lock: Mutex<()>,
    closed: AtomicBool,
    snapshot_path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl Registry {
    /// In-memory registry with `capacity` slots and no snapshot file.
    #[must_use]
    pub fn new(capacity: usize, rates: RateTable) -> Self {
        Self::from_state(RegistryState::empty(capacity, rates))
    }

    /// Rebuild a registry from a loaded snapshot image.
    #[must_use]
    pub fn from_image(image: SnapshotImage) -> Self {
        let mut state = RegistryState::empty(image.capacity, image.rates);
        for record in image.records {
            if record.is_present() {
                state.present.insert(record.key.clone(), record);
            } else {
                state.push_history(record);
            }
        }
        Self::from_state(state)
    }

    /// Load the snapshot at `path`, falling back to `capacity`/`rates` and an
    /// empty table when it is missing or unreadable. Later mutations are
    /// persisted to `path`.
    pub fn open(path: impl Into<PathBuf>, capacity: usize, rates: RateTable) -> Self {
        let path = path.into();
        let registry = match snapshot::load(&path) {
            Ok(image) => {
                info!(
                    path = %path.display(),
                    capacity = image.capacity,
                    occupied = image.occupied,
                    records = image.records.len(),
                    "Loaded registry snapshot"
                );
                Self::from_image(image)
            }
            Err(SnapshotError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No snapshot found, starting empty");
                Self::new(capacity, rates)
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to load snapshot, falling back to defaults"
                );
                Self::new(capacity, rates)
            }
        };
        registry.with_snapshot_path(path)
    }

    fn from_state(state: RegistryState) -> Self {
        Self {
            state: RwLock::new(state),
            capacity_gate: Mutex::new(()),
            capacity_freed: Condvar::new(),
            persist_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            snapshot_path: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Persist every mutation to `path`.
    #[must_use]
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    /// Replace the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Snapshot file, if persistence is enabled.
    #[must_use]
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Admit `key`, waiting up to `wait` for a free slot when full.
    ///
    /// A zero `wait` fails immediately with [`RegistryError::Full`].
    ///
    /// # Errors
    ///
    /// - [`RegistryError::Duplicate`] if `key` is already present
    /// - [`RegistryError::Full`] if full and `wait` is zero
    /// - [`RegistryError::WaitTimedOut`] if no slot freed up within `wait`
    /// - [`RegistryError::Closed`] if the registry was closed while waiting
    pub fn admit(
        &self,
        key: &str,
        category: Category,
        wait: Duration,
    ) -> Result<OccupantRecord, RegistryError> {
        let result = match self.try_admit(key, category) {
            Err(RegistryError::Full) if !wait.is_zero() => {
                debug!(
                    key,
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    "Registry full, waiting for a slot"
                );
                self.admit_blocking(key, category, wait)
            }
            other => other,
        };

        match &result {
            Ok(record) => {
                info!(key, category = %record.category, "Occupant admitted");
                self.persist();
            }
            Err(e) => warn!(key, error = %e, "Admission rejected"),
        }
        result
    }

    fn try_admit(&self, key: &str, category: Category) -> Result<OccupantRecord, RegistryError> {
        let mut state = self.state.write();
        if state.present.contains_key(key) {
            return Err(RegistryError::Duplicate(key.to_owned()));
        }
        if state.is_full() {
            return Err(RegistryError::Full);
        }
        let record = OccupantRecord::admitted(key.to_owned(), category, self.clock.now());
        state.present.insert(key.to_owned(), record.clone());
        Ok(record)
    }

    fn admit_blocking(
        &self,
        key: &str,
        category: Category,
        wait: Duration,
    ) -> Result<OccupantRecord, RegistryError> {
        let deadline = Instant::now().checked_add(wait);
        let mut gate = self.capacity_gate.lock();
        loop {
            if self.is_closed() {
                return Err(RegistryError::Closed);
            }
            match self.try_admit(key, category) {
                Err(RegistryError::Full) => {}
                other => return other,
            }
            let timed_out = match deadline {
                Some(deadline) => self.capacity_freed.wait_until(&mut gate, deadline).timed_out(),
                None => {
                    self.capacity_freed.wait(&mut gate);
                    false
                }
            };
            if timed_out {
                if self.is_closed() {
                    return Err(RegistryError::Closed);
                }
                // A release may have signalled us right at the deadline.
                return match self.try_admit(key, category) {
                    Err(RegistryError::Full) => Err(RegistryError::WaitTimedOut),
                    other => other,
                };
            }
        }
    }

    /// Stop blocking admissions and wake every admitter parked on a full
    /// registry. Non-blocking calls keep working.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _gate = self.capacity_gate.lock();
            self.capacity_freed.notify_all();
        }
        info!("Registry closed to waiting admitters");
    }

    /// Whether [`Registry::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release `key`, charging the fee for its stay.
    ///
    /// Wakes one admitter blocked on a full registry.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::AlreadyReleased`] if `key` only exists as history
    /// - [`RegistryError::NotFound`] if `key` was never admitted
    pub fn release(&self, key: &str) -> Result<OccupantRecord, RegistryError> {
        let released = {
            let mut state = self.state.write();
            match state.present.remove(key) {
                Some(mut record) => {
                    let rate = state.rates.rate_for(record.category);
                    record.finalize(self.clock.now(), rate);
                    state.push_history(record.clone());
                    Ok(record)
                }
                None if state.last_released.contains_key(key) => {
                    Err(RegistryError::AlreadyReleased(key.to_owned()))
                }
                None => Err(RegistryError::NotFound(key.to_owned())),
            }
        };

        match released {
            Ok(record) => {
                {
                    let _gate = self.capacity_gate.lock();
                    self.capacity_freed.notify_one();
                }
                info!(key, fee = record.fee, "Occupant released");
                self.persist();
                Ok(record)
            }
            Err(e) => {
                warn!(key, error = %e, "Release rejected");
                Err(e)
            }
        }
    }

    /// Current record for `key`, or its most recent historical one.
    #[must_use]
    pub fn query(&self, key: &str) -> Option<OccupantRecord> {
        let state = self.state.read();
        state.present.get(key).cloned().or_else(|| {
            state
                .last_released
                .get(key)
                .and_then(|&idx| state.history.get(idx))
                .cloned()
        })
    }

    /// Records still occupying a slot, in no particular order.
    #[must_use]
    pub fn list_current(&self) -> Vec<OccupantRecord> {
        self.state.read().present.values().cloned().collect()
    }

    /// Released records, oldest release first.
    #[must_use]
    pub fn list_history(&self) -> Vec<OccupantRecord> {
        self.state.read().history.clone()
    }

    /// Replace both hourly rates. Already-released fees are unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidRate`] unless both rates are positive.
    pub fn set_rates(&self, small: f64, large: f64) -> Result<RateTable, RegistryError> {
        let Some(rates) = RateTable::new(small, large) else {
            warn!(small, large, "Rejected non-positive rates");
            return Err(RegistryError::InvalidRate);
        };
        self.state.write().rates = rates;
        info!(small, large, "Rates updated");
        self.persist();
        Ok(rates)
    }

    /// Current hourly rates.
    #[must_use]
    pub fn rates(&self) -> RateTable {
        self.state.read().rates
    }

    /// Total slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.read().capacity
    }

    /// Slots in use.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.state.read().present.len()
    }

    /// Capacity, occupancy and rates read under one lock.
    #[must_use]
    pub fn status(&self) -> RegistryStatus {
        let state = self.state.read();
        let occupied = state.present.len();
        RegistryStatus {
            capacity: state.capacity,
            occupied,
            available: state.capacity.saturating_sub(occupied),
            small_rate: state.rates.small,
            large_rate: state.rates.large,
        }
    }

    /// Consistent image of the whole registry: history first, then present.
    #[must_use]
    pub fn snapshot_image(&self) -> SnapshotImage {
        let state = self.state.read();
        let mut records = Vec::with_capacity(state.history.len() + state.present.len());
        records.extend(state.history.iter().cloned());
        records.extend(state.present.values().cloned());
        SnapshotImage {
            capacity: state.capacity,
            occupied: state.present.len(),
            rates: state.rates,
            records,
        }
    }

    /// Rewrite the snapshot file. The image is taken after the persistence
    /// lock is held, so the last writer always stores the newest state.
    fn persist(&self) {
        let Some(path) = self.snapshot_path.as_deref() else {
            return;
        };
        let _persist = self.persist_lock.lock();
        let image = self.snapshot_image();
        if let Err(e) = snapshot::save(path, &image) {
            error!(path = %path.display(), error = %e, "Failed to persist snapshot");
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("status", &self.status())
            .field("snapshot_path", &self.snapshot_path)
            .finish_non_exhaustive()
    }
}
