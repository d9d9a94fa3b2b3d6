//! Admission control and engine caching.
//!
//! At most `max_sessions` requests run concurrently; waiters queue FIFO
//! and can give up after a deadline. Each admission slot carries a
//! cached engine keyed by `(mode, model key)`: a later session that
//! requests the same configuration reuses the resident engine instead
//! of paying another model load. Without the ceiling, N sessions times
//! M workers would stack N×M resident models onto the devices.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::worker::pool::WorkerPool;
use crate::worker::UnitWorker;
use subtext_common::types::{EngineMode, ModelKey};

/// Error type for admission.
#[derive(Debug)]
pub enum AdmissionError {
    /// No slot freed up within the caller's deadline.
    Timeout { waited: Duration },
    /// The pool is shutting down.
    Closed,
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::Timeout { waited } => {
                write!(f, "No session slot became free within {:?}", waited)
            }
            AdmissionError::Closed => write!(f, "Admission pool is closed"),
        }
    }
}

impl std::error::Error for AdmissionError {}

/// Cache key for resident engines.
pub type EngineKey = (EngineMode, ModelKey);

fn key_display(key: &EngineKey) -> String {
    format!("{}/{}", key.0, key.1)
}

/// A resident engine, either flavour.
pub enum CachedEngine {
    /// Single mode: the in-process worker hosting the engine. `None`
    /// while a scheduling run has the worker checked out, or after it
    /// died.
    Single {
        worker: Option<Box<dyn UnitWorker>>,
    },
    /// Parallel mode: the process worker pool, models resident across
    /// sessions.
    Parallel { pool: Arc<WorkerPool> },
}

struct Slot {
    index: usize,
    cached: Option<(EngineKey, CachedEngine)>,
}

/// Bounded admission with per-slot engine caches.
pub struct TranscriberPool {
    semaphore: Arc<Semaphore>,
    slots: Arc<Mutex<Vec<Slot>>>,
    max_sessions: usize,
}

impl TranscriberPool {
    pub fn new(max_sessions: usize) -> Self {
        let max_sessions = max_sessions.max(1);
        let slots = (0..max_sessions)
            .map(|index| Slot {
                index,
                cached: None,
            })
            .collect();
        Self {
            semaphore: Arc::new(Semaphore::new(max_sessions)),
            slots: Arc::new(Mutex::new(slots)),
            max_sessions,
        }
    }

    /// Block until a slot frees up, FIFO, or the deadline passes.
    pub async fn acquire(&self, deadline: Duration) -> Result<EngineHandle, AdmissionError> {
        let permit = tokio::time::timeout(
            deadline,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| AdmissionError::Timeout { waited: deadline })?
        .map_err(|_| AdmissionError::Closed)?;

        let slot = self
            .slots
            .lock()
            .unwrap()
            .pop()
            .expect("one parked slot per available permit");
        debug!("Admission granted (slot {})", slot.index);

        Ok(EngineHandle {
            _permit: permit,
            slot: Some(slot),
            slots: Arc::clone(&self.slots),
        })
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Sessions currently holding a slot.
    pub fn active_sessions(&self) -> usize {
        self.max_sessions - self.semaphore.available_permits()
    }

    /// Display keys of engines resident in parked slots.
    pub fn cached_engine_keys(&self) -> Vec<String> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter_map(|slot| slot.cached.as_ref().map(|(key, _)| key_display(key)))
            .collect()
    }
}

/// Admission ticket: holds one slot for the lifetime of a session.
///
/// Dropping the handle returns the slot (with whatever engine it now
/// caches) and frees the permit, exactly once, on every exit path.
pub struct EngineHandle {
    _permit: OwnedSemaphorePermit,
    slot: Option<Slot>,
    slots: Arc<Mutex<Vec<Slot>>>,
}

impl EngineHandle {
    /// The slot's engine for `key`, building one with `build` when the
    /// cache is empty or holds a different configuration. The previous
    /// engine is dropped before the build so its devices are free while
    /// the new model loads.
    pub async fn engine_for<F, Fut, E>(
        &mut self,
        key: EngineKey,
        build: F,
    ) -> Result<&mut CachedEngine, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<CachedEngine, E>>,
    {
        let slot = self.slot.as_mut().expect("slot held until drop");

        let reusable = matches!(&slot.cached, Some((cached_key, _)) if *cached_key == key);
        if reusable {
            info!("Reusing cached engine {}", key_display(&key));
        } else {
            if let Some((old_key, old_engine)) = slot.cached.take() {
                info!(
                    "Replacing cached engine {} with {}",
                    key_display(&old_key),
                    key_display(&key)
                );
                if let CachedEngine::Parallel { pool } = &old_engine {
                    pool.shutdown().await;
                }
                drop(old_engine);
            }
            let engine = build().await?;
            slot.cached = Some((key, engine));
        }

        Ok(&mut slot.cached.as_mut().expect("just ensured").1)
    }

    /// Drop the cached engine, e.g. after it died mid-session.
    pub fn clear_engine(&mut self) {
        if let Some(slot) = self.slot.as_mut() {
            slot.cached = None;
        }
    }

    /// Release the slot now. Equivalent to dropping the handle; kept
    /// for call sites that want the release to read explicitly.
    pub fn release(self) {}
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            debug!("Admission released (slot {})", slot.index);
            self.slots.lock().unwrap().push(slot);
        }
    }
}
