//! Subtext transcription service core.
//!
//! Given a long audio input the service detects speech, partitions it
//! into balanced work units, dispatches those units across a pool of
//! device-pinned inference workers with resident models, reassembles
//! the per-unit output into a globally time-ordered subtitle stream,
//! and isolates concurrent sessions so their files and in-flight state
//! never collide.

pub mod admission;
pub mod audio;
pub mod config;
pub mod engine;
pub mod fetch;
pub mod ipc;
pub mod partition;
pub mod pipeline;
pub mod postprocess;
pub mod scheduler;
pub mod session;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::info;

/// Global shutdown flag
static SHUTDOWN_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Get the global shutdown flag.
pub fn get_shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN_FLAG
        .get_or_init(|| Arc::new(AtomicBool::new(false)))
        .clone()
}

/// Request service shutdown.
pub fn request_shutdown() {
    info!("Shutdown requested");
    get_shutdown_flag().store(true, Ordering::SeqCst);
}

/// Check if shutdown has been requested.
pub fn is_shutdown_requested() -> bool {
    get_shutdown_flag().load(Ordering::SeqCst)
}
