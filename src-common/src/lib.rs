//! Subtext Common Library
//!
//! Shared data model, SRT utilities and IPC protocol for communication
//! between the subtext client, service and worker components.

pub mod ipc;
pub mod logging;
pub mod srt;
pub mod types;

pub use types::*;
