//! IPC server: the request surface of the service.

pub mod handlers;
pub mod server;
