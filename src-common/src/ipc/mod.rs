//! Framed-JSON IPC shared by both links: client to service over the
//! Unix socket, and service to worker over child stdio.

mod protocol;
mod requests;
mod responses;

pub use protocol::*;
pub use requests::*;
pub use responses::*;
