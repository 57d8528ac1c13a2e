//! SFTP subsystem
//!
//! File management on the session's SFTP handle plus streamed uploads and
//! downloads.

pub mod session;
pub mod transfer;
pub mod types;

pub use transfer::TransferControl;
pub use types::*;
