//! HTTP surface for the queue engine.
//!
//! Serves task intake, result reporting, the admin operations, and
//! read-only views of the queue, event log, and audit trail.

mod server;

pub use server::{ApiServer, start_server};
