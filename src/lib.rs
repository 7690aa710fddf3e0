//! Task scheduling and queue engine for multi-phase agent workflows.
//!
//! This module exports the core components for testing and integration.

pub mod admission;
pub mod api;
pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod feedback;
pub mod logging;
pub mod registry;
pub mod scheduler;
pub mod scoring;
pub mod types;
