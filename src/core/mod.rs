//! Shared infrastructure: storage access, configuration, paths, logging and audit helpers.
//!
//! Nothing in here knows about lifecycle semantics; see [`crate::lifecycle`] for that.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod locks;
pub mod logging;
pub mod redact;
pub mod schemas;
pub mod store;
pub mod time;
