//! Offline-first sync queue for farm record keeping.
//!
//! Local mutations (a milk record, a flock update, a deleted task) are queued
//! durably and pushed to the remote farm API whenever the device is online.

pub mod config;
pub mod db;
pub mod models;
pub mod server;
pub mod sync;
