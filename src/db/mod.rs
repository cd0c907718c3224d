//! Database module for HeartBeats.
//!
//! Provides SQLite storage for hosts and their probe history.

mod models;
mod store;

pub use models::*;
pub use store::*;
