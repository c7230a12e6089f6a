//! trawl library crate.
//!
//! A resumable batch media harvester: an event bus, a staged pipeline
//! and a durable SQLite session store, plus recovery operations over
//! interrupted runs.

pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod logging;
pub mod pipeline;
pub mod post;
pub mod recovery;

pub use error::{Error, Result};
