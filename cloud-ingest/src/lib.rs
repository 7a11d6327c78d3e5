//! cloud-ingest library crate.
//!
//! Scheduled ingestion of datum from third-party cloud APIs: a poll loop that
//! advances each stream's watermark, a rake loop that reconciles settled days
//! against stored data, and the task store, token cache and worker pool they
//! run on.

pub mod config;
pub mod database;
pub mod domain;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod schedule;
pub mod services;
pub mod token;
pub mod utils;
pub mod vendor;

pub use error::{Error, Result};
