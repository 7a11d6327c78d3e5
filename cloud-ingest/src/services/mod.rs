//! Service wiring and lifecycle.

pub mod container;

pub use container::{AbandonedReset, ServiceContainer};
