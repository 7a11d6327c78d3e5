//! Scheduling primitives: triggers and zone-aware day windows.

pub mod day;
mod trigger;

pub use trigger::{Trigger, TriggerContext, TriggerError};
