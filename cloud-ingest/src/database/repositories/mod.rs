//! Repository layer for database access.

pub mod datum;
pub mod event;
pub mod ownership;
pub mod stream;
pub mod task;

pub use datum::*;
pub use event::*;
pub use ownership::*;
pub use stream::*;
pub use task::*;
