//! Compute context: command queue and single-owner buffer handles.

pub mod queue;
pub mod value;

pub use queue::{CommandQueue, ContextId, Fence};
pub use value::BufferedValue;
