//! Stream registry and per-stream relay state

pub mod store;
pub mod stream;

pub use store::StreamRegistry;
pub use stream::Stream;
