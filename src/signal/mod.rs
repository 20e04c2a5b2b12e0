//! JSON signaling protocol
//!
//! One JSON object per WebSocket text frame, discriminated by a `type`
//! field. All other fields are optional; which ones are required depends on
//! the type. Errors go back to the client as a separate `{error, code}`
//! frame so older clients that only understand the flat envelope still get
//! something parseable.

pub mod message;
pub mod telemetry;

pub use message::{ErrorMessage, SignalKind, SignalMessage};
pub use telemetry::Telemetry;
