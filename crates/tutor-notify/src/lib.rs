//! Outbound interfaces for tutord
//!
//! The engine tells people things through two seams:
//! - [`Notifier`]: templated messages (email, push) delivered by an external
//!   dispatcher
//! - [`RealtimeEmitter`]: best-effort live events for connected clients
//!
//! Neither may fail a business operation. Failures are logged and dropped.

mod mock;
mod traits;

pub use mock::*;
pub use traits::*;
