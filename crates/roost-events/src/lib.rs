//! Event bus and console sinks for inter-component communication.
//!
//! Every server instance owns one [`Bus`]. The container environment
//! publishes state and resource events into it, the console sink mirrors
//! process output into it, and any number of subscribers (WebSocket
//! sessions, SSE streams, the crash detector, the disk limiter) consume it
//! through bounded channels. Publishing never blocks: a subscriber whose
//! channel is full misses that delivery, everyone else is unaffected.

mod bus;
mod sink;
pub mod topic;

pub use bus::{Bus, Event};
pub use sink::{ConsoleSink, SinkPool};
