//! Single-room WebSocket chat relay.
//!
//! Every message a client sends is relayed to every connected client,
//! sender included. Each module owns one concern:
//!
//! - [`room`] is the hub: a single task that owns membership and fans
//!   messages out to per-client outboxes.
//! - [`session`] bridges one connection to the hub with a read loop and a
//!   write loop.
//! - [`message`] defines the opaque payload and its WebSocket framing.
//! - [`page`] loads and caches the HTML chat page.
//! - [`server`] wires the page and the `/room` upgrade endpoint into axum.
//! - [`cli`] parses the command-line flags.

pub mod cli;
pub mod message;
pub mod page;
pub mod room;
pub mod server;
pub mod session;
