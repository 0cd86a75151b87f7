//! Cross-context message relay.
//!
//! The outer surface, the sandboxed frame and the host cannot talk to each
//! other directly. They attach to a [`FrameMessageRouter`], either in process
//! or over the loopback [`RelayServer`].

mod message;
mod router;
pub mod server;

pub use message::RelayMessage;
pub use router::{Delivery, Endpoint, FrameMessageRouter};
pub use server::{generate_token, RelayServer, PROTOCOL_VERSION};
