//! Reverse proxy that sits between the nested frame and a local dev server.

mod body;
mod engine;
mod forward;
pub mod inject;
mod tunnel;

pub use engine::{ProxyEngine, SessionInfo};
pub use inject::Injection;
