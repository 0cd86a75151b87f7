//! Devframe - embed a local dev server in a tool panel.
//!
//! A per-panel reverse proxy injects the instrumentation bundle into HTML
//! pages, a relay connects the panel surface, the framed page and the host,
//! and a storage bridge keeps cookies and localStorage across sessions.

pub mod cli;
pub mod commands;
pub mod config;
pub mod devtools;
pub mod error;
pub mod panel;
pub mod proxy;
pub mod relay;
pub mod storage;

pub use error::{DevframeError, Result};
