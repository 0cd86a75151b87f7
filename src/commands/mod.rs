pub mod config;
pub mod cookies;
pub mod devtools;
pub mod fetch;
pub mod serve;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::cli::Cli;
use crate::config::Config;
use crate::error::Result;
use crate::storage::StorageBridge;

/// Open the storage bridge the CLI flags and config point at.
pub(crate) fn open_storage(config: &Config) -> Result<Arc<StorageBridge>> {
    Ok(Arc::new(StorageBridge::open(config.storage.resolve_dir()?)?))
}

pub(crate) fn create_spinner(cli: &Cli, message: &str) -> Option<ProgressBar> {
    if cli.json {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
            .template("  {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    Some(pb)
}
