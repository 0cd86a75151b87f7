use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands;
use crate::config::Config;
use crate::error::Result;

/// Devframe CLI - proxy a local dev server into a tool panel
#[derive(Parser)]
#[command(name = "devframe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory for cookie and localStorage snapshots
    #[arg(long, env = "DEVFRAME_STORAGE_DIR", global = true)]
    pub storage_dir: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Proxy a local app and run the relay until interrupted
    Serve {
        /// URL or port of the app (e.g., "3000", "localhost:5173/app")
        target: String,

        /// Relay WebSocket port (defaults to relay.port)
        #[arg(long)]
        relay_port: Option<u16>,

        /// Fixed proxy port (defaults to proxy.listen_port)
        #[arg(long)]
        proxy_port: Option<u16>,

        /// Where captured screenshots are written
        #[arg(long)]
        screenshot_dir: Option<PathBuf>,
    },

    /// Locate the remote-debugging frontend
    Devtools {
        /// Debug server base URL (defaults to devtools.endpoint)
        #[arg(long)]
        endpoint: Option<String>,

        /// Prefer the target served from this port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Fetch a page the way the panel does for non-local sites
    Fetch {
        /// URL to fetch (scheme optional)
        url: String,

        /// Print the injected HTML instead of a summary
        #[arg(long)]
        html: bool,
    },

    /// Inspect or edit persisted localStorage
    Storage {
        #[command(subcommand)]
        command: StorageCommands,
    },

    /// Inspect or edit the persisted cookie jar
    Cookies {
        #[command(subcommand)]
        command: CookiesCommands,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum StorageCommands {
    /// List all entries
    List,

    /// Get a single value
    Get {
        /// Storage key
        key: String,
    },

    /// Set a value
    Set {
        /// Storage key
        key: String,
        /// Value to store
        value: String,
    },

    /// Remove a key
    Remove {
        /// Storage key
        key: String,
    },

    /// Remove every entry
    Clear,
}

#[derive(Subcommand)]
pub enum CookiesCommands {
    /// List stored cookies
    List {
        /// Only cookies that would be sent to this URL
        #[arg(long)]
        url: Option<String>,
    },

    /// Store a cookie as if URL had sent a Set-Cookie header
    Set {
        /// URL the cookie belongs to
        url: String,
        /// Set-Cookie header value (e.g., "sid=1; Path=/")
        set_cookie: String,
    },

    /// Remove every cookie
    Clear,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., "proxy.drain_grace_ms")
        key: String,
        /// Value to set
        value: String,
    },

    /// Get a configuration value
    Get {
        /// Configuration key
        key: String,
    },

    /// Show configuration file path
    Path,

    /// Remove the configuration file
    Reset,
}

impl Cli {
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Serve {
                target,
                relay_port,
                proxy_port,
                screenshot_dir,
            } => {
                commands::serve::run(
                    self,
                    target,
                    *relay_port,
                    *proxy_port,
                    screenshot_dir.clone(),
                )
                .await
            }
            Commands::Devtools { endpoint, port } => {
                commands::devtools::run(self, endpoint.as_deref(), *port).await
            }
            Commands::Fetch { url, html } => commands::fetch::run(self, url, *html).await,
            Commands::Storage { command } => commands::storage::run(self, command).await,
            Commands::Cookies { command } => commands::cookies::run(self, command).await,
            Commands::Config { command } => commands::config::run(self, command).await,
        }
    }

    /// Configuration with command-line overrides applied.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load()?;
        if let Some(dir) = &self.storage_dir {
            config.storage.dir = Some(dir.display().to_string());
        }
        Ok(config)
    }
}
