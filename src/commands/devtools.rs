use colored::Colorize;

use super::create_spinner;
use crate::cli::Cli;
use crate::devtools::{DevToolsLocator, DiscoveryResult};
use crate::error::Result;

pub async fn run(cli: &Cli, endpoint: Option<&str>, port: Option<u16>) -> Result<()> {
    let mut config = cli.load_config()?.devtools;
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint.to_string();
    }
    let locator = DevToolsLocator::new(&config)?;

    let spinner = create_spinner(cli, &format!("Looking for debug targets at {}...", locator.endpoint()));
    let result = locator.discover(port).await;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        match &result {
            DiscoveryResult::Ready { url } => {
                println!("{} DevTools ready", "✓".green());
                println!("  {}", url.cyan());
            }
            DiscoveryResult::Error { error, .. } => {
                println!("{} {}", "✗".red(), error);
            }
        }
    }

    result.into_result().map(|_| ())
}
