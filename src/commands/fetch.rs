use std::time::Duration;

use colored::Colorize;

use super::{create_spinner, open_storage};
use crate::cli::Cli;
use crate::error::Result;
use crate::panel::fetch::SiteFetcher;
use crate::panel::url::normalize;
use crate::proxy::Injection;

pub async fn run(cli: &Cli, raw: &str, html: bool) -> Result<()> {
    let config = cli.load_config()?;
    let url = normalize(raw, None)?;
    let fetcher = SiteFetcher::new(open_storage(&config)?, Duration::from_secs(30))?;
    let injection = Injection::new(config.proxy.mount_id.clone(), config.proxy.bundle_src.clone());

    let spinner = create_spinner(cli, &format!("Fetching {}...", url));
    let page = fetcher.fetch(&url, &injection).await;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    if html {
        print!("{}", page.html);
    } else if cli.json {
        println!("{}", serde_json::to_string_pretty(&page)?);
    } else if page.ok {
        println!(
            "{} {} {}",
            "✓".green(),
            page.status,
            page.title.as_deref().unwrap_or("(untitled)").bold()
        );
        println!("  {}", page.url.dimmed());
        println!("  {} bytes after injection", page.html.len());
    } else {
        println!("{} Could not load {}", "✗".red(), page.url);
    }

    Ok(())
}
