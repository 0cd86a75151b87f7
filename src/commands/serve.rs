use std::path::{Path, PathBuf};
use std::sync::Arc;

use colored::Colorize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::open_storage;
use crate::cli::Cli;
use crate::devtools::DevToolsLocator;
use crate::error::Result;
use crate::panel::{save_screenshot, HostEvent, Navigation, Panel};
use crate::proxy::ProxyEngine;
use crate::relay::{generate_token, server, Endpoint, FrameMessageRouter, RelayServer};

pub async fn run(
    cli: &Cli,
    target: &str,
    relay_port: Option<u16>,
    proxy_port: Option<u16>,
    screenshot_dir: Option<PathBuf>,
) -> Result<()> {
    let mut config = cli.load_config()?;
    if let Some(port) = proxy_port {
        config.proxy.listen_port = port;
    }

    let storage = open_storage(&config)?;
    let router = Arc::new(FrameMessageRouter::new(Arc::clone(&storage)));

    let token = generate_token();
    let listener = server::bind(relay_port.unwrap_or(config.relay.port)).await?;
    let relay_url = format!("ws://{}", listener.local_addr()?);
    let mut relay = RelayServer::new(Arc::clone(&router), token.clone());
    if let Some(origin) = &config.proxy.public_origin {
        relay = relay.allow_origin(origin.clone());
    }
    let shutdown = CancellationToken::new();
    let relay_task = tokio::spawn(relay.serve(listener, shutdown.clone()));

    let proxy = Arc::new(
        ProxyEngine::new(config.proxy.clone())
            .with_storage(Arc::clone(&storage))
            .with_relay(relay_url.clone(), token.clone()),
    );
    let devtools = Arc::new(DevToolsLocator::new(&config.devtools)?);
    let panel = Arc::new(
        Panel::new(&config, proxy, devtools, Arc::clone(&router))?
            .with_relay(relay_url.clone(), token.clone()),
    );

    let (host_id, inbox) = router.attach(Endpoint::Host);
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let host_panel = Arc::clone(&panel);
    let host_task = tokio::spawn(async move { host_panel.run_host(inbox, events_tx).await });

    let navigation = match panel.load_url(&target_url(target)).await {
        Ok(navigation) => navigation,
        Err(e) => {
            shutdown.cancel();
            host_task.abort();
            return Err(e);
        }
    };
    print_ready(cli, &navigation, &relay_url, &token);

    let screenshot_dir = screenshot_dir.unwrap_or_else(std::env::temp_dir);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => report(cli, event, &screenshot_dir),
                None => break,
            },
        }
    }

    if !cli.json {
        println!("\n  Shutting down...");
    }
    shutdown.cancel();
    router.detach(Endpoint::Host, host_id);
    host_task.abort();
    panel.dispose().await;
    match relay_task.await {
        Ok(Err(e)) => tracing::warn!("Relay ended with error: {}", e),
        Err(e) if !e.is_cancelled() => tracing::warn!("Relay task failed: {}", e),
        _ => {}
    }

    Ok(())
}

/// A bare port means the app on localhost.
fn target_url(target: &str) -> String {
    let target = target.trim();
    if !target.is_empty() && target.chars().all(|c| c.is_ascii_digit()) {
        format!("localhost:{}", target)
    } else {
        target.to_string()
    }
}

fn print_ready(cli: &Cli, navigation: &Navigation, relay_url: &str, token: &str) {
    let (url, frame_url) = match navigation {
        Navigation::Proxied { url, proxy_url } => (url.to_string(), proxy_url.to_string()),
        Navigation::External(page) => (page.url.clone(), page.url.clone()),
    };

    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "url": url,
                "frameUrl": frame_url,
                "relayUrl": relay_url,
                "token": token,
            })
        );
        return;
    }

    println!("{} Serving {}", "✓".green(), url.bold());
    println!("  Frame URL: {}", frame_url.cyan());
    println!("  Relay:     {}", relay_url);
    println!("  Token:     {}", token.dimmed());
    println!("\n  Press Ctrl+C to stop");
}

fn report(cli: &Cli, event: HostEvent, screenshot_dir: &Path) {
    match event {
        HostEvent::ElementPicked { text, screenshot } => {
            let saved = screenshot.and_then(|data| store(&data, screenshot_dir));
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({ "event": "elementPicked", "text": text, "screenshot": saved })
                );
            } else {
                println!("{} Picked element", "✓".green());
                println!("{}", text);
                if let Some(path) = saved {
                    println!("  Screenshot: {}", path.dimmed());
                }
            }
        }
        HostEvent::ScreenshotCaptured { data } => {
            let saved = store(&data, screenshot_dir);
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({ "event": "screenshotCaptured", "path": saved })
                );
            } else if let Some(path) = saved {
                println!("{} Screenshot saved: {}", "✓".green(), path);
            }
        }
    }
}

fn store(data: &str, dir: &Path) -> Option<String> {
    match save_screenshot(data, dir) {
        Ok(path) => Some(path.display().to_string()),
        Err(e) => {
            tracing::warn!("Screenshot not saved: {}", e);
            None
        }
    }
}
