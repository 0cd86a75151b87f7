use chrono::{TimeZone, Utc};
use colored::Colorize;

use super::open_storage;
use crate::cli::{Cli, CookiesCommands};
use crate::error::{DevframeError, Result};
use crate::panel::url::normalize;
use crate::storage::Cookie;

pub async fn run(cli: &Cli, command: &CookiesCommands) -> Result<()> {
    let storage = open_storage(&cli.load_config()?)?;

    match command {
        CookiesCommands::List { url } => {
            let url = url.as_deref().map(|u| normalize(u, None)).transpose()?;
            let now = Utc::now();
            let cookies: Vec<Cookie> = storage
                .cookies()
                .into_iter()
                .filter(|c| url.as_ref().map_or(true, |u| c.matches(u, now)))
                .collect();
            list(cli, &cookies)?;
        }
        CookiesCommands::Set { url, set_cookie } => {
            let url = normalize(url, None)?;
            let cookie = Cookie::parse(set_cookie, &url, Utc::now()).ok_or_else(|| {
                DevframeError::Other(format!("'{}' is not a cookie {} would accept", set_cookie, url))
            })?;
            let (name, domain) = (cookie.name.clone(), cookie.domain.clone());
            storage.put_cookie(cookie)?;

            if cli.json {
                println!("{}", serde_json::json!({ "name": name, "domain": domain }));
            } else {
                println!("{} Stored {} for {}", "✓".green(), name.bold(), domain);
            }
        }
        CookiesCommands::Clear => {
            storage.clear_cookies()?;
            if cli.json {
                println!("{}", serde_json::json!({ "status": "cleared" }));
            } else {
                println!("{} Cookie jar cleared", "✓".green());
            }
        }
    }

    Ok(())
}

fn list(cli: &Cli, cookies: &[Cookie]) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(cookies)?);
        return Ok(());
    }

    if cookies.is_empty() {
        println!("{}", "(no cookies)".dimmed());
        return Ok(());
    }

    println!("{} {} cookies\n", "✓".green(), cookies.len());
    for cookie in cookies {
        let expires = cookie
            .expires
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "session".to_string());
        let mut flags = Vec::new();
        if cookie.secure {
            flags.push("Secure");
        }
        if cookie.http_only {
            flags.push("HttpOnly");
        }
        println!(
            "  {}={}  {}{}  {}  {}",
            cookie.name.cyan(),
            cookie.value,
            cookie.domain,
            cookie.path,
            expires.dimmed(),
            flags.join(" ").dimmed()
        );
    }

    Ok(())
}
