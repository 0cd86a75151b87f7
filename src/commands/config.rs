use colored::Colorize;

use crate::cli::{Cli, ConfigCommands};
use crate::config::Config;
use crate::error::{DevframeError, Result};

pub async fn run(cli: &Cli, command: &ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => show(cli),
        ConfigCommands::Set { key, value } => set(cli, key, value),
        ConfigCommands::Get { key } => get(cli, key),
        ConfigCommands::Path => path(cli),
        ConfigCommands::Reset => reset(cli),
    }
}

fn show(cli: &Cli) -> Result<()> {
    let config = cli.load_config()?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        let toml_str = toml::to_string_pretty(&config)
            .map_err(|e| DevframeError::ConfigError(e.to_string()))?;
        println!("{}", toml_str);
    }

    Ok(())
}

fn set(cli: &Cli, key: &str, value: &str) -> Result<()> {
    // Command-line overrides must not end up in the file
    let mut config = Config::load()?;
    config.set_key(key, value)?;
    config.save()?;

    if cli.json {
        println!("{}", serde_json::json!({ "key": key, "value": value }));
    } else {
        println!("{} Set {} = {}", "✓".green(), key, value);
    }

    Ok(())
}

fn get(cli: &Cli, key: &str) -> Result<()> {
    let value = cli.load_config()?.get_key(key)?;

    if cli.json {
        println!("{}", serde_json::json!({ "key": key, "value": value }));
    } else {
        match value {
            Some(v) => println!("{}", v),
            None => println!("{}", "(not set)".dimmed()),
        }
    }

    Ok(())
}

fn reset(cli: &Cli) -> Result<()> {
    let path = Config::config_path();

    if !path.exists() {
        if cli.json {
            println!(
                "{}",
                serde_json::json!({ "status": "no_config", "path": path.display().to_string() })
            );
        } else {
            println!("{} No config file to remove.", "✓".green());
        }
        return Ok(());
    }

    std::fs::remove_file(&path)?;

    if cli.json {
        println!(
            "{}",
            serde_json::json!({ "status": "removed", "path": path.display().to_string() })
        );
    } else {
        println!(
            "{} Config removed: {}",
            "✓".green(),
            path.display().to_string().dimmed()
        );
    }

    Ok(())
}

fn path(cli: &Cli) -> Result<()> {
    let path = Config::config_path();

    if cli.json {
        println!("{}", serde_json::json!({ "path": path.display().to_string() }));
    } else {
        println!("{}", path.display());
    }

    Ok(())
}
