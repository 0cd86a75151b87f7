use colored::Colorize;

use super::open_storage;
use crate::cli::{Cli, StorageCommands};
use crate::error::Result;
use crate::storage::{StorageAction, StorageScope};

/// The CLI only sees `localStorage`; `sessionStorage` dies with the serving process.
pub async fn run(cli: &Cli, command: &StorageCommands) -> Result<()> {
    let storage = open_storage(&cli.load_config()?)?;

    match command {
        StorageCommands::List => {
            let entries = storage.read(StorageScope::Local);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("{}", "(empty)".dimmed());
            } else {
                for (key, value) in &entries {
                    println!("{} = {}", key.cyan(), value);
                }
            }
        }
        StorageCommands::Get { key } => {
            let value = storage.read(StorageScope::Local).remove(key);
            if cli.json {
                println!("{}", serde_json::json!({ "key": key, "value": value }));
            } else {
                match value {
                    Some(v) => println!("{}", v),
                    None => println!("{}", "(not set)".dimmed()),
                }
            }
        }
        StorageCommands::Set { key, value } => {
            storage.write(StorageScope::Local, StorageAction::Set, Some(key), Some(value))?;
            if cli.json {
                println!("{}", serde_json::json!({ "key": key, "value": value }));
            } else {
                println!("{} Set {} = {}", "✓".green(), key, value);
            }
        }
        StorageCommands::Remove { key } => {
            storage.write(StorageScope::Local, StorageAction::Remove, Some(key), None)?;
            if cli.json {
                println!("{}", serde_json::json!({ "removed": key }));
            } else {
                println!("{} Removed {}", "✓".green(), key);
            }
        }
        StorageCommands::Clear => {
            storage.write(StorageScope::Local, StorageAction::Clear, None, None)?;
            if cli.json {
                println!("{}", serde_json::json!({ "status": "cleared" }));
            } else {
                println!("{} localStorage cleared", "✓".green());
            }
        }
    }

    Ok(())
}
