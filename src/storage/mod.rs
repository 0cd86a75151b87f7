//! Durable and ephemeral browser storage for the embedded frame.
//!
//! The frame runs sandboxed, so its own cookies and `localStorage` do not
//! survive a reload. Everything here is owned by a [`StorageBridge`] and
//! reached through the relay.

mod bridge;
mod cookie;
mod kv;

pub use bridge::{StorageAction, StorageBridge};
pub use cookie::{Cookie, CookieStore};
pub use kv::KeyValueStore;

use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// Which storage area a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageScope {
    /// `localStorage`: persisted to disk
    Local,
    /// `sessionStorage`: process lifetime only
    Session,
}

impl StorageScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageScope::Local => "local",
            StorageScope::Session => "session",
        }
    }
}

impl std::str::FromStr for StorageScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(StorageScope::Local),
            "session" => Ok(StorageScope::Session),
            other => Err(format!("unknown storage scope '{}' (expected local or session)", other)),
        }
    }
}

/// Write a file by writing a sibling temp file and renaming it over the target.
fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Lock a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_parses_case_insensitively() {
        assert_eq!("LOCAL".parse::<StorageScope>(), Ok(StorageScope::Local));
        assert_eq!(" session ".parse::<StorageScope>(), Ok(StorageScope::Session));
        assert!("cookies".parse::<StorageScope>().is_err());
    }

    #[test]
    fn write_atomic_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.json");

        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }
}
