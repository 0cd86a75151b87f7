use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{lock, Cookie, CookieStore, KeyValueStore, StorageScope};
use crate::error::{DevframeError, Result};

const COOKIES_FILE: &str = "cookies.json";
const LOCAL_STORAGE_FILE: &str = "local_storage.json";

/// Mutation requested by a `storageUpdate` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageAction {
    Set,
    Remove,
    Clear,
}

/// Owner of every store the frame can reach: the cookie jar, durable
/// `localStorage` and in-memory `sessionStorage`.
///
/// Each store has its own lock so a cookie write never waits on a
/// `localStorage` flush. Persistence failures are logged and the in-memory
/// state stays authoritative.
#[derive(Debug)]
pub struct StorageBridge {
    dir: PathBuf,
    cookies: Mutex<CookieStore>,
    local: Mutex<KeyValueStore>,
    session: Mutex<KeyValueStore>,
}

impl StorageBridge {
    /// Open (or create) the storage directory and load its snapshots.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            DevframeError::PersistenceFailure(format!("{}: {}", dir.display(), e))
        })?;

        let cookies = CookieStore::load(dir.join(COOKIES_FILE));
        let local = KeyValueStore::durable(dir.join(LOCAL_STORAGE_FILE));
        tracing::debug!(
            "Opened storage at {} ({} cookies, {} local keys)",
            dir.display(),
            cookies.len(),
            local.len()
        );

        Ok(Self {
            dir,
            cookies: Mutex::new(cookies),
            local: Mutex::new(local),
            session: Mutex::new(KeyValueStore::ephemeral()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn scope(&self, scope: StorageScope) -> &Mutex<KeyValueStore> {
        match scope {
            StorageScope::Local => &self.local,
            StorageScope::Session => &self.session,
        }
    }

    /// Full contents of one scope.
    pub fn read(&self, scope: StorageScope) -> BTreeMap<String, String> {
        lock(self.scope(scope)).snapshot()
    }

    /// Apply one mutation and return the scope's contents afterwards.
    pub fn write(
        &self,
        scope: StorageScope,
        action: StorageAction,
        key: Option<&str>,
        value: Option<&str>,
    ) -> Result<BTreeMap<String, String>> {
        let mut store = lock(self.scope(scope));

        match (action, key, value) {
            (StorageAction::Set, Some(key), Some(value)) => store.set(key, value),
            (StorageAction::Set, _, _) => {
                return Err(DevframeError::MalformedMessage(
                    "storage set needs a key and a value".to_string(),
                ))
            }
            (StorageAction::Remove, Some(key), _) => {
                store.remove(key);
            }
            (StorageAction::Remove, None, _) => {
                return Err(DevframeError::MalformedMessage(
                    "storage remove needs a key".to_string(),
                ))
            }
            (StorageAction::Clear, _, _) => store.clear(),
        }

        if let Err(e) = store.persist() {
            tracing::warn!("{} storage not saved: {}", scope.as_str(), e);
        }

        Ok(store.snapshot())
    }

    /// `Cookie` header value for a request to `url`.
    pub fn cookies_for(&self, url: &Url) -> String {
        lock(&self.cookies).header_for(url, Utc::now())
    }

    /// Store one `Set-Cookie` value received from `url`.
    pub fn ingest(&self, set_cookie: &str, url: &Url) -> bool {
        let mut jar = lock(&self.cookies);
        let changed = jar.ingest(set_cookie, url, Utc::now());
        if changed {
            if let Err(e) = jar.persist() {
                tracing::warn!("Cookie jar not saved: {}", e);
            }
        }
        changed
    }

    /// Insert a fully built cookie, as the `cookies set` command does.
    pub fn put_cookie(&self, cookie: Cookie) -> Result<()> {
        let mut jar = lock(&self.cookies);
        jar.insert(cookie, Utc::now());
        jar.persist()
    }

    /// All stored, unexpired cookies.
    pub fn cookies(&self) -> Vec<Cookie> {
        let mut jar = lock(&self.cookies);
        jar.purge_expired(Utc::now());
        jar.cookies().to_vec()
    }

    pub fn clear_cookies(&self) -> Result<()> {
        let mut jar = lock(&self.cookies);
        jar.clear();
        jar.persist()
    }

    /// Clear local and session storage. The cookie jar is left alone.
    pub fn clear_all(&self) {
        for scope in [StorageScope::Local, StorageScope::Session] {
            let mut store = lock(self.scope(scope));
            store.clear();
            if let Err(e) = store.persist() {
                tracing::warn!("{} storage not saved: {}", scope.as_str(), e);
            }
        }
    }
}
