//! Per-identity key store
//!
//! Keys are cached in memory for the life of the process. When a key
//! directory is configured, `<key_dir>/<identity>.key` holds the base64 key:
//! it is read on a cache miss and written whenever a key is generated or
//! installed. File problems are logged, never fatal.

use burrow_transport::TunnelKey;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct KeyStore {
    keys: DashMap<String, TunnelKey>,
    key_dir: Option<PathBuf>,
}

impl KeyStore {
    /// In-memory only store
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_dir(key_dir: impl Into<PathBuf>) -> Self {
        Self {
            keys: DashMap::new(),
            key_dir: Some(key_dir.into()),
        }
    }

    pub fn key_dir(&self) -> Option<&Path> {
        self.key_dir.as_deref()
    }

    /// Returns the key for `identity`, loading or generating it on first use.
    ///
    /// A miss touches the key file from the calling thread. Async callers
    /// provision up front with [`KeyStore::provision`] so this stays a
    /// cache lookup.
    pub fn get(&self, identity: &str) -> TunnelKey {
        if let Some(key) = self.keys.get(identity) {
            return key.clone();
        }
        let path = self.key_path(identity);
        let loaded = path.as_deref().and_then(load_key);
        let generated = loaded.is_none();
        let (key, inserted) = self.insert_if_absent(identity, loaded);
        if inserted && generated {
            if let Some(path) = path {
                persist_key(identity, &path, &key);
            }
        }
        key
    }

    /// Loads or generates the key for `identity`, with file access on the
    /// blocking pool.
    pub async fn provision(&self, identity: &str) -> TunnelKey {
        if let Some(key) = self.keys.get(identity) {
            return key.clone();
        }
        let path = self.key_path(identity);
        let lookup = path.clone();
        let loaded = tokio::task::spawn_blocking(move || lookup.as_deref().and_then(load_key))
            .await
            .unwrap_or_else(|e| {
                warn!(identity = %identity, error = %e, "Key file lookup task failed");
                None
            });
        let generated = loaded.is_none();
        let (key, inserted) = self.insert_if_absent(identity, loaded);

        if let (true, true, Some(path)) = (inserted, generated, path) {
            let (identity, persisted) = (identity.to_string(), key.clone());
            if let Err(e) =
                tokio::task::spawn_blocking(move || persist_key(&identity, &path, &persisted)).await
            {
                warn!(error = %e, "Key file write task failed");
            }
        }
        key
    }

    /// Caches `loaded`, or a new key, unless a concurrent miss got there
    /// first. Returns the cached key and whether this call inserted it.
    /// The shard lock is released before returning.
    fn insert_if_absent(&self, identity: &str, loaded: Option<TunnelKey>) -> (TunnelKey, bool) {
        match self.keys.entry(identity.to_string()) {
            Entry::Occupied(existing) => (existing.get().clone(), false),
            Entry::Vacant(slot) => {
                match &loaded {
                    Some(_) => debug!(identity = %identity, "Loaded tunnel key from disk"),
                    None => info!(identity = %identity, "Generated new tunnel key"),
                }
                let key = slot.insert(loaded.unwrap_or_else(TunnelKey::generate)).clone();
                (key, true)
            }
        }
    }

    /// Installs a known key, replacing any cached one.
    pub fn set(&self, identity: &str, key: TunnelKey) {
        if let Some(path) = self.key_path(identity) {
            persist_key(identity, &path, &key);
        }
        self.keys.insert(identity.to_string(), key);
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.keys.contains_key(identity)
    }

    /// Drops the cached key. The key file is left in place.
    pub fn forget(&self, identity: &str) {
        self.keys.remove(identity);
    }

    fn key_path(&self, identity: &str) -> Option<PathBuf> {
        let dir = self.key_dir.as_ref()?;
        let safe = !identity.is_empty()
            && identity != "."
            && identity != ".."
            && !identity.contains(&['/', '\\'][..]);
        if !safe {
            warn!(identity = %identity, "Identity is not usable as a key file name");
            return None;
        }
        Some(dir.join(format!("{identity}.key")))
    }
}

fn load_key(path: &Path) -> Option<TunnelKey> {
    let contents = std::fs::read_to_string(path).ok()?;
    match TunnelKey::from_base64(&contents) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring invalid key file");
            None
        }
    }
}

fn persist_key(identity: &str, path: &Path, key: &TunnelKey) {
    let result = path
        .parent()
        .map(std::fs::create_dir_all)
        .unwrap_or(Ok(()))
        .and_then(|_| std::fs::write(path, key.to_base64()));
    if let Err(e) = result {
        warn!(
            identity = %identity,
            path = %path.display(),
            error = %e,
            "Failed to persist tunnel key, keeping it in memory only"
        );
    }
}
