//! URL-keyed persistent cache for downloaded archives.
//!
//! Entries live under `<base>/cache/downloads/` as
//! `<sha256(url)>.zip` files, indexed by a `registry.json` sidecar.
//! The cache key is the resolved download URL, typically pinned to a
//! commit SHA, so a hit is byte-identical to a re-download. Entries
//! are never evicted; a missing backing file invalidates its entry on
//! the next lookup.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const REGISTRY_FILE: &str = "registry.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    pub hash: String,
    pub file_path: PathBuf,
    pub size: u64,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DownloadCache {
    root: PathBuf,
}

impl DownloadCache {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            root: base_dir.join("cache").join("downloads"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Look up a cached download. Returns the cached bytes, or `None`
    /// when the URL is unknown or its backing file has been removed.
    pub fn lookup(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let mut registry = self.load_registry()?;
        let Some(entry) = registry.get(url) else {
            return Ok(None);
        };

        if !entry.file_path.exists() {
            log::debug!("dropping stale cache entry for {url}");
            registry.remove(url);
            self.save_registry(&registry)?;
            return Ok(None);
        }

        let data = fs::read(&entry.file_path)
            .with_context(|| format!("reading cached file {:?}", entry.file_path))?;
        Ok(Some(data))
    }

    /// Store downloaded bytes under their URL key.
    pub fn store(&self, url: &str, data: &[u8]) -> Result<CacheEntry> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating cache directory {:?}", self.root))?;

        let file_path = self.entry_path(url);
        fs::write(&file_path, data)
            .with_context(|| format!("writing cached file {:?}", file_path))?;

        let mut hasher = Sha256::new();
        hasher.update(data);
        let entry = CacheEntry {
            url: url.to_string(),
            hash: format!("{:x}", hasher.finalize()),
            file_path,
            size: data.len() as u64,
            cached_at: Utc::now(),
        };

        let mut registry = self.load_registry()?;
        registry.insert(url.to_string(), entry.clone());
        self.save_registry(&registry)?;

        Ok(entry)
    }

    fn entry_path(&self, url: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        self.root.join(format!("{:x}.zip", hasher.finalize()))
    }

    fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    fn load_registry(&self) -> Result<HashMap<String, CacheEntry>> {
        let path = self.registry_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let data =
            fs::read_to_string(&path).with_context(|| format!("reading cache registry {:?}", path))?;
        serde_json::from_str(&data).with_context(|| format!("parsing cache registry {:?}", path))
    }

    fn save_registry(&self, registry: &HashMap<String, CacheEntry>) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating cache directory {:?}", self.root))?;
        let data = serde_json::to_string_pretty(registry)?;
        fs::write(self.registry_path(), data).context("writing cache registry")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn store_then_lookup_round_trips() {
        let tmp = tempdir().unwrap();
        let cache = DownloadCache::new(tmp.path());

        let url = "https://github.com/o/r/archive/abc123.zip";
        let entry = cache.store(url, b"zipbytes").unwrap();
        assert_eq!(entry.size, 8);

        let data = cache.lookup(url).unwrap().expect("entry should exist");
        assert_eq!(data, b"zipbytes");
    }

    #[test]
    fn unknown_url_misses() {
        let tmp = tempdir().unwrap();
        let cache = DownloadCache::new(tmp.path());
        assert!(cache.lookup("https://nowhere.invalid/x.zip").unwrap().is_none());
    }

    #[test]
    fn missing_backing_file_invalidates_entry() {
        let tmp = tempdir().unwrap();
        let cache = DownloadCache::new(tmp.path());

        let url = "https://github.com/o/r/archive/def456.zip";
        let entry = cache.store(url, b"data").unwrap();
        fs::remove_file(&entry.file_path).unwrap();

        assert!(cache.lookup(url).unwrap().is_none());
        // The registry no longer lists the entry either.
        let registry = cache.load_registry().unwrap();
        assert!(!registry.contains_key(url));
    }
}
