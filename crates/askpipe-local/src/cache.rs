use askpipe_core::{Error, FetchedPage, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) fn now_epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedPage {
    schema_version: u32,
    fetched_at_epoch_s: u64,
    page: FetchedPage,
}

/// On-disk cache of extracted pages, one JSON file per URL.
#[derive(Debug, Clone)]
pub struct PageCache {
    root: PathBuf,
    ttl_s: Option<u64>,
}

impl PageCache {
    pub fn new(root: PathBuf, ttl_s: Option<u64>) -> Self {
        Self { root, ttl_s }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn key_for(url: &str) -> String {
        let mut h = Sha256::new();
        h.update(b"page:v1\n");
        h.update(url.trim().as_bytes());
        hex::encode(h.finalize())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root
            .join(&key[0..2])
            .join(&key[2..4])
            .join(format!("{key}.json"))
    }

    /// Cache-only lookup. Expired or unreadable entries are a miss.
    pub fn get(&self, url: &str) -> Result<Option<FetchedPage>> {
        let p = self.path_for(&Self::key_for(url));
        if !p.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&p).map_err(|e| Error::Fetch(format!("page cache read: {e}")))?;
        let Ok(entry) = serde_json::from_slice::<CachedPage>(&bytes) else {
            return Ok(None);
        };
        if let Some(ttl_s) = self.ttl_s {
            if now_epoch_s().saturating_sub(entry.fetched_at_epoch_s) > ttl_s {
                return Ok(None);
            }
        }
        Ok(Some(entry.page))
    }

    pub fn put(&self, page: &FetchedPage) -> Result<()> {
        let p = self.path_for(&Self::key_for(&page.url));
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Fetch(format!("page cache mkdir: {e}")))?;
        }
        let entry = CachedPage {
            schema_version: 1,
            fetched_at_epoch_s: now_epoch_s(),
            page: page.clone(),
        };
        let bytes = serde_json::to_vec(&entry).map_err(|e| Error::Fetch(e.to_string()))?;
        fs::write(&p, bytes).map_err(|e| Error::Fetch(format!("page cache write: {e}")))?;
        Ok(())
    }
}
