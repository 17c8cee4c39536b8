//! On-disk artifact cache keyed by deterministic content fingerprints.
//!
//! Each use-site owns one subdirectory under `$ROOT_PATH/data` and one
//! payload type. Entries are immutable once written; a rewrite replaces the
//! file atomically via a same-directory rename. There is no eviction; the
//! disk is authoritative.

use std::fs;
use std::marker::PhantomData;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use canopy_utils::{Error, Result};

/// One serialized cache entry as stored on disk.
#[derive(Serialize, Deserialize)]
struct CacheEntry<T> {
    data: T,
    created_at: DateTime<Utc>,
    checksum: String,
}

/// A typed file cache rooted at a use-site subdirectory.
pub struct FileCache<T> {
    cache_dir: PathBuf,
    _payload: PhantomData<T>,
}

impl<T> FileCache<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Cache for a use-site subdirectory under `$ROOT_PATH/data`.
    pub fn new(sub_dir: &str) -> Self {
        Self::at(PathBuf::from(canopy_utils::properties::data_path(sub_dir)))
    }

    /// Cache rooted at an explicit directory.
    pub fn at(cache_dir: PathBuf) -> Self {
        FileCache {
            cache_dir,
            _payload: PhantomData,
        }
    }

    /// Hex SHA-1 digest of the ordered, delimited rendering of `parts`.
    pub fn generate_key<S: AsRef<str>>(&self, parts: &[S]) -> String {
        let mut key_data = String::new();
        for part in parts {
            key_data.push_str(part.as_ref());
            key_data.push('_');
        }
        let mut hasher = Sha1::new();
        hasher.update(key_data.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns the payload iff the entry exists, deserializes cleanly and
    /// its stored checksum matches a freshly computed one. Any other
    /// condition is a miss.
    pub fn get(&self, key: &str) -> Option<T> {
        let cache_file = self.cache_dir.join(format!("{key}.json"));
        let raw = fs::read(&cache_file).ok()?;
        let entry: CacheEntry<T> = serde_json::from_slice(&raw).ok()?;

        let expected = checksum(&entry.data)?;
        if entry.checksum != expected {
            warn!("checksum mismatch for cache key {key}, treating as miss");
            return None;
        }
        Some(entry.data)
    }

    /// Serialize `{data, now, checksum}` to a sibling temp file and rename
    /// it over the final name.
    pub fn set(&self, key: &str, data: T) -> Result<()> {
        fs::create_dir_all(&self.cache_dir)?;

        let checksum = checksum(&data)
            .ok_or_else(|| Error::Schema(format!("failed to serialize cache entry {key}")))?;
        let entry = CacheEntry {
            data,
            created_at: Utc::now(),
            checksum,
        };
        let json_data = serde_json::to_vec(&entry)?;

        let cache_file = self.cache_dir.join(format!("{key}.json"));
        let tmp_file = self.cache_dir.join(format!("{key}.json.tmp"));

        fs::write(&tmp_file, &json_data)?;
        if let Err(e) = fs::rename(&tmp_file, &cache_file) {
            let _ = fs::remove_file(&tmp_file);
            return Err(Error::Io(std::io::Error::new(
                e.kind(),
                format!("cache write failed for key {key}: {e}"),
            )));
        }
        Ok(())
    }
}

/// Hex md5 of the payload's JSON rendering.
fn checksum<T: Serialize>(data: &T) -> Option<String> {
    let json_data = serde_json::to_vec(data).ok()?;
    Some(hex::encode(md5::compute(&json_data).0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        values: Vec<f64>,
    }

    fn sample() -> Payload {
        Payload {
            name: "plot-7".to_string(),
            values: vec![0.25, -0.5, 1.0],
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache: FileCache<Payload> = FileCache::at(dir.path().to_path_buf());
        let key = cache.generate_key(&["plot-7", "2024-01-01", "2024-02-01"]);

        assert!(cache.get(&key).is_none());
        cache.set(&key, sample()).unwrap();
        assert_eq!(cache.get(&key), Some(sample()));
    }

    #[test]
    fn test_key_is_deterministic_and_order_sensitive() {
        let dir = TempDir::new().unwrap();
        let cache: FileCache<Payload> = FileCache::at(dir.path().to_path_buf());
        let a = cache.generate_key(&["x", "y"]);
        let b = cache.generate_key(&["x", "y"]);
        let c = cache.generate_key(&["y", "x"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn test_tampered_payload_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache: FileCache<Payload> = FileCache::at(dir.path().to_path_buf());
        let key = cache.generate_key(&["tamper"]);
        cache.set(&key, sample()).unwrap();

        let file = dir.path().join(format!("{key}.json"));
        let contents = std::fs::read_to_string(&file).unwrap();
        // Flip one byte inside the stored payload.
        let tampered = contents.replace("plot-7", "plot-8");
        assert_ne!(contents, tampered);
        std::fs::write(&file, tampered).unwrap();

        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_corrupt_json_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache: FileCache<Payload> = FileCache::at(dir.path().to_path_buf());
        let key = cache.generate_key(&["corrupt"]);
        cache.set(&key, sample()).unwrap();

        let file = dir.path().join(format!("{key}.json"));
        std::fs::write(&file, b"{not json").unwrap();
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_rewrite_replaces_entry() {
        let dir = TempDir::new().unwrap();
        let cache: FileCache<Payload> = FileCache::at(dir.path().to_path_buf());
        let key = cache.generate_key(&["rewrite"]);
        cache.set(&key, sample()).unwrap();

        let mut updated = sample();
        updated.values.push(2.0);
        cache.set(&key, updated.clone()).unwrap();
        assert_eq!(cache.get(&key), Some(updated));
    }
}
