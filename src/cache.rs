//! On-disk result cache for read-type remote calls.
//!
//! One JSON file per key. Entries are written only after a successful live
//! call and read only while offline; the sole eviction is the age-based
//! purge driven by file modification time.

use std::{
    fmt::Debug,
    fs, io,
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime},
};

use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

const ENTRY_EXTENSION: &str = "json";
const STAGING_EXTENSION: &str = "tmp";
/// Staging files older than this belong to a write that never finished.
const STAGING_GRACE: Duration = Duration::from_secs(10 * 60);

static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cache entry {path} could not be encoded or decoded: {source}")]
    Codec {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Deterministic key derived from a call name and its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hashes `name` plus the JSON form of `args`, falling back to the debug
    /// form when `args` cannot be serialized.
    ///
    /// The fallback is only as stable as the `Debug` output of `args`. Hash
    /// containers print in iteration order, so arguments with non-string map
    /// keys should use ordered containers such as `BTreeMap`.
    pub fn for_call<A>(name: &str, args: &A) -> Self
    where
        A: Serialize + Debug + ?Sized,
    {
        let params = match serde_json::to_string(args) {
            Ok(json) => json,
            Err(_) => format!("{args:?}"),
        };
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update(params.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Value produced by a cache-wrapped call.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    /// Returned by the live call (and written through to disk).
    Live(T),
    /// Read from disk while offline.
    Cached(T),
    /// Offline and nothing stored for this key.
    Missing,
}

impl<T> Fetched<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Fetched::Live(value) | Fetched::Cached(value) => Some(value),
            Fetched::Missing => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Fetched::Missing)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
        match self {
            Fetched::Live(value) => Fetched::Live(f(value)),
            Fetched::Cached(value) => Fetched::Cached(f(value)),
            Fetched::Missing => Fetched::Missing,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: usize,
    pub kept: usize,
    /// Abandoned staging files swept alongside the entries.
    pub staging: usize,
}

#[derive(Debug, Clone)]
pub struct ResultCache {
    dir: PathBuf,
}

impl ResultCache {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.{ENTRY_EXTENSION}", key.as_str()))
    }

    /// Overwrites the entry for `key`. Concurrent writers race; the last
    /// rename wins.
    pub fn store<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        let payload = serde_json::to_vec(value).map_err(|source| CacheError::Codec {
            path: path.clone(),
            source,
        })?;
        let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
        let staging = self
            .dir
            .join(format!("{}.{}-{seq}.{STAGING_EXTENSION}", key.as_str(), process::id()));
        fs::write(&staging, payload)
            .and_then(|()| fs::rename(&staging, &path))
            .map_err(|source| {
                let _ = fs::remove_file(&staging);
                CacheError::Io {
                    path: path.clone(),
                    source,
                }
            })
    }

    pub fn load<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>, CacheError> {
        let path = self.entry_path(key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| CacheError::Codec { path, source })
    }

    /// Removes entries whose file is older than `max_age`, plus staging
    /// files left behind by interrupted writes.
    pub fn purge_older_than(&self, max_age: Duration) -> Result<PurgeReport, CacheError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| CacheError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let now = SystemTime::now();
        let mut report = PurgeReport::default();

        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            let staging = match path.extension().and_then(|ext| ext.to_str()) {
                Some(ENTRY_EXTENSION) => false,
                Some(STAGING_EXTENSION) => true,
                _ => continue,
            };
            let modified = match entry.metadata().and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "cannot read cache entry age");
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if staging {
                if age <= STAGING_GRACE {
                    continue;
                }
            } else if age <= max_age {
                report.kept += 1;
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) if staging => report.staging += 1,
                Ok(()) => report.removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to purge cache entry")
                }
            }
        }

        debug!(
            removed = report.removed,
            kept = report.kept,
            staging = report.staging,
            "cache purge finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs::File;

    #[test]
    fn key_is_content_based() {
        let a = CacheKey::for_call("get_launchers", &(3, Some(9)));
        let b = CacheKey::for_call("get_launchers", &(3, Some(9)));
        let c = CacheKey::for_call("get_launchers", &(3, None::<i64>));
        let d = CacheKey::for_call("get_tasks", &(3, Some(9)));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn key_falls_back_for_unserializable_args() {
        use std::collections::BTreeMap;
        let mut first = BTreeMap::new();
        first.insert((1, 2), "tuple keys are not valid JSON object keys");
        first.insert((3, 4), "nor are these");
        let mut second = BTreeMap::new();
        second.insert((3, 4), "nor are these");
        second.insert((1, 2), "tuple keys are not valid JSON object keys");
        assert!(serde_json::to_string(&first).is_err());

        let key = CacheKey::for_call("odd", &first);
        assert_eq!(key, CacheKey::for_call("odd", &second));
        second.insert((5, 6), "more");
        assert_ne!(key, CacheKey::for_call("odd", &second));
    }

    #[test]
    fn store_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path().join("cache")).unwrap();
        let key = CacheKey::for_call("get_projects", &());
        let value = json!([{"id": 1, "name": "alpha"}]);

        cache.store(&key, &value).unwrap();
        let loaded: Option<serde_json::Value> = cache.load(&key).unwrap();
        assert_eq!(loaded, Some(value));
    }

    #[test]
    fn load_of_unknown_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let loaded: Option<serde_json::Value> =
            cache.load(&CacheKey::for_call("never", &())).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn purge_removes_only_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let fresh = CacheKey::for_call("fresh", &());
        let stale = CacheKey::for_call("stale", &());
        cache.store(&fresh, &1).unwrap();
        cache.store(&stale, &2).unwrap();

        let eight_days_ago = SystemTime::now() - Duration::from_secs(8 * 86_400);
        File::options()
            .write(true)
            .open(cache.entry_path(&stale))
            .unwrap()
            .set_modified(eight_days_ago)
            .unwrap();

        let report = cache
            .purge_older_than(Duration::from_secs(7 * 86_400))
            .unwrap();
        assert_eq!(
            report,
            PurgeReport {
                removed: 1,
                kept: 1,
                staging: 0
            }
        );
        assert!(cache.entry_path(&fresh).exists());
        assert!(!cache.entry_path(&stale).exists());
    }

    #[test]
    fn purge_sweeps_abandoned_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let abandoned = dir.path().join("deadbeef.1-0.tmp");
        let in_flight = dir.path().join("deadbeef.1-1.tmp");
        fs::write(&abandoned, b"{").unwrap();
        fs::write(&in_flight, b"{").unwrap();
        File::options()
            .write(true)
            .open(&abandoned)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        let report = cache
            .purge_older_than(Duration::from_secs(7 * 86_400))
            .unwrap();
        assert_eq!(report.staging, 1);
        assert_eq!(report.removed, 0);
        assert!(!abandoned.exists());
        assert!(in_flight.exists());
    }

    #[test]
    fn fetched_helpers() {
        assert_eq!(Fetched::Live(2).map(|v| v * 2).into_option(), Some(4));
        assert!(Fetched::<i32>::Missing.is_missing());
        assert_eq!(Fetched::Cached("x").into_option(), Some("x"));
    }
}
