use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use std::{fmt, fs};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CacheConfig;
use crate::key::CacheKey;

/// A contained storage-layer failure.
///
/// These never reach callers of the coordinator. They are logged at the point
/// of containment and degrade to a cache miss, costing latency rather than
/// correctness.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record could not be de/serialized.
    #[error("record serialization failed")]
    Serialization(#[from] serde_json::Error),
    /// Reading or writing the record file failed.
    #[error("record io failed")]
    Io(#[from] io::Error),
    /// The temp file could not be moved into its final location.
    #[error("record could not be persisted")]
    Persist(#[from] tempfile::PersistError),
}

/// The durable shape of one cached value.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedRecord<T> {
    value: T,
    /// Milliseconds since the Unix epoch at which the fetch settled.
    timestamp: u64,
}

/// Durable storage for fetch results, surviving process restarts.
///
/// Records live as JSON files under `<cache_dir>/records/`, one per cache
/// key, at the path given by [`CacheKey::record_path`]. A record is valid
/// only while `now - timestamp < ttl`; expired and malformed records are
/// deleted by the read that finds them rather than by a background sweep.
///
/// Writes go through a temp file in a sibling directory and are moved into
/// place atomically, so a crashed writer never leaves a half-written record
/// behind. All writes are best-effort: failures are logged and contained.
///
/// With no `cache_dir` configured, every read is a miss and every write is
/// dropped. Nothing errors.
pub struct PersistentStore {
    records_dir: Option<PathBuf>,
    tmp_dir: Option<PathBuf>,
    max_record_age: Duration,
}

impl fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentStore")
            .field("records_dir", &self.records_dir)
            .field("max_record_age", &self.max_record_age)
            .finish()
    }
}

impl PersistentStore {
    /// Creates the store, creating its directories if a `cache_dir` is
    /// configured.
    pub fn new(config: &CacheConfig) -> io::Result<Self> {
        let records_dir = config.cache_dir.as_ref().map(|dir| dir.join("records"));
        let tmp_dir = config.cache_dir.as_ref().map(|dir| dir.join("tmp"));

        if let Some(dir) = &records_dir {
            fs::create_dir_all(dir)?;
        }
        if let Some(dir) = &tmp_dir {
            fs::create_dir_all(dir)?;
        }

        Ok(Self {
            records_dir,
            tmp_dir,
            max_record_age: config.max_record_age,
        })
    }

    /// Reads the record for `key` if it is present and fresh under `ttl`.
    ///
    /// Returns the value together with the instant its fetch originally
    /// settled. A stale or malformed record is removed on the spot and
    /// reported as a miss, as is any read failure.
    pub fn read<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
        ttl: Duration,
    ) -> Option<(T, SystemTime)> {
        let path = self.record_path(key)?;

        let source = match catch_not_found(|| fs::read_to_string(&path)) {
            Ok(Some(source)) => source,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    key = %key,
                    "failed to read cache record",
                );
                return None;
            }
        };

        let record: PersistedRecord<T> = match serde_json::from_str(&source) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    key = %key,
                    "removing malformed cache record",
                );
                self.remove(key);
                return None;
            }
        };

        let stored_at = UNIX_EPOCH + Duration::from_millis(record.timestamp);
        let age = SystemTime::now()
            .duration_since(stored_at)
            .unwrap_or_default();
        if age >= ttl {
            tracing::trace!(key = %key, ?age, "evicting stale cache record");
            self.remove(key);
            return None;
        }

        Some((record.value, stored_at))
    }

    /// Writes the record for `key`, overwriting any previous one.
    ///
    /// The error is returned for the caller to log; persistence is an
    /// optimization, never a correctness requirement, so callers must not
    /// propagate it further.
    pub fn write<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        timestamp: SystemTime,
    ) -> Result<(), StoreError> {
        let (Some(path), Some(tmp_dir)) = (self.record_path(key), self.tmp_dir.as_deref()) else {
            // Storage is disabled; dropping the write is the contract.
            return Ok(());
        };

        let record = PersistedRecord {
            value,
            timestamp: unix_millis(timestamp),
        };
        let buf = serde_json::to_vec(&record)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut temp_file = tempfile::Builder::new().prefix("tmp").tempfile_in(tmp_dir)?;
        temp_file.write_all(&buf)?;
        temp_file.persist(&path)?;

        tracing::trace!(key = %key, path = %path.display(), "persisted cache record");
        Ok(())
    }

    /// Removes the record for `key`, if any.
    pub fn remove(&self, key: &CacheKey) {
        let Some(path) = self.record_path(key) else {
            return;
        };
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    key = %key,
                    "failed to remove cache record",
                );
            }
        }
    }

    /// Sweeps the record directory, removing records older than the
    /// configured retention as well as unparsable record files.
    ///
    /// Intended for the surrounding application's scheduled cleanup job.
    pub fn cleanup(&self) -> anyhow::Result<CleanupStats> {
        let Some(records_dir) = &self.records_dir else {
            return Ok(CleanupStats::default());
        };

        let mut stats = CleanupStats::default();
        for version_dir in fs::read_dir(records_dir)? {
            let version_dir = version_dir?.path();
            if !version_dir.is_dir() {
                continue;
            }
            for fan_dir in fs::read_dir(&version_dir)? {
                let fan_dir = fan_dir?.path();
                if !fan_dir.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(&fan_dir)? {
                    let path = entry?.path();
                    if self.should_remove(&path) {
                        match fs::remove_file(&path) {
                            Ok(()) => stats.removed += 1,
                            Err(err) => tracing::warn!(
                                error = &err as &dyn std::error::Error,
                                path = %path.display(),
                                "failed to remove cache record",
                            ),
                        }
                    } else {
                        stats.retained += 1;
                    }
                }
                // only succeeds once the fanout directory is empty
                let _ = fs::remove_dir(&fan_dir);
            }
        }

        tracing::debug!(removed = stats.removed, retained = stats.retained, "cache sweep done");
        Ok(stats)
    }

    fn should_remove(&self, path: &Path) -> bool {
        #[derive(Deserialize)]
        struct RecordHead {
            timestamp: u64,
        }

        let Ok(source) = fs::read_to_string(path) else {
            return true;
        };
        let Ok(head) = serde_json::from_str::<RecordHead>(&source) else {
            tracing::warn!(path = %path.display(), "removing unparsable cache record");
            return true;
        };

        let stored_at = UNIX_EPOCH + Duration::from_millis(head.timestamp);
        let age = SystemTime::now()
            .duration_since(stored_at)
            .unwrap_or_default();
        age >= self.max_record_age
    }

    fn record_path(&self, key: &CacheKey) -> Option<PathBuf> {
        self.records_dir.as_ref().map(|dir| dir.join(key.record_path()))
    }
}

/// Counters reported by [`PersistentStore::cleanup`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    /// Number of records removed by the sweep.
    pub removed: usize,
    /// Number of records still within retention.
    pub retained: usize,
}

fn unix_millis(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn store_in(dir: &Path) -> PersistentStore {
        let config = CacheConfig {
            cache_dir: Some(dir.to_path_buf()),
            ..Default::default()
        };
        PersistentStore::new(&config).unwrap()
    }

    #[test]
    fn test_fresh_record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let key = CacheKey::new("menu:current");

        let written_at = SystemTime::now() - Duration::from_secs(10);
        store.write(&key, &vec![1u32, 2, 3], written_at).unwrap();

        let (value, stored_at) = store.read::<Vec<u32>>(&key, TTL).unwrap();
        assert_eq!(value, vec![1, 2, 3]);
        // the original timestamp survives, millisecond-truncated
        let drift = written_at.duration_since(stored_at).unwrap();
        assert!(drift < Duration::from_millis(1));
    }

    #[test]
    fn test_stale_record_evicted_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let key = CacheKey::new("menu:current");

        store
            .write(&key, &7u64, SystemTime::now() - (TTL + Duration::from_secs(1)))
            .unwrap();

        let path = store.record_path(&key).unwrap();
        assert!(path.exists());
        assert!(store.read::<u64>(&key, TTL).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_malformed_record_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let key = CacheKey::new("menu:current");

        let path = store.record_path(&key).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{ not json").unwrap();

        assert!(store.read::<u64>(&key, TTL).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_overwrite_replaces_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let key = CacheKey::new("menu:current");

        store.write(&key, &1u64, SystemTime::now()).unwrap();
        store.write(&key, &2u64, SystemTime::now()).unwrap();

        let (value, _) = store.read::<u64>(&key, TTL).unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn test_blocked_write_returns_the_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let key = CacheKey::new("menu:current");

        // a directory squatting on the record path makes the final rename fail
        let path = store.record_path(&key).unwrap();
        fs::create_dir_all(&path).unwrap();

        assert!(matches!(
            store.write(&key, &1u64, SystemTime::now()),
            Err(StoreError::Persist(_))
        ));
    }

    #[test]
    fn test_disabled_store_is_a_noop() {
        let store = PersistentStore::new(&CacheConfig::default()).unwrap();
        let key = CacheKey::new("menu:current");

        store.write(&key, &1u64, SystemTime::now()).unwrap();
        assert!(store.read::<u64>(&key, TTL).is_none());
        store.remove(&key);
        assert_eq!(store.cleanup().unwrap(), CleanupStats::default());
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Menu {
        date: DateTime<Utc>,
        dishes: Vec<Dish>,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Dish {
        name: String,
        added_at: DateTime<Utc>,
    }

    #[test]
    fn test_date_fields_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let key = CacheKey::new("menu:current");

        let menu = Menu {
            date: Utc.with_ymd_and_hms(2024, 1, 1, 11, 30, 0).unwrap(),
            dishes: vec![Dish {
                name: "Käsespätzle".into(),
                added_at: Utc.with_ymd_and_hms(2023, 12, 24, 8, 15, 30).unwrap(),
            }],
        };
        store.write(&key, &menu, SystemTime::now()).unwrap();

        // on disk, dates are plain RFC 3339 text
        let raw = fs::read_to_string(store.record_path(&key).unwrap()).unwrap();
        let raw: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(raw["value"]["date"], "2024-01-01T11:30:00Z");
        assert_eq!(
            raw["value"]["dishes"][0]["added_at"],
            "2023-12-24T08:15:30Z"
        );

        // reading revives them into real date values, nested ones included
        let (read, _) = store.read::<Menu>(&key, TTL).unwrap();
        assert_eq!(read, menu);
    }

    #[test]
    fn test_cleanup_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            cache_dir: Some(dir.path().to_path_buf()),
            max_record_age: Duration::from_secs(3600),
            ..Default::default()
        };
        let store = PersistentStore::new(&config).unwrap();

        let keep = CacheKey::new("keepthis");
        let kill = CacheKey::new("killthis");
        store.write(&keep, &1u64, SystemTime::now()).unwrap();
        store
            .write(&kill, &2u64, SystemTime::now() - Duration::from_secs(7200))
            .unwrap();

        // an unparsable stray also gets removed
        let stray = store.record_path(&CacheKey::new("stray")).unwrap();
        fs::create_dir_all(stray.parent().unwrap()).unwrap();
        fs::write(&stray, b"junk").unwrap();

        let stats = store.cleanup().unwrap();
        assert_eq!(
            stats,
            CleanupStats {
                removed: 2,
                retained: 1
            }
        );
        assert!(store.record_path(&keep).unwrap().exists());
        assert!(!store.record_path(&kill).unwrap().exists());
        assert!(!stray.exists());
    }
}
