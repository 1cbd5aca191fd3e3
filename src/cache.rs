use crate::config::IndicatorConfig;
use crate::error::CacheError;
use crate::indicators::IndicatorSet;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const INDICATOR_CACHE_VERSION: u32 = 1;
const CACHE_FILE_EXTENSION: &str = "bin";

/// Digest of everything that determines an indicator table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

#[derive(Serialize)]
struct KeyMaterial<'a> {
    symbol: &'a str,
    timeframe: &'a str,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    indicators: &'a IndicatorConfig,
}

impl CacheKey {
    pub fn new(
        symbol: &str,
        timeframe: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        config: &IndicatorConfig,
    ) -> Self {
        let material = KeyMaterial {
            symbol,
            timeframe,
            start,
            end,
            indicators: config,
        };
        let bytes = serde_json::to_vec(&material).unwrap_or_else(|_| {
            format!("{}|{}|{:?}|{:?}|{:?}", symbol, timeframe, start, end, config).into_bytes()
        });
        Self(blake3::hash(&bytes).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store for computed indicator tables. A failing cache never fails a
/// backtest: callers treat any error as a miss and recompute.
pub trait IndicatorCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<Arc<Vec<IndicatorSet>>>, CacheError>;

    fn put(&self, key: CacheKey, indicators: Arc<Vec<IndicatorSet>>) -> Result<(), CacheError>;

    fn clear(&self) -> Result<(), CacheError>;
}

/// Process-local cache shared across worker threads.
#[derive(Clone, Default)]
pub struct MemoryIndicatorCache {
    entries: Arc<DashMap<CacheKey, Arc<Vec<IndicatorSet>>>>,
}

impl MemoryIndicatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IndicatorCache for MemoryIndicatorCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Arc<Vec<IndicatorSet>>>, CacheError> {
        Ok(self.entries.get(key).map(|entry| Arc::clone(entry.value())))
    }

    fn put(&self, key: CacheKey, indicators: Arc<Vec<IndicatorSet>>) -> Result<(), CacheError> {
        self.entries.insert(key, indicators);
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.clear();
        Ok(())
    }
}

#[derive(Serialize)]
struct CacheEnvelopeRef<'a> {
    version: u32,
    key: &'a str,
    indicators: &'a [IndicatorSet],
}

#[derive(Deserialize)]
struct CacheEnvelope {
    version: u32,
    key: String,
    indicators: Vec<IndicatorSet>,
}

/// One bincode file per key under a directory. Survives across runs.
#[derive(Debug, Clone)]
pub struct FileIndicatorCache {
    dir: PathBuf,
}

impl FileIndicatorCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir
            .join(format!("{}.{}", key.as_str(), CACHE_FILE_EXTENSION))
    }
}

impl IndicatorCache for FileIndicatorCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Arc<Vec<IndicatorSet>>>, CacheError> {
        let path = self.entry_path(key);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let envelope: CacheEnvelope = bincode::deserialize_from(BufReader::new(file))
            .map_err(|err| CacheError::Decode(format!("{}: {}", path.display(), err)))?;

        if envelope.version != INDICATOR_CACHE_VERSION {
            log::debug!(
                "Ignoring stale cache entry {} (version {})",
                path.display(),
                envelope.version
            );
            return Ok(None);
        }
        if envelope.key != key.as_str() {
            return Err(CacheError::KeyMismatch {
                expected: key.as_str().to_string(),
                found: envelope.key,
            });
        }

        Ok(Some(Arc::new(envelope.indicators)))
    }

    fn put(&self, key: CacheKey, indicators: Arc<Vec<IndicatorSet>>) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)?;

        let path = self.entry_path(&key);
        let tmp_path = self.dir.join(format!(
            "{}.{}.tmp-{}",
            key.as_str(),
            CACHE_FILE_EXTENSION,
            uuid::Uuid::new_v4().simple()
        ));

        let envelope = CacheEnvelopeRef {
            version: INDICATOR_CACHE_VERSION,
            key: key.as_str(),
            indicators: indicators.as_slice(),
        };

        let write_result = (|| -> Result<(), CacheError> {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            bincode::serialize_into(&mut writer, &envelope)
                .map_err(|err| CacheError::Encode(err.to_string()))?;
            writer.flush()?;
            Ok(())
        })();

        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        // Readers only ever observe complete files
        fs::rename(&tmp_path, &path).map_err(|err| {
            let _ = fs::remove_file(&tmp_path);
            CacheError::Io(err)
        })
    }

    fn clear(&self) -> Result<(), CacheError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let path = entry?.path();
            let is_cache_file = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| {
                    name.ends_with(&format!(".{}", CACHE_FILE_EXTENSION))
                        || name.contains(&format!(".{}.tmp-", CACHE_FILE_EXTENSION))
                })
                .unwrap_or(false);
            if is_cache_file && path.is_file() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key_for(symbol: &str, config: &IndicatorConfig) -> CacheKey {
        CacheKey::new(
            symbol,
            "1h",
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
            config,
        )
    }

    fn table() -> Arc<Vec<IndicatorSet>> {
        Arc::new(vec![
            IndicatorSet::default(),
            IndicatorSet {
                ema_fast: Some(101.5),
                atr: Some(2.25),
                ..IndicatorSet::default()
            },
        ])
    }

    #[test]
    fn key_depends_on_every_component() {
        let config = IndicatorConfig::default();
        let base = key_for("AAA", &config);
        assert_eq!(base, key_for("AAA", &config));
        assert_eq!(base.as_str().len(), 64);
        assert_ne!(base, key_for("BBB", &config));

        let tweaked = IndicatorConfig {
            rsi_period: 7,
            ..IndicatorConfig::default()
        };
        assert_ne!(base, key_for("AAA", &tweaked));

        let other_timeframe = CacheKey::new("AAA", "1d", None, None, &config);
        assert_ne!(base, other_timeframe);
    }

    #[test]
    fn memory_cache_get_put_clear() {
        let cache = MemoryIndicatorCache::new();
        let key = key_for("AAA", &IndicatorConfig::default());
        assert!(cache.get(&key).unwrap().is_none());

        cache.put(key.clone(), table()).unwrap();
        assert_eq!(cache.get(&key).unwrap().as_deref(), Some(&*table()));
        assert_eq!(cache.len(), 1);

        cache.clear().unwrap();
        assert!(cache.is_empty());
        assert!(cache.get(&key).unwrap().is_none());
    }

    #[test]
    fn file_cache_persists_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let key = key_for("AAA", &IndicatorConfig::default());

        FileIndicatorCache::new(dir.path())
            .put(key.clone(), table())
            .unwrap();

        let reopened = FileIndicatorCache::new(dir.path());
        assert_eq!(reopened.get(&key).unwrap().as_deref(), Some(&*table()));

        reopened.clear().unwrap();
        assert!(reopened.get(&key).unwrap().is_none());
    }

    #[test]
    fn file_cache_reports_corrupt_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileIndicatorCache::new(dir.path());
        let key = key_for("AAA", &IndicatorConfig::default());
        fs::write(cache.entry_path(&key), b"\x01garbage").unwrap();

        assert!(matches!(cache.get(&key), Err(CacheError::Decode(_))));
    }

    #[test]
    fn file_cache_rejects_entry_stored_under_foreign_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileIndicatorCache::new(dir.path());
        let key = key_for("AAA", &IndicatorConfig::default());
        let other = key_for("BBB", &IndicatorConfig::default());
        cache.put(other.clone(), table()).unwrap();
        fs::copy(cache.entry_path(&other), cache.entry_path(&key)).unwrap();

        match cache.get(&key) {
            Err(CacheError::KeyMismatch { expected, found }) => {
                assert_eq!(expected, key.as_str());
                assert_eq!(found, other.as_str());
            }
            other => panic!("expected key mismatch, got {:?}", other.map(|t| t.is_some())),
        }

        // Overwriting the entry repairs it
        cache.put(key.clone(), table()).unwrap();
        assert_eq!(cache.get(&key).unwrap().as_deref(), Some(&*table()));
    }

    #[test]
    fn clearing_missing_directory_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileIndicatorCache::new(dir.path().join("never-created"));
        assert!(cache.clear().is_ok());
    }
}
