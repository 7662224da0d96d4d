//! On-disk format of the persisted cache map
//!
//! Single bincode file:
//! - `version`: format version, checked before decoding the rest
//! - `saved_at`: wall-clock time of the flush
//! - `entries`: key -> `CacheEntry<V>`
//!
//! Writes go to a sibling temp file which is then renamed over the target,
//! so readers never see a half-written cache.
//!
//! Format Version History:
//! - v1: Initial version

use crate::error::PersistError;
use crate::expiration::CacheEntry;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Current cache file format version
///
/// Increment when `CacheEntry` or the file layout changes; older files are
/// then rejected on load and the store starts empty.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// File name used inside the platform cache directory
pub const DEFAULT_CACHE_FILE: &str = "cache.bin";

/// Default cache file location: `<platform cache dir>/covercache/cache.bin`
pub fn default_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("covercache")
        .join(DEFAULT_CACHE_FILE)
}

#[derive(Serialize)]
struct CacheFileRef<'a, V> {
    version: u32,
    saved_at: DateTime<Utc>,
    entries: &'a HashMap<String, CacheEntry<V>>,
}

#[derive(Deserialize)]
struct CacheFile<V> {
    version: u32,
    #[allow(dead_code)]
    saved_at: DateTime<Utc>,
    entries: HashMap<String, CacheEntry<V>>,
}

/// Serialize the whole persisted map
pub fn encode<V: Serialize>(
    entries: &HashMap<String, CacheEntry<V>>,
    saved_at: DateTime<Utc>,
) -> Result<Vec<u8>, PersistError> {
    let file = CacheFileRef {
        version: CACHE_FORMAT_VERSION,
        saved_at,
        entries,
    };
    bincode::serialize(&file).map_err(|e| PersistError::Encode {
        message: e.to_string(),
    })
}

/// Deserialize a cache file read from `path`
pub fn decode<V: DeserializeOwned>(
    path: &Path,
    bytes: &[u8],
) -> Result<HashMap<String, CacheEntry<V>>, PersistError> {
    // The version leads the file, so it can be checked before the payload
    let version: u32 = bincode::deserialize(bytes).map_err(|e| PersistError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    if version != CACHE_FORMAT_VERSION {
        return Err(PersistError::VersionMismatch {
            path: path.to_path_buf(),
            found: version,
            expected: CACHE_FORMAT_VERSION,
        });
    }

    let file: CacheFile<V> = bincode::deserialize(bytes).map_err(|e| PersistError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    debug_assert_eq!(file.version, CACHE_FORMAT_VERSION);
    Ok(file.entries)
}

/// Load the persisted map; `Ok(None)` when no file exists yet
pub fn load<V: DeserializeOwned>(
    path: &Path,
) -> Result<Option<HashMap<String, CacheEntry<V>>>, PersistError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No cache file found");
            return Ok(None);
        }
        Err(source) => {
            return Err(PersistError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    decode(path, &bytes).map(Some)
}

/// Replace the file at `path` with `bytes`
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let write_err = |source| PersistError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }

    let tmp_path = temp_path(path);
    let result = (|| {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(write_err(e));
    }

    debug!(path = %path.display(), bytes = bytes.len(), "Cache file written");
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| DEFAULT_CACHE_FILE.into());
    name.push(".tmp");
    path.with_file_name(name)
}
