use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::schema::{CATALOG_FILES, CatalogTables, SCHEMA_VERSION};
use super::ReferenceCatalog;
use crate::error::{OptError, Result};

const CACHE_FILE_PREFIX: &str = "catalog-";
const CACHE_FILE_SUFFIX: &str = ".json";

/// Parsed catalog tables, serialized to JSON and keyed by the hash of their sources.
#[derive(Debug, Serialize, Deserialize)]
pub struct CachedCatalog {
    pub schema_version: String,
    pub source_hash: String,
    pub created_at: u64,
    pub tables: CatalogTables,
}

/// Content-addressed cache of parsed reference tables.
///
/// A cache entry is only ever found through the hash of the exact source bytes it was
/// built from, so an edited source file simply misses. Old entries stay on disk until
/// [`CatalogCache::invalidate`] is called.
#[derive(Debug, Clone)]
pub struct CatalogCache {
    dir: PathBuf,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl CatalogCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// SHA-256 over the schema version and every catalog file (absent files hash a marker).
    pub fn source_hash(source_dir: &Path) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(SCHEMA_VERSION.as_bytes());
        for file_name in CATALOG_FILES {
            hasher.update(file_name.as_bytes());
            let path = source_dir.join(file_name);
            if path.exists() {
                let bytes = fs::read(&path).map_err(|err| OptError::io_at(&path, err))?;
                hasher.update((bytes.len() as u64).to_le_bytes());
                hasher.update(&bytes);
            } else {
                hasher.update(b"<absent>");
            }
        }
        Ok(hex::encode(hasher.finalize()))
    }

    fn entry_path(&self, source_hash: &str) -> PathBuf {
        self.dir
            .join(format!("{CACHE_FILE_PREFIX}{source_hash}{CACHE_FILE_SUFFIX}"))
    }

    /// Returns the cached tables for `source_hash`, or None on a miss or unreadable entry.
    pub fn load(&self, source_hash: &str) -> Option<CatalogTables> {
        let path = self.entry_path(source_hash);
        let file = fs::File::open(&path).ok()?;
        let cached: CachedCatalog = match serde_json::from_reader(BufReader::new(file)) {
            Ok(cached) => cached,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable catalog cache entry");
                return None;
            }
        };
        if cached.schema_version != SCHEMA_VERSION || cached.source_hash != source_hash {
            return None;
        }
        Some(cached.tables)
    }

    pub fn store(&self, source_hash: &str, tables: &CatalogTables) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|err| OptError::io_at(&self.dir, err))?;
        let path = self.entry_path(source_hash);
        let cached = CachedCatalog {
            schema_version: SCHEMA_VERSION.to_string(),
            source_hash: source_hash.to_string(),
            created_at: now_secs(),
            tables: tables.clone(),
        };
        let file = fs::File::create(&path).map_err(|err| OptError::io_at(&path, err))?;
        serde_json::to_writer(BufWriter::new(file), &cached)?;
        Ok(path)
    }

    /// Removes every cache entry. Returns the number of files deleted.
    pub fn invalidate(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(OptError::io_at(&self.dir, err)),
        };
        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            let is_entry = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(CACHE_FILE_PREFIX) && n.ends_with(CACHE_FILE_SUFFIX));
            if is_entry {
                fs::remove_file(&path).map_err(|err| OptError::io_at(&path, err))?;
                removed += 1;
            }
        }
        tracing::info!(dir = %self.dir.display(), removed, "invalidated catalog cache");
        Ok(removed)
    }

    /// Load the catalog for `source_dir`, parsing CSVs only on a cache miss.
    pub fn load_or_build(&self, source_dir: &Path) -> Result<ReferenceCatalog> {
        let source_hash = Self::source_hash(source_dir)?;
        if let Some(tables) = self.load(&source_hash) {
            tracing::info!(hash = %source_hash, "catalog cache hit");
            return ReferenceCatalog::from_tables(tables);
        }
        tracing::info!(hash = %source_hash, "catalog cache miss; parsing source tables");
        let tables = CatalogTables::read_dir(source_dir)?;
        let catalog = ReferenceCatalog::from_tables(tables)?;
        self.store(&source_hash, catalog.tables())?;
        Ok(catalog)
    }
}
