use crate::command::CommandTypeId;
use crate::{CachedLogEvent, ObjectUrl, PipelineResult, ResultStatus};
use kiln_base::hashing::HashMap;
use kiln_base::{ObjectId, ObjectIdBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

const SHARD_COUNT: usize = 16;
const CACHE_FILE_VERSION: u32 = 1;

/// Everything that determines the output of a command: what it is, how it is configured, and the
/// content of what it reads
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub command_type: CommandTypeId,
    pub command_version: u32,
    pub parameter_hash: ObjectId,
    // Each input keeps its url so that two inputs trading content still changes the key. Sorted
    // by url.
    pub inputs: Vec<(ObjectUrl, ObjectId)>,
}

impl CacheKey {
    pub fn new(
        command_type: CommandTypeId,
        command_version: u32,
        parameter_hash: ObjectId,
        mut inputs: Vec<(ObjectUrl, ObjectId)>,
    ) -> Self {
        inputs.sort();
        CacheKey {
            command_type,
            command_version,
            parameter_hash,
            inputs,
        }
    }

    pub fn digest(&self) -> ObjectId {
        let mut builder = ObjectIdBuilder::new();
        // Writing plain data into the hasher can't fail
        let _ = bincode::serialize_into(&mut builder, self);
        builder.compute_hash()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub output_objects: Vec<(ObjectUrl, ObjectId)>,
    // Inputs the command found while executing, with the id they had at the time. The entry is
    // only valid while they still resolve to the same ids.
    pub discovered_dependencies: Vec<(ObjectUrl, ObjectId)>,
    pub log_events: Vec<CachedLogEvent>,
    pub status: ResultStatus,
    // Seconds since the unix epoch
    pub timestamp: u64,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    // Each record is a bincode-encoded (CacheKey, CacheEntry). Kept separate so that one bad
    // record does not take the rest of the file down with it.
    records: Vec<Vec<u8>>,
}

type CacheShard = RwLock<HashMap<CacheKey, Arc<CacheEntry>>>;

struct ResultCacheInner {
    shards: Vec<CacheShard>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
}

/// Shared, long-lived map from `CacheKey` to the result of running that command. Readers and
/// writers of different keys proceed concurrently, and entries are swapped in whole so a reader
/// never observes a partially written entry.
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<ResultCacheInner>,
}

impl ResultCache {
    fn with_path(path: Option<PathBuf>) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Default::default()).collect();
        ResultCache {
            inner: Arc::new(ResultCacheInner {
                shards,
                path,
                dirty: AtomicBool::new(false),
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self::with_path(None)
    }

    /// Load the cache file at `path`, or start empty if it does not exist. An unreadable file is
    /// logged and ignored, the cache only ever saves work.
    pub fn open(path: &Path) -> PipelineResult<Self> {
        let cache = Self::with_path(Some(path.to_path_buf()));
        if !path.exists() {
            return Ok(cache);
        }

        let bytes = std::fs::read(path)?;
        let cache_file = match bincode::deserialize::<CacheFile>(&bytes) {
            Ok(cache_file) if cache_file.version == CACHE_FILE_VERSION => cache_file,
            Ok(cache_file) => {
                log::warn!(
                    "Ignoring result cache {:?} with unsupported version {}",
                    path,
                    cache_file.version
                );
                return Ok(cache);
            }
            Err(e) => {
                log::warn!("Ignoring unreadable result cache {:?}: {}", path, e);
                return Ok(cache);
            }
        };

        let mut skipped = 0;
        for record in cache_file.records {
            match bincode::deserialize::<(CacheKey, CacheEntry)>(&record) {
                Ok((key, entry)) => {
                    let shard = cache.shard(&key);
                    shard.write().unwrap().insert(key, Arc::new(entry));
                }
                Err(_) => skipped += 1,
            }
        }

        if skipped > 0 {
            log::warn!(
                "Skipped {} unreadable entries in result cache {:?}",
                skipped,
                path
            );
        }

        log::debug!("Loaded {} result cache entries from {:?}", cache.len(), path);
        Ok(cache)
    }

    fn shard(
        &self,
        key: &CacheKey,
    ) -> &CacheShard {
        let index = (key.digest().as_u128() % SHARD_COUNT as u128) as usize;
        &self.inner.shards[index]
    }

    pub fn try_get(
        &self,
        key: &CacheKey,
    ) -> Option<Arc<CacheEntry>> {
        self.shard(key).read().unwrap().get(key).cloned()
    }

    /// Replaces any existing entry for the key
    pub fn put(
        &self,
        key: CacheKey,
        entry: CacheEntry,
    ) {
        let entry = Arc::new(entry);
        self.shard(&key).write().unwrap().insert(key, entry);
        self.inner.dirty.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|x| x.read().unwrap().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Write the cache to disk if it has changed since it was last saved. Does nothing for
    /// in-memory caches.
    pub fn save(&self) -> PipelineResult<()> {
        let Some(path) = &self.inner.path else {
            return Ok(());
        };

        // Cleared up front so that puts racing with the write mark it again
        if !self.inner.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let result = self.write_cache_file(path);
        if result.is_err() {
            self.inner.dirty.store(true, Ordering::Release);
        }
        result
    }

    fn write_cache_file(
        &self,
        path: &Path,
    ) -> PipelineResult<()> {
        profiling::scope!("ResultCache::save");
        let mut records = Vec::default();
        for shard in &self.inner.shards {
            for (key, entry) in shard.read().unwrap().iter() {
                records.push(bincode::serialize(&(key, &**entry))?);
            }
        }

        let bytes = bincode::serialize(&CacheFile {
            version: CACHE_FILE_VERSION,
            records,
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}
