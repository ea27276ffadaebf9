use crate::{ObjectUrl, PipelineResult, UrlType};
use kiln_base::hashing::HashMap;
use kiln_base::{LruCache, ObjectId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const CONTENT_INDEX_FILE_NAME: &str = "content_index.json";
const CONTENT_INDEX_VERSION: u32 = 1;
// Blobs read back from disk that stay in memory
const READ_CACHE_CAPACITY: u32 = 256;

#[derive(Serialize, Deserialize)]
struct ContentIndexJson {
    version: u32,
    // content url path -> hex object id
    entries: BTreeMap<String, String>,
}

/// Converts an object id to a path starting at the given root
/// Example: /2/d/2d4154f72b3c422387677e8d1fa70447.blob
pub fn object_id_to_path(
    root: &Path,
    object_id: ObjectId,
) -> PathBuf {
    let encoded = object_id.to_string();
    root.join(&encoded[0..1])
        .join(&encoded[1..2])
        .join(format!("{}.blob", encoded))
}

struct ObjectDatabaseInner {
    // None for a database that only lives in memory
    root_path: Option<PathBuf>,
    // Every object, for in-memory databases only
    objects: Mutex<HashMap<ObjectId, Arc<Vec<u8>>>>,
    // Recently read blobs, for on-disk databases only
    read_cache: Option<Mutex<LruCache<ObjectId, Arc<Vec<u8>>>>>,
    // Latest known id for each content url, carried across builds
    content_index: Mutex<BTreeMap<String, ObjectId>>,
}

/// Content-addressable blob store. Blobs are immutable and keyed by the hash of their bytes, so
/// writing the same payload twice is a no-op.
#[derive(Clone)]
pub struct ObjectDatabase {
    inner: Arc<ObjectDatabaseInner>,
}

impl ObjectDatabase {
    pub fn in_memory() -> Self {
        ObjectDatabase {
            inner: Arc::new(ObjectDatabaseInner {
                root_path: None,
                objects: Default::default(),
                read_cache: None,
                content_index: Default::default(),
            }),
        }
    }

    pub fn open(root_path: &Path) -> PipelineResult<Self> {
        std::fs::create_dir_all(root_path)?;
        let content_index = Self::load_content_index(&root_path.join(CONTENT_INDEX_FILE_NAME));

        Ok(ObjectDatabase {
            inner: Arc::new(ObjectDatabaseInner {
                root_path: Some(root_path.to_path_buf()),
                objects: Default::default(),
                read_cache: Some(Mutex::new(LruCache::new(READ_CACHE_CAPACITY))),
                content_index: Mutex::new(content_index),
            }),
        })
    }

    // A broken index only costs us rebuilds, so it is never an error
    fn load_content_index(path: &Path) -> BTreeMap<String, ObjectId> {
        let mut content_index = BTreeMap::default();
        if !path.exists() {
            return content_index;
        }

        let parsed = std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|contents| {
                serde_json::from_str::<ContentIndexJson>(&contents).map_err(|e| e.to_string())
            });

        match parsed {
            Ok(index) if index.version == CONTENT_INDEX_VERSION => {
                for (url_path, id) in index.entries {
                    match id.parse::<ObjectId>() {
                        Ok(object_id) => {
                            content_index.insert(url_path, object_id);
                        }
                        Err(e) => log::warn!(
                            "Ignoring content index entry {} with bad id {}: {}",
                            url_path,
                            id,
                            e
                        ),
                    }
                }
            }
            Ok(index) => log::warn!(
                "Ignoring content index {:?} with unsupported version {}",
                path,
                index.version
            ),
            Err(e) => log::warn!("Ignoring unreadable content index {:?}: {}", path, e),
        }

        content_index
    }

    pub fn root_path(&self) -> Option<&Path> {
        self.inner.root_path.as_deref()
    }

    pub fn put(
        &self,
        data: &[u8],
    ) -> PipelineResult<ObjectId> {
        profiling::scope!("ObjectDatabase::put");
        let object_id = ObjectId::from_bytes(data);

        if let Some(root_path) = &self.inner.root_path {
            let path = object_id_to_path(root_path, object_id);
            if !path.exists() {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }

                // Write to a temporary name and rename so a reader never sees a partial blob
                let tmp_path = path.with_extension(format!("tmp{}", uuid::Uuid::new_v4().to_simple()));
                std::fs::write(&tmp_path, data)?;
                if let Err(e) = std::fs::rename(&tmp_path, &path) {
                    let _ = std::fs::remove_file(&tmp_path);
                    if !path.exists() {
                        return Err(e.into());
                    }
                }
            }
        } else {
            self.inner
                .objects
                .lock()
                .unwrap()
                .entry(object_id)
                .or_insert_with(|| Arc::new(data.to_vec()));
        }

        Ok(object_id)
    }

    pub fn get(
        &self,
        object_id: ObjectId,
    ) -> PipelineResult<Option<Arc<Vec<u8>>>> {
        let (Some(root_path), Some(read_cache)) = (&self.inner.root_path, &self.inner.read_cache)
        else {
            return Ok(self.inner.objects.lock().unwrap().get(&object_id).cloned());
        };

        if let Some(data) = read_cache.lock().unwrap().get(&object_id) {
            return Ok(Some(data.clone()));
        }

        let path = object_id_to_path(root_path, object_id);
        if !path.exists() {
            return Ok(None);
        }

        let data = Arc::new(std::fs::read(&path)?);
        if ObjectId::from_bytes(&data) != object_id {
            log::warn!("Object {} on disk does not match its id, ignoring it", object_id);
            return Ok(None);
        }

        read_cache.lock().unwrap().insert(object_id, data.clone());
        Ok(Some(data))
    }

    pub fn exists(
        &self,
        object_id: ObjectId,
    ) -> bool {
        match &self.inner.root_path {
            Some(root_path) => object_id_to_path(root_path, object_id).exists(),
            None => self.inner.objects.lock().unwrap().contains_key(&object_id),
        }
    }

    /// Latest id recorded for a content url by a previous build
    pub fn lookup_url(
        &self,
        url: &ObjectUrl,
    ) -> Option<ObjectId> {
        if url.url_type != UrlType::Content {
            return None;
        }

        self.inner
            .content_index
            .lock()
            .unwrap()
            .get(&url.path)
            .copied()
    }

    pub(crate) fn update_content_index<'a, I: IntoIterator<Item = (&'a ObjectUrl, &'a ObjectId)>>(
        &self,
        entries: I,
    ) {
        let mut content_index = self.inner.content_index.lock().unwrap();
        for (url, object_id) in entries {
            if url.url_type == UrlType::Content {
                content_index.insert(url.path.clone(), *object_id);
            }
        }
    }

    pub fn content_index_len(&self) -> usize {
        self.inner.content_index.lock().unwrap().len()
    }

    /// Persist the content index. Does nothing for in-memory databases.
    pub fn save_index(&self) -> PipelineResult<()> {
        let Some(root_path) = &self.inner.root_path else {
            return Ok(());
        };

        let entries = self
            .inner
            .content_index
            .lock()
            .unwrap()
            .iter()
            .map(|(url_path, object_id)| (url_path.clone(), object_id.to_string()))
            .collect();

        let json = serde_json::to_string_pretty(&ContentIndexJson {
            version: CONTENT_INDEX_VERSION,
            entries,
        })?;

        let path = root_path.join(CONTENT_INDEX_FILE_NAME);
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}
