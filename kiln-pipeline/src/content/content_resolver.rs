use crate::build::OutputObjectsSnapshot;
use crate::{ObjectDatabase, ObjectUrl, PipelineError, PipelineResult, UrlType};
use kiln_base::ObjectId;
use std::path::PathBuf;
use std::sync::Arc;

/// Turns urls into content ids for one build. Content urls are looked up in the outputs visible
/// to the asking command, then in what previous builds left in the object database. File urls
/// are hashed straight from disk.
pub(crate) struct ContentResolver {
    object_database: ObjectDatabase,
    source_root_path: Option<PathBuf>,
}

impl ContentResolver {
    pub(crate) fn new(
        object_database: ObjectDatabase,
        source_root_path: Option<PathBuf>,
    ) -> Self {
        ContentResolver {
            object_database,
            source_root_path,
        }
    }

    pub(crate) fn object_database(&self) -> &ObjectDatabase {
        &self.object_database
    }

    fn source_file_path(
        &self,
        url: &ObjectUrl,
    ) -> PathBuf {
        match &self.source_root_path {
            Some(source_root_path) => source_root_path.join(&url.path),
            None => PathBuf::from(&url.path),
        }
    }

    /// None if nothing by that url exists right now
    pub(crate) fn resolve(
        &self,
        url: &ObjectUrl,
        visible_outputs: &OutputObjectsSnapshot,
    ) -> Option<ObjectId> {
        match url.url_type {
            UrlType::Content => visible_outputs
                .get(url)
                .map(|x| x.object_id)
                .or_else(|| self.object_database.lookup_url(url)),
            UrlType::File => {
                let path = self.source_file_path(url);
                if !path.is_file() {
                    return None;
                }

                profiling::scope!("Hash source file");
                match std::fs::read(&path) {
                    Ok(data) => Some(ObjectId::from_bytes(&data)),
                    Err(e) => {
                        log::warn!("Could not read source file {:?}: {}", path, e);
                        None
                    }
                }
            }
        }
    }

    pub(crate) fn read(
        &self,
        url: &ObjectUrl,
        visible_outputs: &OutputObjectsSnapshot,
    ) -> PipelineResult<Arc<Vec<u8>>> {
        match url.url_type {
            UrlType::Content => {
                let object_id = self
                    .resolve(url, visible_outputs)
                    .ok_or_else(|| PipelineError::MissingContent(url.to_string()))?;
                self.object_database
                    .get(object_id)?
                    .ok_or_else(|| PipelineError::MissingContent(format!("{} ({})", url, object_id)))
            }
            UrlType::File => Ok(Arc::new(std::fs::read(self.source_file_path(url))?)),
        }
    }
}
