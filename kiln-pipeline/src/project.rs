use crate::{BuildEngine, BuildOptions, ObjectDatabase, PipelineResult, ResultCache};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const PROJECT_FILE_NAME: &str = "kiln_project.json";

#[derive(Serialize, Deserialize)]
pub struct BuildEngineConfigurationJson {
    pub object_database_path: String,
    pub result_cache_path: String,
    pub source_root_path: String,
    #[serde(default)]
    pub thread_count: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct BuildEngineConfiguration {
    // Directory holding built content, addressed by hash
    pub object_database_path: PathBuf,

    // Path to the FILE the result cache is saved to
    pub result_cache_path: PathBuf,

    // File urls are relative to this directory
    pub source_root_path: PathBuf,

    // Defaults to the number of logical cores
    pub thread_count: Option<usize>,
}

impl BuildEngineConfiguration {
    pub fn unverified_absolute_path(
        root_path: &Path,
        json_path: &str,
    ) -> PathBuf {
        if Path::new(json_path).is_absolute() {
            PathBuf::from(json_path)
        } else {
            root_path.join(json_path)
        }
    }

    // root_path is the directory containing the project file. The directory is created if it
    // doesn't exist so that it can be canonicalized.
    pub fn parse_dir_path(
        root_path: &Path,
        json_path: &str,
    ) -> PipelineResult<PathBuf> {
        let joined_path = Self::unverified_absolute_path(root_path, json_path);
        if !joined_path.exists() {
            std::fs::create_dir_all(&joined_path)?;
        }

        Ok(dunce::canonicalize(&joined_path)?)
    }

    // The file itself may not exist yet, so only its parent directory is created and canonicalized
    pub fn parse_file_path(
        root_path: &Path,
        json_path: &str,
    ) -> PipelineResult<PathBuf> {
        let joined_path = Self::unverified_absolute_path(root_path, json_path);
        let file_name = joined_path
            .file_name()
            .ok_or_else(|| format!("{:?} does not name a file", joined_path))?
            .to_os_string();
        let parent_path = joined_path
            .parent()
            .ok_or_else(|| format!("Parent of {:?} could not be found", joined_path))?;
        if !parent_path.exists() {
            std::fs::create_dir_all(parent_path)?;
        }

        Ok(dunce::canonicalize(parent_path)?.join(file_name))
    }

    pub fn read_from_path(path: &Path) -> PipelineResult<Self> {
        let root_path = dunce::canonicalize(
            path.parent()
                .ok_or_else(|| "Parent of project file path could not be found".to_string())?,
        )?;
        let file_contents = std::fs::read_to_string(path)?;
        let project_file: BuildEngineConfigurationJson = serde_json::from_str(&file_contents)?;

        if project_file.thread_count == Some(0) {
            return Err(format!("thread_count in {:?} must be at least 1", path).into());
        }

        Ok(BuildEngineConfiguration {
            object_database_path: Self::parse_dir_path(
                &root_path,
                &project_file.object_database_path,
            )?,
            result_cache_path: Self::parse_file_path(&root_path, &project_file.result_cache_path)?,
            source_root_path: Self::parse_dir_path(&root_path, &project_file.source_root_path)?,
            thread_count: project_file.thread_count,
        })
    }

    pub fn locate_project_file(search_location: &Path) -> PipelineResult<Self> {
        let mut path = Some(search_location.to_path_buf());
        while let Some(p) = path {
            let joined_path = p.join(PROJECT_FILE_NAME);
            if joined_path.exists() {
                log::info!("Using project configuration at {:?}", joined_path);
                return Self::read_from_path(&joined_path);
            }

            path = p.parent().map(|x| x.to_path_buf());
        }

        Err(format!(
            "{} could not be located at {:?} or in any of its parent directories",
            PROJECT_FILE_NAME, search_location
        ))?
    }

    /// Open the object database and result cache and create an engine that uses them
    pub fn open_engine(&self) -> PipelineResult<BuildEngine> {
        let object_database = ObjectDatabase::open(&self.object_database_path)?;
        let result_cache = ResultCache::open(&self.result_cache_path)?;
        Ok(BuildEngine::new(object_database, result_cache)
            .with_source_root_path(self.source_root_path.clone()))
    }

    /// Build options with this project's thread count
    pub fn build_options(&self) -> BuildOptions {
        let mut options = BuildOptions::default();
        if let Some(thread_count) = self.thread_count {
            options.thread_count = thread_count;
        }
        options
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn locate_in_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PROJECT_FILE_NAME),
            r#"{
                "object_database_path": "build/objects",
                "result_cache_path": "build/results.bin",
                "source_root_path": "assets",
                "thread_count": 3
            }"#,
        )
        .unwrap();

        let nested = dir.path().join("assets").join("textures");
        std::fs::create_dir_all(&nested).unwrap();

        let configuration = BuildEngineConfiguration::locate_project_file(&nested).unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        assert_eq!(configuration.object_database_path, root.join("build").join("objects"));
        assert_eq!(configuration.result_cache_path, root.join("build").join("results.bin"));
        assert_eq!(configuration.source_root_path, root.join("assets"));
        assert_eq!(configuration.build_options().thread_count, 3);
        assert!(configuration.object_database_path.is_dir());

        let engine = configuration.open_engine().unwrap();
        assert_eq!(engine.source_root_path(), Some(root.join("assets").as_path()));
        assert!(engine.result_cache().is_empty());
    }

    #[test]
    fn zero_threads_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PROJECT_FILE_NAME);
        std::fs::write(
            &path,
            r#"{
                "object_database_path": "objects",
                "result_cache_path": "results.bin",
                "source_root_path": ".",
                "thread_count": 0
            }"#,
        )
        .unwrap();

        assert!(BuildEngineConfiguration::read_from_path(&path).is_err());
    }
}
