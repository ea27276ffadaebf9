pub use kiln_base::{ObjectId, ObjectIdBuilder};

mod pipeline_error;
pub use pipeline_error::*;

mod log_events;
pub use log_events::*;

mod project;
pub use project::{BuildEngineConfiguration, BuildEngineConfigurationJson, PROJECT_FILE_NAME};

pub mod cache;
pub use cache::ResultCache;

pub mod content;
pub use content::{ObjectDatabase, ObjectUrl, UrlType};

mod command;
pub use command::{
    CancellationToken, Command, CommandContext, CommandTypeId, ParameterHashWriter, ResultStatus,
};

mod build;
pub use build::{
    BuildEngine, BuildGraph, BuildOptions, BuildPriority, BuildResult, BuildResultCode,
    OutputObject, OutputObjectsSnapshot, PrepareContext, StepId,
};

// type_uuid is part of the Command trait, re-exported so commands don't need their own dependency
pub use type_uuid;

#[cfg(test)]
mod tests;
