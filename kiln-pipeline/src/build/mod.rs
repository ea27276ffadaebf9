pub(crate) mod build_step;
pub use build_step::{BuildGraph, BuildPriority, PrepareContext, StepId};

mod build_result;
pub use build_result::{BuildResult, BuildResultCode};

mod output_groups;
pub use output_groups::{OutputObject, OutputObjectsSnapshot};
pub(crate) use output_groups::OutputObjectGroups;

mod resolver;

mod executor_thread_pool;

mod executor;
pub use executor::{BuildEngine, BuildOptions};
