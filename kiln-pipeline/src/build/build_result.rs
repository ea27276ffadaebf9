use crate::{BuildLogData, ObjectUrl, ResultStatus, StepId};
use kiln_base::ObjectId;
use std::collections::BTreeMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BuildResultCode {
    Successful,
    // A step failed, or the graph could not be built
    BuildError,
    // The build options were unusable, nothing ran
    CommandLineError,
    Cancelled,
}

pub struct BuildResult {
    pub code: BuildResultCode,
    pub step_statuses: BTreeMap<StepId, ResultStatus>,
    pub log: BuildLogData,
    // Commands whose execute() was invoked
    pub executed_count: usize,
    // Commands whose result came from the result cache
    pub cache_hit_count: usize,
    pub(crate) step_outputs: BTreeMap<StepId, BTreeMap<ObjectUrl, ObjectId>>,
    pub(crate) output_objects: BTreeMap<ObjectUrl, ObjectId>,
}

impl BuildResult {
    pub(crate) fn new(
        code: BuildResultCode,
        log: BuildLogData,
    ) -> Self {
        BuildResult {
            code,
            step_statuses: Default::default(),
            log,
            executed_count: 0,
            cache_hit_count: 0,
            step_outputs: Default::default(),
            output_objects: Default::default(),
        }
    }

    pub fn is_successful(&self) -> bool {
        self.code == BuildResultCode::Successful
    }

    pub fn status(
        &self,
        step_id: StepId,
    ) -> Option<ResultStatus> {
        self.step_statuses.get(&step_id).copied()
    }

    /// The latest id registered for every url by a step that succeeded
    pub fn output_objects(&self) -> &BTreeMap<ObjectUrl, ObjectId> {
        &self.output_objects
    }

    /// The output group of one step, if it succeeded and registered anything
    pub fn step_outputs(
        &self,
        step_id: StepId,
    ) -> Option<&BTreeMap<ObjectUrl, ObjectId>> {
        self.step_outputs.get(&step_id)
    }
}
