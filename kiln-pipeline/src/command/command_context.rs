use crate::build::OutputObjectsSnapshot;
use crate::content::ContentResolver;
use crate::{
    BuildLogEvent, CancellationToken, LogEventLevel, ObjectDatabase, ObjectUrl, PipelineResult,
    StepId,
};
use kiln_base::ObjectId;
use std::collections::BTreeMap;
use std::sync::Arc;

// What a command left behind once it finished executing
pub(crate) struct CommandContextResults {
    pub(crate) registered_outputs: BTreeMap<ObjectUrl, ObjectId>,
    pub(crate) discovered_dependencies: BTreeMap<ObjectUrl, ObjectId>,
    pub(crate) log_events: Vec<BuildLogEvent>,
}

/// Everything a command may touch while it executes. Outputs registered here become visible to
/// other commands only after this one finishes successfully.
pub struct CommandContext<'a> {
    step_id: StepId,
    title: &'a str,
    content: &'a ContentResolver,
    cancellation_token: &'a CancellationToken,
    visible_outputs: OutputObjectsSnapshot,
    registered_outputs: BTreeMap<ObjectUrl, ObjectId>,
    discovered_dependencies: BTreeMap<ObjectUrl, ObjectId>,
    log_events: Vec<BuildLogEvent>,
}

impl<'a> CommandContext<'a> {
    pub(crate) fn new(
        step_id: StepId,
        title: &'a str,
        content: &'a ContentResolver,
        cancellation_token: &'a CancellationToken,
        visible_outputs: OutputObjectsSnapshot,
    ) -> Self {
        CommandContext {
            step_id,
            title,
            content,
            cancellation_token,
            visible_outputs,
            registered_outputs: Default::default(),
            discovered_dependencies: Default::default(),
            log_events: Default::default(),
        }
    }

    pub(crate) fn finish(self) -> CommandContextResults {
        CommandContextResults {
            registered_outputs: self.registered_outputs,
            discovered_dependencies: self.discovered_dependencies,
            log_events: self.log_events,
        }
    }

    pub fn step_id(&self) -> StepId {
        self.step_id
    }

    pub fn title(&self) -> &str {
        self.title
    }

    pub fn object_database(&self) -> &ObjectDatabase {
        self.content.object_database()
    }

    /// Outputs of every step that finished before this command started
    pub fn output_objects_groups(&self) -> &OutputObjectsSnapshot {
        &self.visible_outputs
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        self.cancellation_token
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Record that this command produced `object_id` under `url`. The content should already be
    /// in the object database, cached results whose content has gone missing are not reused.
    pub fn register_output(
        &mut self,
        url: ObjectUrl,
        object_id: ObjectId,
    ) {
        let previous = self.registered_outputs.insert(url.clone(), object_id);
        if let Some(previous) = previous {
            if previous != object_id {
                self.warn(format!(
                    "{} registered again, {} supersedes {}",
                    url, object_id, previous
                ));
            }
        }
    }

    /// Store `data` in the object database and register it as an output
    pub fn write_output(
        &mut self,
        url: ObjectUrl,
        data: &[u8],
    ) -> PipelineResult<ObjectId> {
        let object_id = self.content.object_database().put(data)?;
        self.register_output(url, object_id);
        Ok(object_id)
    }

    /// Declare an input found while executing. It does not change the order of the current
    /// build, but a later build will only reuse this result while the input is unchanged.
    pub fn register_input_dependency(
        &mut self,
        url: ObjectUrl,
    ) -> ObjectId {
        let object_id = match self.content.resolve(&url, &self.visible_outputs) {
            Some(object_id) => object_id,
            None => {
                self.warn(format!("Discovered dependency {} does not exist", url));
                ObjectId::null()
            }
        };

        self.discovered_dependencies.insert(url, object_id);
        object_id
    }

    pub fn resolve_input(
        &self,
        url: &ObjectUrl,
    ) -> Option<ObjectId> {
        self.content.resolve(url, &self.visible_outputs)
    }

    pub fn read_input(
        &self,
        url: &ObjectUrl,
    ) -> PipelineResult<Arc<Vec<u8>>> {
        self.content.read(url, &self.visible_outputs)
    }

    pub fn log<T: Into<String>>(
        &mut self,
        level: LogEventLevel,
        message: T,
    ) {
        self.log_events.push(BuildLogEvent {
            step_id: Some(self.step_id),
            level,
            message: message.into(),
        });
    }

    pub fn debug<T: Into<String>>(
        &mut self,
        message: T,
    ) {
        self.log(LogEventLevel::Debug, message);
    }

    pub fn verbose<T: Into<String>>(
        &mut self,
        message: T,
    ) {
        self.log(LogEventLevel::Verbose, message);
    }

    pub fn info<T: Into<String>>(
        &mut self,
        message: T,
    ) {
        self.log(LogEventLevel::Info, message);
    }

    pub fn warn<T: Into<String>>(
        &mut self,
        message: T,
    ) {
        self.log(LogEventLevel::Warning, message);
    }

    pub fn error<T: Into<String>>(
        &mut self,
        message: T,
    ) {
        self.log(LogEventLevel::Error, message);
    }
}
