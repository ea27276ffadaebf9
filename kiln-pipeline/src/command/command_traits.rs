use crate::{CommandContext, ObjectUrl, PipelineResult, PrepareContext};
use kiln_base::{ObjectId, ObjectIdBuilder};
use serde::{Deserialize, Serialize};
use std::panic::RefUnwindSafe;
use type_uuid::TypeUuid;

/// Stable identity of a command type, taken from the command's `TypeUuid`
#[derive(Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CommandTypeId(u128);

impl CommandTypeId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes).as_u128())
    }

    pub fn of<T: TypeUuid>() -> Self {
        Self::from_bytes(T::UUID)
    }

    pub fn as_uuid(self) -> uuid::Uuid {
        uuid::Uuid::from_u128(self.0)
    }
}

impl std::fmt::Debug for CommandTypeId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_tuple("CommandTypeId")
            .field(&uuid::Uuid::from_u128(self.0))
            .finish()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultStatus {
    Successful,
    Failed,
    Cancelled,
    // The step never got to run
    NotProcessed,
    // A cached result was reused instead of running the command
    NotTriggeredWasSuccessful,
    // An upstream step did not succeed so this one was never started
    NotTriggeredPrerequisiteFailed,
}

impl ResultStatus {
    pub fn is_successful(self) -> bool {
        matches!(
            self,
            ResultStatus::Successful | ResultStatus::NotTriggeredWasSuccessful
        )
    }

    pub fn is_failed(self) -> bool {
        self == ResultStatus::Failed
    }

    pub fn is_cancelled(self) -> bool {
        matches!(
            self,
            ResultStatus::Cancelled | ResultStatus::NotTriggeredPrerequisiteFailed
        )
    }
}

/// Collects every field of a command that influences its output. The same fields must be written
/// in the same order every time, the resulting hash is persisted as part of the cache key.
pub struct ParameterHashWriter {
    builder: ObjectIdBuilder,
}

impl Default for ParameterHashWriter {
    fn default() -> Self {
        ParameterHashWriter {
            builder: ObjectIdBuilder::new(),
        }
    }
}

impl ParameterHashWriter {
    pub fn write<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
    ) -> PipelineResult<()> {
        bincode::serialize_into(&mut self.builder, value)?;
        Ok(())
    }

    pub fn write_bytes(
        &mut self,
        bytes: &[u8],
    ) {
        // Length prefix keeps ["ab", "c"] and ["a", "bc"] apart
        self.builder.write(&(bytes.len() as u64).to_le_bytes());
        self.builder.write(bytes);
    }

    pub fn write_str(
        &mut self,
        value: &str,
    ) {
        self.write_bytes(value.as_bytes());
    }

    pub fn finish(&self) -> ObjectId {
        self.builder.compute_hash()
    }
}

/// A unit of build work. Implementations should be pure functions of their parameters and the
/// content of their inputs: given the same parameter hash and input hashes they must register
/// the same outputs.
///
/// `execute` can run on any worker thread. Long running commands should poll
/// `context.is_cancelled()` and return `ResultStatus::Cancelled` promptly when it is set.
pub trait Command: TypeUuid + Send + Sync + RefUnwindSafe + 'static {
    /// Human-readable label for logs, not part of the command identity
    fn title(&self) -> String;

    /// Bump to invalidate every cached result of this command type
    fn version(&self) -> u32 {
        1
    }

    /// Write everything that affects the output. The default writes nothing.
    fn compute_parameter_hash(
        &self,
        _writer: &mut ParameterHashWriter,
    ) -> PipelineResult<()> {
        Ok(())
    }

    /// Static inputs, known before execution. Used both to order the build and as part of the
    /// cache key.
    fn input_files(&self) -> Vec<ObjectUrl> {
        Vec::default()
    }

    /// Content urls this command promises to register. Other commands that list one of these
    /// as an input will wait for this command.
    fn output_files(&self) -> Vec<ObjectUrl> {
        Vec::default()
    }

    /// Runs once on the calling thread before anything executes. Commands that expand into
    /// smaller pieces of work add them here, and they will complete before `execute` runs.
    fn prepare(
        &self,
        _context: &mut PrepareContext,
    ) -> PipelineResult<()> {
        Ok(())
    }

    fn execute(
        &self,
        context: &mut CommandContext,
    ) -> PipelineResult<ResultStatus>;

    /// Called from the coordinating thread when the build is cancelled while this command is
    /// executing. Use it to release any wait the command is blocked on.
    fn cancel(&self) {}

    /// Commands with side effects beyond their registered outputs must opt out
    fn is_cacheable(&self) -> bool {
        true
    }
}

// Object-safe view of a Command, so commands of any type can live in one graph
pub(crate) trait CommandAbstract: Send + Sync + RefUnwindSafe {
    fn command_type_inner(&self) -> CommandTypeId;

    fn title_inner(&self) -> String;

    fn version_inner(&self) -> u32;

    fn parameter_hash_inner(&self) -> PipelineResult<ObjectId>;

    fn input_files_inner(&self) -> Vec<ObjectUrl>;

    fn output_files_inner(&self) -> Vec<ObjectUrl>;

    fn prepare_inner(
        &self,
        context: &mut PrepareContext,
    ) -> PipelineResult<()>;

    fn execute_inner(
        &self,
        context: &mut CommandContext,
    ) -> PipelineResult<ResultStatus>;

    fn cancel_inner(&self);

    fn is_cacheable_inner(&self) -> bool;
}

pub(crate) struct CommandWrapper<T: Command>(pub(crate) T);

impl<T: Command> CommandAbstract for CommandWrapper<T> {
    fn command_type_inner(&self) -> CommandTypeId {
        CommandTypeId::of::<T>()
    }

    fn title_inner(&self) -> String {
        self.0.title()
    }

    fn version_inner(&self) -> u32 {
        self.0.version()
    }

    fn parameter_hash_inner(&self) -> PipelineResult<ObjectId> {
        let mut writer = ParameterHashWriter::default();
        self.0.compute_parameter_hash(&mut writer)?;
        Ok(writer.finish())
    }

    fn input_files_inner(&self) -> Vec<ObjectUrl> {
        self.0.input_files()
    }

    fn output_files_inner(&self) -> Vec<ObjectUrl> {
        self.0.output_files()
    }

    fn prepare_inner(
        &self,
        context: &mut PrepareContext,
    ) -> PipelineResult<()> {
        self.0.prepare(context)
    }

    fn execute_inner(
        &self,
        context: &mut CommandContext,
    ) -> PipelineResult<ResultStatus> {
        profiling::scope!(&format!("{}::execute", std::any::type_name::<T>()));
        self.0.execute(context)
    }

    fn cancel_inner(&self) {
        self.0.cancel()
    }

    fn is_cacheable_inner(&self) -> bool {
        self.0.is_cacheable()
    }
}
