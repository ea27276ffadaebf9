mod cancellation;
pub use cancellation::CancellationToken;

mod command_traits;
pub use command_traits::{Command, CommandTypeId, ParameterHashWriter, ResultStatus};
pub(crate) use command_traits::{CommandAbstract, CommandWrapper};

mod command_context;
pub use command_context::CommandContext;
pub(crate) use command_context::CommandContextResults;
