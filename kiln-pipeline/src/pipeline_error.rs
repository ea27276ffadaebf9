use kiln_base::ObjectIdParseError;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum PipelineError {
    StringError(String),
    IoError(Arc<std::io::Error>),
    BincodeError(Arc<bincode::Error>),
    JsonError(Arc<serde_json::Error>),
    ParseError(ObjectIdParseError),
    // A dependency cycle, listed as step titles in dependency order with the first step repeated
    // at the end
    CycleDetected(Vec<String>),
    InvalidGraph(String),
    MissingContent(String),
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            PipelineError::StringError(_) => None,
            PipelineError::IoError(ref e) => Some(&**e),
            PipelineError::BincodeError(ref e) => Some(&**e),
            PipelineError::JsonError(ref e) => Some(&**e),
            PipelineError::ParseError(ref e) => Some(e),
            PipelineError::CycleDetected(_) => None,
            PipelineError::InvalidGraph(_) => None,
            PipelineError::MissingContent(_) => None,
        }
    }
}

impl core::fmt::Display for PipelineError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            PipelineError::StringError(ref e) => e.fmt(fmt),
            PipelineError::IoError(ref e) => e.fmt(fmt),
            PipelineError::BincodeError(ref e) => e.fmt(fmt),
            PipelineError::JsonError(ref e) => e.fmt(fmt),
            PipelineError::ParseError(ref e) => e.fmt(fmt),
            PipelineError::CycleDetected(ref chain) => {
                write!(fmt, "Dependency cycle detected: {}", chain.join(" -> "))
            }
            PipelineError::InvalidGraph(ref e) => write!(fmt, "Invalid build graph: {}", e),
            PipelineError::MissingContent(ref e) => write!(fmt, "Missing content: {}", e),
        }
    }
}

impl From<&str> for PipelineError {
    fn from(str: &str) -> Self {
        PipelineError::StringError(str.to_string())
    }
}

impl From<String> for PipelineError {
    fn from(string: String) -> Self {
        PipelineError::StringError(string)
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(error: std::io::Error) -> Self {
        PipelineError::IoError(Arc::new(error))
    }
}

impl From<bincode::Error> for PipelineError {
    fn from(error: bincode::Error) -> Self {
        PipelineError::BincodeError(Arc::new(error))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(error: serde_json::Error) -> Self {
        PipelineError::JsonError(Arc::new(error))
    }
}

impl From<ObjectIdParseError> for PipelineError {
    fn from(error: ObjectIdParseError) -> Self {
        PipelineError::ParseError(error)
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
