use crate::StepId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogEventLevel {
    Debug,
    Verbose,
    Info,
    Warning,
    Error,
    FatalError,
}

impl LogEventLevel {
    pub(crate) fn forward_to_log(
        self,
        message: &str,
    ) {
        match self {
            LogEventLevel::Debug => log::trace!("{}", message),
            LogEventLevel::Verbose => log::debug!("{}", message),
            LogEventLevel::Info => log::info!("{}", message),
            LogEventLevel::Warning => log::warn!("{}", message),
            LogEventLevel::Error | LogEventLevel::FatalError => log::error!("{}", message),
        }
    }
}

// The part of a log event that gets stored in the result cache and replayed on a cache hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedLogEvent {
    pub level: LogEventLevel,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct BuildLogEvent {
    pub step_id: Option<StepId>,
    pub level: LogEventLevel,
    pub message: String,
}

impl BuildLogEvent {
    pub(crate) fn to_cached(&self) -> CachedLogEvent {
        CachedLogEvent {
            level: self.level,
            message: self.message.clone(),
        }
    }
}

pub struct BuildLogData {
    pub(crate) id: Uuid,
    pub(crate) start_instant: std::time::Instant,
    pub(crate) end_instant: Option<std::time::Instant>,
    pub(crate) start_time: std::time::SystemTime,
    pub(crate) end_time: Option<std::time::SystemTime>,
    pub(crate) log_events: Vec<BuildLogEvent>,
}

impl Default for BuildLogData {
    fn default() -> Self {
        BuildLogData {
            id: Uuid::new_v4(),
            start_instant: std::time::Instant::now(),
            end_instant: None,
            start_time: std::time::SystemTime::now(),
            end_time: None,
            log_events: vec![],
        }
    }
}

impl BuildLogData {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn log_events(&self) -> &[BuildLogEvent] {
        &self.log_events
    }

    pub fn start_time(&self) -> std::time::SystemTime {
        self.start_time
    }

    pub fn end_time(&self) -> Option<std::time::SystemTime> {
        self.end_time
    }

    pub fn duration(&self) -> Option<std::time::Duration> {
        self.end_instant
            .map(|end_instant| end_instant - self.start_instant)
    }

    pub fn events_for_step(
        &self,
        step_id: StepId,
    ) -> impl Iterator<Item = &BuildLogEvent> {
        self.log_events
            .iter()
            .filter(move |x| x.step_id == Some(step_id))
    }

    pub fn has_errors(&self) -> bool {
        self.log_events
            .iter()
            .any(|x| x.level >= LogEventLevel::Error)
    }

    pub(crate) fn push(
        &mut self,
        log_event: BuildLogEvent,
    ) {
        self.log_events.push(log_event);
    }

    pub(crate) fn finish(&mut self) {
        self.end_instant = Some(std::time::Instant::now());
        self.end_time = Some(std::time::SystemTime::now());
    }
}
