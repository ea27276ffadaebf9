use super::executor::BuildSession;
use crate::cache::{CacheEntry, CacheKey};
use crate::command::{CommandContext, CommandContextResults};
use crate::{BuildLogEvent, LogEventLevel, ObjectUrl, PipelineResult, ResultStatus};
use crossbeam_channel::{Receiver, Sender};
use kiln_base::ObjectId;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

// Ask a worker to run (or reuse the cached result of) one command node
pub(crate) struct RunStepRequest {
    pub node: usize,
}

pub(crate) enum ExecutorThreadPoolRequest {
    RunStep(RunStepRequest),
}

pub(crate) struct StepOutcome {
    pub node: usize,
    pub status: ResultStatus,
    pub outputs: BTreeMap<ObjectUrl, ObjectId>,
    pub log_events: Vec<BuildLogEvent>,
    pub cache_hit: bool,
    pub executed: bool,
}

impl StepOutcome {
    fn not_run(
        node: usize,
        status: ResultStatus,
    ) -> Self {
        StepOutcome {
            node,
            status,
            outputs: Default::default(),
            log_events: Vec::default(),
            cache_hit: false,
            executed: false,
        }
    }
}

pub(crate) enum ExecutorThreadPoolOutcome {
    RunStepComplete(StepOutcome),
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|x| x.as_secs())
        .unwrap_or(0)
}

// A cached result is only reusable if it succeeded, its content is still around, and everything
// it discovered while running still has the same content
fn is_cache_entry_valid(
    session: &BuildSession,
    entry: &CacheEntry,
    visible_outputs: &crate::build::OutputObjectsSnapshot,
) -> bool {
    if entry.status != ResultStatus::Successful {
        return false;
    }

    for (_, object_id) in &entry.output_objects {
        if !session.content.object_database().exists(*object_id) {
            return false;
        }
    }

    for (url, object_id) in &entry.discovered_dependencies {
        let current_id = session
            .content
            .resolve(url, visible_outputs)
            .unwrap_or_else(ObjectId::null);
        if current_id != *object_id {
            return false;
        }
    }

    true
}

fn do_build(
    session: &BuildSession,
    request: RunStepRequest,
) -> StepOutcome {
    let node = session.graph.node(request.node);
    profiling::scope!(&format!("Handle Step {}", node.title));

    let Some(command) = &node.command else {
        // Lists have nothing to run
        return StepOutcome::not_run(request.node, ResultStatus::Successful);
    };

    if session.cancellation_token.is_cancelled() {
        return StepOutcome::not_run(request.node, ResultStatus::Cancelled);
    }

    let visible_outputs = session.output_groups.snapshot();
    let mut log_events = Vec::default();

    //
    // Hash what the command reads. Something that does not exist hashes to null, so that it
    // appearing later still changes the key.
    //
    let mut inputs = Vec::with_capacity(command.input_files.len());
    for input_url in command.input_files.iter() {
        let object_id = match session.content.resolve(input_url, &visible_outputs) {
            Some(object_id) => object_id,
            None => {
                log_events.push(BuildLogEvent {
                    step_id: Some(node.step_id),
                    level: LogEventLevel::Warning,
                    message: format!("Input {} does not exist", input_url),
                });
                ObjectId::null()
            }
        };
        inputs.push((input_url.clone(), object_id));
    }

    let cache_key = CacheKey::new(
        command.command_type,
        command.command_version,
        command.parameter_hash,
        inputs,
    );

    //
    // Reuse the previous result if nothing it depends on has changed
    //
    if command.is_cacheable && !session.force_rebuild {
        if let Some(entry) = session.result_cache.try_get(&cache_key) {
            if is_cache_entry_valid(session, &entry, &visible_outputs) {
                log_events.extend(entry.log_events.iter().map(|x| BuildLogEvent {
                    step_id: Some(node.step_id),
                    level: x.level,
                    message: x.message.clone(),
                }));

                return StepOutcome {
                    node: request.node,
                    status: ResultStatus::NotTriggeredWasSuccessful,
                    outputs: entry.output_objects.iter().cloned().collect(),
                    log_events,
                    cache_hit: true,
                    executed: false,
                };
            }

            log::debug!("Cached result for {} is stale", node.title);
        }
    }

    //
    // Run the command. Errors and panics are failures of this step only.
    //
    let mut context = CommandContext::new(
        node.step_id,
        &node.title,
        &session.content,
        &session.cancellation_token,
        visible_outputs,
    );

    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        command.command.execute_inner(&mut context)
    }));

    let status = match result {
        Ok(Ok(
            status @ (ResultStatus::Successful | ResultStatus::Failed | ResultStatus::Cancelled),
        )) => status,
        Ok(Ok(status)) => {
            context.error(format!(
                "Command returned {:?}, which is not a valid result of executing",
                status
            ));
            ResultStatus::Failed
        }
        Ok(Err(e)) => {
            context.error(format!("Command returned error: {}", e));
            ResultStatus::Failed
        }
        Err(payload) => {
            context.error(format!("Command panicked: {}", panic_message(&*payload)));
            ResultStatus::Failed
        }
    };

    let CommandContextResults {
        registered_outputs,
        discovered_dependencies,
        log_events: command_log_events,
    } = context.finish();

    if command.is_cacheable {
        session.result_cache.put(
            cache_key,
            CacheEntry {
                output_objects: registered_outputs
                    .iter()
                    .map(|(url, id)| (url.clone(), *id))
                    .collect(),
                discovered_dependencies: discovered_dependencies.into_iter().collect(),
                // Only what the command itself logged, the rest is recomputed on every lookup
                log_events: command_log_events.iter().map(|x| x.to_cached()).collect(),
                status,
                timestamp: unix_timestamp(),
            },
        );
    }

    log_events.extend(command_log_events);

    StepOutcome {
        node: request.node,
        status,
        outputs: registered_outputs,
        log_events,
        cache_hit: false,
        executed: true,
    }
}

// Thread that tries to take steps out of the request channel and ends when the finish channel is
// signalled
struct ExecutorWorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl ExecutorWorkerThread {
    fn new(
        session: Arc<BuildSession>,
        request_rx: Receiver<ExecutorThreadPoolRequest>,
        outcome_tx: Sender<ExecutorThreadPoolOutcome>,
        active_request_count: Arc<AtomicUsize>,
        thread_index: usize,
    ) -> PipelineResult<Self> {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let join_handle = std::thread::Builder::new()
            .name(format!("Build Worker {}", thread_index))
            .spawn(move || {
                profiling::register_thread!(&format!("ExecutorWorkerThread {}", thread_index));
                loop {
                    crossbeam_channel::select! {
                        recv(request_rx) -> msg => {
                            let Ok(msg) = msg else {
                                return;
                            };

                            match msg {
                                ExecutorThreadPoolRequest::RunStep(msg) => {
                                    profiling::scope!("ExecutorThreadPoolRequest::RunStep");
                                    let outcome = do_build(&session, msg);
                                    active_request_count.fetch_sub(1, Ordering::Release);
                                    if outcome_tx.send(ExecutorThreadPoolOutcome::RunStepComplete(outcome)).is_err() {
                                        return;
                                    }
                                }
                            }
                        },
                        recv(finish_rx) -> _msg => {
                            return;
                        }
                    }
                }
            })?;

        Ok(ExecutorWorkerThread {
            finish_tx,
            join_handle,
        })
    }
}

// Spawns N threads, proxies messages to/from them, and stops the threads on finish()
pub(crate) struct ExecutorThreadPool {
    worker_threads: Vec<ExecutorWorkerThread>,
    request_tx: Sender<ExecutorThreadPoolRequest>,
    active_request_count: Arc<AtomicUsize>,
}

impl ExecutorThreadPool {
    pub(crate) fn new(
        session: Arc<BuildSession>,
        thread_count: usize,
        outcome_tx: Sender<ExecutorThreadPoolOutcome>,
    ) -> PipelineResult<Self> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<ExecutorThreadPoolRequest>();
        let active_request_count = Arc::new(AtomicUsize::new(0));

        let mut worker_threads = Vec::with_capacity(thread_count);
        for thread_index in 0..thread_count {
            let worker = ExecutorWorkerThread::new(
                session.clone(),
                request_rx.clone(),
                outcome_tx.clone(),
                active_request_count.clone(),
                thread_index,
            )?;
            worker_threads.push(worker);
        }

        Ok(ExecutorThreadPool {
            worker_threads,
            request_tx,
            active_request_count,
        })
    }

    pub(crate) fn active_request_count(&self) -> usize {
        self.active_request_count.load(Ordering::Acquire)
    }

    pub(crate) fn add_request(
        &self,
        request: ExecutorThreadPoolRequest,
    ) {
        self.active_request_count.fetch_add(1, Ordering::Release);
        // Workers only drop the receiver after finish(), which consumes the pool
        let _ = self.request_tx.send(request);
    }

    pub(crate) fn finish(self) {
        for worker_thread in &self.worker_threads {
            let _ = worker_thread.finish_tx.send(());
        }

        for worker_thread in self.worker_threads {
            if worker_thread.join_handle.join().is_err() {
                log::error!("Build worker thread panicked");
            }
        }
    }
}
