use super::executor_thread_pool::{
    ExecutorThreadPool, ExecutorThreadPoolOutcome, ExecutorThreadPoolRequest, RunStepRequest,
    StepOutcome,
};
use super::output_groups::OutputObjectGroups;
use super::resolver::{CompletionUpdate, DependencyTracker, ReadyQueue, ResolvedGraph};
use crate::cache::ResultCache;
use crate::content::ContentResolver;
use crate::{
    BuildGraph, BuildLogData, BuildLogEvent, BuildResult, BuildResultCode, CancellationToken,
    LogEventLevel, ObjectDatabase, ResultStatus, StepId,
};
use crossbeam_channel::Receiver;
use kiln_base::hashing::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PROGRESS_PRINT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct BuildOptions {
    // Number of worker threads, and so the most commands that execute at once
    pub thread_count: usize,
    // Ignore the result cache and execute every command. Results are still written to the cache.
    pub force_rebuild: bool,
    pub cancellation_token: CancellationToken,
    // Events below this level are left out of the build log
    pub log_level: LogEventLevel,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            thread_count: num_cpus::get(),
            force_rebuild: false,
            cancellation_token: CancellationToken::new(),
            log_level: LogEventLevel::Info,
        }
    }
}

// State shared by the coordinator and the workers for the duration of one build
pub(crate) struct BuildSession {
    pub(crate) graph: ResolvedGraph,
    pub(crate) content: ContentResolver,
    pub(crate) result_cache: ResultCache,
    pub(crate) output_groups: OutputObjectGroups,
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) force_rebuild: bool,
}

/// Runs build graphs against a long-lived object database and result cache. Cheap to clone.
#[derive(Clone)]
pub struct BuildEngine {
    object_database: ObjectDatabase,
    result_cache: ResultCache,
    source_root_path: Option<PathBuf>,
}

impl BuildEngine {
    pub fn new(
        object_database: ObjectDatabase,
        result_cache: ResultCache,
    ) -> Self {
        BuildEngine {
            object_database,
            result_cache,
            source_root_path: None,
        }
    }

    /// File urls are resolved relative to this path. Without it they are used as given.
    pub fn with_source_root_path<T: Into<PathBuf>>(
        mut self,
        source_root_path: T,
    ) -> Self {
        self.source_root_path = Some(source_root_path.into());
        self
    }

    pub fn object_database(&self) -> &ObjectDatabase {
        &self.object_database
    }

    pub fn result_cache(&self) -> &ResultCache {
        &self.result_cache
    }

    pub fn source_root_path(&self) -> Option<&Path> {
        self.source_root_path.as_deref()
    }

    fn unprocessed_result(
        graph: &BuildGraph,
        code: BuildResultCode,
        mut log_data: BuildLogData,
        message: String,
    ) -> BuildResult {
        log::error!("{}", message);
        log_data.push(BuildLogEvent {
            step_id: None,
            level: LogEventLevel::FatalError,
            message,
        });
        log_data.finish();

        let mut result = BuildResult::new(code, log_data);
        result.step_statuses = graph
            .step_ids()
            .map(|x| (x, ResultStatus::NotProcessed))
            .collect();
        result
    }

    /// Build `root` and everything it needs. Commands reachable from `root` are prepared, which
    /// may add steps to `graph`.
    pub fn build(
        &self,
        graph: &mut BuildGraph,
        root: StepId,
        options: &BuildOptions,
    ) -> BuildResult {
        profiling::scope!("BuildEngine::build");
        let log_data = BuildLogData::default();
        log::info!("Starting build {}", log_data.id().to_simple());

        if options.thread_count == 0 {
            return Self::unprocessed_result(
                graph,
                BuildResultCode::CommandLineError,
                log_data,
                "Build thread count must be at least 1".to_string(),
            );
        }

        let resolved = match ResolvedGraph::resolve(graph, root) {
            Ok(resolved) => resolved,
            Err(e) => {
                return Self::unprocessed_result(
                    graph,
                    BuildResultCode::BuildError,
                    log_data,
                    format!("Could not build {}: {}", graph.step_title(root).unwrap_or("?"), e),
                );
            }
        };

        let session = Arc::new(BuildSession {
            graph: resolved,
            content: ContentResolver::new(
                self.object_database.clone(),
                self.source_root_path.clone(),
            ),
            result_cache: self.result_cache.clone(),
            output_groups: OutputObjectGroups::default(),
            cancellation_token: options.cancellation_token.clone(),
            force_rebuild: options.force_rebuild,
        });

        let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded();
        let thread_pool =
            match ExecutorThreadPool::new(session.clone(), options.thread_count, outcome_tx) {
                Ok(thread_pool) => thread_pool,
                Err(e) => {
                    return Self::unprocessed_result(
                        graph,
                        BuildResultCode::BuildError,
                        log_data,
                        format!("Could not start build threads: {}", e),
                    );
                }
            };

        // Wake the coordinator as soon as the build is cancelled
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(1);
        let cancel_callback_id = options.cancellation_token.on_cancel(move || {
            let _ = cancel_tx.try_send(());
        });

        let mut coordinator = BuildCoordinator::new(&session, options, &thread_pool, log_data);
        coordinator.run(&outcome_rx, cancel_rx);

        let result = coordinator.into_result();
        thread_pool.finish();
        options.cancellation_token.unregister(cancel_callback_id);

        self.object_database
            .update_content_index(result.output_objects.iter());

        if let Err(e) = self.result_cache.save() {
            log::warn!("Could not save result cache: {}", e);
        }
        if let Err(e) = self.object_database.save_index() {
            log::warn!("Could not save content index: {}", e);
        }

        log::info!(
            "Build {} finished: {:?}, {} executed, {} reused from cache, took {:?}",
            result.log.id().to_simple(),
            result.code,
            result.executed_count,
            result.cache_hit_count,
            result.log.duration().unwrap_or_default()
        );

        result
    }
}

// Owns all scheduling state. Only ever touched from the thread that called build(), workers report
// back over a channel.
struct BuildCoordinator<'a> {
    session: &'a BuildSession,
    thread_pool: &'a ExecutorThreadPool,
    thread_count: usize,
    log_level: LogEventLevel,
    tracker: DependencyTracker,
    ready: ReadyQueue,
    in_flight: HashSet<usize>,
    cancelled: bool,
    executed_count: usize,
    cache_hit_count: usize,
    last_progress_print_time: Option<Instant>,
    log_data: BuildLogData,
}

impl<'a> BuildCoordinator<'a> {
    fn new(
        session: &'a BuildSession,
        options: &BuildOptions,
        thread_pool: &'a ExecutorThreadPool,
        log_data: BuildLogData,
    ) -> Self {
        BuildCoordinator {
            session,
            thread_pool,
            thread_count: options.thread_count,
            log_level: options.log_level,
            tracker: DependencyTracker::new(&session.graph),
            ready: ReadyQueue::default(),
            in_flight: HashSet::default(),
            cancelled: false,
            executed_count: 0,
            cache_hit_count: 0,
            last_progress_print_time: None,
            log_data,
        }
    }

    fn push_log(
        &mut self,
        log_event: BuildLogEvent,
    ) {
        if log_event.level < self.log_level {
            return;
        }

        let graph = &self.session.graph;
        match log_event.step_id.and_then(|x| graph.node_index(x)) {
            Some(node) => {
                let title = &graph.node(node).title;
                log_event
                    .level
                    .forward_to_log(&format!("[{}] {}", title, log_event.message));
            }
            None => log_event.level.forward_to_log(&log_event.message),
        }

        self.log_data.push(log_event);
    }

    // Commands go into the ready queue. Lists have nothing to run, so they complete right away.
    fn enqueue_ready(
        &mut self,
        nodes: Vec<usize>,
    ) {
        let session = self.session;
        let mut pending = nodes;
        while let Some(node) = pending.pop() {
            if session.graph.node(node).command.is_some() {
                self.ready.push(&session.graph, node);
                continue;
            }

            let update = self
                .tracker
                .complete(&session.graph, node, ResultStatus::Successful);
            pending.extend(update.ready);
        }
    }

    fn handle_update(
        &mut self,
        update: CompletionUpdate,
    ) {
        for &node in &update.skipped {
            let step_id = self.session.graph.node(node).step_id;
            self.push_log(BuildLogEvent {
                step_id: Some(step_id),
                level: LogEventLevel::Verbose,
                message: "Not started because a prerequisite did not succeed".to_string(),
            });
        }

        self.enqueue_ready(update.ready);
        if self.cancelled {
            self.cancel_pending();
        }
    }

    fn dispatch(&mut self) {
        while self.in_flight.len() < self.thread_count {
            let Some(node) = self.ready.pop() else {
                break;
            };

            self.in_flight.insert(node);
            self.thread_pool
                .add_request(ExecutorThreadPoolRequest::RunStep(RunStepRequest { node }));
        }
    }

    fn handle_outcome(
        &mut self,
        outcome: StepOutcome,
    ) {
        let session = self.session;
        let node = session.graph.node(outcome.node);
        self.in_flight.remove(&outcome.node);

        if outcome.executed {
            self.executed_count += 1;
        }
        if outcome.cache_hit {
            self.cache_hit_count += 1;
        }

        // Outputs of anything that did not succeed are never visible to other steps
        if outcome.status.is_successful() {
            session.output_groups.commit(node.step_id, &outcome.outputs);
        }

        for log_event in outcome.log_events {
            self.push_log(log_event);
        }

        if outcome.status == ResultStatus::Failed {
            self.push_log(BuildLogEvent {
                step_id: Some(node.step_id),
                level: LogEventLevel::Error,
                message: "Step failed".to_string(),
            });
        }

        let update = self
            .tracker
            .complete(&session.graph, outcome.node, outcome.status);
        self.handle_update(update);
    }

    fn begin_cancel(&mut self) {
        if self.cancelled {
            return;
        }

        self.cancelled = true;
        self.push_log(BuildLogEvent {
            step_id: None,
            level: LogEventLevel::Info,
            message: format!(
                "Build cancelled, waiting for {} running steps",
                self.in_flight.len()
            ),
        });

        // Give commands blocked on their own waits a chance to notice
        for &node in &self.in_flight {
            if let Some(command) = &self.session.graph.node(node).command {
                command.command.cancel_inner();
            }
        }

        self.cancel_pending();
    }

    // Everything that has not started yet will not start
    fn cancel_pending(&mut self) {
        while self.ready.pop().is_some() {}

        for node in 0..self.session.graph.len() {
            if !self.in_flight.contains(&node) {
                self.tracker
                    .settle_without_propagation(node, ResultStatus::Cancelled);
            }
        }
    }

    fn print_progress(&mut self) {
        let now = Instant::now();
        if let Some(last_progress_print_time) = self.last_progress_print_time {
            if (now - last_progress_print_time) < PROGRESS_PRINT_INTERVAL {
                return;
            }
        }

        log::info!(
            "Steps: {}/{} ({} running)",
            self.tracker.settled_count(),
            self.session.graph.len(),
            self.thread_pool.active_request_count()
        );
        self.last_progress_print_time = Some(now);
    }

    #[profiling::function]
    fn run(
        &mut self,
        outcome_rx: &Receiver<ExecutorThreadPoolOutcome>,
        mut cancel_rx: Receiver<()>,
    ) {
        self.enqueue_ready(self.tracker.initially_ready());

        loop {
            if !self.cancelled && self.session.cancellation_token.is_cancelled() {
                self.begin_cancel();
                cancel_rx = crossbeam_channel::never();
            }

            if !self.cancelled {
                self.dispatch();
            }

            if self.in_flight.is_empty() {
                if self.tracker.all_settled() {
                    break;
                }

                // Nothing is running and nothing can start. Steps still waiting would wait forever.
                log::error!("Build stalled with steps still waiting on prerequisites");
                for node in 0..self.session.graph.len() {
                    self.tracker
                        .settle_without_propagation(node, ResultStatus::NotProcessed);
                }
                break;
            }

            let mut cancel_signalled = false;
            crossbeam_channel::select! {
                recv(outcome_rx) -> msg => {
                    match msg {
                        Ok(ExecutorThreadPoolOutcome::RunStepComplete(outcome)) => self.handle_outcome(outcome),
                        Err(_) => {
                            log::error!("Build workers disconnected with steps in flight");
                            break;
                        }
                    }
                },
                recv(cancel_rx) -> _msg => cancel_signalled = true,
                default(PROGRESS_PRINT_INTERVAL) => {}
            }

            if cancel_signalled {
                self.begin_cancel();
                cancel_rx = crossbeam_channel::never();
            }

            self.print_progress();
        }
    }

    fn into_result(mut self) -> BuildResult {
        let session = self.session;
        let mut step_statuses = std::collections::BTreeMap::default();
        let mut step_outputs = std::collections::BTreeMap::default();
        for (index, node) in session.graph.nodes().enumerate() {
            let status = self
                .tracker
                .status(index)
                .unwrap_or(ResultStatus::NotProcessed);
            step_statuses.insert(node.step_id, status);

            if let Some(outputs) = session.output_groups.group(node.step_id) {
                step_outputs.insert(node.step_id, outputs);
            }
        }

        let any_failed = step_statuses
            .values()
            .any(|x| matches!(x, ResultStatus::Failed | ResultStatus::NotProcessed));
        let all_successful = step_statuses.values().all(|x| x.is_successful());
        let code = if any_failed {
            BuildResultCode::BuildError
        } else if self.cancelled || !all_successful {
            BuildResultCode::Cancelled
        } else {
            BuildResultCode::Successful
        };

        self.log_data.finish();
        let mut result = BuildResult::new(code, self.log_data);
        result.step_statuses = step_statuses;
        result.step_outputs = step_outputs;
        result.output_objects = session.output_groups.all_outputs();
        result.executed_count = self.executed_count;
        result.cache_hit_count = self.cache_hit_count;
        result
    }
}
