use crate::{
    BuildEngine, BuildGraph, BuildOptions, BuildPriority, BuildResultCode, CancellationToken,
    Command, CommandContext, LogEventLevel, ObjectDatabase, ObjectId, ObjectUrl,
    ParameterHashWriter, PipelineResult, PrepareContext, ResultCache, ResultStatus, StepId,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use type_uuid::TypeUuid;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn in_memory_engine() -> BuildEngine {
    BuildEngine::new(ObjectDatabase::in_memory(), ResultCache::in_memory())
}

fn options(thread_count: usize) -> BuildOptions {
    BuildOptions {
        thread_count,
        ..Default::default()
    }
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn count(counter: &Arc<AtomicUsize>) -> usize {
    counter.load(Ordering::SeqCst)
}

//
// Writes fixed content to a content url
//
#[derive(TypeUuid)]
#[uuid = "6478d596-7f6c-4dbf-9a83-ad2096c633cd"]
struct EchoCommand {
    path: String,
    content: String,
    // Only counts executions, deliberately not part of the parameter hash
    executions: Arc<AtomicUsize>,
}

impl EchoCommand {
    fn new(
        path: &str,
        content: &str,
        executions: &Arc<AtomicUsize>,
    ) -> Self {
        EchoCommand {
            path: path.to_string(),
            content: content.to_string(),
            executions: executions.clone(),
        }
    }
}

impl Command for EchoCommand {
    fn title(&self) -> String {
        format!("Echo {}", self.path)
    }

    fn compute_parameter_hash(
        &self,
        writer: &mut ParameterHashWriter,
    ) -> PipelineResult<()> {
        writer.write_str(&self.path);
        writer.write_str(&self.content);
        Ok(())
    }

    fn output_files(&self) -> Vec<ObjectUrl> {
        vec![ObjectUrl::content(self.path.as_str())]
    }

    fn execute(
        &self,
        context: &mut CommandContext,
    ) -> PipelineResult<ResultStatus> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        context.write_output(ObjectUrl::content(self.path.as_str()), self.content.as_bytes())?;
        context.info(format!("Wrote {}", self.path));
        Ok(ResultStatus::Successful)
    }
}

//
// Concatenates its inputs into one output
//
#[derive(TypeUuid)]
#[uuid = "c0168beb-c72c-48eb-8887-58224a414a3a"]
struct ConcatCommand {
    inputs: Vec<ObjectUrl>,
    output: String,
    executions: Arc<AtomicUsize>,
}

impl ConcatCommand {
    fn new(
        inputs: Vec<ObjectUrl>,
        output: &str,
        executions: &Arc<AtomicUsize>,
    ) -> Self {
        ConcatCommand {
            inputs,
            output: output.to_string(),
            executions: executions.clone(),
        }
    }
}

impl Command for ConcatCommand {
    fn title(&self) -> String {
        format!("Concat {}", self.output)
    }

    fn compute_parameter_hash(
        &self,
        writer: &mut ParameterHashWriter,
    ) -> PipelineResult<()> {
        writer.write(&self.inputs)?;
        writer.write_str(&self.output);
        Ok(())
    }

    fn input_files(&self) -> Vec<ObjectUrl> {
        self.inputs.clone()
    }

    fn output_files(&self) -> Vec<ObjectUrl> {
        vec![ObjectUrl::content(self.output.as_str())]
    }

    fn execute(
        &self,
        context: &mut CommandContext,
    ) -> PipelineResult<ResultStatus> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let mut data = Vec::default();
        for input in &self.inputs {
            data.extend_from_slice(&context.read_input(input)?);
        }

        context.write_output(ObjectUrl::content(self.output.as_str()), &data)?;
        Ok(ResultStatus::Successful)
    }
}

//
// Fails, after optionally writing an output that must never become visible
//
#[derive(TypeUuid)]
#[uuid = "671ea0b9-9131-487c-9a42-4d7ff3b63ee4"]
struct FailingCommand {
    return_error: bool,
    executions: Arc<AtomicUsize>,
}

impl Command for FailingCommand {
    fn title(&self) -> String {
        "Failing".to_string()
    }

    fn compute_parameter_hash(
        &self,
        writer: &mut ParameterHashWriter,
    ) -> PipelineResult<()> {
        writer.write(&self.return_error)
    }

    fn execute(
        &self,
        context: &mut CommandContext,
    ) -> PipelineResult<ResultStatus> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        context.write_output(ObjectUrl::content("partial"), b"partial")?;
        if self.return_error {
            return Err("bad input".into());
        }

        context.error("Could not do the thing");
        Ok(ResultStatus::Failed)
    }
}

#[derive(TypeUuid)]
#[uuid = "0f80528d-6860-41b2-88bf-6dd1038c9811"]
struct PanickingCommand;

impl Command for PanickingCommand {
    fn title(&self) -> String {
        "Panicking".to_string()
    }

    fn execute(
        &self,
        _context: &mut CommandContext,
    ) -> PipelineResult<ResultStatus> {
        panic!("boom");
    }
}

//
// Waits until released by cancel()
//
#[derive(TypeUuid)]
#[uuid = "4f9b0141-9264-4b10-abc5-c2f03933b790"]
struct BlockedCommand {
    started: Arc<AtomicBool>,
    released: Arc<(Mutex<bool>, Condvar)>,
}

impl BlockedCommand {
    fn new(started: &Arc<AtomicBool>) -> Self {
        BlockedCommand {
            started: started.clone(),
            released: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }
}

impl Command for BlockedCommand {
    fn title(&self) -> String {
        "Blocked".to_string()
    }

    fn execute(
        &self,
        context: &mut CommandContext,
    ) -> PipelineResult<ResultStatus> {
        self.started.store(true, Ordering::SeqCst);

        let (lock, condvar) = &*self.released;
        let mut released = lock.lock().unwrap();
        while !*released && !context.is_cancelled() {
            released = condvar
                .wait_timeout(released, Duration::from_secs(5))
                .unwrap()
                .0;
        }

        if context.is_cancelled() {
            Ok(ResultStatus::Cancelled)
        } else {
            Ok(ResultStatus::Successful)
        }
    }

    fn cancel(&self) {
        let (lock, condvar) = &*self.released;
        *lock.lock().unwrap() = true;
        condvar.notify_all();
    }

    fn is_cacheable(&self) -> bool {
        false
    }
}

//
// Copies a source file it only finds out about while executing
//
#[derive(TypeUuid)]
#[uuid = "14ec7b8d-43e2-461d-9369-a5b2abe9df20"]
struct IncludeCommand {
    include: String,
    output: String,
    executions: Arc<AtomicUsize>,
}

impl Command for IncludeCommand {
    fn title(&self) -> String {
        format!("Include {}", self.include)
    }

    fn compute_parameter_hash(
        &self,
        writer: &mut ParameterHashWriter,
    ) -> PipelineResult<()> {
        writer.write_str(&self.include);
        writer.write_str(&self.output);
        Ok(())
    }

    fn execute(
        &self,
        context: &mut CommandContext,
    ) -> PipelineResult<ResultStatus> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let include_url = ObjectUrl::file(self.include.as_str());
        context.register_input_dependency(include_url.clone());
        let data = context.read_input(&include_url)?;
        context.write_output(ObjectUrl::content(self.output.as_str()), &data)?;
        Ok(ResultStatus::Successful)
    }
}

//
// Expands into one Echo per part during prepare, then joins them
//
#[derive(TypeUuid)]
#[uuid = "af1dd683-47c6-4b6f-8c35-64f28549d865"]
struct BundleCommand {
    parts: Vec<(String, String)>,
    output: String,
    part_executions: Arc<AtomicUsize>,
    executions: Arc<AtomicUsize>,
}

impl Command for BundleCommand {
    fn title(&self) -> String {
        format!("Bundle {}", self.output)
    }

    fn compute_parameter_hash(
        &self,
        writer: &mut ParameterHashWriter,
    ) -> PipelineResult<()> {
        writer.write_str(&self.output);
        Ok(())
    }

    fn input_files(&self) -> Vec<ObjectUrl> {
        self.parts
            .iter()
            .map(|(path, _)| ObjectUrl::content(path.as_str()))
            .collect()
    }

    fn output_files(&self) -> Vec<ObjectUrl> {
        vec![ObjectUrl::content(self.output.as_str())]
    }

    fn prepare(
        &self,
        context: &mut PrepareContext,
    ) -> PipelineResult<()> {
        for (path, content) in &self.parts {
            context.add_command(EchoCommand::new(path, content, &self.part_executions))?;
        }
        Ok(())
    }

    fn execute(
        &self,
        context: &mut CommandContext,
    ) -> PipelineResult<ResultStatus> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let mut data = Vec::default();
        for input in self.input_files() {
            data.extend_from_slice(&context.read_input(&input)?);
        }

        context.write_output(ObjectUrl::content(self.output.as_str()), &data)?;
        Ok(ResultStatus::Successful)
    }
}

//
// Records the order commands start in
//
#[derive(TypeUuid)]
#[uuid = "e48216f7-5096-4263-bc87-53f7940c11c2"]
struct RecordCommand {
    name: String,
    order: Arc<Mutex<Vec<String>>>,
}

impl Command for RecordCommand {
    fn title(&self) -> String {
        self.name.clone()
    }

    fn execute(
        &self,
        _context: &mut CommandContext,
    ) -> PipelineResult<ResultStatus> {
        self.order.lock().unwrap().push(self.name.clone());
        Ok(ResultStatus::Successful)
    }

    fn is_cacheable(&self) -> bool {
        false
    }
}

fn list_of(
    graph: &mut BuildGraph,
    title: &str,
    children: &[StepId],
) -> StepId {
    let list = graph.add_list(title);
    for &child in children {
        graph.add_child(list, child).unwrap();
    }
    list
}

#[test]
fn echo_is_cached() {
    init_logging();
    let engine = in_memory_engine();
    let executions = counter();

    let mut graph = BuildGraph::new();
    let echo = graph.add_command(EchoCommand::new("a.txt", "hello", &executions));
    let result = engine.build(&mut graph, echo, &options(2));

    assert_eq!(result.code, BuildResultCode::Successful);
    assert_eq!(result.status(echo), Some(ResultStatus::Successful));
    assert_eq!(result.executed_count, 1);
    assert_eq!(count(&executions), 1);
    assert_eq!(engine.result_cache().len(), 1);

    let url = ObjectUrl::content("a.txt");
    let expected_id = ObjectId::from_bytes(b"hello");
    assert_eq!(result.output_objects()[&url], expected_id);
    assert_eq!(result.step_outputs(echo).unwrap()[&url], expected_id);

    // Same command in a new graph, the cached result is reused
    let mut graph = BuildGraph::new();
    let echo = graph.add_command(EchoCommand::new("a.txt", "hello", &executions));
    let result = engine.build(&mut graph, echo, &options(2));

    assert_eq!(result.code, BuildResultCode::Successful);
    assert_eq!(result.status(echo), Some(ResultStatus::NotTriggeredWasSuccessful));
    assert_eq!(result.executed_count, 0);
    assert_eq!(result.cache_hit_count, 1);
    assert_eq!(count(&executions), 1);
    assert_eq!(result.output_objects()[&url], expected_id);

    // The log of the first execution is replayed
    assert!(result
        .log
        .events_for_step(echo)
        .any(|x| x.message == "Wrote a.txt"));
}

#[test]
fn separate_builds_are_deterministic() {
    init_logging();
    let build = || {
        let engine = in_memory_engine();
        let executions = counter();
        let mut graph = BuildGraph::new();
        let a = graph.add_command(EchoCommand::new("a", "hello ", &executions));
        let b = graph.add_command(EchoCommand::new("b", "world", &executions));
        let joined = graph.add_command(ConcatCommand::new(
            vec![ObjectUrl::content("a"), ObjectUrl::content("b")],
            "joined",
            &executions,
        ));
        let root = list_of(&mut graph, "root", &[a, b, joined]);
        let result = engine.build(&mut graph, root, &options(4));
        assert_eq!(result.code, BuildResultCode::Successful);
        result.output_objects().clone()
    };

    let first = build();
    let second = build();
    assert_eq!(first, second);
    assert_eq!(
        first[&ObjectUrl::content("joined")],
        ObjectId::from_bytes(b"hello world")
    );
}

#[test]
fn changed_source_only_rebuilds_what_depends_on_it() {
    init_logging();
    let source_dir = tempfile::tempdir().unwrap();
    std::fs::write(source_dir.path().join("a.txt"), b"A").unwrap();
    std::fs::write(source_dir.path().join("b.txt"), b"B").unwrap();

    let engine = in_memory_engine().with_source_root_path(source_dir.path());
    let executions = counter();
    let build = || {
        let mut graph = BuildGraph::new();
        let a = graph.add_command(ConcatCommand::new(
            vec![ObjectUrl::file("a.txt")],
            "a.out",
            &executions,
        ));
        let b = graph.add_command(ConcatCommand::new(
            vec![ObjectUrl::file("b.txt")],
            "b.out",
            &executions,
        ));
        let joined = graph.add_command(ConcatCommand::new(
            vec![ObjectUrl::content("a.out"), ObjectUrl::content("b.out")],
            "joined",
            &executions,
        ));
        let root = list_of(&mut graph, "root", &[joined, a, b]);
        engine.build(&mut graph, root, &options(4))
    };

    let result = build();
    assert_eq!(result.code, BuildResultCode::Successful);
    assert_eq!(result.executed_count, 3);

    let result = build();
    assert_eq!(result.code, BuildResultCode::Successful);
    assert_eq!(result.executed_count, 0);
    assert_eq!(result.cache_hit_count, 3);

    std::fs::write(source_dir.path().join("a.txt"), b"A2").unwrap();
    let result = build();
    assert_eq!(result.code, BuildResultCode::Successful);
    assert_eq!(result.executed_count, 2);
    assert_eq!(result.cache_hit_count, 1);
    assert_eq!(count(&executions), 5);
    assert_eq!(
        result.output_objects()[&ObjectUrl::content("joined")],
        ObjectId::from_bytes(b"A2B")
    );
}

#[test]
fn inputs_trading_content_rebuild_the_consumer() {
    init_logging();
    let engine = in_memory_engine();
    let echo_executions = counter();
    let concat_executions = counter();
    let build = |a_content: &str, b_content: &str| {
        let mut graph = BuildGraph::new();
        let a = graph.add_command(EchoCommand::new("a", a_content, &echo_executions));
        let b = graph.add_command(EchoCommand::new("b", b_content, &echo_executions));
        let joined = graph.add_command(ConcatCommand::new(
            vec![ObjectUrl::content("a"), ObjectUrl::content("b")],
            "ab",
            &concat_executions,
        ));
        let root = list_of(&mut graph, "root", &[a, b, joined]);
        let result = engine.build(&mut graph, root, &options(2));
        (result, joined)
    };

    let (result, _) = build("x", "y");
    assert_eq!(result.code, BuildResultCode::Successful);
    assert_eq!(
        result.output_objects()[&ObjectUrl::content("ab")],
        ObjectId::from_bytes(b"xy")
    );

    // Same set of input ids as before, but attached to different urls
    let (result, joined) = build("y", "x");
    assert_eq!(result.code, BuildResultCode::Successful);
    assert_eq!(result.status(joined), Some(ResultStatus::Successful));
    assert_eq!(count(&concat_executions), 2);
    assert_eq!(
        result.output_objects()[&ObjectUrl::content("ab")],
        ObjectId::from_bytes(b"yx")
    );
}

#[test]
fn failure_cancels_dependents_only() {
    init_logging();
    let engine = in_memory_engine();
    let failing_executions = counter();
    let dependent_executions = counter();
    let independent_executions = counter();

    let mut graph = BuildGraph::new();
    let failing = graph.add_command(FailingCommand {
        return_error: false,
        executions: failing_executions.clone(),
    });
    let dependent = graph.add_command(EchoCommand::new("dependent", "x", &dependent_executions));
    let transitive = graph.add_command(EchoCommand::new("transitive", "y", &dependent_executions));
    let independent =
        graph.add_command(EchoCommand::new("independent", "z", &independent_executions));
    graph.add_dependency(dependent, failing).unwrap();
    graph.add_dependency(transitive, dependent).unwrap();
    let root = list_of(&mut graph, "root", &[failing, dependent, transitive, independent]);

    let result = engine.build(&mut graph, root, &options(2));
    assert_eq!(result.code, BuildResultCode::BuildError);
    assert_eq!(result.status(failing), Some(ResultStatus::Failed));
    assert_eq!(result.status(independent), Some(ResultStatus::Successful));
    for step in [dependent, transitive, root] {
        let status = result.status(step).unwrap();
        assert!(status.is_cancelled());
        assert!(!status.is_successful());
    }

    assert_eq!(count(&failing_executions), 1);
    assert_eq!(count(&dependent_executions), 0);
    assert_eq!(count(&independent_executions), 1);

    // Nothing a failed step registered is visible
    assert!(!result
        .output_objects()
        .contains_key(&ObjectUrl::content("partial")));
    assert!(result.step_outputs(failing).is_none());
    assert!(result.log.has_errors());

    // Failed results are recorded but never reused
    let result = engine.build(&mut graph, root, &options(2));
    assert_eq!(result.code, BuildResultCode::BuildError);
    assert_eq!(count(&failing_executions), 2);
}

#[test]
fn returned_error_fails_the_step() {
    init_logging();
    let engine = in_memory_engine();
    let mut graph = BuildGraph::new();
    let failing = graph.add_command(FailingCommand {
        return_error: true,
        executions: counter(),
    });

    let result = engine.build(&mut graph, failing, &options(1));
    assert_eq!(result.code, BuildResultCode::BuildError);
    assert_eq!(result.status(failing), Some(ResultStatus::Failed));
    assert!(result
        .log
        .events_for_step(failing)
        .any(|x| x.level == LogEventLevel::Error && x.message.contains("bad input")));
}

#[test]
fn panic_fails_the_step_not_the_build() {
    init_logging();
    let engine = in_memory_engine();
    let executions = counter();
    let mut graph = BuildGraph::new();
    let panicking = graph.add_command(PanickingCommand);
    let other = graph.add_command(EchoCommand::new("other", "fine", &executions));
    let root = list_of(&mut graph, "root", &[panicking, other]);

    let result = engine.build(&mut graph, root, &options(2));
    assert_eq!(result.code, BuildResultCode::BuildError);
    assert_eq!(result.status(panicking), Some(ResultStatus::Failed));
    assert_eq!(result.status(other), Some(ResultStatus::Successful));
    assert!(result
        .log
        .events_for_step(panicking)
        .any(|x| x.level == LogEventLevel::Error && x.message.contains("boom")));
}

#[test]
fn cycle_is_rejected_before_anything_runs() {
    init_logging();
    let engine = in_memory_engine();
    let executions = counter();
    let mut graph = BuildGraph::new();
    let s1 = graph.add_command(EchoCommand::new("s1", "1", &executions));
    let s2 = graph.add_command(EchoCommand::new("s2", "2", &executions));
    let s3 = graph.add_command(EchoCommand::new("s3", "3", &executions));
    graph.add_dependency(s1, s2).unwrap();
    graph.add_dependency(s2, s3).unwrap();
    graph.add_dependency(s3, s1).unwrap();
    let root = list_of(&mut graph, "root", &[s1, s2, s3]);

    let result = engine.build(&mut graph, root, &options(4));
    assert_eq!(result.code, BuildResultCode::BuildError);
    assert_eq!(result.executed_count, 0);
    assert_eq!(count(&executions), 0);
    assert_eq!(result.status(s1), Some(ResultStatus::NotProcessed));
    assert!(result
        .log
        .log_events()
        .iter()
        .any(|x| x.message.contains("cycle")));
}

#[test]
fn list_inside_its_own_prepared_steps_is_rejected() {
    init_logging();
    let engine = in_memory_engine();
    let part_executions = counter();
    let executions = counter();

    let mut graph = BuildGraph::new();
    let bundle = graph.add_command(BundleCommand {
        parts: vec![("part".to_string(), "a".to_string())],
        output: "bundle".to_string(),
        part_executions: part_executions.clone(),
        executions: executions.clone(),
    });
    let root = list_of(&mut graph, "root", &[bundle]);

    let result = engine.build(&mut graph, root, &options(2));
    assert_eq!(result.code, BuildResultCode::Successful);
    assert_eq!(count(&executions), 1);

    // The prepared list has no parent of its own, so the list check cannot see that root
    // already owns it through the bundle
    let prepared = graph.prepared_steps(bundle).unwrap();
    graph.add_child(prepared, root).unwrap();

    let result = engine.build(&mut graph, root, &options(2));
    assert_eq!(result.code, BuildResultCode::BuildError);
    assert_eq!(result.executed_count, 0);
    assert_eq!(count(&executions), 1);
    assert_eq!(count(&part_executions), 1);
    assert!(result
        .log
        .log_events()
        .iter()
        .any(|x| x.message.contains("cycle")));
}

#[test]
fn cancellation_releases_blocked_command() {
    init_logging();
    let engine = in_memory_engine();
    let started = Arc::new(AtomicBool::new(false));
    let executions = counter();

    let mut graph = BuildGraph::new();
    let blocked = graph.add_command(BlockedCommand::new(&started));
    let dependent = graph.add_command(EchoCommand::new("dependent", "x", &executions));
    graph.add_dependency(dependent, blocked).unwrap();
    let root = list_of(&mut graph, "root", &[blocked, dependent]);

    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        let started = started.clone();
        std::thread::spawn(move || {
            while !started.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            token.cancel();
        })
    };

    let start = Instant::now();
    let cancellable = BuildOptions {
        thread_count: 2,
        cancellation_token: token.clone(),
        ..Default::default()
    };
    let result = engine.build(&mut graph, root, &cancellable);
    canceller.join().unwrap();

    // The blocked command waits up to 5 seconds per poll, cancel() releases it well before that
    assert!(start.elapsed() < Duration::from_secs(4));
    assert_eq!(result.code, BuildResultCode::Cancelled);
    assert_eq!(result.status(blocked), Some(ResultStatus::Cancelled));
    assert!(result.status(dependent).unwrap().is_cancelled());
    assert!(result.status(root).unwrap().is_cancelled());
    assert_eq!(count(&executions), 0);
}

#[test]
fn cancelled_before_start_runs_nothing() {
    init_logging();
    let engine = in_memory_engine();
    let executions = counter();
    let mut graph = BuildGraph::new();
    let echo = graph.add_command(EchoCommand::new("a", "a", &executions));

    let cancelled = BuildOptions {
        thread_count: 2,
        cancellation_token: CancellationToken::new(),
        ..Default::default()
    };
    cancelled.cancellation_token.cancel();

    let result = engine.build(&mut graph, echo, &cancelled);
    assert_eq!(result.code, BuildResultCode::Cancelled);
    assert_eq!(result.status(echo), Some(ResultStatus::Cancelled));
    assert_eq!(count(&executions), 0);
}

#[test]
fn cancellation_keeps_finished_results() {
    init_logging();
    let engine = in_memory_engine();
    let started = Arc::new(AtomicBool::new(false));
    let executions = counter();

    let mut graph = BuildGraph::new();
    let echo = graph.add_command(EchoCommand::new("a", "a", &executions));
    let blocked = graph.add_command(BlockedCommand::new(&started));
    graph.add_dependency(blocked, echo).unwrap();

    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        let started = started.clone();
        std::thread::spawn(move || {
            while !started.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            token.cancel();
        })
    };

    let cancellable = BuildOptions {
        thread_count: 1,
        cancellation_token: token,
        ..Default::default()
    };
    let result = engine.build(&mut graph, blocked, &cancellable);
    canceller.join().unwrap();
    assert_eq!(result.code, BuildResultCode::Cancelled);
    assert_eq!(result.status(echo), Some(ResultStatus::Successful));

    // The next build picks up where the cancelled one stopped
    let mut graph = BuildGraph::new();
    let echo = graph.add_command(EchoCommand::new("a", "a", &executions));
    let result = engine.build(&mut graph, echo, &options(1));
    assert_eq!(result.status(echo), Some(ResultStatus::NotTriggeredWasSuccessful));
    assert_eq!(count(&executions), 1);
}

#[test]
fn zero_threads_is_a_command_line_error() {
    init_logging();
    let engine = in_memory_engine();
    let executions = counter();
    let mut graph = BuildGraph::new();
    let echo = graph.add_command(EchoCommand::new("a", "a", &executions));

    let result = engine.build(&mut graph, echo, &options(0));
    assert_eq!(result.code, BuildResultCode::CommandLineError);
    assert_eq!(result.status(echo), Some(ResultStatus::NotProcessed));
    assert_eq!(count(&executions), 0);
}

#[test]
fn ready_steps_start_in_priority_order() {
    init_logging();
    let engine = in_memory_engine();
    let order = Arc::new(Mutex::new(Vec::default()));
    let mut graph = BuildGraph::new();
    let record = |graph: &mut BuildGraph, name: &str, priority: Option<BuildPriority>| {
        let step = graph.add_command(RecordCommand {
            name: name.to_string(),
            order: order.clone(),
        });
        if let Some(priority) = priority {
            graph.set_priority(step, priority).unwrap();
        }
        step
    };

    let a = record(&mut graph, "a", Some(BuildPriority::new(0, 0)));
    let b = record(&mut graph, "b", Some(BuildPriority::new(5, 0)));
    let c = record(&mut graph, "c", Some(BuildPriority::new(1, 0)));
    let d = record(&mut graph, "d", Some(BuildPriority::new(5, 1)));
    let e = record(&mut graph, "e", None);

    // Children inherit the priority of their list
    let f = record(&mut graph, "f", None);
    let urgent = list_of(&mut graph, "urgent", &[f]);
    graph.set_priority(urgent, BuildPriority::new(3, 0)).unwrap();

    let root = list_of(&mut graph, "root", &[a, b, c, d, e, urgent]);
    let result = engine.build(&mut graph, root, &options(1));
    assert_eq!(result.code, BuildResultCode::Successful);
    assert_eq!(*order.lock().unwrap(), vec!["d", "b", "f", "c", "a", "e"]);
}

#[test]
fn prepared_steps_finish_before_their_owner() {
    init_logging();
    let engine = in_memory_engine();
    let part_executions = counter();
    let executions = counter();

    let mut graph = BuildGraph::new();
    let bundle = graph.add_command(BundleCommand {
        parts: vec![
            ("part1".to_string(), "a".to_string()),
            ("part2".to_string(), "b".to_string()),
        ],
        output: "bundle".to_string(),
        part_executions: part_executions.clone(),
        executions: executions.clone(),
    });

    let result = engine.build(&mut graph, bundle, &options(4));
    assert_eq!(result.code, BuildResultCode::Successful);
    assert_eq!(count(&part_executions), 2);
    assert_eq!(count(&executions), 1);
    assert_eq!(
        result.output_objects()[&ObjectUrl::content("bundle")],
        ObjectId::from_bytes(b"ab")
    );

    let prepared = graph.prepared_steps(bundle).unwrap();
    assert_eq!(graph.children(prepared).len(), 2);
    for &part in graph.children(prepared) {
        assert_eq!(result.status(part), Some(ResultStatus::Successful));
    }

    // Preparing again is not needed, and everything comes from the cache
    let result = engine.build(&mut graph, bundle, &options(4));
    assert_eq!(result.code, BuildResultCode::Successful);
    assert_eq!(result.executed_count, 0);
    assert_eq!(result.cache_hit_count, 3);
    assert_eq!(graph.children(prepared).len(), 2);
}

#[test]
fn discovered_dependency_invalidates_cached_result() {
    init_logging();
    let source_dir = tempfile::tempdir().unwrap();
    std::fs::write(source_dir.path().join("include.txt"), b"first").unwrap();

    let engine = in_memory_engine().with_source_root_path(source_dir.path());
    let executions = counter();
    let build = || {
        let mut graph = BuildGraph::new();
        let step = graph.add_command(IncludeCommand {
            include: "include.txt".to_string(),
            output: "included".to_string(),
            executions: executions.clone(),
        });
        engine.build(&mut graph, step, &options(1))
    };

    let result = build();
    assert_eq!(result.code, BuildResultCode::Successful);
    assert_eq!(count(&executions), 1);

    let result = build();
    assert_eq!(result.cache_hit_count, 1);
    assert_eq!(count(&executions), 1);

    std::fs::write(source_dir.path().join("include.txt"), b"second").unwrap();
    let result = build();
    assert_eq!(result.code, BuildResultCode::Successful);
    assert_eq!(count(&executions), 2);
    assert_eq!(
        result.output_objects()[&ObjectUrl::content("included")],
        ObjectId::from_bytes(b"second")
    );
}

#[test]
fn consumers_wait_for_producers_of_their_inputs() {
    init_logging();
    let engine = in_memory_engine();
    let executions = counter();
    let mut graph = BuildGraph::new();

    // Added before its producer and with no explicit dependency
    let consumer = graph.add_command(ConcatCommand::new(
        vec![ObjectUrl::content("x")],
        "y",
        &executions,
    ));
    let producer = graph.add_command(EchoCommand::new("x", "hello", &executions));
    let root = list_of(&mut graph, "root", &[consumer, producer]);

    let result = engine.build(&mut graph, root, &options(4));
    assert_eq!(result.code, BuildResultCode::Successful);
    assert_eq!(
        result.output_objects()[&ObjectUrl::content("y")],
        ObjectId::from_bytes(b"hello")
    );
}

#[test]
fn missing_input_fails_the_consumer() {
    init_logging();
    let engine = in_memory_engine();
    let mut graph = BuildGraph::new();
    let consumer = graph.add_command(ConcatCommand::new(
        vec![ObjectUrl::content("nowhere")],
        "y",
        &counter(),
    ));

    let result = engine.build(&mut graph, consumer, &options(1));
    assert_eq!(result.status(consumer), Some(ResultStatus::Failed));
    assert!(result
        .log
        .events_for_step(consumer)
        .any(|x| x.level == LogEventLevel::Warning && x.message.contains("content:nowhere")));
}

#[test]
fn later_registration_supersedes_earlier_one() {
    init_logging();
    let engine = in_memory_engine();
    let executions = counter();
    let mut graph = BuildGraph::new();
    let first = graph.add_command(EchoCommand::new("shared", "first", &executions));
    let second = graph.add_command(EchoCommand::new("shared", "second", &executions));
    graph.add_dependency(second, first).unwrap();

    let result = engine.build(&mut graph, second, &options(2));
    assert_eq!(result.code, BuildResultCode::Successful);

    let url = ObjectUrl::content("shared");
    assert_eq!(result.output_objects()[&url], ObjectId::from_bytes(b"second"));
    // Each step keeps its own group
    assert_eq!(
        result.step_outputs(first).unwrap()[&url],
        ObjectId::from_bytes(b"first")
    );
    assert_eq!(
        result.step_outputs(second).unwrap()[&url],
        ObjectId::from_bytes(b"second")
    );
}

#[test]
fn force_rebuild_ignores_the_cache() {
    init_logging();
    let engine = in_memory_engine();
    let executions = counter();
    let mut graph = BuildGraph::new();
    let echo = graph.add_command(EchoCommand::new("a", "a", &executions));

    engine.build(&mut graph, echo, &options(1));
    let forced = BuildOptions {
        thread_count: 1,
        force_rebuild: true,
        ..Default::default()
    };
    let result = engine.build(&mut graph, echo, &forced);
    assert_eq!(result.status(echo), Some(ResultStatus::Successful));
    assert_eq!(count(&executions), 2);
}

#[test]
fn log_level_filters_the_build_log() {
    init_logging();
    let engine = in_memory_engine();
    let mut graph = BuildGraph::new();
    let echo = graph.add_command(EchoCommand::new("a", "a", &counter()));

    let quiet = BuildOptions {
        thread_count: 1,
        log_level: LogEventLevel::Warning,
        ..Default::default()
    };
    let result = engine.build(&mut graph, echo, &quiet);
    assert_eq!(result.log.events_for_step(echo).count(), 0);

    // The cached log still holds the info message
    let result = engine.build(&mut graph, echo, &options(1));
    assert_eq!(result.log.events_for_step(echo).count(), 1);
}

#[test]
fn results_survive_reopening_the_stores() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let objects_path = dir.path().join("objects");
    let cache_path = dir.path().join("results.bin");
    let executions = counter();
    let url = ObjectUrl::content("a.txt");

    {
        let engine = BuildEngine::new(
            ObjectDatabase::open(&objects_path).unwrap(),
            ResultCache::open(&cache_path).unwrap(),
        );
        let mut graph = BuildGraph::new();
        let echo = graph.add_command(EchoCommand::new("a.txt", "hello", &executions));
        let result = engine.build(&mut graph, echo, &options(1));
        assert_eq!(result.code, BuildResultCode::Successful);
    }

    let engine = BuildEngine::new(
        ObjectDatabase::open(&objects_path).unwrap(),
        ResultCache::open(&cache_path).unwrap(),
    );
    assert_eq!(
        engine.object_database().lookup_url(&url),
        Some(ObjectId::from_bytes(b"hello"))
    );

    let mut graph = BuildGraph::new();
    let echo = graph.add_command(EchoCommand::new("a.txt", "hello", &executions));
    let result = engine.build(&mut graph, echo, &options(1));
    assert_eq!(result.status(echo), Some(ResultStatus::NotTriggeredWasSuccessful));
    assert_eq!(count(&executions), 1);
}
