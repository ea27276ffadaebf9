use crate::build::build_step::{BuildGraph, BuildStepKind};
use crate::command::{CommandAbstract, CommandTypeId};
use crate::{
    BuildPriority, ObjectUrl, PipelineError, PipelineResult, PrepareContext, ResultStatus, StepId,
};
use kiln_base::hashing::{HashMap, HashSet};
use kiln_base::ObjectId;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::{algo, Direction};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

// Everything the executor needs to run a command, computed once before scheduling
pub(crate) struct ResolvedCommand {
    pub(crate) command: Arc<dyn CommandAbstract>,
    pub(crate) command_type: CommandTypeId,
    pub(crate) command_version: u32,
    pub(crate) parameter_hash: ObjectId,
    pub(crate) input_files: Arc<Vec<ObjectUrl>>,
    pub(crate) is_cacheable: bool,
}

pub(crate) struct ResolvedNode {
    pub(crate) step_id: StepId,
    pub(crate) title: Arc<String>,
    // None for list steps
    pub(crate) command: Option<ResolvedCommand>,
    pub(crate) priority: BuildPriority,
}

/// The part of a `BuildGraph` reachable from the root, flattened into nodes with explicit,
/// structural and data edges. Edges point from a prerequisite to the node waiting on it.
/// Guaranteed acyclic. Node indices follow step id order.
pub(crate) struct ResolvedGraph {
    graph: DiGraph<ResolvedNode, ()>,
    node_lookup: HashMap<StepId, usize>,
}

impl ResolvedGraph {
    /// Prepares every reachable command, then links and validates the result
    #[profiling::function]
    pub(crate) fn resolve(
        graph: &mut BuildGraph,
        root: StepId,
    ) -> PipelineResult<ResolvedGraph> {
        graph.try_step(root)?;

        //
        // Gather the build set, running prepare() on commands as we discover them since it may add
        // more steps
        //
        let mut visited = HashSet::<StepId>::default();
        let mut build_set = Vec::default();
        let mut owners = HashMap::<StepId, StepId>::default();
        let mut pending = vec![root];
        while let Some(step_id) = pending.pop() {
            if !visited.insert(step_id) {
                continue;
            }
            build_set.push(step_id);

            let command = match &graph.try_step(step_id)?.kind {
                BuildStepKind::Command(command) => Some(command.clone()),
                BuildStepKind::List => None,
            };
            if let Some(command) = command {
                if graph.try_step(step_id)?.prepared.is_none() {
                    let mut context = PrepareContext::new(graph, step_id);
                    command.prepare_inner(&mut context).map_err(|e| {
                        PipelineError::InvalidGraph(format!(
                            "prepare failed for {}: {}",
                            command.title_inner(),
                            e
                        ))
                    })?;
                }
            }

            let step = graph.try_step(step_id)?;
            if let Some(prepared) = step.prepared {
                owners.insert(prepared, step_id);
                pending.push(prepared);
            }
            // Reverse so that steps are discovered in the order they were added
            for &child in step.children.iter().rev() {
                pending.push(child);
            }
            for &dependency in step.dependencies.iter().rev() {
                graph.try_step(dependency)?;
                pending.push(dependency);
            }
        }

        // Insertion order is the final tie-break for scheduling, so keep nodes sorted by step id
        build_set.sort();
        let node_lookup: HashMap<StepId, usize> = build_set
            .iter()
            .enumerate()
            .map(|(index, step_id)| (*step_id, index))
            .collect();

        //
        // Create the nodes. Hashing parameters happens here, once per command.
        //
        let mut nodes = Vec::with_capacity(build_set.len());
        let mut producers = HashMap::<ObjectUrl, Vec<usize>>::default();
        for (index, &step_id) in build_set.iter().enumerate() {
            let step = graph.try_step(step_id)?;
            let command = match &step.kind {
                BuildStepKind::Command(command) => {
                    for output_url in command.output_files_inner() {
                        producers.entry(output_url).or_default().push(index);
                    }

                    let parameter_hash = command.parameter_hash_inner().map_err(|e| {
                        PipelineError::InvalidGraph(format!(
                            "could not hash parameters of {}: {}",
                            step.title, e
                        ))
                    })?;

                    Some(ResolvedCommand {
                        command: command.clone(),
                        command_type: command.command_type_inner(),
                        command_version: command.version_inner(),
                        parameter_hash,
                        input_files: Arc::new(command.input_files_inner()),
                        is_cacheable: command.is_cacheable_inner(),
                    })
                }
                BuildStepKind::List => None,
            };

            nodes.push(ResolvedNode {
                step_id,
                title: Arc::new(step.title.clone()),
                command,
                priority: effective_priority(graph, &owners, step_id),
            });
        }

        //
        // Edges (prerequisite, dependent): list -> children, step -> explicit dependencies, command -> its prepared steps,
        // and consumer -> producer for every declared input some step in the build promises
        //
        let mut edges = Vec::default();
        for (index, &step_id) in build_set.iter().enumerate() {
            let step = graph.try_step(step_id)?;
            let mut prerequisites = Vec::default();
            prerequisites.extend(step.children.iter().map(|x| node_lookup[x]));
            prerequisites.extend(step.dependencies.iter().map(|x| node_lookup[x]));
            prerequisites.extend(step.prepared.iter().map(|x| node_lookup[x]));

            if let Some(command) = &nodes[index].command {
                for input_url in command.input_files.iter() {
                    if let Some(input_producers) = producers.get(input_url) {
                        prerequisites.extend(input_producers.iter().filter(|x| **x != index));
                    }
                }
            }

            let mut seen = HashSet::default();
            prerequisites.retain(|x| seen.insert(*x));
            edges.extend(prerequisites.into_iter().map(|x| (x, index)));
        }

        let mut dag = DiGraph::with_capacity(nodes.len(), edges.len());
        for node in nodes {
            dag.add_node(node);
        }
        for (prerequisite, dependent) in edges {
            dag.add_edge(NodeIndex::new(prerequisite), NodeIndex::new(dependent), ());
        }

        let resolved = ResolvedGraph {
            graph: dag,
            node_lookup,
        };
        if let Some(cycle) = resolved.find_cycle() {
            let chain = cycle
                .iter()
                .map(|x| format!("{} {:?}", resolved.graph[*x].title, resolved.graph[*x].step_id))
                .collect();
            return Err(PipelineError::CycleDetected(chain));
        }

        Ok(resolved)
    }

    // The nodes of one cycle in edge order, first node repeated at the end
    fn find_cycle(&self) -> Option<Vec<NodeIndex>> {
        if algo::toposort(&self.graph, None).is_ok() {
            return None;
        }

        let has_cycle = |component: &Vec<NodeIndex>| {
            component.len() > 1 || self.graph.contains_edge(component[0], component[0])
        };
        let component = algo::tarjan_scc(&self.graph)
            .into_iter()
            .find(|x| has_cycle(x))?;
        let members: HashSet<NodeIndex> = component.iter().copied().collect();

        // Shortest way around the strongly connected component, back to where it started
        let start = component[0];
        let mut came_from = HashMap::<NodeIndex, NodeIndex>::default();
        let mut queue = VecDeque::from(vec![start]);
        while let Some(node) = queue.pop_front() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if next == start {
                    let mut chain = vec![node];
                    let mut current = node;
                    while current != start {
                        current = came_from[&current];
                        chain.push(current);
                    }
                    chain.reverse();
                    chain.push(start);
                    return Some(chain);
                }

                if members.contains(&next) && !came_from.contains_key(&next) {
                    came_from.insert(next, node);
                    queue.push_back(next);
                }
            }
        }

        None
    }

    pub(crate) fn node(
        &self,
        node: usize,
    ) -> &ResolvedNode {
        &self.graph[NodeIndex::new(node)]
    }

    pub(crate) fn nodes(&self) -> impl Iterator<Item = &ResolvedNode> {
        self.graph.node_indices().map(move |x| &self.graph[x])
    }

    pub(crate) fn node_index(
        &self,
        step_id: StepId,
    ) -> Option<usize> {
        self.node_lookup.get(&step_id).copied()
    }

    pub(crate) fn prerequisite_count(
        &self,
        node: usize,
    ) -> usize {
        self.graph
            .neighbors_directed(NodeIndex::new(node), Direction::Incoming)
            .count()
    }

    pub(crate) fn dependents(
        &self,
        node: usize,
    ) -> impl Iterator<Item = usize> + '_ {
        self.graph
            .neighbors_directed(NodeIndex::new(node), Direction::Outgoing)
            .map(|x| x.index())
    }

    pub(crate) fn len(&self) -> usize {
        self.graph.node_count()
    }
}

fn effective_priority(
    graph: &BuildGraph,
    owners: &HashMap<StepId, StepId>,
    step_id: StepId,
) -> BuildPriority {
    let mut visited = HashSet::<StepId>::default();
    let mut current = Some(step_id);
    while let Some(step_id) = current {
        if !visited.insert(step_id) {
            break;
        }

        let Ok(step) = graph.try_step(step_id) else {
            break;
        };

        if let Some(priority) = step.priority {
            return priority;
        }

        current = step.parent.or_else(|| owners.get(&step_id).copied());
    }

    BuildPriority::default()
}

#[derive(PartialEq, Eq)]
struct ReadyEntry {
    priority: BuildPriority,
    order: Reverse<usize>,
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(
        &self,
        other: &Self,
    ) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.order.cmp(&other.order))
    }
}

/// Ready nodes, highest priority first, then lowest node index (insertion order)
#[derive(Default)]
pub(crate) struct ReadyQueue {
    heap: BinaryHeap<ReadyEntry>,
}

impl ReadyQueue {
    pub(crate) fn push(
        &mut self,
        graph: &ResolvedGraph,
        node: usize,
    ) {
        self.heap.push(ReadyEntry {
            priority: graph.node(node).priority,
            order: Reverse(node),
        });
    }

    pub(crate) fn pop(&mut self) -> Option<usize> {
        self.heap.pop().map(|x| x.order.0)
    }
}

#[derive(Default, Debug)]
pub(crate) struct CompletionUpdate {
    // All prerequisites succeeded, the node can start
    pub(crate) ready: Vec<usize>,
    // Settled as NotTriggeredPrerequisiteFailed because something upstream did not succeed
    pub(crate) skipped: Vec<usize>,
}

/// Tracks which nodes have settled and which are waiting on prerequisites
pub(crate) struct DependencyTracker {
    remaining_prerequisites: Vec<usize>,
    statuses: Vec<Option<ResultStatus>>,
    settled_count: usize,
}

impl DependencyTracker {
    pub(crate) fn new(graph: &ResolvedGraph) -> Self {
        DependencyTracker {
            remaining_prerequisites: (0..graph.len()).map(|x| graph.prerequisite_count(x)).collect(),
            statuses: vec![None; graph.len()],
            settled_count: 0,
        }
    }

    pub(crate) fn initially_ready(&self) -> Vec<usize> {
        (0..self.remaining_prerequisites.len())
            .filter(|x| self.remaining_prerequisites[*x] == 0)
            .collect()
    }

    pub(crate) fn status(
        &self,
        node: usize,
    ) -> Option<ResultStatus> {
        self.statuses[node]
    }

    pub(crate) fn settled_count(&self) -> usize {
        self.settled_count
    }

    pub(crate) fn all_settled(&self) -> bool {
        self.settled_count == self.statuses.len()
    }

    /// Settle a node that was never started, without affecting its dependents. Used when the
    /// whole build is cancelled.
    pub(crate) fn settle_without_propagation(
        &mut self,
        node: usize,
        status: ResultStatus,
    ) {
        if self.statuses[node].is_none() {
            self.statuses[node] = Some(status);
            self.settled_count += 1;
        }
    }

    /// Record the final status of a node. Dependents whose last prerequisite this was become
    /// ready. If the node did not succeed, every transitive dependent is settled immediately as
    /// NotTriggeredPrerequisiteFailed.
    pub(crate) fn complete(
        &mut self,
        graph: &ResolvedGraph,
        node: usize,
        status: ResultStatus,
    ) -> CompletionUpdate {
        let mut update = CompletionUpdate::default();
        if self.statuses[node].is_some() {
            return update;
        }

        self.statuses[node] = Some(status);
        self.settled_count += 1;

        let mut failed = Vec::default();
        if !status.is_successful() {
            failed.push(node);
        }

        for dependent in graph.dependents(node) {
            self.remaining_prerequisites[dependent] -= 1;
            if status.is_successful()
                && self.remaining_prerequisites[dependent] == 0
                && self.statuses[dependent].is_none()
            {
                update.ready.push(dependent);
            }
        }

        while let Some(failed_node) = failed.pop() {
            for dependent in graph.dependents(failed_node) {
                if self.statuses[dependent].is_some() {
                    continue;
                }

                self.statuses[dependent] = Some(ResultStatus::NotTriggeredPrerequisiteFailed);
                self.settled_count += 1;
                update.skipped.push(dependent);
                failed.push(dependent);
            }
        }

        update
    }
}
