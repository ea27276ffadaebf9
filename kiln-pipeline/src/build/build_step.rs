use crate::command::{CommandAbstract, CommandWrapper};
use crate::{Command, PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

/// Index of a step within its `BuildGraph`. Assigned in insertion order.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct StepId(u32);

impl StepId {
    pub(crate) fn from_index(index: usize) -> Self {
        StepId(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Debug for StepId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_tuple("StepId").field(&self.0).finish()
    }
}

/// Higher values are started first. `major` is compared before `minor`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct BuildPriority {
    pub major: i32,
    pub minor: i32,
}

impl BuildPriority {
    pub fn new(
        major: i32,
        minor: i32,
    ) -> Self {
        BuildPriority { major, minor }
    }
}

impl PartialOrd for BuildPriority {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BuildPriority {
    fn cmp(
        &self,
        other: &Self,
    ) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
    }
}

pub(crate) enum BuildStepKind {
    Command(Arc<dyn CommandAbstract>),
    List,
}

pub(crate) struct BuildStep {
    pub(crate) title: String,
    pub(crate) kind: BuildStepKind,
    pub(crate) parent: Option<StepId>,
    pub(crate) children: Vec<StepId>,
    pub(crate) dependencies: Vec<StepId>,
    pub(crate) priority: Option<BuildPriority>,
    // List of sub-steps produced by Command::prepare, if it produced any
    pub(crate) prepared: Option<StepId>,
}

/// Owns every step of one build. Steps are either a single command or a list of child steps,
/// and may additionally depend on any other step in the graph.
#[derive(Default)]
pub struct BuildGraph {
    steps: Vec<BuildStep>,
}

impl BuildGraph {
    pub fn new() -> Self {
        Default::default()
    }

    fn push_step(
        &mut self,
        title: String,
        kind: BuildStepKind,
    ) -> StepId {
        let step_id = StepId::from_index(self.steps.len());
        self.steps.push(BuildStep {
            title,
            kind,
            parent: None,
            children: Vec::default(),
            dependencies: Vec::default(),
            priority: None,
            prepared: None,
        });
        step_id
    }

    pub fn add_command<T: Command>(
        &mut self,
        command: T,
    ) -> StepId {
        let title = command.title();
        self.push_step(
            title,
            BuildStepKind::Command(Arc::new(CommandWrapper(command))),
        )
    }

    pub fn add_list<T: Into<String>>(
        &mut self,
        title: T,
    ) -> StepId {
        self.push_step(title.into(), BuildStepKind::List)
    }

    pub(crate) fn try_step(
        &self,
        step_id: StepId,
    ) -> PipelineResult<&BuildStep> {
        self.steps.get(step_id.index()).ok_or_else(|| {
            PipelineError::InvalidGraph(format!("{:?} does not exist in the graph", step_id))
        })
    }

    fn try_step_mut(
        &mut self,
        step_id: StepId,
    ) -> PipelineResult<&mut BuildStep> {
        self.steps.get_mut(step_id.index()).ok_or_else(|| {
            PipelineError::InvalidGraph(format!("{:?} does not exist in the graph", step_id))
        })
    }

    /// Make `child` part of the list step `list`. A step can only belong to one list.
    pub fn add_child(
        &mut self,
        list: StepId,
        child: StepId,
    ) -> PipelineResult<()> {
        if list == child {
            return Err(PipelineError::InvalidGraph(format!(
                "{:?} cannot be a child of itself",
                list
            )));
        }

        let list_step = self.try_step(list)?;
        if !matches!(list_step.kind, BuildStepKind::List) {
            return Err(PipelineError::InvalidGraph(format!(
                "{:?} ({}) is not a list step and cannot have children",
                list, list_step.title
            )));
        }

        // Parent links never form a loop, so this walk ends at a step without a parent
        let mut ancestor = list_step.parent;
        while let Some(step_id) = ancestor {
            if step_id == child {
                return Err(PipelineError::InvalidGraph(format!(
                    "{:?} contains {:?}, making it a child would form a cycle",
                    child, list
                )));
            }
            ancestor = self.try_step(step_id)?.parent;
        }

        let child_step = self.try_step_mut(child)?;
        if let Some(parent) = child_step.parent {
            return Err(PipelineError::InvalidGraph(format!(
                "{:?} ({}) already belongs to {:?}",
                child, child_step.title, parent
            )));
        }
        child_step.parent = Some(list);

        self.try_step_mut(list)?.children.push(child);
        Ok(())
    }

    /// `step` will not start until `prerequisite` has finished successfully
    pub fn add_dependency(
        &mut self,
        step: StepId,
        prerequisite: StepId,
    ) -> PipelineResult<()> {
        self.try_step(prerequisite)?;
        let dependencies = &mut self.try_step_mut(step)?.dependencies;
        if !dependencies.contains(&prerequisite) {
            dependencies.push(prerequisite);
        }
        Ok(())
    }

    /// Children of a list inherit its priority unless they set their own
    pub fn set_priority(
        &mut self,
        step: StepId,
        priority: BuildPriority,
    ) -> PipelineResult<()> {
        self.try_step_mut(step)?.priority = Some(priority);
        Ok(())
    }

    pub fn step_title(
        &self,
        step: StepId,
    ) -> Option<&str> {
        self.steps.get(step.index()).map(|x| x.title.as_str())
    }

    pub fn children(
        &self,
        list: StepId,
    ) -> &[StepId] {
        self.steps
            .get(list.index())
            .map(|x| x.children.as_slice())
            .unwrap_or(&[])
    }

    /// The list of steps that `Command::prepare` added for this step, once the build has
    /// prepared it
    pub fn prepared_steps(
        &self,
        step: StepId,
    ) -> Option<StepId> {
        self.steps.get(step.index()).and_then(|x| x.prepared)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub(crate) fn step_ids(&self) -> impl Iterator<Item = StepId> {
        (0..self.steps.len()).map(StepId::from_index)
    }
}

/// Handed to `Command::prepare`. Commands added through it form the preparing step's list of
/// sub-steps, which all finish before the preparing command executes.
pub struct PrepareContext<'a> {
    graph: &'a mut BuildGraph,
    owner: StepId,
}

impl<'a> PrepareContext<'a> {
    pub(crate) fn new(
        graph: &'a mut BuildGraph,
        owner: StepId,
    ) -> Self {
        PrepareContext { graph, owner }
    }

    pub fn owner(&self) -> StepId {
        self.owner
    }

    fn prepared_list(&mut self) -> PipelineResult<StepId> {
        if let Some(list) = self.graph.try_step(self.owner)?.prepared {
            return Ok(list);
        }

        let owner_step = self.graph.try_step(self.owner)?;
        let title = format!("{} (prepared)", owner_step.title);
        let priority = owner_step.priority;

        let list = self.graph.add_list(title);
        self.graph.try_step_mut(list)?.priority = priority;
        self.graph.try_step_mut(self.owner)?.prepared = Some(list);
        Ok(list)
    }

    pub fn add_command<T: Command>(
        &mut self,
        command: T,
    ) -> PipelineResult<StepId> {
        let list = self.prepared_list()?;
        let step = self.graph.add_command(command);
        self.graph.add_child(list, step)?;
        Ok(step)
    }

    pub fn add_dependency(
        &mut self,
        step: StepId,
        prerequisite: StepId,
    ) -> PipelineResult<()> {
        self.graph.add_dependency(step, prerequisite)
    }

    pub fn set_priority(
        &mut self,
        step: StepId,
        priority: BuildPriority,
    ) -> PipelineResult<()> {
        self.graph.set_priority(step, priority)
    }
}
