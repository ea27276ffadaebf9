use crate::{ObjectUrl, StepId};
use kiln_base::hashing::HashMap;
use kiln_base::ObjectId;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OutputObject {
    pub object_id: ObjectId,
    // The step whose execution registered this object
    pub group: StepId,
}

/// Immutable view of the registered outputs at the moment a command started. Registrations made
/// afterwards are not visible through it.
#[derive(Clone, Default)]
pub struct OutputObjectsSnapshot {
    latest: Arc<BTreeMap<ObjectUrl, OutputObject>>,
}

impl OutputObjectsSnapshot {
    pub fn get(
        &self,
        url: &ObjectUrl,
    ) -> Option<OutputObject> {
        self.latest.get(url).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectUrl, &OutputObject)> {
        self.latest.iter()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[derive(Default)]
struct OutputObjectGroupsInner {
    // Everything each step registered, kept so groups stay distinguishable when two steps
    // produce the same url
    groups: HashMap<StepId, BTreeMap<ObjectUrl, ObjectId>>,
    // Most recent registration for each url. Copy-on-write, snapshots handed to running commands
    // keep the old version alive.
    latest: Arc<BTreeMap<ObjectUrl, OutputObject>>,
}

/// Per-build table of outputs, grouped by the step that produced them
#[derive(Default)]
pub(crate) struct OutputObjectGroups {
    inner: Mutex<OutputObjectGroupsInner>,
}

impl OutputObjectGroups {
    pub(crate) fn commit(
        &self,
        group: StepId,
        outputs: &BTreeMap<ObjectUrl, ObjectId>,
    ) {
        if outputs.is_empty() {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        let latest = Arc::make_mut(&mut inner.latest);
        for (url, &object_id) in outputs {
            let previous = latest.insert(url.clone(), OutputObject { object_id, group });
            if let Some(previous) = previous {
                if previous.group != group && previous.object_id != object_id {
                    log::warn!(
                        "{} registered by step {:?} supersedes the output of step {:?}",
                        url,
                        group,
                        previous.group
                    );
                }
            }
        }

        inner
            .groups
            .entry(group)
            .or_default()
            .extend(outputs.iter().map(|(url, id)| (url.clone(), *id)));
    }

    pub(crate) fn snapshot(&self) -> OutputObjectsSnapshot {
        OutputObjectsSnapshot {
            latest: self.inner.lock().unwrap().latest.clone(),
        }
    }

    pub(crate) fn group(
        &self,
        group: StepId,
    ) -> Option<BTreeMap<ObjectUrl, ObjectId>> {
        self.inner.lock().unwrap().groups.get(&group).cloned()
    }

    pub(crate) fn all_outputs(&self) -> BTreeMap<ObjectUrl, ObjectId> {
        self.inner
            .lock()
            .unwrap()
            .latest
            .iter()
            .map(|(url, output)| (url.clone(), output.object_id))
            .collect()
    }
}
