// Task arena - the cancellation tree of one store
//
// Every dispatched task gets a node. A node owns:
// - the task handle
// - the ids of its children (forked or called tasks), in start order
// - a slab of disposers (timer clears, event unsubscribes, child cancels)
//
// Children refer back to their parent by id only, so the tree never forms an
// Rc cycle. Ids carry a generation: an id whose node was removed stays stale
// even if the slab slot is reused.
//
// A finished task keeps its node while it still has live children, so that
// cancelling it still reaches them. The node is pruned once the last child
// is gone.

use crate::dispatch::Task;
use slab::Slab;

/// Cleanup registered by a running task
///
/// Calling it cancels the resource (clears the timer, unsubscribes, cancels
/// the child task). Dropping it without calling only releases it.
pub(crate) type Disposer = Box<dyn FnOnce()>;

/// Identifier of a node in the task arena
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct TaskId {
    index: u32,
    generation: u32,
}

impl TaskId {
    fn index(self) -> usize {
        self.index as usize
    }
}

/// Key of one disposer inside a node
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct DisposerKey(usize);

struct TaskNode {
    generation: u32,
    task: Task,
    parent: Option<TaskId>,
    children: Vec<TaskId>,
    disposers: Slab<Disposer>,
    done: bool,
}

#[derive(Default)]
pub(crate) struct TaskArena {
    nodes: Slab<TaskNode>,
    generation: u32,
}

impl TaskArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a running task, optionally as the child of `parent`
    ///
    /// A stale parent id is ignored and the task becomes a root.
    pub(crate) fn insert(&mut self, task: Task, parent: Option<TaskId>) -> TaskId {
        self.generation = self.generation.wrapping_add(1);
        let parent = parent.filter(|&parent| self.contains(parent));
        let index = self.nodes.insert(TaskNode {
            generation: self.generation,
            task,
            parent,
            children: Vec::new(),
            disposers: Slab::new(),
            done: false,
        });
        let id = TaskId {
            index: index as u32,
            generation: self.generation,
        };
        if let Some(parent) = parent.and_then(|parent| self.node_mut(parent)) {
            parent.children.push(id);
        }
        id
    }

    fn node(&self, id: TaskId) -> Option<&TaskNode> {
        self.nodes
            .get(id.index())
            .filter(|node| node.generation == id.generation)
    }

    fn node_mut(&mut self, id: TaskId) -> Option<&mut TaskNode> {
        self.nodes
            .get_mut(id.index())
            .filter(|node| node.generation == id.generation)
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.node(id).is_some()
    }

    #[cfg(test)]
    pub(crate) fn parent(&self, id: TaskId) -> Option<TaskId> {
        self.node(id).and_then(|node| node.parent)
    }

    #[cfg(test)]
    pub(crate) fn children(&self, id: TaskId) -> Vec<TaskId> {
        self.node(id)
            .map(|node| node.children.clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Register a disposer on a running task
    ///
    /// Hands the disposer back if the task is no longer running.
    pub(crate) fn add_disposer(&mut self, id: TaskId, disposer: Disposer) -> Result<DisposerKey, Disposer> {
        match self.node_mut(id) {
            Some(node) if !node.done => Ok(DisposerKey(node.disposers.insert(disposer))),
            _ => Err(disposer),
        }
    }

    /// Remove a disposer so the caller can run or release it
    pub(crate) fn take_disposer(&mut self, id: TaskId, key: DisposerKey) -> Option<Disposer> {
        self.node_mut(id)
            .and_then(|node| node.disposers.try_remove(key.0))
    }

    /// Mark a task finished and hand back its remaining disposers
    ///
    /// The node is removed right away unless it still has children.
    pub(crate) fn complete(&mut self, id: TaskId) -> Vec<Disposer> {
        let Some(node) = self.node_mut(id) else {
            return Vec::new();
        };
        node.done = true;
        let disposers = node.disposers.drain().collect();
        self.prune(id);
        disposers
    }

    /// Remove `id` and walk up while finished ancestors become childless
    fn prune(&mut self, mut id: TaskId) {
        loop {
            let removable = self
                .node(id)
                .is_some_and(|node| node.done && node.children.is_empty());
            if !removable {
                return;
            }
            let node = self.nodes.remove(id.index());
            let Some(parent_id) = node.parent else {
                return;
            };
            let Some(parent) = self.node_mut(parent_id) else {
                return;
            };
            parent.children.retain(|&child| child != id);
            id = parent_id;
        }
    }

    /// Remove `id` and its whole subtree
    ///
    /// Returns every removed task with its disposers, parents before
    /// children. The caller marks the tasks cancelled and runs the disposers
    /// once the arena is no longer borrowed.
    pub(crate) fn cancel_tree(&mut self, id: TaskId) -> Vec<(Task, Vec<Disposer>)> {
        let Some(parent) = self.node(id).map(|node| node.parent) else {
            return Vec::new();
        };
        if let Some(parent) = parent.and_then(|parent| self.node_mut(parent)) {
            parent.children.retain(|&child| child != id);
        }

        let mut cancelled = Vec::new();
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if !self.contains(id) {
                continue;
            }
            let mut node = self.nodes.remove(id.index());
            stack.extend(node.children.iter().rev().copied());
            cancelled.push((node.task, node.disposers.drain().collect()));
        }

        if let Some(parent) = parent {
            self.prune(parent);
        }
        cancelled
    }
}
