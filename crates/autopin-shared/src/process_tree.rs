use crate::{Pid, Tid};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Index of a node inside the tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct NodeId(usize);

/// A process of the observed hierarchy together with its threads.
#[derive(Debug, Clone)]
pub struct ProcessNode {
    pid: Pid,
    parent: Option<NodeId>,
    tasks: BTreeSet<Tid>,
    children: BTreeMap<Pid, NodeId>,
}

impl ProcessNode {
    fn new(pid: Pid, parent: Option<NodeId>) -> Self {
        Self {
            pid,
            parent,
            tasks: BTreeSet::new(),
            children: BTreeMap::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn tasks(&self) -> &BTreeSet<Tid> {
        &self.tasks
    }

    pub fn child_pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.children.keys().copied()
    }
}

/// Two nodes are the same process when their pids match.
impl PartialEq for ProcessNode {
    fn eq(&self, other: &Self) -> bool {
        self.pid == other.pid
    }
}

impl Eq for ProcessNode {}

/// Live hierarchy of the observed process, its descendants and their threads.
///
/// Nodes are stored in an arena and indexed by pid and by tid, so that lookups never walk
/// the tree. Pruned nodes are unlinked from their parent and from both indexes but stay in the
/// arena, so node ids are never reused. Traversal order is depth-first, a parent before its
/// children and siblings by ascending pid.
#[derive(Debug, Clone)]
pub struct ProcessTree {
    nodes: Vec<ProcessNode>,
    by_pid: HashMap<Pid, NodeId>,
    by_tid: HashMap<Tid, NodeId>,
    root: NodeId,
}

impl ProcessTree {
    /// Create a tree for the observed process. Its own pid is its first task.
    pub fn new(root_pid: Pid) -> Self {
        let mut root = ProcessNode::new(root_pid, None);
        root.tasks.insert(root_pid);

        let root_id = NodeId(0);
        Self {
            nodes: vec![root],
            by_pid: HashMap::from([(root_pid, root_id)]),
            by_tid: HashMap::from([(root_pid, root_id)]),
            root: root_id,
        }
    }

    fn node(&self, id: NodeId) -> &ProcessNode {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut ProcessNode {
        &mut self.nodes[id.0]
    }

    pub fn root(&self) -> &ProcessNode {
        self.node(self.root)
    }

    pub fn root_pid(&self) -> Pid {
        self.root().pid
    }

    /// Attach `child` below `parent`. Returns `false` and leaves the tree untouched when the
    /// parent is unknown or the child is already part of the tree.
    pub fn add_child_process(&mut self, parent: Pid, child: Pid) -> bool {
        let Some(&parent_id) = self.by_pid.get(&parent) else {
            return false;
        };
        if self.by_pid.contains_key(&child) {
            return false;
        }

        let child_id = NodeId(self.nodes.len());
        let mut node = ProcessNode::new(child, Some(parent_id));
        if let Entry::Vacant(entry) = self.by_tid.entry(child) {
            entry.insert(child_id);
            node.tasks.insert(child);
        }
        self.nodes.push(node);
        self.by_pid.insert(child, child_id);
        self.node_mut(parent_id).children.insert(child, child_id);
        true
    }

    /// Record `tid` as a thread of `pid`. Unknown pids and tids already owned by a process
    /// are ignored.
    pub fn add_process_task(&mut self, pid: Pid, tid: Tid) -> bool {
        let Some(&id) = self.by_pid.get(&pid) else {
            return false;
        };
        if self.by_tid.contains_key(&tid) {
            return false;
        }
        self.by_tid.insert(tid, id);
        self.node_mut(id).tasks.insert(tid);
        true
    }

    /// Bulk form of [`ProcessTree::add_process_task`], returns how many tids were added.
    pub fn add_process_tasks(&mut self, pid: Pid, tids: impl IntoIterator<Item = Tid>) -> usize {
        tids.into_iter()
            .filter(|&tid| self.add_process_task(pid, tid))
            .count()
    }

    /// Threads of `pid`, empty when the process is unknown.
    pub fn tasks_of(&self, pid: Pid) -> BTreeSet<Tid> {
        self.find_process(pid)
            .map(|node| node.tasks.clone())
            .unwrap_or_default()
    }

    pub fn find_process(&self, pid: Pid) -> Option<&ProcessNode> {
        self.by_pid.get(&pid).map(|&id| self.node(id))
    }

    /// The process owning `tid`.
    pub fn find_task(&self, tid: Tid) -> Option<&ProcessNode> {
        self.by_tid.get(&tid).map(|&id| self.node(id))
    }

    pub fn contains_task(&self, tid: Tid) -> bool {
        self.by_tid.contains_key(&tid)
    }

    /// Processes in traversal order.
    pub fn processes(&self) -> Vec<&ProcessNode> {
        let mut ordered = Vec::with_capacity(self.by_pid.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            ordered.push(node);
            // Reversed so that the smallest pid is popped first
            stack.extend(node.children.values().rev().copied());
        }
        ordered
    }

    /// Every thread of the hierarchy in traversal order.
    pub fn all_tasks(&self) -> Vec<Tid> {
        self.processes()
            .into_iter()
            .flat_map(|node| node.tasks.iter().copied())
            .collect()
    }

    pub fn task_count(&self) -> usize {
        self.by_tid.len()
    }

    /// Forget a terminated thread. Non-root processes left without threads and children are
    /// pruned, walking up towards the root. Returns the pid that owned the thread.
    pub fn remove_task(&mut self, tid: Tid) -> Option<Pid> {
        let id = self.by_tid.remove(&tid)?;
        let node = self.node_mut(id);
        node.tasks.remove(&tid);
        let owner = node.pid;

        self.prune_from(id);
        Some(owner)
    }

    fn prune_from(&mut self, mut id: NodeId) {
        while id != self.root {
            let node = self.node(id);
            if !node.tasks.is_empty() || !node.children.is_empty() {
                return;
            }
            let (pid, parent) = (node.pid, node.parent);
            self.by_pid.remove(&pid);

            let Some(parent) = parent else {
                return;
            };
            self.node_mut(parent).children.remove(&pid);
            id = parent;
        }
    }
}
