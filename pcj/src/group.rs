use crate::error::{Error, ErrorKind, Result};
use crate::state::{BarrierState, BroadcastState, CollectState, ReduceState, ReqKey};
use crate::{GlobalThreadId, GroupId, GroupThreadId, PhysicalId};
use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::Mutex;

/// The communication tree of a group: a binary heap over the distinct
/// physical ids hosting members, master node first, then home nodes of
/// members in ascending group-thread-id order, deduplicated. Every
/// collective fans in and out along this tree, so a node talks to at most
/// one parent and two children.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommTree {
    nodes: Vec<PhysicalId>,
}

impl CommTree {
    /// Builds the tree for a member set. The iterator yields the home node
    /// of every member in ascending group-thread-id order.
    pub fn build<I>(master: PhysicalId, homes: I) -> CommTree
    where
        I: IntoIterator<Item = PhysicalId>,
    {
        let mut nodes = vec![master];

        for home in homes {
            if !nodes.contains(&home) {
                nodes.push(home);
            }
        }

        CommTree { nodes }
    }

    #[inline]
    pub fn root(&self) -> PhysicalId {
        self.nodes[0]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn nodes(&self) -> &[PhysicalId] {
        &self.nodes
    }

    #[inline]
    pub fn contains(&self, node: PhysicalId) -> bool {
        self.index_of(node).is_some()
    }

    fn index_of(&self, node: PhysicalId) -> Option<usize> {
        self.nodes.iter().position(|&n| n == node)
    }

    /// The parent of a node, or `None` for the root and for nodes outside
    /// the tree.
    pub fn parent_of(&self, node: PhysicalId) -> Option<PhysicalId> {
        match self.index_of(node) {
            Some(0) | None => None,
            Some(index) => Some(self.nodes[(index - 1) / 2]),
        }
    }

    /// The children of a node, in heap order.
    pub fn children_of(&self, node: PhysicalId) -> Vec<PhysicalId> {
        let index = match self.index_of(node) {
            Some(index) => index,
            None => return Vec::new(),
        };

        [2 * index + 1, 2 * index + 2]
            .iter()
            .filter_map(|&child| self.nodes.get(child).cloned())
            .collect()
    }
}

struct GroupInner {
    threads_map: BTreeMap<GroupThreadId, GlobalThreadId>,
    index: HashMap<GlobalThreadId, GroupThreadId>,
    local: Vec<(GroupThreadId, GlobalThreadId)>,
    tree: CommTree,
}

/// A named subset of threads, together with its request tables. Mappings
/// only ever grow: threads join, they never leave.
pub struct Group {
    pub id: GroupId,
    pub name: String,
    inner: Mutex<GroupInner>,

    pub barrier: Mutex<HashMap<u32, BarrierState>>,
    pub broadcast: Mutex<HashMap<ReqKey, BroadcastState>>,
    pub reduce: Mutex<HashMap<ReqKey, ReduceState>>,
    pub collect: Mutex<HashMap<ReqKey, CollectState>>,

    // Broadcast sequencing. The root stamps every broadcast with the next
    // sequence number; nodes deliver a value only if its sequence exceeds
    // what the variable already saw. Concurrent broadcasts to one variable
    // then settle on the same (highest-sequence) value on every member, no
    // matter how handler execution interleaves.
    pub broadcast_seq: AtomicU64,
    pub delivered: Mutex<HashMap<(String, String), u64>>,
}

impl Group {
    pub fn new(id: GroupId, name: &str) -> Group {
        Group {
            id,
            name: name.to_string(),
            inner: Mutex::new(GroupInner {
                threads_map: BTreeMap::new(),
                index: HashMap::new(),
                local: Vec::new(),
                tree: CommTree::build(0, std::iter::empty()),
            }),
            barrier: Mutex::new(HashMap::new()),
            broadcast: Mutex::new(HashMap::new()),
            reduce: Mutex::new(HashMap::new()),
            collect: Mutex::new(HashMap::new()),
            broadcast_seq: AtomicU64::new(0),
            delivered: Mutex::new(HashMap::new()),
        }
    }

    /// Applies a membership snapshot fixed by the group master and derives
    /// the local member set and the communication tree.
    ///
    /// Snapshots are totally ordered by size; an older (smaller) snapshot
    /// arriving late is ignored. A global id appearing under two group
    /// thread ids violates the mapping invariant.
    pub fn apply_mapping<H>(
        &self,
        threads_map: BTreeMap<GroupThreadId, GlobalThreadId>,
        my_node: PhysicalId,
        home_of: H,
    ) -> Result<()>
    where
        H: Fn(GlobalThreadId) -> Result<PhysicalId>,
    {
        let mut index = HashMap::new();
        let mut local = Vec::new();
        let mut homes = Vec::new();

        for (&group_id, &global_id) in &threads_map {
            if index.insert(global_id, group_id).is_some() {
                return Err(Error::with_detail(
                    ErrorKind::Config,
                    format!("thread {} mapped twice in group {}", global_id, self.id),
                ));
            }

            let home = home_of(global_id)?;
            homes.push(home);

            if home == my_node {
                local.push((group_id, global_id));
            }
        }

        let tree = CommTree::build(0, homes);

        let mut inner = self.inner.lock().unwrap();
        if threads_map.len() <= inner.threads_map.len() {
            return Ok(());
        }

        inner.threads_map = threads_map;
        inner.index = index;
        inner.local = local;
        inner.tree = tree;
        Ok(())
    }

    /// The global thread id of a group member.
    pub fn global_id(&self, group_thread_id: GroupThreadId) -> Result<GlobalThreadId> {
        self.inner
            .lock()
            .unwrap()
            .threads_map
            .get(&group_thread_id)
            .cloned()
            .ok_or_else(|| {
                Error::with_detail(
                    ErrorKind::UnknownThread,
                    format!("group thread {} in group {}", group_thread_id, self.id),
                )
            })
    }

    /// The group thread id of a global thread, failing for non-members.
    pub fn group_thread_id(&self, global_id: GlobalThreadId) -> Result<GroupThreadId> {
        self.inner
            .lock()
            .unwrap()
            .index
            .get(&global_id)
            .cloned()
            .ok_or_else(|| {
                Error::with_detail(
                    ErrorKind::UnknownThread,
                    format!("thread {} not in group {}", global_id, self.id),
                )
            })
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().threads_map.len()
    }

    /// Members homed on this node, ascending by group thread id.
    pub fn local_members(&self) -> Vec<(GroupThreadId, GlobalThreadId)> {
        self.inner.lock().unwrap().local.clone()
    }

    pub fn tree(&self) -> CommTree {
        self.inner.lock().unwrap().tree.clone()
    }
}
