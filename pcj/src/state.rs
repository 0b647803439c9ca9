//! Request state kept by the collective engine.
//!
//! States are created lazily at intermediate nodes on the first relevant
//! message and removed exactly once, when the local countdown reaches zero
//! and the state is taken out of its table. Lookup-then-decrement always
//! happens under the owning table lock, so it is single-step.

use crate::error::{Error, Result};
use crate::future::Completion;
use crate::{GlobalThreadId, GroupThreadId, RequestNum};
use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Identifies a collective request within one group and kind.
pub type ReqKey = (GlobalThreadId, RequestNum);

/// One-shot reply slot shared by all request/reply message flows.
pub type ReplySlot = Arc<Completion<Vec<u8>>>;

/// Barrier progress for one round: outstanding notifications plus the
/// futures of the local threads waiting on the round.
pub struct BarrierState {
    pub waiting: u32,
    pub futures: Vec<ReplySlot>,
}

impl BarrierState {
    pub fn new(waiting: u32) -> BarrierState {
        BarrierState {
            waiting,
            futures: Vec::new(),
        }
    }
}

/// Broadcast fan-out progress at one node: outstanding child acks.
pub struct BroadcastState {
    pub waiting: u32,
}

/// Reduce aggregation at one node. Errors are sticky: once a contribution
/// fails, the failure is what travels up the tree.
pub struct ReduceState {
    pub waiting: u32,
    pub op: String,
    pub acc: Option<Result<Vec<u8>>>,
}

impl ReduceState {
    /// Folds a contribution into the accumulator with the supplied combiner.
    pub fn combine<F>(&mut self, incoming: Result<Vec<u8>>, combiner: F)
    where
        F: FnOnce(&[u8], &[u8]) -> Result<Vec<u8>>,
    {
        self.acc = Some(match (self.acc.take(), incoming) {
            (Some(Err(err)), _) | (_, Err(err)) => Err(err),
            (None, Ok(value)) => Ok(value),
            (Some(Ok(acc)), Ok(value)) => combiner(&acc, &value),
        });
    }
}

/// Collect aggregation at one node, ordered by group thread id.
pub struct CollectState {
    pub waiting: u32,
    pub parts: BTreeMap<GroupThreadId, Vec<u8>>,
    pub failed: Option<Error>,
}

impl CollectState {
    pub fn absorb(&mut self, incoming: Result<Vec<(GroupThreadId, Vec<u8>)>>) {
        match incoming {
            Ok(parts) => {
                for (id, bytes) in parts {
                    self.parts.insert(id, bytes);
                }
            }
            Err(err) => {
                if self.failed.is_none() {
                    self.failed = Some(err);
                }
            }
        }
    }
}

/// Group-join progress at the master: outstanding member confirmations.
pub struct JoinState {
    pub waiting: u32,
    pub joiner_node: u32,
    pub group: u32,
    pub group_thread_id: GroupThreadId,
}

/// Key of a pending point-to-point reply: the request kind byte plus the
/// requester and its request number.
pub type PendingKey = (u8, GlobalThreadId, RequestNum);

/// Node-wide table of outstanding reply futures. A slot is inserted before
/// the request leaves the node and taken exactly once when the reply
/// arrives; job abort fails every remaining slot.
pub struct PendingTable {
    slots: Mutex<HashMap<PendingKey, ReplySlot>>,
}

impl PendingTable {
    pub fn new() -> PendingTable {
        PendingTable {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: PendingKey) -> ReplySlot {
        let slot: ReplySlot = Arc::new(Completion::new());
        self.slots.lock().unwrap().insert(key, slot.clone());
        slot
    }

    pub fn take(&self, key: &PendingKey) -> Option<ReplySlot> {
        self.slots.lock().unwrap().remove(key)
    }

    /// Fails every outstanding slot. Used by job abort so suspended callers
    /// observe `ConnectionLost` instead of hanging.
    pub fn fail_all(&self, err: &Error) {
        let slots: Vec<ReplySlot> = self.slots.lock().unwrap().drain().map(|(_, v)| v).collect();

        for slot in slots {
            slot.signal(Err(err.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn pending_slot_is_taken_once() {
        let table = PendingTable::new();
        let key = (17u8, 3, 8);

        let slot = table.insert(key);
        let taken = table.take(&key).unwrap();

        assert!(Arc::ptr_eq(&slot, &taken));
        assert!(table.take(&key).is_none());
    }

    #[test]
    fn fail_all_releases_waiters() {
        let table = PendingTable::new();
        let slot = table.insert((1, 0, 0));

        table.fail_all(&Error::new(ErrorKind::ConnectionLost));

        assert_eq!(slot.wait().unwrap_err().kind(), ErrorKind::ConnectionLost);
        assert!(table.take(&(1, 0, 0)).is_none());
    }

    #[test]
    fn reduce_combine_folds_and_keeps_errors() {
        let mut state = ReduceState {
            waiting: 0,
            op: "sum".into(),
            acc: None,
        };

        state.combine(Ok(vec![1]), |_, _| unreachable!());
        assert_eq!(state.acc, Some(Ok(vec![1])));

        state.combine(Ok(vec![2]), |a, b| Ok(vec![a[0] + b[0]]));
        assert_eq!(state.acc, Some(Ok(vec![3])));

        state.combine(Err(Error::new(ErrorKind::NoSuchVariable)), |_, _| unreachable!());
        state.combine(Ok(vec![9]), |_, _| unreachable!());

        match state.acc {
            Some(Err(ref err)) => assert_eq!(err.kind(), ErrorKind::NoSuchVariable),
            ref other => panic!("Unexpected accumulator {:?}", other.is_some()),
        }
    }

    #[test]
    fn collect_orders_by_group_thread_id() {
        let mut state = CollectState {
            waiting: 0,
            parts: BTreeMap::new(),
            failed: None,
        };

        state.absorb(Ok(vec![(2, vec![2]), (0, vec![0])]));
        state.absorb(Ok(vec![(1, vec![1])]));

        let ordered: Vec<GroupThreadId> = state.parts.keys().cloned().collect();
        assert_eq!(ordered, vec![0, 1, 2]);
        assert!(state.failed.is_none());
    }
}
