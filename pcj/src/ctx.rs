//! The per-thread execution context: the API user code runs against.
//!
//! Each logical thread owns one `Ctx`. Request numbers are monotonic per
//! context, and the futures returned by the one-sided and collective
//! operations gate the next operation on the same group, preserving
//! program order.

use crate::error::Result;
use crate::future::Completion;
use crate::msg::{barrier, BarrierMsg, BroadcastMsg, CollectMsg, JoinMsg, Kind, Message, ReduceMsg, XferMsg};
use crate::net::networker::Target;
use crate::runtime::Core;
use crate::state::{BarrierState, ReplySlot};
use crate::wire::{self, Decode, Encode, WireReader};
use crate::{GlobalThreadId, GroupId, GroupThreadId, RequestNum, GLOBAL_GROUP, GLOBAL_GROUP_NAME};
use hashbrown::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// A handle to a group this thread belongs to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GroupHandle {
    pub id: GroupId,
    pub name: String,
}

/// A one-shot future for a typed reply. `get` suspends the calling thread
/// until the collective engine signals the underlying slot.
pub struct PcjFuture<T> {
    slot: ReplySlot,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Decode> PcjFuture<T> {
    fn new(slot: ReplySlot) -> PcjFuture<T> {
        PcjFuture {
            slot,
            _marker: PhantomData,
        }
    }

    /// Waits for the reply and decodes it.
    pub fn get(self) -> Result<T> {
        let bytes = self.slot.wait()?;
        wire::from_bytes(&bytes)
    }
}

/// A one-shot future for a collect: the values of every member, ordered by
/// ascending group thread id.
pub struct CollectFuture<T> {
    slot: ReplySlot,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Decode> CollectFuture<T> {
    pub fn get(self) -> Result<Vec<T>> {
        let bytes = self.slot.wait()?;
        let raw: Vec<Vec<u8>> = wire::from_bytes(&bytes)?;

        raw.iter().map(|bytes| wire::from_bytes(bytes)).collect()
    }
}

/// The execution context of one logical thread.
pub struct Ctx {
    core: Arc<Core>,
    id: GlobalThreadId,
    req: RequestNum,
    rounds: HashMap<GroupId, u32>,
}

impl Ctx {
    pub(crate) fn new(core: Arc<Core>, id: GlobalThreadId) -> Ctx {
        Ctx {
            core,
            id,
            req: 0,
            rounds: HashMap::new(),
        }
    }

    #[inline]
    pub fn my_id(&self) -> GlobalThreadId {
        self.id
    }

    #[inline]
    pub fn thread_count(&self) -> u32 {
        self.core.total_threads()
    }

    /// The global group containing every thread of the job.
    pub fn global(&self) -> GroupHandle {
        GroupHandle {
            id: GLOBAL_GROUP,
            name: GLOBAL_GROUP_NAME.to_string(),
        }
    }

    /// This thread's index within a group.
    pub fn group_thread_id(&self, group: &GroupHandle) -> Result<GroupThreadId> {
        self.core.group(group.id)?.group_thread_id(self.id)
    }

    pub fn group_size(&self, group: &GroupHandle) -> Result<usize> {
        Ok(self.core.group(group.id)?.size())
    }

    fn next_req(&mut self) -> RequestNum {
        self.req += 1;
        self.req
    }

    // --- collectives -----------------------------------------------------

    /// Barrier over the global group.
    pub fn barrier(&mut self) -> Result<()> {
        let global = self.global();
        self.barrier_on(&global)
    }

    /// Barrier over a group. Resolves only after every member thread has
    /// entered the same round; rounds follow SPMD program order, so all
    /// members must issue their barriers in lockstep.
    pub fn barrier_on(&mut self, group: &GroupHandle) -> Result<()> {
        let g = self.core.group(group.id)?;
        g.group_thread_id(self.id)?;

        let round = {
            let round = self.rounds.entry(group.id).or_insert(0);
            *round += 1;
            *round
        };

        let slot: ReplySlot = Arc::new(Completion::new());
        {
            let mut table = g.barrier.lock().unwrap();
            let state = table
                .entry(round)
                .or_insert_with(|| BarrierState::new(barrier::barrier_count(&g, &self.core)));
            state.futures.push(slot.clone());
        }

        self.core.networker.send(
            Target::Loopback,
            &Message::Barrier(BarrierMsg::Go {
                group: group.id,
                round,
            }),
        )?;

        slot.wait()?;
        Ok(())
    }

    /// Broadcasts a value into the named variable of every member thread.
    /// The future resolves when this node's subtree has delivered.
    pub fn broadcast<T: Encode>(
        &mut self,
        group: &GroupHandle,
        storage: &str,
        name: &str,
        value: &T,
    ) -> Result<PcjFuture<()>> {
        let g = self.core.group(group.id)?;
        g.group_thread_id(self.id)?;

        let req = self.next_req();
        let key = (Kind::BroadcastRequest as u8, self.id, req);
        let slot = self.core.pending.insert(key);

        let send = self.core.send_to_node(
            g.tree().root(),
            &Message::Broadcast(BroadcastMsg::Request {
                group: group.id,
                requester: self.id,
                req,
                storage: storage.to_string(),
                name: name.to_string(),
                value: wire::to_bytes(value),
            }),
        );

        if let Err(err) = send {
            self.core.pending.take(&key);
            return Err(err);
        }

        Ok(PcjFuture::new(slot))
    }

    /// Reduces the named variable over every member thread with a
    /// registered associative operator.
    pub fn reduce<T: Decode>(
        &mut self,
        group: &GroupHandle,
        storage: &str,
        name: &str,
        op: &str,
    ) -> Result<PcjFuture<T>> {
        let g = self.core.group(group.id)?;
        g.group_thread_id(self.id)?;

        let req = self.next_req();
        let key = (Kind::ReduceRequest as u8, self.id, req);
        let slot = self.core.pending.insert(key);

        let send = self.core.send_to_node(
            g.tree().root(),
            &Message::Reduce(ReduceMsg::Request {
                group: group.id,
                requester: self.id,
                req,
                storage: storage.to_string(),
                name: name.to_string(),
                op: op.to_string(),
            }),
        );

        if let Err(err) = send {
            self.core.pending.take(&key);
            return Err(err);
        }

        Ok(PcjFuture::new(slot))
    }

    /// Collects the named variable of every member thread, ordered by
    /// ascending group thread id.
    pub fn collect<T: Decode>(
        &mut self,
        group: &GroupHandle,
        storage: &str,
        name: &str,
    ) -> Result<CollectFuture<T>> {
        let g = self.core.group(group.id)?;
        g.group_thread_id(self.id)?;

        let req = self.next_req();
        let key = (Kind::CollectRequest as u8, self.id, req);
        let slot = self.core.pending.insert(key);

        let send = self.core.send_to_node(
            g.tree().root(),
            &Message::Collect(CollectMsg::Request {
                group: group.id,
                requester: self.id,
                req,
                storage: storage.to_string(),
                name: name.to_string(),
            }),
        );

        if let Err(err) = send {
            self.core.pending.take(&key);
            return Err(err);
        }

        Ok(CollectFuture {
            slot,
            _marker: PhantomData,
        })
    }

    /// Joins (or creates) the named group. Blocks until every existing
    /// member has observed the addition.
    pub fn join_group(&mut self, name: &str) -> Result<GroupHandle> {
        let req = self.next_req();
        let key = (Kind::GroupJoinRequest as u8, self.id, req);
        let slot = self.core.pending.insert(key);

        let send = self.core.send_to_node(
            0,
            &Message::Join(JoinMsg::Request {
                name: name.to_string(),
                requester: self.id,
                req,
            }),
        );

        if let Err(err) = send {
            self.core.pending.take(&key);
            return Err(err);
        }

        let bytes = slot.wait()?;
        let mut reader = WireReader::new(&bytes);
        let group = reader.read_u32()?;
        let _group_thread_id = reader.read_u32()?;
        reader.expect_end()?;

        Ok(GroupHandle {
            id: group,
            name: name.to_string(),
        })
    }

    // --- one-sided operations --------------------------------------------

    /// Reads a variable of a (possibly remote) thread.
    pub fn get<T: Decode>(
        &mut self,
        target: GlobalThreadId,
        storage: &str,
        name: &str,
    ) -> Result<PcjFuture<T>> {
        let req = self.next_req();
        let key = (Kind::GetRequest as u8, self.id, req);

        let home = self.core.home_of(target)?;
        let slot = self.core.pending.insert(key);

        let send = self.core.send_to_node(
            home,
            &Message::Xfer(XferMsg::GetRequest {
                target,
                storage: storage.to_string(),
                name: name.to_string(),
                requester: self.id,
                req,
            }),
        );

        if let Err(err) = send {
            self.core.pending.take(&key);
            return Err(err);
        }

        Ok(PcjFuture::new(slot))
    }

    /// Writes a variable of a (possibly remote) thread. Last writer wins.
    pub fn put<T: Encode>(
        &mut self,
        target: GlobalThreadId,
        storage: &str,
        name: &str,
        value: &T,
    ) -> Result<PcjFuture<()>> {
        let req = self.next_req();
        let key = (Kind::PutRequest as u8, self.id, req);

        let home = self.core.home_of(target)?;
        let slot = self.core.pending.insert(key);

        let send = self.core.send_to_node(
            home,
            &Message::Xfer(XferMsg::PutRequest {
                target,
                storage: storage.to_string(),
                name: name.to_string(),
                value: wire::to_bytes(value),
                requester: self.id,
                req,
            }),
        );

        if let Err(err) = send {
            self.core.pending.take(&key);
            return Err(err);
        }

        Ok(PcjFuture::new(slot))
    }

    /// Combines a value into a variable of a (possibly remote) thread with
    /// a registered operator. Serialized per variable at the target.
    pub fn accumulate<T: Encode>(
        &mut self,
        target: GlobalThreadId,
        storage: &str,
        name: &str,
        op: &str,
        value: &T,
    ) -> Result<PcjFuture<()>> {
        let req = self.next_req();
        let key = (Kind::AccumulateRequest as u8, self.id, req);

        let home = self.core.home_of(target)?;
        let slot = self.core.pending.insert(key);

        let send = self.core.send_to_node(
            home,
            &Message::Xfer(XferMsg::AccRequest {
                target,
                storage: storage.to_string(),
                name: name.to_string(),
                op: op.to_string(),
                value: wire::to_bytes(value),
                requester: self.id,
                req,
            }),
        );

        if let Err(err) = send {
            self.core.pending.take(&key);
            return Err(err);
        }

        Ok(PcjFuture::new(slot))
    }

    /// Runs a registered task against a (possibly remote) thread's context
    /// and returns its result.
    pub fn async_at<A: Encode, T: Decode>(
        &mut self,
        target: GlobalThreadId,
        task: &str,
        arg: &A,
    ) -> Result<PcjFuture<T>> {
        let req = self.next_req();
        let key = (Kind::AsyncAtRequest as u8, self.id, req);

        let home = self.core.home_of(target)?;
        let slot = self.core.pending.insert(key);

        let send = self.core.send_to_node(
            home,
            &Message::Xfer(XferMsg::AsyncAtRequest {
                target,
                task: task.to_string(),
                arg: wire::to_bytes(arg),
                requester: self.id,
                req,
            }),
        );

        if let Err(err) = send {
            self.core.pending.take(&key);
            return Err(err);
        }

        Ok(PcjFuture::new(slot))
    }

    // --- local storage ---------------------------------------------------

    /// Registers a storage and its shared variable names for this thread.
    pub fn register(&self, storage: &str, names: &[&str]) -> Result<()> {
        self.core.storage_of(self.id)?.register(storage, names);
        Ok(())
    }

    pub fn put_local<T: Encode>(&self, storage: &str, name: &str, value: &T) -> Result<()> {
        self.core
            .storage_of(self.id)?
            .put(storage, name, wire::to_bytes(value))
    }

    pub fn get_local<T: Decode>(&self, storage: &str, name: &str) -> Result<T> {
        let bytes = self.core.storage_of(self.id)?.get(storage, name)?;
        wire::from_bytes(&bytes)
    }

    /// Blocks until the next put on one of this thread's variables.
    pub fn monitor(&self, storage: &str, name: &str) -> Result<()> {
        self.core.storage_of(self.id)?.monitor(storage, name)
    }
}
