//! Broadcast collective.
//!
//! The originator sends `Request` to the group's root, which stamps the
//! broadcast with the group's next sequence number. The root and every
//! internal node forward `Inform` to their children, deliver the value into
//! every local member thread's storage, and ack upward once all child acks
//! arrived. Delivery is last-sequence-wins per variable, so racing
//! broadcasts settle on the same value on every member. The originator's
//! future completes when its own node's subtree has finished processing.

use super::{Kind, Message};
use crate::error::Result;
use crate::group::Group;
use crate::logging;
use crate::runtime::Core;
use crate::state::BroadcastState;
use crate::wire::{WireReader, WireWriter};
use crate::{GlobalThreadId, GroupId, RequestNum};
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Debug)]
pub enum BroadcastMsg {
    Request {
        group: GroupId,
        requester: GlobalThreadId,
        req: RequestNum,
        storage: String,
        name: String,
        value: Vec<u8>,
    },
    Inform {
        group: GroupId,
        requester: GlobalThreadId,
        req: RequestNum,
        seq: u64,
        storage: String,
        name: String,
        value: Vec<u8>,
    },
    Ack {
        group: GroupId,
        requester: GlobalThreadId,
        req: RequestNum,
    },
}

impl BroadcastMsg {
    pub fn kind(&self) -> Kind {
        match self {
            BroadcastMsg::Request { .. } => Kind::BroadcastRequest,
            BroadcastMsg::Ack { .. } => Kind::BroadcastBytes,
            BroadcastMsg::Inform { .. } => Kind::BroadcastInform,
        }
    }

    pub fn write(&self, writer: &mut WireWriter) {
        match self {
            BroadcastMsg::Request {
                group,
                requester,
                req,
                storage,
                name,
                value,
            } => {
                writer.write_u32(*group);
                writer.write_u32(*requester);
                writer.write_u32(*req);
                writer.write_str(storage);
                writer.write_str(name);
                writer.write_blob(value);
            }
            BroadcastMsg::Inform {
                group,
                requester,
                req,
                seq,
                storage,
                name,
                value,
            } => {
                writer.write_u32(*group);
                writer.write_u32(*requester);
                writer.write_u32(*req);
                writer.write_u64(*seq);
                writer.write_str(storage);
                writer.write_str(name);
                writer.write_blob(value);
            }
            BroadcastMsg::Ack {
                group,
                requester,
                req,
            } => {
                writer.write_u32(*group);
                writer.write_u32(*requester);
                writer.write_u32(*req);
            }
        }
    }

    pub fn read(kind: Kind, reader: &mut WireReader) -> Result<BroadcastMsg> {
        let group = reader.read_u32()?;
        let requester = reader.read_u32()?;
        let req = reader.read_u32()?;

        Ok(match kind {
            Kind::BroadcastRequest => BroadcastMsg::Request {
                group,
                requester,
                req,
                storage: reader.read_str()?,
                name: reader.read_str()?,
                value: reader.read_blob()?,
            },
            Kind::BroadcastInform => BroadcastMsg::Inform {
                group,
                requester,
                req,
                seq: reader.read_u64()?,
                storage: reader.read_str()?,
                name: reader.read_str()?,
                value: reader.read_blob()?,
            },
            Kind::BroadcastBytes => BroadcastMsg::Ack {
                group,
                requester,
                req,
            },
            _ => unreachable!(),
        })
    }

    pub fn execute(self, core: &Arc<Core>) -> Result<()> {
        match self {
            BroadcastMsg::Request {
                group,
                requester,
                req,
                storage,
                name,
                value,
            } => {
                // Only the root stamps sequence numbers.
                let g = core.group(group)?;
                let seq = g.broadcast_seq.fetch_add(1, Ordering::SeqCst) + 1;

                fan_out(core, &g, requester, req, seq, storage, name, value)
            }
            BroadcastMsg::Inform {
                group,
                requester,
                req,
                seq,
                storage,
                name,
                value,
            } => {
                let g = core.group(group)?;
                fan_out(core, &g, requester, req, seq, storage, name, value)
            }
            BroadcastMsg::Ack {
                group,
                requester,
                req,
            } => {
                let g = core.group(group)?;

                let done = {
                    let mut table = g.broadcast.lock().unwrap();
                    match table.get_mut(&(requester, req)) {
                        Some(state) => {
                            state.waiting -= 1;
                            if state.waiting == 0 {
                                table.remove(&(requester, req));
                                true
                            } else {
                                false
                            }
                        }
                        None => false,
                    }
                };

                if done {
                    finish(core, &g, requester, req)?;
                }

                Ok(())
            }
        }
    }
}

/// Forwards the value to the children, delivers it locally if no later
/// broadcast already wrote the variable, and either completes immediately
/// (leaf) or records the outstanding child acks.
fn fan_out(
    core: &Arc<Core>,
    g: &Arc<Group>,
    requester: GlobalThreadId,
    req: RequestNum,
    seq: u64,
    storage: String,
    name: String,
    value: Vec<u8>,
) -> Result<()> {
    let tree = g.tree();
    let children = tree.children_of(core.my_id());

    // The state must exist before the first Inform leaves, or a fast child
    // ack would find nothing to decrement.
    if !children.is_empty() {
        g.broadcast.lock().unwrap().insert(
            (requester, req),
            BroadcastState {
                waiting: children.len() as u32,
            },
        );
    }

    for &child in &children {
        core.send_to_node(
            child,
            &Message::Broadcast(BroadcastMsg::Inform {
                group: g.id,
                requester,
                req,
                seq,
                storage: storage.clone(),
                name: name.clone(),
                value: value.clone(),
            }),
        )?;
    }

    // Last sequence wins: a stale value never overwrites a newer one, and
    // the check-and-deliver is atomic against other broadcasts at this node.
    let fresh = {
        let mut delivered = g.delivered.lock().unwrap();
        let applied = delivered.entry((storage.clone(), name.clone())).or_insert(0);

        if seq > *applied {
            *applied = seq;
            true
        } else {
            false
        }
    };

    if fresh {
        for (_, global) in g.local_members() {
            let delivery = core
                .storage_of(global)
                .and_then(|s| s.put(&storage, &name, value.clone()));

            if let Err(err) = delivery {
                logging::warn!(core.log, "broadcast delivery failed";
                               "thread" => global,
                               "storage" => &storage,
                               "name" => &name,
                               "error" => %err);
            }
        }
    }

    if children.is_empty() {
        finish(core, g, requester, req)?;
    }

    Ok(())
}

/// This node's subtree is done: release the originator if it lives here and
/// ack to the parent.
fn finish(core: &Arc<Core>, group: &Arc<Group>, requester: GlobalThreadId, req: RequestNum) -> Result<()> {
    let my = core.my_id();

    if core.home_of(requester)? == my {
        if let Some(slot) = core.pending.take(&(Kind::BroadcastRequest as u8, requester, req)) {
            slot.signal(Ok(crate::wire::to_bytes(&())));
        }
    }

    let tree = group.tree();
    if my != tree.root() {
        let parent = tree.parent_of(my).expect("Non-root node has a parent");
        core.send_to_node(
            parent,
            &Message::Broadcast(BroadcastMsg::Ack {
                group: group.id,
                requester,
                req,
            }),
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let payload = Message::Broadcast(BroadcastMsg::Request {
            group: 0,
            requester: 2,
            req: 5,
            storage: "shared".into(),
            name: "x".into(),
            value: vec![1, 2, 3],
        })
        .encode(2);

        match Message::decode(&payload).unwrap() {
            Message::Broadcast(BroadcastMsg::Request {
                group,
                requester,
                req,
                storage,
                name,
                value,
            }) => {
                assert_eq!((group, requester, req), (0, 2, 5));
                assert_eq!(storage, "shared");
                assert_eq!(name, "x");
                assert_eq!(value, vec![1, 2, 3]);
            }
            _ => panic!("Unexpected message"),
        }

        let payload = Message::Broadcast(BroadcastMsg::Inform {
            group: 3,
            requester: 2,
            req: 5,
            seq: 77,
            storage: "shared".into(),
            name: "x".into(),
            value: vec![4; 100],
        })
        .encode(16);

        match Message::decode(&payload).unwrap() {
            Message::Broadcast(BroadcastMsg::Inform { seq, value, .. }) => {
                assert_eq!(seq, 77);
                assert_eq!(value, vec![4; 100]);
            }
            _ => panic!("Unexpected message"),
        }

        let payload = Message::Broadcast(BroadcastMsg::Ack {
            group: 1,
            requester: 0,
            req: 9,
        })
        .encode(16384);

        match Message::decode(&payload).unwrap() {
            Message::Broadcast(BroadcastMsg::Ack {
                group,
                requester,
                req,
            }) => assert_eq!((group, requester, req), (1, 0, 9)),
            _ => panic!("Unexpected message"),
        }
    }
}
