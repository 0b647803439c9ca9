//! Reduce collective.
//!
//! The requester sends `Request` to the group's root; requests fan down the
//! tree. Every node folds the variable of each local member thread with the
//! named combiner, waits for the partials of its children, and forwards one
//! partial to its parent. The root sends the final aggregate to the
//! requester's home node. Failures are sticky and travel up in place of a
//! value.

use super::{Kind, Message};
use crate::error::Result;
use crate::group::Group;
use crate::runtime::Core;
use crate::state::ReduceState;
use crate::wire::{self, WireReader, WireWriter};
use crate::{GlobalThreadId, GroupId, RequestNum};
use std::sync::Arc;

#[derive(Debug)]
pub enum ReduceMsg {
    Request {
        group: GroupId,
        requester: GlobalThreadId,
        req: RequestNum,
        storage: String,
        name: String,
        op: String,
    },
    Values {
        group: GroupId,
        requester: GlobalThreadId,
        req: RequestNum,
        is_final: bool,
        outcome: Result<Vec<u8>>,
    },
}

impl ReduceMsg {
    pub fn kind(&self) -> Kind {
        match self {
            ReduceMsg::Request { .. } => Kind::ReduceRequest,
            ReduceMsg::Values { .. } => Kind::ReduceValueBytes,
        }
    }

    pub fn write(&self, writer: &mut WireWriter) {
        match self {
            ReduceMsg::Request {
                group,
                requester,
                req,
                storage,
                name,
                op,
            } => {
                writer.write_u32(*group);
                writer.write_u32(*requester);
                writer.write_u32(*req);
                writer.write_str(storage);
                writer.write_str(name);
                writer.write_str(op);
            }
            ReduceMsg::Values {
                group,
                requester,
                req,
                is_final,
                outcome,
            } => {
                writer.write_u32(*group);
                writer.write_u32(*requester);
                writer.write_u32(*req);
                writer.write_bool(*is_final);
                wire::write_outcome(writer, outcome);
            }
        }
    }

    pub fn read(kind: Kind, reader: &mut WireReader) -> Result<ReduceMsg> {
        let group = reader.read_u32()?;
        let requester = reader.read_u32()?;
        let req = reader.read_u32()?;

        Ok(match kind {
            Kind::ReduceRequest => ReduceMsg::Request {
                group,
                requester,
                req,
                storage: reader.read_str()?,
                name: reader.read_str()?,
                op: reader.read_str()?,
            },
            Kind::ReduceValueBytes => ReduceMsg::Values {
                group,
                requester,
                req,
                is_final: reader.read_bool()?,
                outcome: wire::read_outcome(reader)?,
            },
            _ => unreachable!(),
        })
    }

    pub fn execute(self, core: &Arc<Core>) -> Result<()> {
        match self {
            ReduceMsg::Request {
                group,
                requester,
                req,
                storage,
                name,
                op,
            } => {
                let g = core.group(group)?;
                let tree = g.tree();
                let children = tree.children_of(core.my_id());

                // Fold the local contributions first.
                let mut state = ReduceState {
                    waiting: children.len() as u32,
                    op: op.clone(),
                    acc: None,
                };

                for (_, global) in g.local_members() {
                    let value = core.storage_of(global).and_then(|s| s.get(&storage, &name));
                    combine(core, &mut state, value);
                }

                if children.is_empty() {
                    return forward(core, &g, requester, req, state.acc);
                }

                g.reduce.lock().unwrap().insert((requester, req), state);

                for &child in &children {
                    core.send_to_node(
                        child,
                        &Message::Reduce(ReduceMsg::Request {
                            group,
                            requester,
                            req,
                            storage: storage.clone(),
                            name: name.clone(),
                            op: op.clone(),
                        }),
                    )?;
                }

                Ok(())
            }
            ReduceMsg::Values {
                group,
                requester,
                req,
                is_final,
                outcome,
            } => {
                if is_final {
                    if let Some(slot) = core.pending.take(&(Kind::ReduceRequest as u8, requester, req)) {
                        slot.signal(outcome);
                    }
                    return Ok(());
                }

                let g = core.group(group)?;

                let finished = {
                    let mut table = g.reduce.lock().unwrap();
                    match table.get_mut(&(requester, req)) {
                        Some(state) => {
                            combine(core, state, outcome);
                            state.waiting -= 1;
                            if state.waiting == 0 {
                                table.remove(&(requester, req)).map(|state| state.acc)
                            } else {
                                None
                            }
                        }
                        None => None,
                    }
                };

                match finished {
                    Some(acc) => forward(core, &g, requester, req, acc),
                    None => Ok(()),
                }
            }
        }
    }
}

fn combine(core: &Core, state: &mut ReduceState, incoming: Result<Vec<u8>>) {
    let op = core.op(&state.op);

    state.combine(incoming, |acc, value| op.and_then(|f| f(acc, value)));
}

/// Sends this node's aggregate up: a partial to the parent, or the final
/// result to the requester's home node from the root.
fn forward(
    core: &Arc<Core>,
    group: &Arc<Group>,
    requester: GlobalThreadId,
    req: RequestNum,
    acc: Option<Result<Vec<u8>>>,
) -> Result<()> {
    let outcome = acc.unwrap_or_else(|| {
        Err(crate::error::Error::with_detail(
            crate::error::ErrorKind::NoSuchVariable,
            "reduction over empty member set",
        ))
    });

    let tree = group.tree();
    let my = core.my_id();

    if my == tree.root() {
        let home = core.home_of(requester)?;
        core.send_to_node(
            home,
            &Message::Reduce(ReduceMsg::Values {
                group: group.id,
                requester,
                req,
                is_final: true,
                outcome,
            }),
        )
    } else {
        let parent = tree.parent_of(my).expect("Non-root node has a parent");
        core.send_to_node(
            parent,
            &Message::Reduce(ReduceMsg::Values {
                group: group.id,
                requester,
                req,
                is_final: false,
                outcome,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};

    #[test]
    fn wire_roundtrip() {
        let payload = Message::Reduce(ReduceMsg::Request {
            group: 2,
            requester: 1,
            req: 3,
            storage: "shared".into(),
            name: "acc".into(),
            op: "sum_i64".into(),
        })
        .encode(16384);

        match Message::decode(&payload).unwrap() {
            Message::Reduce(ReduceMsg::Request { storage, name, op, .. }) => {
                assert_eq!((storage.as_str(), name.as_str(), op.as_str()), ("shared", "acc", "sum_i64"));
            }
            _ => panic!("Unexpected message"),
        }

        let payload = Message::Reduce(ReduceMsg::Values {
            group: 2,
            requester: 1,
            req: 3,
            is_final: true,
            outcome: Err(Error::with_detail(ErrorKind::UserException, "unknown op")),
        })
        .encode(16384);

        match Message::decode(&payload).unwrap() {
            Message::Reduce(ReduceMsg::Values { is_final, outcome, .. }) => {
                assert!(is_final);
                let err = outcome.unwrap_err();
                assert_eq!(err.kind(), ErrorKind::UserException);
                assert_eq!(err.detail(), "unknown op");
            }
            _ => panic!("Unexpected message"),
        }
    }
}
