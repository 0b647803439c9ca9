//! Collect collective.
//!
//! Like reduce, but the aggregate is the concatenation of every member's
//! value, ordered by strictly ascending group thread id. Partials carry
//! `(group_thread_id, value)` pairs; the root flattens the ordered set and
//! sends it to the requester's home node.

use super::{Kind, Message};
use crate::error::{Error, ErrorKind, Result};
use crate::group::Group;
use crate::runtime::Core;
use crate::state::CollectState;
use crate::wire::{self, WireReader, WireWriter};
use crate::{GlobalThreadId, GroupId, GroupThreadId, RequestNum};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug)]
pub enum CollectMsg {
    Request {
        group: GroupId,
        requester: GlobalThreadId,
        req: RequestNum,
        storage: String,
        name: String,
    },
    Values {
        group: GroupId,
        requester: GlobalThreadId,
        req: RequestNum,
        is_final: bool,
        outcome: Result<Vec<(GroupThreadId, Vec<u8>)>>,
    },
}

impl CollectMsg {
    pub fn kind(&self) -> Kind {
        match self {
            CollectMsg::Request { .. } => Kind::CollectRequest,
            CollectMsg::Values { .. } => Kind::CollectValueBytes,
        }
    }

    pub fn write(&self, writer: &mut WireWriter) {
        match self {
            CollectMsg::Request {
                group,
                requester,
                req,
                storage,
                name,
            } => {
                writer.write_u32(*group);
                writer.write_u32(*requester);
                writer.write_u32(*req);
                writer.write_str(storage);
                writer.write_str(name);
            }
            CollectMsg::Values {
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

                match outcome {
                    Ok(parts) => {
                        writer.write_u8(0);
                        writer.write_u32(parts.len() as u32);
                        for (id, bytes) in parts {
                            writer.write_u32(*id);
                            writer.write_blob(bytes);
                        }
                    }
                    Err(err) => {
                        writer.write_u8(1);
                        writer.write_u8(err.kind() as u8);
                        writer.write_str(err.detail());
                    }
                }
            }
        }
    }

    pub fn read(kind: Kind, reader: &mut WireReader) -> Result<CollectMsg> {
        let group = reader.read_u32()?;
        let requester = reader.read_u32()?;
        let req = reader.read_u32()?;

        Ok(match kind {
            Kind::CollectRequest => CollectMsg::Request {
                group,
                requester,
                req,
                storage: reader.read_str()?,
                name: reader.read_str()?,
            },
            Kind::CollectValueBytes => {
                let is_final = reader.read_bool()?;

                let outcome = match reader.read_u8()? {
                    0 => {
                        let count = reader.read_u32()? as usize;
                        let mut parts = Vec::with_capacity(count.min(4096));
                        for _ in 0..count {
                            let id = reader.read_u32()?;
                            parts.push((id, reader.read_blob()?));
                        }
                        Ok(parts)
                    }
                    1 => {
                        let kind = ErrorKind::from_u8(reader.read_u8()?).ok_or_else(|| {
                            Error::with_detail(ErrorKind::MalformedMessage, "unknown error kind")
                        })?;
                        Err(Error::with_detail(kind, reader.read_str()?))
                    }
                    other => {
                        return Err(Error::with_detail(
                            ErrorKind::MalformedMessage,
                            format!("invalid outcome byte {}", other),
                        ))
                    }
                };

                CollectMsg::Values {
                    group,
                    requester,
                    req,
                    is_final,
                    outcome,
                }
            }
            _ => unreachable!(),
        })
    }

    pub fn execute(self, core: &Arc<Core>) -> Result<()> {
        match self {
            CollectMsg::Request {
                group,
                requester,
                req,
                storage,
                name,
            } => {
                let g = core.group(group)?;
                let tree = g.tree();
                let children = tree.children_of(core.my_id());

                let mut state = CollectState {
                    waiting: children.len() as u32,
                    parts: BTreeMap::new(),
                    failed: None,
                };

                for (group_thread_id, global) in g.local_members() {
                    let value = core.storage_of(global).and_then(|s| s.get(&storage, &name));
                    state.absorb(value.map(|bytes| vec![(group_thread_id, bytes)]));
                }

                if children.is_empty() {
                    return forward(core, &g, requester, req, state);
                }

                g.collect.lock().unwrap().insert((requester, req), state);

                for &child in &children {
                    core.send_to_node(
                        child,
                        &Message::Collect(CollectMsg::Request {
                            group,
                            requester,
                            req,
                            storage: storage.clone(),
                            name: name.clone(),
                        }),
                    )?;
                }

                Ok(())
            }
            CollectMsg::Values {
                group,
                requester,
                req,
                is_final,
                outcome,
            } => {
                if is_final {
                    if let Some(slot) = core.pending.take(&(Kind::CollectRequest as u8, requester, req)) {
                        // Flatten into the blob the requester decodes.
                        slot.signal(outcome.map(|parts| {
                            let values: Vec<Vec<u8>> =
                                parts.into_iter().map(|(_, bytes)| bytes).collect();
                            wire::to_bytes(&values)
                        }));
                    }
                    return Ok(());
                }

                let g = core.group(group)?;

                let finished = {
                    let mut table = g.collect.lock().unwrap();
                    match table.get_mut(&(requester, req)) {
                        Some(state) => {
                            state.absorb(outcome);
                            state.waiting -= 1;
                            if state.waiting == 0 {
                                table.remove(&(requester, req))
                            } else {
                                None
                            }
                        }
                        None => None,
                    }
                };

                match finished {
                    Some(state) => forward(core, &g, requester, req, state),
                    None => Ok(()),
                }
            }
        }
    }
}

/// Sends this node's ordered partial up the tree, or the final ordered set
/// to the requester's home node from the root.
fn forward(
    core: &Arc<Core>,
    group: &Arc<Group>,
    requester: GlobalThreadId,
    req: RequestNum,
    state: CollectState,
) -> Result<()> {
    let outcome = match state.failed {
        Some(err) => Err(err),
        None => Ok(state.parts.into_iter().collect::<Vec<_>>()),
    };

    let tree = group.tree();
    let my = core.my_id();

    let (target, is_final) = if my == tree.root() {
        (core.home_of(requester)?, true)
    } else {
        (tree.parent_of(my).expect("Non-root node has a parent"), false)
    };

    core.send_to_node(
        target,
        &Message::Collect(CollectMsg::Values {
            group: group.id,
            requester,
            req,
            is_final,
            outcome,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let payload = Message::Collect(CollectMsg::Request {
            group: 1,
            requester: 0,
            req: 2,
            storage: "shared".into(),
            name: "ids".into(),
        })
        .encode(16384);

        match Message::decode(&payload).unwrap() {
            Message::Collect(CollectMsg::Request { storage, name, .. }) => {
                assert_eq!((storage.as_str(), name.as_str()), ("shared", "ids"));
            }
            _ => panic!("Unexpected message"),
        }

        let payload = Message::Collect(CollectMsg::Values {
            group: 1,
            requester: 0,
            req: 2,
            is_final: false,
            outcome: Ok(vec![(0, vec![7]), (3, vec![8, 9])]),
        })
        .encode(4);

        match Message::decode(&payload).unwrap() {
            Message::Collect(CollectMsg::Values { is_final, outcome, .. }) => {
                assert!(!is_final);
                assert_eq!(outcome.unwrap(), vec![(0, vec![7]), (3, vec![8, 9])]);
            }
            _ => panic!("Unexpected message"),
        }
    }

    #[test]
    fn error_outcome_roundtrip() {
        let payload = Message::Collect(CollectMsg::Values {
            group: 1,
            requester: 0,
            req: 2,
            is_final: true,
            outcome: Err(Error::with_detail(ErrorKind::NoSuchVariable, "ids")),
        })
        .encode(16384);

        match Message::decode(&payload).unwrap() {
            Message::Collect(CollectMsg::Values { outcome, .. }) => {
                let err = outcome.unwrap_err();
                assert_eq!(err.kind(), ErrorKind::NoSuchVariable);
                assert_eq!(err.detail(), "ids");
            }
            _ => panic!("Unexpected message"),
        }
    }
}
