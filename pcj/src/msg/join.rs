//! Group join.
//!
//! The joiner sends `Request` to the master (node 0), which assigns the
//! group id and the next dense group thread id, fixing a total order on
//! additions. The master informs every member node of the new snapshot;
//! once all confirm, it responds to the joiner. Each member observes
//! additions in the master's order.

use super::{Kind, Message};
use crate::error::Result;
use crate::runtime::Core;
use crate::state::JoinState;
use crate::wire::{self, WireReader, WireWriter};
use crate::{GlobalThreadId, GroupId, GroupThreadId, RequestNum};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug)]
pub enum JoinMsg {
    Request {
        name: String,
        requester: GlobalThreadId,
        req: RequestNum,
    },
    Response {
        requester: GlobalThreadId,
        req: RequestNum,
        outcome: Result<Vec<u8>>,
    },
    Inform {
        group: GroupId,
        name: String,
        pairs: Vec<(GroupThreadId, GlobalThreadId)>,
        requester: GlobalThreadId,
        req: RequestNum,
    },
    Confirm {
        group: GroupId,
        requester: GlobalThreadId,
        req: RequestNum,
    },
}

impl JoinMsg {
    pub fn kind(&self) -> Kind {
        match self {
            JoinMsg::Request { .. } => Kind::GroupJoinRequest,
            JoinMsg::Response { .. } => Kind::GroupJoinResponse,
            JoinMsg::Inform { .. } => Kind::GroupJoinInform,
            JoinMsg::Confirm { .. } => Kind::GroupJoinConfirm,
        }
    }

    pub fn write(&self, writer: &mut WireWriter) {
        match self {
            JoinMsg::Request {
                name,
                requester,
                req,
            } => {
                writer.write_str(name);
                writer.write_u32(*requester);
                writer.write_u32(*req);
            }
            JoinMsg::Response {
                requester,
                req,
                outcome,
            } => {
                writer.write_u32(*requester);
                writer.write_u32(*req);
                wire::write_outcome(writer, outcome);
            }
            JoinMsg::Inform {
                group,
                name,
                pairs,
                requester,
                req,
            } => {
                writer.write_u32(*group);
                writer.write_str(name);
                writer.write_u32(pairs.len() as u32);
                for (group_thread_id, global_id) in pairs {
                    writer.write_u32(*group_thread_id);
                    writer.write_u32(*global_id);
                }
                writer.write_u32(*requester);
                writer.write_u32(*req);
            }
            JoinMsg::Confirm {
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

    pub fn read(kind: Kind, reader: &mut WireReader) -> Result<JoinMsg> {
        Ok(match kind {
            Kind::GroupJoinRequest => JoinMsg::Request {
                name: reader.read_str()?,
                requester: reader.read_u32()?,
                req: reader.read_u32()?,
            },
            Kind::GroupJoinResponse => JoinMsg::Response {
                requester: reader.read_u32()?,
                req: reader.read_u32()?,
                outcome: wire::read_outcome(reader)?,
            },
            Kind::GroupJoinInform => {
                let group = reader.read_u32()?;
                let name = reader.read_str()?;

                let count = reader.read_u32()? as usize;
                let mut pairs = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    pairs.push((reader.read_u32()?, reader.read_u32()?));
                }

                JoinMsg::Inform {
                    group,
                    name,
                    pairs,
                    requester: reader.read_u32()?,
                    req: reader.read_u32()?,
                }
            }
            Kind::GroupJoinConfirm => JoinMsg::Confirm {
                group: reader.read_u32()?,
                requester: reader.read_u32()?,
                req: reader.read_u32()?,
            },
            _ => unreachable!(),
        })
    }

    pub fn execute(self, core: &Arc<Core>) -> Result<()> {
        match self {
            JoinMsg::Request {
                name,
                requester,
                req,
            } => {
                let joiner_node = core.home_of(requester)?;
                let (group, group_thread_id, pairs, recipients) = core.master_assign(&name, requester)?;

                core.join_states.lock().unwrap().insert(
                    (requester, req),
                    JoinState {
                        waiting: recipients.len() as u32,
                        joiner_node,
                        group,
                        group_thread_id,
                    },
                );

                for node in recipients {
                    core.send_to_node(
                        node,
                        &Message::Join(JoinMsg::Inform {
                            group,
                            name: name.clone(),
                            pairs: pairs.clone(),
                            requester,
                            req,
                        }),
                    )?;
                }

                Ok(())
            }
            JoinMsg::Inform {
                group,
                name,
                pairs,
                requester,
                req,
            } => {
                let g = core.group_or_create(group, &name);
                let threads_map: BTreeMap<GroupThreadId, GlobalThreadId> = pairs.into_iter().collect();

                let my = core.my_id();
                g.apply_mapping(threads_map, my, |thread| core.home_of(thread))?;

                core.send_to_node(
                    0,
                    &Message::Join(JoinMsg::Confirm {
                        group,
                        requester,
                        req,
                    }),
                )
            }
            JoinMsg::Confirm {
                group: _,
                requester,
                req,
            } => {
                let done = {
                    let mut table = core.join_states.lock().unwrap();
                    match table.get_mut(&(requester, req)) {
                        Some(state) => {
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

                if let Some(state) = done {
                    let mut writer = WireWriter::with_defaults();
                    writer.write_u32(state.group);
                    writer.write_u32(state.group_thread_id);

                    core.send_to_node(
                        state.joiner_node,
                        &Message::Join(JoinMsg::Response {
                            requester,
                            req,
                            outcome: Ok(writer.into_bytes()),
                        }),
                    )?;
                }

                Ok(())
            }
            JoinMsg::Response {
                requester,
                req,
                outcome,
            } => {
                if let Some(slot) = core.pending.take(&(Kind::GroupJoinRequest as u8, requester, req)) {
                    slot.signal(outcome);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let payload = Message::Join(JoinMsg::Request {
            name: "G".into(),
            requester: 7,
            req: 1,
        })
        .encode(16384);

        match Message::decode(&payload).unwrap() {
            Message::Join(JoinMsg::Request {
                name,
                requester,
                req,
            }) => assert_eq!((name.as_str(), requester, req), ("G", 7, 1)),
            _ => panic!("Unexpected message"),
        }

        let payload = Message::Join(JoinMsg::Inform {
            group: 2,
            name: "G".into(),
            pairs: vec![(0, 4), (1, 7)],
            requester: 7,
            req: 1,
        })
        .encode(16384);

        match Message::decode(&payload).unwrap() {
            Message::Join(JoinMsg::Inform { group, pairs, .. }) => {
                assert_eq!(group, 2);
                assert_eq!(pairs, vec![(0, 4), (1, 7)]);
            }
            _ => panic!("Unexpected message"),
        }

        let payload = Message::Join(JoinMsg::Confirm {
            group: 2,
            requester: 7,
            req: 1,
        })
        .encode(16384);

        match Message::decode(&payload).unwrap() {
            Message::Join(JoinMsg::Confirm { group, .. }) => assert_eq!(group, 2),
            _ => panic!("Unexpected message"),
        }

        let payload = Message::Join(JoinMsg::Response {
            requester: 7,
            req: 1,
            outcome: Ok(vec![0, 0, 0, 2, 0, 0, 0, 1]),
        })
        .encode(16384);

        match Message::decode(&payload).unwrap() {
            Message::Join(JoinMsg::Response { outcome, .. }) => {
                assert_eq!(outcome.unwrap(), vec![0, 0, 0, 2, 0, 0, 0, 1]);
            }
            _ => panic!("Unexpected message"),
        }
    }
}
