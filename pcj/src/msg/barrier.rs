//! Barrier collective.
//!
//! Every member thread contributes one `Go` for the round (loopback for its
//! own node). A node forwards a single `Go` to its parent once all children
//! and all local threads have reported; the root then floods `Waiting` down
//! the tree, which releases the local futures at every node.

use super::{Kind, Message};
use crate::error::Result;
use crate::group::Group;
use crate::runtime::Core;
use crate::state::BarrierState;
use crate::wire::{WireReader, WireWriter};
use crate::GroupId;
use std::sync::Arc;

#[derive(Debug)]
pub enum BarrierMsg {
    Go { group: GroupId, round: u32 },
    Waiting { group: GroupId, round: u32 },
}

impl BarrierMsg {
    pub fn kind(&self) -> Kind {
        match self {
            BarrierMsg::Go { .. } => Kind::BarrierGo,
            BarrierMsg::Waiting { .. } => Kind::BarrierWaitingBytes,
        }
    }

    pub fn write(&self, writer: &mut WireWriter) {
        match self {
            BarrierMsg::Go { group, round } | BarrierMsg::Waiting { group, round } => {
                writer.write_u32(*group);
                writer.write_u32(*round);
            }
        }
    }

    pub fn read(kind: Kind, reader: &mut WireReader) -> Result<BarrierMsg> {
        let group = reader.read_u32()?;
        let round = reader.read_u32()?;

        Ok(match kind {
            Kind::BarrierGo => BarrierMsg::Go { group, round },
            Kind::BarrierWaitingBytes => BarrierMsg::Waiting { group, round },
            _ => unreachable!(),
        })
    }

    pub fn execute(self, core: &Arc<Core>) -> Result<()> {
        match self {
            BarrierMsg::Go { group, round } => {
                let g = core.group(group)?;
                let tree = g.tree();
                let my = core.my_id();

                let done = {
                    let mut table = g.barrier.lock().unwrap();
                    let state = table
                        .entry(round)
                        .or_insert_with(|| BarrierState::new(barrier_count(&g, core)));
                    state.waiting -= 1;
                    state.waiting == 0
                };

                if !done {
                    return Ok(());
                }

                if my == tree.root() {
                    release(core, &g, round)
                } else {
                    let parent = tree.parent_of(my).expect("Non-root node has a parent");
                    core.send_to_node(parent, &Message::Barrier(BarrierMsg::Go { group, round }))
                }
            }
            BarrierMsg::Waiting { group, round } => {
                let g = core.group(group)?;
                release(core, &g, round)
            }
        }
    }
}

/// Notifications a node waits for in one round: one per child subtree plus
/// one per local member thread.
pub fn barrier_count(group: &Group, core: &Core) -> u32 {
    let children = group.tree().children_of(core.my_id()).len() as u32;
    children + group.local_members().len() as u32
}

/// Floods `Waiting` to the children and signals every local future of the
/// round. The round's state is removed here, exactly once.
fn release(core: &Arc<Core>, group: &Arc<Group>, round: u32) -> Result<()> {
    let tree = group.tree();

    for child in tree.children_of(core.my_id()) {
        core.send_to_node(
            child,
            &Message::Barrier(BarrierMsg::Waiting {
                group: group.id,
                round,
            }),
        )?;
    }

    if let Some(state) = group.barrier.lock().unwrap().remove(&round) {
        for future in state.futures {
            future.signal(Ok(Vec::new()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let payload = Message::Barrier(BarrierMsg::Go { group: 3, round: 9 }).encode(16384);

        match Message::decode(&payload).unwrap() {
            Message::Barrier(BarrierMsg::Go { group, round }) => {
                assert_eq!((group, round), (3, 9));
            }
            _ => panic!("Unexpected message"),
        }

        let payload = Message::Barrier(BarrierMsg::Waiting { group: 0, round: 1 }).encode(16384);

        match Message::decode(&payload).unwrap() {
            Message::Barrier(BarrierMsg::Waiting { group, round }) => {
                assert_eq!((group, round), (0, 1));
            }
            _ => panic!("Unexpected message"),
        }
    }
}
