//! Graceful shutdown.
//!
//! Every node counts one notification per child of the global tree plus one
//! for its own local program. At zero a non-root forwards `Bye` upward;
//! node 0 floods `Completed` down the tree and the job tears down.

use super::Kind;
use crate::error::Result;
use crate::runtime::Core;
use crate::wire::{WireReader, WireWriter};
use crate::PhysicalId;
use std::sync::Arc;

#[derive(Debug)]
pub enum ByeMsg {
    Bye { node: PhysicalId },
    Completed,
}

impl ByeMsg {
    pub fn kind(&self) -> Kind {
        match self {
            ByeMsg::Bye { .. } => Kind::Bye,
            ByeMsg::Completed => Kind::ByeCompleted,
        }
    }

    pub fn write(&self, writer: &mut WireWriter) {
        match self {
            ByeMsg::Bye { node } => writer.write_u32(*node),
            ByeMsg::Completed => (),
        }
    }

    pub fn read(kind: Kind, reader: &mut WireReader) -> Result<ByeMsg> {
        Ok(match kind {
            Kind::Bye => ByeMsg::Bye {
                node: reader.read_u32()?,
            },
            Kind::ByeCompleted => ByeMsg::Completed,
            _ => unreachable!(),
        })
    }

    pub fn execute(self, core: &Arc<Core>) -> Result<()> {
        match self {
            ByeMsg::Bye { node: _ } => core.bye_decrement(),
            ByeMsg::Completed => core.bye_completed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::Message;

    #[test]
    fn wire_roundtrip() {
        let payload = Message::Bye(ByeMsg::Bye { node: 4 }).encode(16384);

        match Message::decode(&payload).unwrap() {
            Message::Bye(ByeMsg::Bye { node }) => assert_eq!(node, 4),
            _ => panic!("Unexpected message"),
        }

        let payload = Message::Bye(ByeMsg::Completed).encode(16384);

        match Message::decode(&payload).unwrap() {
            Message::Bye(ByeMsg::Completed) => (),
            _ => panic!("Unexpected message"),
        }
    }
}
