//! Bootstrap handshake messages.
//!
//! Non-zero nodes introduce themselves to node 0 with `Hello`; node 0
//! assigns dense physical ids in arrival order and answers every node with
//! the complete table. Once a node's mesh row is connected it reports
//! `Completed`, and node 0 releases the job with `Go`.

use super::Kind;
use crate::error::Result;
use crate::net::networker::Origin;
use crate::node::NodeInfo;
use crate::runtime::Core;
use crate::wire::{WireReader, WireWriter};
use crate::{GlobalThreadId, PhysicalId};
use std::sync::Arc;

#[derive(Debug)]
pub enum HelloMsg {
    Hello {
        host: String,
        port: u16,
        threads: Vec<GlobalThreadId>,
    },
    Response {
        physical_id: PhysicalId,
        nodes: Vec<NodeInfo>,
    },
    Completed {
        physical_id: PhysicalId,
    },
    Go,
}

impl HelloMsg {
    pub fn kind(&self) -> Kind {
        match self {
            HelloMsg::Hello { .. } => Kind::Hello,
            HelloMsg::Response { .. } => Kind::HelloResponse,
            HelloMsg::Completed { .. } => Kind::HelloCompleted,
            HelloMsg::Go => Kind::HelloGo,
        }
    }

    pub fn write(&self, writer: &mut WireWriter) {
        match self {
            HelloMsg::Hello { host, port, threads } => {
                writer.write_str(host);
                writer.write_u16(*port);
                writer.write_u32(threads.len() as u32);
                for &thread in threads {
                    writer.write_u32(thread);
                }
            }
            HelloMsg::Response { physical_id, nodes } => {
                writer.write_u32(*physical_id);
                writer.write_u32(nodes.len() as u32);
                for node in nodes {
                    node.write(writer);
                }
            }
            HelloMsg::Completed { physical_id } => writer.write_u32(*physical_id),
            HelloMsg::Go => (),
        }
    }

    pub fn read(kind: Kind, reader: &mut WireReader) -> Result<HelloMsg> {
        Ok(match kind {
            Kind::Hello => {
                let host = reader.read_str()?;
                let port = reader.read_u16()?;

                let count = reader.read_u32()? as usize;
                let mut threads = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    threads.push(reader.read_u32()?);
                }

                HelloMsg::Hello { host, port, threads }
            }
            Kind::HelloResponse => {
                let physical_id = reader.read_u32()?;

                let count = reader.read_u32()? as usize;
                let mut nodes = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    nodes.push(NodeInfo::read(reader)?);
                }

                HelloMsg::Response { physical_id, nodes }
            }
            Kind::HelloCompleted => HelloMsg::Completed {
                physical_id: reader.read_u32()?,
            },
            Kind::HelloGo => HelloMsg::Go,
            _ => unreachable!(),
        })
    }

    pub fn execute(self, core: &Arc<Core>, origin: Origin) -> Result<()> {
        match self {
            HelloMsg::Hello { host, port, threads } => core.boot_hello(origin, host, port, threads),
            HelloMsg::Response { physical_id, nodes } => core.boot_response(physical_id, nodes),
            HelloMsg::Completed { physical_id } => core.boot_completed(physical_id),
            HelloMsg::Go => {
                core.boot_go();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::Message;

    fn roundtrip(msg: HelloMsg) -> HelloMsg {
        let payload = Message::Hello(msg).encode(16384);
        match Message::decode(&payload).unwrap() {
            Message::Hello(msg) => msg,
            _ => panic!("Unexpected family"),
        }
    }

    #[test]
    fn hello_roundtrip() {
        match roundtrip(HelloMsg::Hello {
            host: "10.0.0.7".into(),
            port: 9123,
            threads: vec![2, 3],
        }) {
            HelloMsg::Hello { host, port, threads } => {
                assert_eq!(host, "10.0.0.7");
                assert_eq!(port, 9123);
                assert_eq!(threads, vec![2, 3]);
            }
            _ => panic!("Unexpected kind"),
        }
    }

    #[test]
    fn response_roundtrip() {
        let nodes = vec![
            NodeInfo {
                physical_id: 0,
                host: "a".into(),
                port: 1,
                threads: vec![0],
            },
            NodeInfo {
                physical_id: 1,
                host: "b".into(),
                port: 2,
                threads: vec![1, 2],
            },
        ];

        match roundtrip(HelloMsg::Response {
            physical_id: 1,
            nodes: nodes.clone(),
        }) {
            HelloMsg::Response {
                physical_id,
                nodes: decoded,
            } => {
                assert_eq!(physical_id, 1);
                assert_eq!(decoded, nodes);
            }
            _ => panic!("Unexpected kind"),
        }
    }

    #[test]
    fn completed_and_go_roundtrip() {
        match roundtrip(HelloMsg::Completed { physical_id: 4 }) {
            HelloMsg::Completed { physical_id } => assert_eq!(physical_id, 4),
            _ => panic!("Unexpected kind"),
        }

        match roundtrip(HelloMsg::Go) {
            HelloMsg::Go => (),
            _ => panic!("Unexpected kind"),
        }
    }
}
