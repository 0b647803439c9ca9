//! Typed wire messages and their handlers.
//!
//! Every message carries a stable one byte kind followed by kind-specific
//! fields. Related kinds are grouped into family enums; the top level
//! `Message` wraps the families and dispatches decode and execution.

pub mod barrier;
pub mod broadcast;
pub mod bye;
pub mod collect;
pub mod hello;
pub mod join;
pub mod reduce;
pub mod xfer;

pub use self::barrier::BarrierMsg;
pub use self::broadcast::BroadcastMsg;
pub use self::bye::ByeMsg;
pub use self::collect::CollectMsg;
pub use self::hello::HelloMsg;
pub use self::join::JoinMsg;
pub use self::reduce::ReduceMsg;
pub use self::xfer::XferMsg;

use crate::error::{Error, ErrorKind, Result};
use crate::net::networker::Origin;
use crate::runtime::Core;
use crate::wire::{WireReader, WireWriter};
use std::sync::Arc;

/// The stable message kind set. The numeric values are part of the wire
/// protocol and never change.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Kind {
    Hello = 0,
    HelloResponse = 1,
    HelloCompleted = 2,
    HelloGo = 3,
    BarrierGo = 4,
    BarrierWaitingBytes = 5,
    BroadcastRequest = 6,
    BroadcastBytes = 7,
    BroadcastInform = 8,
    CollectRequest = 9,
    CollectValueBytes = 10,
    ReduceRequest = 11,
    ReduceValueBytes = 12,
    GroupJoinRequest = 13,
    GroupJoinResponse = 14,
    GroupJoinInform = 15,
    GroupJoinConfirm = 16,
    GetRequest = 17,
    GetReply = 18,
    PutRequest = 19,
    PutReply = 20,
    AccumulateRequest = 21,
    AccumulateReply = 22,
    AsyncAtRequest = 23,
    AsyncAtReply = 24,
    Bye = 25,
    ByeCompleted = 26,
}

impl Kind {
    pub fn from_u8(value: u8) -> Result<Kind> {
        Ok(match value {
            0 => Kind::Hello,
            1 => Kind::HelloResponse,
            2 => Kind::HelloCompleted,
            3 => Kind::HelloGo,
            4 => Kind::BarrierGo,
            5 => Kind::BarrierWaitingBytes,
            6 => Kind::BroadcastRequest,
            7 => Kind::BroadcastBytes,
            8 => Kind::BroadcastInform,
            9 => Kind::CollectRequest,
            10 => Kind::CollectValueBytes,
            11 => Kind::ReduceRequest,
            12 => Kind::ReduceValueBytes,
            13 => Kind::GroupJoinRequest,
            14 => Kind::GroupJoinResponse,
            15 => Kind::GroupJoinInform,
            16 => Kind::GroupJoinConfirm,
            17 => Kind::GetRequest,
            18 => Kind::GetReply,
            19 => Kind::PutRequest,
            20 => Kind::PutReply,
            21 => Kind::AccumulateRequest,
            22 => Kind::AccumulateReply,
            23 => Kind::AsyncAtRequest,
            24 => Kind::AsyncAtReply,
            25 => Kind::Bye,
            26 => Kind::ByeCompleted,
            other => {
                return Err(Error::with_detail(
                    ErrorKind::MalformedMessage,
                    format!("unknown message kind {}", other),
                ))
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Kind::Hello => "Hello",
            Kind::HelloResponse => "HelloResponse",
            Kind::HelloCompleted => "HelloCompleted",
            Kind::HelloGo => "HelloGo",
            Kind::BarrierGo => "BarrierGo",
            Kind::BarrierWaitingBytes => "BarrierWaitingBytes",
            Kind::BroadcastRequest => "BroadcastRequest",
            Kind::BroadcastBytes => "BroadcastBytes",
            Kind::BroadcastInform => "BroadcastInform",
            Kind::CollectRequest => "CollectRequest",
            Kind::CollectValueBytes => "CollectValueBytes",
            Kind::ReduceRequest => "ReduceRequest",
            Kind::ReduceValueBytes => "ReduceValueBytes",
            Kind::GroupJoinRequest => "GroupJoinRequest",
            Kind::GroupJoinResponse => "GroupJoinResponse",
            Kind::GroupJoinInform => "GroupJoinInform",
            Kind::GroupJoinConfirm => "GroupJoinConfirm",
            Kind::GetRequest => "GetRequest",
            Kind::GetReply => "GetReply",
            Kind::PutRequest => "PutRequest",
            Kind::PutReply => "PutReply",
            Kind::AccumulateRequest => "AccumulateRequest",
            Kind::AccumulateReply => "AccumulateReply",
            Kind::AsyncAtRequest => "AsyncAtRequest",
            Kind::AsyncAtReply => "AsyncAtReply",
            Kind::Bye => "Bye",
            Kind::ByeCompleted => "ByeCompleted",
        }
    }
}

/// A typed wire message. Short-lived: constructed by the sender, encoded,
/// decoded at the receiver and consumed by its `execute` handler.
#[derive(Debug)]
pub enum Message {
    Hello(HelloMsg),
    Barrier(BarrierMsg),
    Broadcast(BroadcastMsg),
    Collect(CollectMsg),
    Reduce(ReduceMsg),
    Join(JoinMsg),
    Xfer(XferMsg),
    Bye(ByeMsg),
}

impl Message {
    pub fn kind(&self) -> Kind {
        match self {
            Message::Hello(msg) => msg.kind(),
            Message::Barrier(msg) => msg.kind(),
            Message::Broadcast(msg) => msg.kind(),
            Message::Collect(msg) => msg.kind(),
            Message::Reduce(msg) => msg.kind(),
            Message::Join(msg) => msg.kind(),
            Message::Xfer(msg) => msg.kind(),
            Message::Bye(msg) => msg.kind(),
        }
    }

    /// Encodes the kind byte and the kind-specific fields.
    pub fn encode(&self, chunk_size: usize) -> Vec<u8> {
        let mut writer = WireWriter::new(chunk_size);
        writer.write_u8(self.kind() as u8);

        match self {
            Message::Hello(msg) => msg.write(&mut writer),
            Message::Barrier(msg) => msg.write(&mut writer),
            Message::Broadcast(msg) => msg.write(&mut writer),
            Message::Collect(msg) => msg.write(&mut writer),
            Message::Reduce(msg) => msg.write(&mut writer),
            Message::Join(msg) => msg.write(&mut writer),
            Message::Xfer(msg) => msg.write(&mut writer),
            Message::Bye(msg) => msg.write(&mut writer),
        }

        writer.into_bytes()
    }

    /// Decodes a frame payload produced by `encode`.
    pub fn decode(payload: &[u8]) -> Result<Message> {
        let mut reader = WireReader::new(payload);
        let kind = Kind::from_u8(reader.read_u8()?)?;

        let msg = match kind {
            Kind::Hello | Kind::HelloResponse | Kind::HelloCompleted | Kind::HelloGo => {
                Message::Hello(HelloMsg::read(kind, &mut reader)?)
            }
            Kind::BarrierGo | Kind::BarrierWaitingBytes => {
                Message::Barrier(BarrierMsg::read(kind, &mut reader)?)
            }
            Kind::BroadcastRequest | Kind::BroadcastBytes | Kind::BroadcastInform => {
                Message::Broadcast(BroadcastMsg::read(kind, &mut reader)?)
            }
            Kind::CollectRequest | Kind::CollectValueBytes => {
                Message::Collect(CollectMsg::read(kind, &mut reader)?)
            }
            Kind::ReduceRequest | Kind::ReduceValueBytes => {
                Message::Reduce(ReduceMsg::read(kind, &mut reader)?)
            }
            Kind::GroupJoinRequest
            | Kind::GroupJoinResponse
            | Kind::GroupJoinInform
            | Kind::GroupJoinConfirm => Message::Join(JoinMsg::read(kind, &mut reader)?),
            Kind::GetRequest
            | Kind::GetReply
            | Kind::PutRequest
            | Kind::PutReply
            | Kind::AccumulateRequest
            | Kind::AccumulateReply
            | Kind::AsyncAtRequest
            | Kind::AsyncAtReply => Message::Xfer(XferMsg::read(kind, &mut reader)?),
            Kind::Bye | Kind::ByeCompleted => Message::Bye(ByeMsg::read(kind, &mut reader)?),
        };

        reader.expect_end()?;
        Ok(msg)
    }

    /// Runs the message's handler on a worker thread.
    pub fn execute(self, core: &Arc<Core>, origin: Origin) -> Result<()> {
        match self {
            Message::Hello(msg) => msg.execute(core, origin),
            Message::Barrier(msg) => msg.execute(core),
            Message::Broadcast(msg) => msg.execute(core),
            Message::Collect(msg) => msg.execute(core),
            Message::Reduce(msg) => msg.execute(core),
            Message::Join(msg) => msg.execute(core),
            Message::Xfer(msg) => msg.execute(core),
            Message::Bye(msg) => msg.execute(core),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_bytes_are_stable() {
        for value in 0..27u8 {
            assert_eq!(Kind::from_u8(value).unwrap() as u8, value);
        }

        let err = Kind::from_u8(27).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
    }

    #[test]
    fn unknown_kind_is_malformed() {
        let err = Message::decode(&[200]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
    }

    #[test]
    fn empty_payload_is_malformed() {
        let err = Message::decode(&[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let msg = Message::Barrier(BarrierMsg::Go { group: 0, round: 1 });
        let mut payload = msg.encode(16384);
        payload.push(0);

        let err = Message::decode(&payload).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
    }
}
