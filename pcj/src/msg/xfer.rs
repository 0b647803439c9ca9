//! Point-to-point operations: get, put, accumulate and async-at.
//!
//! Requests go directly to the target thread's home node, execute against
//! its storage on a worker, and reply with the outcome. Storage and thread
//! lookup failures are reply errors, not crashes: they can result from
//! legitimate races during group join.

use super::{Kind, Message};
use crate::error::{Error, ErrorKind, Result};
use crate::runtime::{Core, TaskCtx};
use crate::wire::{self, WireReader, WireWriter};
use crate::{GlobalThreadId, RequestNum};
use std::sync::Arc;

#[derive(Debug)]
pub enum XferMsg {
    GetRequest {
        target: GlobalThreadId,
        storage: String,
        name: String,
        requester: GlobalThreadId,
        req: RequestNum,
    },
    GetReply {
        requester: GlobalThreadId,
        req: RequestNum,
        outcome: Result<Vec<u8>>,
    },
    PutRequest {
        target: GlobalThreadId,
        storage: String,
        name: String,
        value: Vec<u8>,
        requester: GlobalThreadId,
        req: RequestNum,
    },
    PutReply {
        requester: GlobalThreadId,
        req: RequestNum,
        outcome: Result<Vec<u8>>,
    },
    AccRequest {
        target: GlobalThreadId,
        storage: String,
        name: String,
        op: String,
        value: Vec<u8>,
        requester: GlobalThreadId,
        req: RequestNum,
    },
    AccReply {
        requester: GlobalThreadId,
        req: RequestNum,
        outcome: Result<Vec<u8>>,
    },
    AsyncAtRequest {
        target: GlobalThreadId,
        task: String,
        arg: Vec<u8>,
        requester: GlobalThreadId,
        req: RequestNum,
    },
    AsyncAtReply {
        requester: GlobalThreadId,
        req: RequestNum,
        outcome: Result<Vec<u8>>,
    },
}

impl XferMsg {
    pub fn kind(&self) -> Kind {
        match self {
            XferMsg::GetRequest { .. } => Kind::GetRequest,
            XferMsg::GetReply { .. } => Kind::GetReply,
            XferMsg::PutRequest { .. } => Kind::PutRequest,
            XferMsg::PutReply { .. } => Kind::PutReply,
            XferMsg::AccRequest { .. } => Kind::AccumulateRequest,
            XferMsg::AccReply { .. } => Kind::AccumulateReply,
            XferMsg::AsyncAtRequest { .. } => Kind::AsyncAtRequest,
            XferMsg::AsyncAtReply { .. } => Kind::AsyncAtReply,
        }
    }

    pub fn write(&self, writer: &mut WireWriter) {
        match self {
            XferMsg::GetRequest {
                target,
                storage,
                name,
                requester,
                req,
            } => {
                writer.write_u32(*target);
                writer.write_str(storage);
                writer.write_str(name);
                writer.write_u32(*requester);
                writer.write_u32(*req);
            }
            XferMsg::PutRequest {
                target,
                storage,
                name,
                value,
                requester,
                req,
            } => {
                writer.write_u32(*target);
                writer.write_str(storage);
                writer.write_str(name);
                writer.write_blob(value);
                writer.write_u32(*requester);
                writer.write_u32(*req);
            }
            XferMsg::AccRequest {
                target,
                storage,
                name,
                op,
                value,
                requester,
                req,
            } => {
                writer.write_u32(*target);
                writer.write_str(storage);
                writer.write_str(name);
                writer.write_str(op);
                writer.write_blob(value);
                writer.write_u32(*requester);
                writer.write_u32(*req);
            }
            XferMsg::AsyncAtRequest {
                target,
                task,
                arg,
                requester,
                req,
            } => {
                writer.write_u32(*target);
                writer.write_str(task);
                writer.write_blob(arg);
                writer.write_u32(*requester);
                writer.write_u32(*req);
            }
            XferMsg::GetReply {
                requester,
                req,
                outcome,
            }
            | XferMsg::PutReply {
                requester,
                req,
                outcome,
            }
            | XferMsg::AccReply {
                requester,
                req,
                outcome,
            }
            | XferMsg::AsyncAtReply {
                requester,
                req,
                outcome,
            } => {
                writer.write_u32(*requester);
                writer.write_u32(*req);
                wire::write_outcome(writer, outcome);
            }
        }
    }

    pub fn read(kind: Kind, reader: &mut WireReader) -> Result<XferMsg> {
        Ok(match kind {
            Kind::GetRequest => XferMsg::GetRequest {
                target: reader.read_u32()?,
                storage: reader.read_str()?,
                name: reader.read_str()?,
                requester: reader.read_u32()?,
                req: reader.read_u32()?,
            },
            Kind::PutRequest => XferMsg::PutRequest {
                target: reader.read_u32()?,
                storage: reader.read_str()?,
                name: reader.read_str()?,
                value: reader.read_blob()?,
                requester: reader.read_u32()?,
                req: reader.read_u32()?,
            },
            Kind::AccumulateRequest => XferMsg::AccRequest {
                target: reader.read_u32()?,
                storage: reader.read_str()?,
                name: reader.read_str()?,
                op: reader.read_str()?,
                value: reader.read_blob()?,
                requester: reader.read_u32()?,
                req: reader.read_u32()?,
            },
            Kind::AsyncAtRequest => XferMsg::AsyncAtRequest {
                target: reader.read_u32()?,
                task: reader.read_str()?,
                arg: reader.read_blob()?,
                requester: reader.read_u32()?,
                req: reader.read_u32()?,
            },
            Kind::GetReply | Kind::PutReply | Kind::AccumulateReply | Kind::AsyncAtReply => {
                let requester = reader.read_u32()?;
                let req = reader.read_u32()?;
                let outcome = wire::read_outcome(reader)?;

                match kind {
                    Kind::GetReply => XferMsg::GetReply {
                        requester,
                        req,
                        outcome,
                    },
                    Kind::PutReply => XferMsg::PutReply {
                        requester,
                        req,
                        outcome,
                    },
                    Kind::AccumulateReply => XferMsg::AccReply {
                        requester,
                        req,
                        outcome,
                    },
                    _ => XferMsg::AsyncAtReply {
                        requester,
                        req,
                        outcome,
                    },
                }
            }
            _ => unreachable!(),
        })
    }

    pub fn execute(self, core: &Arc<Core>) -> Result<()> {
        match self {
            XferMsg::GetRequest {
                target,
                storage,
                name,
                requester,
                req,
            } => {
                let outcome = core.storage_of(target).and_then(|s| s.get(&storage, &name));
                reply(core, requester, req, |outcome, requester, req| {
                    XferMsg::GetReply {
                        requester,
                        req,
                        outcome,
                    }
                }, outcome)
            }
            XferMsg::PutRequest {
                target,
                storage,
                name,
                value,
                requester,
                req,
            } => {
                let outcome = core
                    .storage_of(target)
                    .and_then(|s| s.put(&storage, &name, value))
                    .map(|_| wire::to_bytes(&()));
                reply(core, requester, req, |outcome, requester, req| {
                    XferMsg::PutReply {
                        requester,
                        req,
                        outcome,
                    }
                }, outcome)
            }
            XferMsg::AccRequest {
                target,
                storage,
                name,
                op,
                value,
                requester,
                req,
            } => {
                let outcome = core.storage_of(target).and_then(|s| {
                    let combiner = core.op(&op)?;
                    s.accumulate(&storage, &name, combiner, value)
                }).map(|_| wire::to_bytes(&()));
                reply(core, requester, req, |outcome, requester, req| {
                    XferMsg::AccReply {
                        requester,
                        req,
                        outcome,
                    }
                }, outcome)
            }
            XferMsg::AsyncAtRequest {
                target,
                task,
                arg,
                requester,
                req,
            } => {
                let outcome = core.storage_of(target).and_then(|s| {
                    let body = core.task(&task)?;
                    let ctx = TaskCtx {
                        thread: target,
                        storage: &s,
                    };
                    body(&ctx, &arg).map_err(|err| match err.kind() {
                        // Task failures carry the remote detail back as a
                        // user exception.
                        ErrorKind::UserException => err,
                        _ => Error::with_detail(ErrorKind::UserException, err.to_string()),
                    })
                });
                reply(core, requester, req, |outcome, requester, req| {
                    XferMsg::AsyncAtReply {
                        requester,
                        req,
                        outcome,
                    }
                }, outcome)
            }
            XferMsg::GetReply {
                requester,
                req,
                outcome,
            } => settle(core, Kind::GetRequest, requester, req, outcome),
            XferMsg::PutReply {
                requester,
                req,
                outcome,
            } => settle(core, Kind::PutRequest, requester, req, outcome),
            XferMsg::AccReply {
                requester,
                req,
                outcome,
            } => settle(core, Kind::AccumulateRequest, requester, req, outcome),
            XferMsg::AsyncAtReply {
                requester,
                req,
                outcome,
            } => settle(core, Kind::AsyncAtRequest, requester, req, outcome),
        }
    }
}

fn reply<F>(
    core: &Arc<Core>,
    requester: GlobalThreadId,
    req: RequestNum,
    make: F,
    outcome: Result<Vec<u8>>,
) -> Result<()>
where
    F: FnOnce(Result<Vec<u8>>, GlobalThreadId, RequestNum) -> XferMsg,
{
    let home = core.home_of(requester)?;
    core.send_to_node(home, &Message::Xfer(make(outcome, requester, req)))
}

fn settle(
    core: &Arc<Core>,
    request_kind: Kind,
    requester: GlobalThreadId,
    req: RequestNum,
    outcome: Result<Vec<u8>>,
) -> Result<()> {
    if let Some(slot) = core.pending.take(&(request_kind as u8, requester, req)) {
        slot.signal(outcome);
    }
    Ok(())
}
