use crate::error::{Error, ErrorKind, Result};
use crate::logging::{self, o, Logger};
use crate::msg::Message;
use crate::net::frame;
use crate::net::selector::{ChannelId, SelectorHandle};
use crate::net::workers::{WorkerHandle, WorkerPool};
use crate::runtime::Core;
use crate::PhysicalId;
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Delivery target of an outbound message.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Target {
    /// This node. The frame short-circuits the socket but still runs
    /// through the decoder, so loopback and remote execution behave the
    /// same.
    Loopback,
    /// A peer socket, by reactor channel id.
    Channel(ChannelId),
}

/// Where an inbound message came from.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Origin {
    Local,
    Remote { channel: ChannelId, peer: PhysicalId },
}

/// Routes outbound messages to the reactor or the loopback, and schedules
/// inbound frames on the worker pool.
pub struct Networker {
    selector: SelectorHandle,
    pool: Mutex<WorkerPool>,
    workers: WorkerHandle,
    core: RwLock<Weak<Core>>,
    chunk_size: usize,
    log: Logger,
}

impl Networker {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        selector: SelectorHandle,
        workers: usize,
        chunk_size: usize,
        log: L,
    ) -> Networker {
        let log = match log.into() {
            Some(log) => log.new(o!("component" => "networker")),
            None => logging::discard(),
        };

        let pool = WorkerPool::new(workers, &log);

        Networker {
            selector,
            workers: pool.handle(),
            pool: Mutex::new(pool),
            core: RwLock::new(Weak::new()),
            chunk_size,
            log,
        }
    }

    /// Wires the runtime core in once it exists. Message execution needs the
    /// core, the core owns the networker; the cycle is broken with a weak
    /// reference.
    pub fn install(&self, core: &Arc<Core>) {
        *self.core.write().unwrap() = Arc::downgrade(core);
    }

    /// Starts a non-blocking connect on the reactor.
    pub fn connect(
        &self,
        addr: std::net::SocketAddr,
        preamble: PhysicalId,
    ) -> Arc<crate::future::Completion<ChannelId>> {
        self.selector.connect(addr, preamble)
    }

    /// Encodes and delivers a message.
    pub fn send(&self, target: Target, msg: &Message) -> Result<()> {
        let payload = msg.encode(self.chunk_size);

        logging::trace!(self.log, "send"; "kind" => msg.kind().name(), "target" => ?target);

        match target {
            Target::Loopback => {
                self.dispatch(Origin::Local, payload);
                Ok(())
            }
            Target::Channel(id) => self.selector.send_frame(id, frame::wrap(&payload)),
        }
    }

    /// Schedules an inbound frame payload for execution on the worker pool.
    pub fn dispatch(&self, origin: Origin, payload: Vec<u8>) {
        let core = match self.core.read().unwrap().upgrade() {
            Some(core) => core,
            None => return,
        };

        let log = self.log.clone();
        let job = Box::new(move || match Message::decode(&payload) {
            Ok(msg) => {
                let kind = msg.kind();
                if let Err(err) = msg.execute(&core, origin) {
                    logging::error!(log, "handler failed";
                                    "kind" => kind.name(),
                                    "error" => %err);
                }
            }
            Err(err) => {
                // Corrupt wire data is not recoverable.
                logging::error!(log, "malformed message"; "error" => %err);
                core.abort(Error::with_detail(ErrorKind::MalformedMessage, err.to_string()));
            }
        });

        self.workers.submit(job);
    }

    /// Stops the worker pool after draining queued jobs.
    pub fn shutdown(&self) {
        self.pool.lock().unwrap().shutdown();
    }
}
