use crate::error::{Error, ErrorKind, Result};
use crate::future::Completion;
use crate::logging::{self, o, Logger};
use crate::net::buffer::Buffer;
use crate::net::frame;
use crate::PhysicalId;
use byteorder::{BigEndian, ByteOrder};
use indexmap::IndexSet;
use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub type ChannelId = usize;

/// Preamble value announced by a node that has not been assigned a physical
/// id yet (the bootstrap connection to node 0).
pub const UNASSIGNED: PhysicalId = PhysicalId::max_value();

const LISTENER_TOKEN: mio::Token = mio::Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(1);
const EVENTS_CAPACITY: usize = 1024;

/// Callbacks invoked from the reactor thread. Implementations must hand any
/// non-trivial work to the worker pool; the reactor never blocks.
pub trait SelectorSink: Send + Sync + 'static {
    /// A complete inbound frame payload (kind byte plus fields).
    fn frame(&self, channel: ChannelId, peer: PhysicalId, payload: Vec<u8>);

    /// An accepted connection finished its preamble and announced its peer.
    fn accepted(&self, channel: ChannelId, peer: PhysicalId);

    /// A fatal failure on a peer socket or the listener.
    fn fatal(&self, err: Error);
}

enum Cmd {
    Connect {
        addr: SocketAddr,
        preamble: PhysicalId,
        reply: Arc<Completion<ChannelId>>,
    },
    Send {
        channel: ChannelId,
        frame: Vec<u8>,
    },
    Close {
        channel: ChannelId,
    },
    Shutdown,
}

/// Cheap cloneable submission side of the reactor.
#[derive(Clone)]
pub struct SelectorHandle {
    tx: mpsc::Sender<Cmd>,
}

impl SelectorHandle {
    /// Enqueues a framed message on the channel's FIFO egress queue.
    /// Frames enqueued on one channel are delivered to the peer in order.
    pub fn send_frame(&self, channel: ChannelId, frame: Vec<u8>) -> Result<()> {
        self.tx
            .send(Cmd::Send { channel, frame })
            .map_err(|_| Error::with_detail(ErrorKind::ConnectionLost, "reactor stopped"))
    }

    /// Starts a non-blocking connect. The returned slot completes with the
    /// channel id once connected, or `ConnectFailed`.
    pub fn connect(&self, addr: SocketAddr, preamble: PhysicalId) -> Arc<Completion<ChannelId>> {
        let reply = Arc::new(Completion::new());

        if self
            .tx
            .send(Cmd::Connect {
                addr,
                preamble,
                reply: reply.clone(),
            })
            .is_err()
        {
            reply.signal(Err(Error::with_detail(ErrorKind::ConnectFailed, "reactor stopped")));
        }

        reply
    }

    pub fn close(&self, channel: ChannelId) {
        let _ = self.tx.send(Cmd::Close { channel });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Cmd::Shutdown);
    }
}

/// The reactor. One thread owns all peer sockets and the listener, and
/// multiplexes accept, connect, read and write over a single `mio::Poll`.
pub struct Selector {
    handle: SelectorHandle,
    local_addr: SocketAddr,
    thread: Option<thread::JoinHandle<()>>,
}

impl Selector {
    /// Binds the listen address and starts the reactor thread.
    pub fn start<'a, L: Into<Option<&'a Logger>>>(
        bind: SocketAddr,
        sink: Arc<dyn SelectorSink>,
        alive_timeout: Option<Duration>,
        log: L,
    ) -> Result<Selector> {
        let log = match log.into() {
            Some(log) => log.new(o!("component" => "selector")),
            None => logging::discard(),
        };

        let listener = TcpListener::bind(&bind)?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = mpsc::channel();
        let mut reactor = Reactor::new(listener, rx, sink, alive_timeout, log)?;

        let thread = thread::Builder::new()
            .name("pcj-selector".into())
            .spawn(move || reactor.run())
            .expect("Error spawning selector thread");

        Ok(Selector {
            handle: SelectorHandle { tx },
            local_addr,
            thread: Some(thread),
        })
    }

    #[inline]
    pub fn handle(&self) -> SelectorHandle {
        self.handle.clone()
    }

    /// The bound listen address, with the ephemeral port resolved.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the reactor and closes every socket.
    pub fn shutdown(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum ChannelState {
    Connecting {
        reply: Arc<Completion<ChannelId>>,
        preamble: PhysicalId,
    },
    Preamble,
    Open,
}

struct Channel {
    stream: TcpStream,
    state: ChannelState,
    peer: PhysicalId,
    ingress: Buffer,
    egress: Buffer,
}

impl Channel {
    fn new(stream: TcpStream, state: ChannelState) -> Channel {
        Channel {
            stream,
            state,
            peer: UNASSIGNED,
            ingress: Buffer::new(),
            egress: Buffer::new(),
        }
    }
}

struct Reactor {
    poll: mio::Poll,
    events: mio::Events,
    listener: TcpListener,
    rx: mpsc::Receiver<Cmd>,
    sink: Arc<dyn SelectorSink>,
    channels: Vec<Option<Channel>>,
    free: Vec<ChannelId>,
    live: IndexSet<ChannelId>,
    alive_timeout: Option<Duration>,
    housekeeping_time: Instant,
    log: Logger,
    stop: bool,
}

impl Reactor {
    fn new(
        listener: TcpListener,
        rx: mpsc::Receiver<Cmd>,
        sink: Arc<dyn SelectorSink>,
        alive_timeout: Option<Duration>,
        log: Logger,
    ) -> Result<Reactor> {
        let poll = mio::Poll::new()?;

        poll.register(
            &listener,
            LISTENER_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )?;

        Ok(Reactor {
            poll,
            events: mio::Events::with_capacity(EVENTS_CAPACITY),
            listener,
            rx,
            sink,
            channels: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            alive_timeout,
            housekeeping_time: Instant::now(),
            log,
            stop: false,
        })
    }

    fn run(&mut self) {
        logging::debug!(self.log, "reactor started");

        while !self.stop {
            self.drain_cmds();

            if self.stop {
                break;
            }

            self.force_send();

            self.poll
                .poll(&mut self.events, Some(POLL_TIMEOUT))
                .expect("Reactor poll failed");

            // The borrow checker will not let the event loop mutate
            // self.channels while iterating self.events, so collect first.
            let events: Vec<(mio::Token, mio::Ready)> = self
                .events
                .iter()
                .map(|event| (event.token(), event.readiness()))
                .collect();

            for (token, readiness) in events {
                if token == LISTENER_TOKEN {
                    self.accept_pending();
                } else {
                    self.channel_event(usize::from(token) - 1, readiness);
                }
            }

            self.housekeeping();
        }

        logging::debug!(self.log, "reactor stopped");
    }

    fn drain_cmds(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(Cmd::Connect {
                    addr,
                    preamble,
                    reply,
                }) => self.start_connect(addr, preamble, reply),
                Ok(Cmd::Send { channel, frame }) => {
                    match self.channels.get_mut(channel).and_then(Option::as_mut) {
                        Some(ch) => ch.egress.write_bytes(&frame),
                        None => logging::debug!(self.log, "send on closed channel";
                                                "channel" => channel),
                    }
                }
                Ok(Cmd::Close { channel }) => self.release(channel),
                Ok(Cmd::Shutdown) | Err(mpsc::TryRecvError::Disconnected) => {
                    self.stop = true;
                    return;
                }
                Err(mpsc::TryRecvError::Empty) => return,
            }
        }
    }

    fn start_connect(
        &mut self,
        addr: SocketAddr,
        preamble: PhysicalId,
        reply: Arc<Completion<ChannelId>>,
    ) {
        match TcpStream::connect(&addr) {
            Ok(stream) => {
                let id = self.install(Channel::new(stream, ChannelState::Connecting { reply, preamble }));
                logging::trace!(self.log, "connect started"; "channel" => id, "addr" => %addr);
            }
            Err(err) => {
                reply.signal(Err(Error::with_detail(ErrorKind::ConnectFailed, err.to_string())));
            }
        }
    }

    fn install(&mut self, channel: Channel) -> ChannelId {
        let id = match self.free.pop() {
            Some(id) => {
                self.channels[id] = Some(channel);
                id
            }
            None => {
                self.channels.push(Some(channel));
                self.channels.len() - 1
            }
        };

        let stream = &self.channels[id].as_ref().unwrap().stream;
        self.poll
            .register(
                stream,
                mio::Token(id + 1),
                mio::Ready::readable() | mio::Ready::writable(),
                mio::PollOpt::edge(),
            )
            .expect("Stream registration failed");

        self.live.insert(id);
        id
    }

    fn release(&mut self, id: ChannelId) {
        if let Some(Some(_)) = self.channels.get(id) {
            self.channels[id] = None;
            self.live.remove(&id);
            self.free.push(id);
        }
    }

    /// Drains pending egress on every live channel. OP_WRITE style readiness
    /// only fires on edges, so queued frames are flushed eagerly here.
    fn force_send(&mut self) {
        let pending: Vec<ChannelId> = self
            .live
            .iter()
            .cloned()
            .filter(|&id| match &self.channels[id] {
                Some(ch) => !ch.egress.is_empty(),
                None => false,
            })
            .collect();

        for id in pending {
            self.try_egress(id);
        }
    }

    fn try_egress(&mut self, id: ChannelId) {
        let result = match self.channels.get_mut(id).and_then(Option::as_mut) {
            // Nothing leaves the socket before the connect handshake is done.
            Some(ch) => match ch.state {
                ChannelState::Connecting { .. } => return,
                _ => ch.egress.egress(&mut ch.stream),
            },
            None => return,
        };

        if let Err(err) = result {
            self.fatal_channel(id, err.into());
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let id = self.install(Channel::new(stream, ChannelState::Preamble));
                    logging::trace!(self.log, "connection accepted"; "channel" => id, "addr" => %addr);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    logging::error!(self.log, "listener failure"; "error" => %err);
                    self.sink.fatal(err.into());
                    self.stop = true;
                    return;
                }
            }
        }
    }

    fn channel_event(&mut self, id: ChannelId, readiness: mio::Ready) {
        // Connect completion first: a failed connect surfaces as an error
        // readiness rather than plain readable/writable.
        if let Some(ch) = self.channels.get_mut(id).and_then(Option::as_mut) {
            if let ChannelState::Connecting { .. } = ch.state {
                self.connect_event(id, readiness);
                return;
            }
        } else {
            return;
        }

        if readiness.is_readable() {
            self.try_ingress(id);
        }

        if readiness.is_writable() {
            self.try_egress(id);
        }
    }

    fn connect_event(&mut self, id: ChannelId, readiness: mio::Ready) {
        let ch = match self.channels.get_mut(id).and_then(Option::as_mut) {
            Some(ch) => ch,
            None => return,
        };

        let failure = match ch.stream.take_error() {
            Ok(None) if readiness.is_writable() => None,
            Ok(None) => return,
            Ok(Some(err)) => Some(err),
            Err(err) => Some(err),
        };

        let state = std::mem::replace(&mut ch.state, ChannelState::Open);
        let (reply, preamble) = match state {
            ChannelState::Connecting { reply, preamble } => (reply, preamble),
            _ => unreachable!(),
        };

        match failure {
            None => {
                // The peer learns who connected before any frames flow.
                let mut bytes = [0u8; 4];
                BigEndian::write_u32(&mut bytes, preamble);
                ch.egress.write_bytes(&bytes);

                logging::trace!(self.log, "connect completed"; "channel" => id);
                reply.signal(Ok(id));
                self.try_egress(id);
            }
            Some(err) => {
                logging::debug!(self.log, "connect failed"; "channel" => id, "error" => %err);
                reply.signal(Err(Error::with_detail(ErrorKind::ConnectFailed, err.to_string())));
                self.release(id);
            }
        }
    }

    fn try_ingress(&mut self, id: ChannelId) {
        let result = match self.channels.get_mut(id).and_then(Option::as_mut) {
            Some(ch) => ch.ingress.ingress(&mut ch.stream),
            None => return,
        };

        // Frames that arrived ahead of an EOF are still delivered.
        if self.process_inbound(id) {
            if let Err(err) = result {
                self.fatal_channel(id, err.into());
            }
        }
    }

    /// Delivers the preamble and all complete frames. Returns false when the
    /// channel was torn down due to corrupt framing.
    fn process_inbound(&mut self, id: ChannelId) -> bool {
        loop {
            let ch = match self.channels.get_mut(id).and_then(Option::as_mut) {
                Some(ch) => ch,
                None => return false,
            };

            if let ChannelState::Preamble = ch.state {
                if ch.ingress.len() < 4 {
                    return true;
                }

                let peer = BigEndian::read_u32(&ch.ingress.read_slice()[..4]);
                ch.ingress.consume(4);
                ch.state = ChannelState::Open;
                ch.peer = peer;

                logging::trace!(self.log, "preamble received"; "channel" => id, "peer" => peer);
                self.sink.accepted(id, peer);
                continue;
            }

            match frame::next_frame(&mut ch.ingress) {
                Ok(Some(payload)) => {
                    let peer = ch.peer;
                    self.sink.frame(id, peer, payload);
                }
                Ok(None) => return true,
                Err(err) => {
                    self.fatal_channel(id, err);
                    return false;
                }
            }
        }
    }

    fn fatal_channel(&mut self, id: ChannelId, err: Error) {
        logging::error!(self.log, "channel failure"; "channel" => id, "error" => %err);
        self.release(id);
        self.sink.fatal(err);
    }

    fn housekeeping(&mut self) {
        let interval = match self.alive_timeout {
            Some(interval) => interval,
            None => return,
        };

        let now = Instant::now();
        if now.duration_since(self.housekeeping_time) < interval {
            return;
        }
        self.housekeeping_time = now;

        let ids: Vec<ChannelId> = self.live.iter().cloned().collect();
        for id in ids {
            let probe = match self.channels.get_mut(id).and_then(Option::as_mut) {
                Some(ch) => ch.stream.take_error(),
                None => continue,
            };

            match probe {
                Ok(None) => (),
                Ok(Some(err)) | Err(err) => self.fatal_channel(id, err.into()),
            }
        }
    }
}
