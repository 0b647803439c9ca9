//! Runtime bootstrap, the shared core, and shutdown.
//!
//! `start` brings up the messaging substrate, runs the bootstrap handshake
//! with node 0, executes the user entry point on every local logical
//! thread, and drains the bye tree before tearing everything down.

use crate::config::Properties;
use crate::ctx::Ctx;
use crate::error::{Error, ErrorKind, Result};
use crate::future::Completion;
use crate::group::Group;
use crate::logging::{self, o, Logger};
use crate::msg::{ByeMsg, HelloMsg, Message};
use crate::net::networker::{Networker, Origin, Target};
use crate::net::selector::{ChannelId, Selector, SelectorSink, UNASSIGNED};
use crate::node::{NodeInfo, NodeTable};
use crate::state::{JoinState, PendingTable, ReplySlot, ReqKey};
use crate::storage::{CombineFn, ThreadStorage};
use crate::{GlobalThreadId, GroupId, GroupThreadId, PhysicalId, GLOBAL_GROUP, GLOBAL_GROUP_NAME};
use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;

const BOOT_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_WAIT: Duration = Duration::from_secs(5);
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);
const CONNECT_ATTEMPTS: usize = 100;

/// The user entry point, run once per local logical thread.
pub type EntryFn = fn(&mut Ctx) -> Result<()>;

/// A named async-at task body, executed against the target thread's storage.
pub type TaskFn = fn(&TaskCtx, &[u8]) -> Result<Vec<u8>>;

/// Execution context handed to async-at tasks.
pub struct TaskCtx<'a> {
    pub thread: GlobalThreadId,
    pub storage: &'a ThreadStorage,
}

/// The SPMD program: one entry point plus the named operators and tasks it
/// uses. Every process constructs the same job, which is what lets reduce
/// combiners and async-at bodies run on any node by name.
#[derive(Clone)]
pub struct Job {
    entry: EntryFn,
    ops: HashMap<String, CombineFn>,
    tasks: HashMap<String, TaskFn>,
}

impl Job {
    pub fn new(entry: EntryFn) -> Job {
        Job {
            entry,
            ops: HashMap::new(),
            tasks: HashMap::new(),
        }
    }

    /// Registers an associative combiner for reduce and accumulate.
    pub fn op(mut self, name: &str, op: CombineFn) -> Job {
        self.ops.insert(name.to_string(), op);
        self
    }

    /// Registers an async-at task body.
    pub fn task(mut self, name: &str, task: TaskFn) -> Job {
        self.tasks.insert(name.to_string(), task);
        self
    }
}

/// Launch parameters of one process, mirroring the launcher command line.
pub struct Settings {
    /// Externally reachable host of this process.
    pub host: String,
    /// Listen port; 0 picks an ephemeral port.
    pub port: u16,
    /// `host:port` of node 0.
    pub node0: String,
    /// Whether this process is node 0.
    pub coordinator: bool,
    pub total_threads: u32,
    /// Global thread ids homed on this process.
    pub local_threads: Vec<GlobalThreadId>,
    pub props: Properties,
    pub logger: Option<Logger>,
}

impl Settings {
    fn validate(&self) -> Result<()> {
        if self.total_threads == 0 {
            return Err(Error::with_detail(ErrorKind::Config, "total thread count is zero"));
        }

        if self.local_threads.is_empty() {
            return Err(Error::with_detail(ErrorKind::Config, "no local threads configured"));
        }

        for &thread in &self.local_threads {
            if thread >= self.total_threads {
                return Err(Error::with_detail(
                    ErrorKind::Config,
                    format!("thread id {} out of range 0..{}", thread, self.total_threads),
                ));
            }
        }

        Ok(())
    }
}

struct Boot {
    response: ReplySlot,
    mesh: ReplySlot,
    go: ReplySlot,
    completed: Mutex<u32>,
}

struct Bye {
    remaining: Mutex<Option<u32>>,
    done: ReplySlot,
}

struct MasterGroup {
    id: GroupId,
    threads: BTreeMap<GroupThreadId, GlobalThreadId>,
}

/// Authoritative group membership, owned by node 0. Assignment is
/// serialized under one lock, which fixes the total order every member
/// observes.
struct MasterRegistry {
    next_id: GroupId,
    groups: HashMap<String, MasterGroup>,
}

/// Shared state of one runtime instance. Message handlers run against this
/// from worker threads; user code reaches it through `Ctx`.
pub struct Core {
    pub log: Logger,
    pub props: Properties,
    pub networker: Networker,
    pub pending: PendingTable,
    pub join_states: Mutex<HashMap<ReqKey, JoinState>>,
    nodes: RwLock<NodeTable>,
    groups: RwLock<HashMap<GroupId, Arc<Group>>>,
    storages: HashMap<GlobalThreadId, Arc<ThreadStorage>>,
    ops: HashMap<String, CombineFn>,
    tasks: HashMap<String, TaskFn>,
    master: Mutex<MasterRegistry>,
    boot: Boot,
    bye: Bye,
    closing: AtomicBool,
    aborted: AtomicBool,
    failure: Mutex<Option<Error>>,
}

impl Core {
    pub fn my_id(&self) -> PhysicalId {
        self.nodes.read().unwrap().my_id()
    }

    pub fn total_threads(&self) -> u32 {
        self.nodes.read().unwrap().total_threads()
    }

    pub fn home_of(&self, thread: GlobalThreadId) -> Result<PhysicalId> {
        self.nodes.read().unwrap().home_of(thread)
    }

    /// Sends a message to a node, routing through the loopback for this
    /// node and the mapped peer channel otherwise.
    pub fn send_to_node(&self, node: PhysicalId, msg: &Message) -> Result<()> {
        let target = self.nodes.read().unwrap().target_for(node)?;
        self.networker.send(target, msg)
    }

    pub fn group(&self, id: GroupId) -> Result<Arc<Group>> {
        self.groups
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::with_detail(ErrorKind::UnknownGroup, format!("group {}", id)))
    }

    pub fn group_or_create(&self, id: GroupId, name: &str) -> Arc<Group> {
        self.groups
            .write()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Arc::new(Group::new(id, name)))
            .clone()
    }

    /// The storage of a thread homed on this node.
    pub fn storage_of(&self, thread: GlobalThreadId) -> Result<Arc<ThreadStorage>> {
        self.storages.get(&thread).cloned().ok_or_else(|| {
            Error::with_detail(ErrorKind::UnknownThread, format!("thread {} not local", thread))
        })
    }

    pub fn op(&self, name: &str) -> Result<CombineFn> {
        self.ops.get(name).cloned().ok_or_else(|| {
            Error::with_detail(ErrorKind::UserException, format!("unknown operator `{}`", name))
        })
    }

    pub fn task(&self, name: &str) -> Result<TaskFn> {
        self.tasks.get(name).cloned().ok_or_else(|| {
            Error::with_detail(ErrorKind::UserException, format!("unknown task `{}`", name))
        })
    }

    /// Assigns (or finds) the group id and the joiner's group thread id,
    /// returning the full snapshot and the nodes to inform. Master only.
    pub fn master_assign(
        &self,
        name: &str,
        requester: GlobalThreadId,
    ) -> Result<(GroupId, GroupThreadId, Vec<(GroupThreadId, GlobalThreadId)>, Vec<PhysicalId>)> {
        let mut master = self.master.lock().unwrap();

        if !master.groups.contains_key(name) {
            let id = master.next_id;
            master.next_id += 1;
            master.groups.insert(
                name.to_string(),
                MasterGroup {
                    id,
                    threads: BTreeMap::new(),
                },
            );
        }

        let entry = master.groups.get_mut(name).unwrap();

        // Re-joining is idempotent: the thread keeps its assignment.
        let group_thread_id = match entry.threads.iter().find(|&(_, &t)| t == requester) {
            Some((&existing, _)) => existing,
            None => {
                let next = entry.threads.len() as GroupThreadId;
                entry.threads.insert(next, requester);
                next
            }
        };

        let pairs: Vec<(GroupThreadId, GlobalThreadId)> =
            entry.threads.iter().map(|(&g, &t)| (g, t)).collect();

        let mut recipients = vec![0];
        for &(_, thread) in &pairs {
            let home = self.home_of(thread)?;
            if !recipients.contains(&home) {
                recipients.push(home);
            }
        }

        Ok((entry.id, group_thread_id, pairs, recipients))
    }

    // --- bootstrap -------------------------------------------------------

    /// Handles a `Hello` at the coordinator: assigns the next physical id
    /// and, once every thread id is covered, answers all nodes with the
    /// complete table.
    pub fn boot_hello(
        &self,
        origin: Origin,
        host: String,
        port: u16,
        threads: Vec<GlobalThreadId>,
    ) -> Result<()> {
        let mut sends = Vec::new();
        let mut validation = Ok(());

        {
            let mut nodes = self.nodes.write().unwrap();

            if !nodes.is_coordinator() {
                return Err(Error::with_detail(ErrorKind::Config, "Hello at non-coordinator node"));
            }

            let id = nodes.push_node(NodeInfo {
                physical_id: 0,
                host,
                port,
                threads,
            });

            if let Origin::Remote { channel, .. } = origin {
                nodes.set_channel(id, channel);
            }

            logging::debug!(self.log, "node registered"; "node" => id);

            if nodes.is_complete() {
                validation = nodes.validate();

                if validation.is_ok() {
                    let table = nodes.nodes().to_vec();
                    for node in &table[1..] {
                        sends.push((
                            node.physical_id,
                            Message::Hello(HelloMsg::Response {
                                physical_id: node.physical_id,
                                nodes: table.clone(),
                            }),
                        ));
                    }
                }
            }
        }

        if let Err(err) = validation {
            self.abort(err.clone());
            return Err(err);
        }

        if !sends.is_empty() {
            logging::info!(self.log, "node table complete"; "nodes" => sends.len() + 1);

            // Group 0 must exist here before any peer can be released, or a
            // fast worker's first collective would find no group.
            self.create_global_group()?;

            for (node, msg) in sends {
                self.send_to_node(node, &msg)?;
            }

            self.check_mesh();
        }

        Ok(())
    }

    /// Handles the coordinator's `Response` at a non-zero node.
    pub fn boot_response(&self, my_id: PhysicalId, nodes: Vec<NodeInfo>) -> Result<()> {
        self.nodes.write().unwrap().assign(my_id, nodes);

        logging::debug!(self.log, "identity assigned"; "node" => my_id);

        self.boot.response.signal(Ok(Vec::new()));
        self.check_mesh();
        Ok(())
    }

    /// Handles a `Completed` report at the coordinator; releases the job
    /// once every node's mesh row is connected.
    pub fn boot_completed(&self, node: PhysicalId) -> Result<()> {
        let expected = self.nodes.read().unwrap().node_count() as u32 - 1;

        let done = {
            let mut count = self.boot.completed.lock().unwrap();
            *count += 1;
            *count == expected
        };

        logging::debug!(self.log, "mesh row complete"; "node" => node);

        if done {
            let peers: Vec<PhysicalId> = self.nodes.read().unwrap().nodes()[1..]
                .iter()
                .map(|n| n.physical_id)
                .collect();

            for peer in peers {
                self.send_to_node(peer, &Message::Hello(HelloMsg::Go))?;
            }

            self.boot_go();
        }

        Ok(())
    }

    pub fn boot_go(&self) {
        self.boot.go.signal(Ok(Vec::new()));
    }

    /// Maps a freshly connected peer channel, invoked from the reactor when
    /// an accepted connection announces itself.
    pub fn set_channel(&self, peer: PhysicalId, channel: ChannelId) {
        if peer == UNASSIGNED {
            return;
        }

        self.nodes.write().unwrap().set_channel(peer, channel);
        self.check_mesh();
    }

    fn check_mesh(&self) {
        if self.nodes.read().unwrap().mesh_complete() {
            self.boot.mesh.signal(Ok(Vec::new()));
        }
    }

    /// Creates the global group from the completed node table and
    /// initializes the bye countdown. Runs on every node before it reports
    /// readiness, so no collective can observe a node without group 0.
    fn create_global_group(&self) -> Result<()> {
        let total = self.total_threads();
        let threads_map: BTreeMap<GroupThreadId, GlobalThreadId> =
            (0..total).map(|thread| (thread, thread)).collect();

        let group = self.group_or_create(GLOBAL_GROUP, GLOBAL_GROUP_NAME);
        let my = self.my_id();
        group.apply_mapping(threads_map, my, |thread| self.home_of(thread))?;

        let children = group.tree().children_of(my).len() as u32;
        *self.bye.remaining.lock().unwrap() = Some(children + 1);

        Ok(())
    }

    // --- shutdown --------------------------------------------------------

    /// One bye notification: a child subtree finished, or the local user
    /// program returned.
    pub fn bye_decrement(&self) -> Result<()> {
        let done = {
            let mut remaining = self.bye.remaining.lock().unwrap();
            match remaining.as_mut() {
                Some(count) => {
                    *count -= 1;
                    *count == 0
                }
                None => false,
            }
        };

        if !done {
            return Ok(());
        }

        // From here on, peers tearing down their sockets is expected.
        self.closing.store(true, Ordering::SeqCst);

        let group = self.group(GLOBAL_GROUP)?;
        let tree = group.tree();
        let my = self.my_id();

        if my == tree.root() {
            self.bye_completed()
        } else {
            let parent = tree.parent_of(my).expect("Non-root node has a parent");
            self.send_to_node(parent, &Message::Bye(ByeMsg::Bye { node: my }))
        }
    }

    /// Floods `ByeCompleted` down the tree and releases the local waiter.
    pub fn bye_completed(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);

        let group = self.group(GLOBAL_GROUP)?;
        for child in group.tree().children_of(self.my_id()) {
            self.send_to_node(child, &Message::Bye(ByeMsg::Completed))?;
        }

        if self.my_id() == 0 {
            logging::info!(self.log, "ByeCompleted");
        }

        self.bye.done.signal(Ok(Vec::new()));
        Ok(())
    }

    // --- failure ---------------------------------------------------------

    /// Fail-fast job abort: every outstanding future completes with
    /// `ConnectionLost` and `start` reports the failure. Ignored once the
    /// bye drain has begun, when peers closing sockets is part of shutdown.
    pub fn abort(&self, err: Error) {
        if self.closing.load(Ordering::SeqCst) {
            logging::debug!(self.log, "late failure during shutdown"; "error" => %err);
            return;
        }

        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }

        logging::error!(self.log, "job aborted"; "error" => %err);
        *self.failure.lock().unwrap() = Some(err.clone());

        let lost = Error::with_detail(ErrorKind::ConnectionLost, err.to_string());

        self.pending.fail_all(&lost);

        for group in self.groups.read().unwrap().values() {
            for (_, state) in group.barrier.lock().unwrap().drain() {
                for future in state.futures {
                    future.signal(Err(lost.clone()));
                }
            }
        }

        self.boot.response.signal(Err(lost.clone()));
        self.boot.mesh.signal(Err(lost.clone()));
        self.boot.go.signal(Err(lost.clone()));
        self.bye.done.signal(Err(lost));
    }

    fn failure(&self) -> Option<Error> {
        self.failure.lock().unwrap().clone()
    }
}

/// Reactor callbacks. Events arriving before the core exists (a peer can
/// connect the instant the listener is up) are buffered and replayed at
/// install time.
enum SinkEvent {
    Frame(ChannelId, PhysicalId, Vec<u8>),
    Accepted(ChannelId, PhysicalId),
    Fatal(Error),
}

enum SinkState {
    Buffering(Vec<SinkEvent>),
    Live(Weak<Core>),
}

struct CoreSink {
    state: Mutex<SinkState>,
}

impl CoreSink {
    fn new() -> CoreSink {
        CoreSink {
            state: Mutex::new(SinkState::Buffering(Vec::new())),
        }
    }

    fn install(&self, core: &Arc<Core>) {
        let buffered = {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(&mut *state, SinkState::Live(Arc::downgrade(core))) {
                SinkState::Buffering(events) => events,
                SinkState::Live(_) => Vec::new(),
            }
        };

        for event in buffered {
            deliver(core, event);
        }
    }

    fn push(&self, event: SinkEvent) {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            SinkState::Buffering(events) => events.push(event),
            SinkState::Live(weak) => {
                if let Some(core) = weak.upgrade() {
                    deliver(&core, event);
                }
            }
        }
    }
}

fn deliver(core: &Arc<Core>, event: SinkEvent) {
    match event {
        SinkEvent::Frame(channel, peer, payload) => {
            core.networker.dispatch(Origin::Remote { channel, peer }, payload)
        }
        SinkEvent::Accepted(channel, peer) => core.set_channel(peer, channel),
        SinkEvent::Fatal(err) => core.abort(err),
    }
}

impl SelectorSink for CoreSink {
    fn frame(&self, channel: ChannelId, peer: PhysicalId, payload: Vec<u8>) {
        self.push(SinkEvent::Frame(channel, peer, payload));
    }

    fn accepted(&self, channel: ChannelId, peer: PhysicalId) {
        self.push(SinkEvent::Accepted(channel, peer));
    }

    fn fatal(&self, err: Error) {
        self.push(SinkEvent::Fatal(err));
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{}:{}", host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| {
            Error::with_detail(ErrorKind::Config, format!("unresolvable address {}:{}", host, port))
        })
}

fn resolve_pair(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| Error::with_detail(ErrorKind::Config, format!("unresolvable address {}", addr)))
}

/// Runs one process of the job: bootstrap, user entry point on every local
/// thread, bye drain, teardown.
pub fn start(settings: Settings, job: Job) -> Result<()> {
    settings.validate()?;

    let log = match &settings.logger {
        Some(logger) => logger.clone(),
        None => logging::discard(),
    };
    let props = settings.props.clone();

    let sink = Arc::new(CoreSink::new());
    let bind = resolve(&settings.host, settings.port)?;

    let mut selector = Selector::start(bind, sink.clone(), props.alive_timeout(), &log)?;
    let local_addr = selector.local_addr();

    let log = log.new(o!("port" => local_addr.port()));
    let networker = Networker::new(selector.handle(), props.workers_count, props.chunk_size, &log);

    let table = if settings.coordinator {
        NodeTable::coordinator(
            NodeInfo {
                physical_id: 0,
                host: settings.host.clone(),
                port: local_addr.port(),
                threads: settings.local_threads.clone(),
            },
            settings.total_threads,
        )
    } else {
        NodeTable::unassigned(settings.local_threads.clone(), settings.total_threads)
    };

    let storages = settings
        .local_threads
        .iter()
        .map(|&thread| (thread, Arc::new(ThreadStorage::new())))
        .collect();

    let core = Arc::new(Core {
        log: log.clone(),
        props: props.clone(),
        networker,
        pending: PendingTable::new(),
        join_states: Mutex::new(HashMap::new()),
        nodes: RwLock::new(table),
        groups: RwLock::new(HashMap::new()),
        storages,
        ops: job.ops.clone(),
        tasks: job.tasks.clone(),
        master: Mutex::new(MasterRegistry {
            next_id: GLOBAL_GROUP + 1,
            groups: HashMap::new(),
        }),
        boot: Boot {
            response: Arc::new(Completion::new()),
            mesh: Arc::new(Completion::new()),
            go: Arc::new(Completion::new()),
            completed: Mutex::new(0),
        },
        bye: Bye {
            remaining: Mutex::new(None),
            done: Arc::new(Completion::new()),
        },
        closing: AtomicBool::new(false),
        aborted: AtomicBool::new(false),
        failure: Mutex::new(None),
    });

    core.networker.install(&core);
    sink.install(&core);

    let result = run_job(&core, &settings, &job, local_addr);

    selector.shutdown();
    core.networker.shutdown();

    match (result, core.failure()) {
        (Ok(()), Some(err)) => Err(err),
        (result, _) => result,
    }
}

fn run_job(core: &Arc<Core>, settings: &Settings, job: &Job, local_addr: SocketAddr) -> Result<()> {
    if settings.coordinator {
        coordinator_bootstrap(core)?;
    } else {
        worker_bootstrap(core, settings, local_addr)?;
    }

    core.boot.go.wait_timeout(BOOT_TIMEOUT)?;

    logging::info!(core.log, "job released"; "node" => core.my_id());

    let entry = job.entry;
    let mut handles = Vec::new();

    for &thread in &settings.local_threads {
        let core = core.clone();

        let handle = thread::Builder::new()
            .name(format!("pcj-thread-{}", thread))
            .spawn(move || {
                let mut ctx = Ctx::new(core, thread);
                entry(&mut ctx)
            })
            .map_err(|err| Error::with_detail(ErrorKind::Config, err.to_string()))?;

        handles.push(handle);
    }

    let mut user_error = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => (),
            Ok(Err(err)) => user_error = Some(err),
            Err(_) => {
                user_error = Some(Error::with_detail(
                    ErrorKind::UserException,
                    "entry point panicked",
                ))
            }
        }
    }

    core.bye_decrement()?;
    core.bye.done.wait_timeout(core.props.shutdown_timeout())?;

    match user_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Node 0 is driven by inbound Hellos; the only active part is the
/// single-node job, which is complete on arrival.
fn coordinator_bootstrap(core: &Arc<Core>) -> Result<()> {
    let complete = core.nodes.read().unwrap().is_complete();

    if complete {
        core.nodes.read().unwrap().validate()?;
        core.create_global_group()?;
        core.boot_go();
    }

    Ok(())
}

/// A non-zero node introduces itself, learns its identity, connects its
/// mesh row and reports readiness.
fn worker_bootstrap(core: &Arc<Core>, settings: &Settings, local_addr: SocketAddr) -> Result<()> {
    let node0 = resolve_pair(&settings.node0)?;

    let channel = connect_retry(core, node0, UNASSIGNED)?;
    core.nodes.write().unwrap().set_channel(0, channel);

    core.networker.send(
        Target::Channel(channel),
        &Message::Hello(HelloMsg::Hello {
            host: settings.host.clone(),
            port: local_addr.port(),
            threads: settings.local_threads.clone(),
        }),
    )?;

    core.boot.response.wait_timeout(BOOT_TIMEOUT)?;
    core.create_global_group()?;

    let my = core.my_id();
    let higher: Vec<(PhysicalId, SocketAddr)> = {
        let nodes = core.nodes.read().unwrap();
        let mut peers = Vec::new();
        for node in nodes.nodes() {
            if node.physical_id > my {
                peers.push((node.physical_id, node.addr()?));
            }
        }
        peers
    };

    for (peer, addr) in higher {
        let channel = connect_retry(core, addr, my)?;
        core.nodes.write().unwrap().set_channel(peer, channel);
    }

    core.check_mesh();
    core.boot.mesh.wait_timeout(BOOT_TIMEOUT)?;

    core.send_to_node(0, &Message::Hello(HelloMsg::Completed { physical_id: my }))
}

/// Peers come up in arbitrary order, so refused connections are retried
/// with a delay.
fn connect_retry(core: &Arc<Core>, addr: SocketAddr, preamble: PhysicalId) -> Result<ChannelId> {
    let mut last = Error::new(ErrorKind::ConnectFailed);

    for _ in 0..CONNECT_ATTEMPTS {
        let slot = core.networker.connect(addr, preamble);

        match slot.wait_timeout(CONNECT_WAIT) {
            Ok(channel) => return Ok(channel),
            Err(err) => {
                if err.kind() != ErrorKind::ConnectFailed && err.kind() != ErrorKind::Timeout {
                    return Err(err);
                }
                last = err;
            }
        }

        thread::sleep(CONNECT_RETRY_DELAY);
    }

    Err(last)
}
