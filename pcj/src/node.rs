use crate::error::{Error, ErrorKind, Result};
use crate::net::networker::Target;
use crate::net::selector::{ChannelId, UNASSIGNED};
use crate::wire::{WireReader, WireWriter};
use crate::{GlobalThreadId, PhysicalId};
use hashbrown::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};

/// A process participating in the job.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NodeInfo {
    pub physical_id: PhysicalId,
    pub host: String,
    pub port: u16,
    pub threads: Vec<GlobalThreadId>,
}

impl NodeInfo {
    pub fn write(&self, writer: &mut WireWriter) {
        writer.write_u32(self.physical_id);
        writer.write_str(&self.host);
        writer.write_u16(self.port);
        writer.write_u32(self.threads.len() as u32);
        for &thread in &self.threads {
            writer.write_u32(thread);
        }
    }

    pub fn read(reader: &mut WireReader) -> Result<NodeInfo> {
        let physical_id = reader.read_u32()?;
        let host = reader.read_str()?;
        let port = reader.read_u16()?;

        let count = reader.read_u32()? as usize;
        let mut threads = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            threads.push(reader.read_u32()?);
        }

        Ok(NodeInfo {
            physical_id,
            host,
            port,
            threads,
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| {
                Error::with_detail(
                    ErrorKind::ConnectFailed,
                    format!("unresolvable address {}:{}", self.host, self.port),
                )
            })
    }
}

/// Process-wide registry: this node's physical id, the node table, the
/// thread-to-node mapping and the peer channel map.
pub struct NodeTable {
    my_id: PhysicalId,
    nodes: Vec<NodeInfo>,
    thread_home: HashMap<GlobalThreadId, PhysicalId>,
    local_threads: Vec<GlobalThreadId>,
    total_threads: u32,
    channels: HashMap<PhysicalId, ChannelId>,
}

impl NodeTable {
    /// A table that does not know its identity yet. Non-zero nodes stay in
    /// this state until node 0 responds with the assignment.
    pub fn unassigned(local_threads: Vec<GlobalThreadId>, total_threads: u32) -> NodeTable {
        NodeTable {
            my_id: UNASSIGNED,
            nodes: Vec::new(),
            thread_home: HashMap::new(),
            local_threads,
            total_threads,
            channels: HashMap::new(),
        }
    }

    /// The coordinator's table, seeded with its own entry.
    pub fn coordinator(info: NodeInfo, total_threads: u32) -> NodeTable {
        let mut table = NodeTable::unassigned(info.threads.clone(), total_threads);
        table.my_id = 0;
        table.push_node(info);
        table
    }

    /// Registers the next arriving node, assigning the next dense physical
    /// id. Coordinator only.
    pub fn push_node(&mut self, mut info: NodeInfo) -> PhysicalId {
        let physical_id = self.nodes.len() as PhysicalId;
        info.physical_id = physical_id;

        for &thread in &info.threads {
            self.thread_home.insert(thread, physical_id);
        }

        self.nodes.push(info);
        physical_id
    }

    /// Installs the assignment received from the coordinator.
    pub fn assign(&mut self, my_id: PhysicalId, nodes: Vec<NodeInfo>) {
        self.my_id = my_id;
        self.thread_home.clear();

        for node in &nodes {
            for &thread in &node.threads {
                self.thread_home.insert(thread, node.physical_id);
            }
        }

        self.nodes = nodes;
    }

    /// Checks that the announced thread ids exactly cover `0..total`.
    pub fn validate(&self) -> Result<()> {
        let announced: usize = self.nodes.iter().map(|n| n.threads.len()).sum();

        if announced != self.thread_home.len() {
            return Err(Error::with_detail(ErrorKind::Config, "duplicate thread ids announced"));
        }

        for thread in 0..self.total_threads {
            if !self.thread_home.contains_key(&thread) {
                return Err(Error::with_detail(
                    ErrorKind::Config,
                    format!("thread {} not announced by any node", thread),
                ));
            }
        }

        if self.thread_home.len() != self.total_threads as usize {
            return Err(Error::with_detail(ErrorKind::Config, "thread ids out of range"));
        }

        Ok(())
    }

    /// True once every thread id in `0..total` has a known home.
    pub fn is_complete(&self) -> bool {
        (0..self.total_threads).all(|thread| self.thread_home.contains_key(&thread))
    }

    #[inline]
    pub fn my_id(&self) -> PhysicalId {
        self.my_id
    }

    #[inline]
    pub fn is_coordinator(&self) -> bool {
        self.my_id == 0
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn node(&self, id: PhysicalId) -> Result<&NodeInfo> {
        self.nodes
            .get(id as usize)
            .ok_or_else(|| Error::with_detail(ErrorKind::UnknownThread, format!("node {}", id)))
    }

    #[inline]
    pub fn total_threads(&self) -> u32 {
        self.total_threads
    }

    #[inline]
    pub fn local_threads(&self) -> &[GlobalThreadId] {
        &self.local_threads
    }

    /// The home node of a global thread id.
    pub fn home_of(&self, thread: GlobalThreadId) -> Result<PhysicalId> {
        self.thread_home.get(&thread).cloned().ok_or_else(|| {
            Error::with_detail(ErrorKind::UnknownThread, format!("thread {}", thread))
        })
    }

    /// Records the channel carrying traffic to a peer node.
    pub fn set_channel(&mut self, node: PhysicalId, channel: ChannelId) {
        self.channels.insert(node, channel);
    }

    /// True once a channel exists for every peer node.
    pub fn mesh_complete(&self) -> bool {
        !self.nodes.is_empty()
            && self
                .nodes
                .iter()
                .all(|n| n.physical_id == self.my_id || self.channels.contains_key(&n.physical_id))
    }

    /// The delivery target for a node: loopback for this node, the mapped
    /// peer channel otherwise.
    pub fn target_for(&self, node: PhysicalId) -> Result<Target> {
        if node == self.my_id {
            return Ok(Target::Loopback);
        }

        self.channels
            .get(&node)
            .map(|&channel| Target::Channel(channel))
            .ok_or_else(|| {
                Error::with_detail(ErrorKind::ConnectionLost, format!("no channel to node {}", node))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: PhysicalId, port: u16, threads: Vec<GlobalThreadId>) -> NodeInfo {
        NodeInfo {
            physical_id: id,
            host: "127.0.0.1".into(),
            port,
            threads,
        }
    }

    #[test]
    fn node_info_wire_roundtrip() {
        let node = info(3, 9000, vec![4, 5, 6]);

        let mut writer = WireWriter::with_defaults();
        node.write(&mut writer);

        let bytes = writer.into_bytes();
        let mut reader = WireReader::new(&bytes);

        assert_eq!(NodeInfo::read(&mut reader).unwrap(), node);
        reader.expect_end().unwrap();
    }

    #[test]
    fn coordinator_assigns_dense_ids() {
        let mut table = NodeTable::coordinator(info(0, 9000, vec![0, 1]), 6);

        assert_eq!(table.push_node(info(99, 9001, vec![2, 3])), 1);
        assert_eq!(table.push_node(info(99, 9002, vec![4, 5])), 2);

        assert!(table.is_complete());
        table.validate().unwrap();

        assert_eq!(table.home_of(0).unwrap(), 0);
        assert_eq!(table.home_of(3).unwrap(), 1);
        assert_eq!(table.home_of(5).unwrap(), 2);
        assert_eq!(table.home_of(6).unwrap_err().kind(), ErrorKind::UnknownThread);
    }

    #[test]
    fn validate_rejects_gaps_and_duplicates() {
        let mut table = NodeTable::coordinator(info(0, 9000, vec![0]), 3);
        table.push_node(info(0, 9001, vec![2]));

        assert!(!table.is_complete());
        assert_eq!(table.validate().unwrap_err().kind(), ErrorKind::Config);

        let mut table = NodeTable::coordinator(info(0, 9000, vec![0, 1]), 3);
        table.push_node(info(0, 9001, vec![1, 2]));

        assert_eq!(table.validate().unwrap_err().kind(), ErrorKind::Config);
    }

    #[test]
    fn target_resolution() {
        let mut table = NodeTable::unassigned(vec![2], 3);
        table.assign(
            1,
            vec![
                info(0, 9000, vec![0, 1]),
                info(1, 9001, vec![2]),
            ],
        );

        assert_eq!(table.target_for(1).unwrap(), Target::Loopback);

        assert_eq!(
            table.target_for(0).unwrap_err().kind(),
            ErrorKind::ConnectionLost
        );

        table.set_channel(0, 7);
        assert_eq!(table.target_for(0).unwrap(), Target::Channel(7));
        assert!(table.mesh_complete());
    }
}
