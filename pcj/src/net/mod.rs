//! The messaging substrate: byte buffers, wire framing, the reactor owning
//! all peer sockets, the worker pool and the networker tying them together.

pub mod buffer;
pub mod frame;
pub mod networker;
pub mod selector;
pub mod workers;
