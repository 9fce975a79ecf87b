//! Mesh transport: UDP broadcast for discovery, TCP for unicast, and an
//! in-process network for tests.

pub mod listener;
pub mod memory;
pub mod transport;

pub use listener::Listener;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use transport::{Inbound, NetTransport, Transport};
