pub mod network;
pub mod peer;
pub mod remote;

pub use network::TestNetwork;
pub use peer::TestPeer;
pub use remote::InMemoryRemote;
