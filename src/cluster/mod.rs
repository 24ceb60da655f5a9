//! Collaborators at the cluster edge: serialization, transports, membership.

mod codec;
mod local;
mod members;
mod tcp;
mod transport;

pub use codec::{to_data, to_object, Data};
pub use local::{LocalFabric, LocalTransport, SentFrame};
pub use members::{ClusterView, NodeState};
pub use tcp::TcpTransport;
pub use transport::{Address, Inbox, PeerFailures, Transport};
