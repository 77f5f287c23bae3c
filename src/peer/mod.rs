pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod link;
pub mod state;
pub mod types;

pub use link::PeerLink;
pub use state::{LinkSignal, LinkState};
pub use types::{CandidateRecord, ConnectionState, IceCandidate, Role};
