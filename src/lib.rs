pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod store;
pub mod transcript;

#[cfg(feature = "desktop")]
pub mod commands;

pub use codec::SessionCode;
pub use config::{LinkConfig, RetryPolicy, ServerConfig};
pub use error::{Error, Result};
pub use events::{ListenerHandle, Listeners};
pub use peer::{CandidateRecord, ConnectionState, IceCandidate, PeerLink, Role};
pub use session::SessionController;
pub use signaling::{ProtocolEvents, SignalingProtocol};
pub use store::{MemoryStore, SessionDoc, SessionPatch, SignalingStore, Subscription};
pub use transcript::Transcript;
