//! Peer connections of the mesh: one link per remote participant

pub mod link;
pub mod registry;
pub mod transport;

pub use link::{CandidateDisposition, NegotiationError, NegotiationStep, PeerLink, SignalingState};
pub use registry::{IgnoreReason, LinkUpdate, NegotiationOutcome, PeerRegistry, ReplaceReport};
pub use transport::{
    LinkEpoch, PeerTransport, PeerTransportFactory, TransportError, TransportEvent,
    TransportEventKind, TransportEventSink,
};
