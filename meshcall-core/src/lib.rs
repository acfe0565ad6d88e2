//! Meshcall - multi-party mesh call negotiation
//!
//! Every participant of a call holds one direct peer connection to every other
//! participant. This crate negotiates those connections over an out-of-band
//! signaling channel and keeps them consistent while people join, leave and
//! toggle their media:
//!
//! - **Per-peer state machines**: explicit offer/answer transition table,
//!   lazy ICE candidate buffering, deterministic glare resolution by id
//! - **Session lifecycle**: start, join, accept/decline invites, leave, with
//!   full release of capture devices and peer connections
//! - **Single-task actor**: commands, signaling and transport callbacks are
//!   handled one at a time, so no session state is ever shared
//! - **Pluggable collaborators**: signaling transport, media source and peer
//!   transport are traits, with a `webrtc`-backed transport and in-process
//!   loopback implementations included
//!
//! # Examples
//!
//! ```rust,no_run
//! use meshcall_core::loopback::{LoopbackHub, LoopbackMedia, LoopbackPeerFactory};
//! use meshcall_core::{CallType, MeshCallService, ParticipantId, RoomId, SignalingHandler};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let hub = LoopbackHub::new();
//! let signaling = Arc::new(SignalingHandler::new(Arc::new(hub.connect("alice"))));
//!
//! let service = MeshCallService::builder(ParticipantId::new("alice"), signaling)
//!     .with_media_source(Arc::new(LoopbackMedia::new("alice")))
//!     .with_transport_factory(Arc::new(LoopbackPeerFactory::new("alice")))
//!     .build()
//!     .await?;
//!
//! let call_id = service.start_call(RoomId::new("physics-101"), CallType::Video).await?;
//! println!("call {call_id} started");
//! service.leave_call().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Participant identity and glare ordering
pub mod identity;

/// Service configuration
pub mod config;

/// Signaling protocol and handlers
pub mod signaling;

/// Local capture and remote streams
pub mod media;

/// Peer links, the peer registry and the transport seam
pub mod peer;

/// Remote participant records
pub mod participants;

/// Incoming call invites
pub mod gate;

/// Call session controller
pub mod session;

/// Session actor and public handle
pub mod service;

/// In-process signaling hub, media source and peer transports
pub mod loopback;

/// `webrtc`-backed peer transports (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod rtc;

// Re-export main types at crate root
pub use config::{ConfigError, IceServerConfig, MeshCallConfig};
pub use gate::{IncomingCallGate, IncomingCallInvite, InviteRejected};
pub use identity::{GlareRole, ParticipantId};
pub use media::{
    LocalMediaStream, MediaError, MediaSource, MediaTrack, RemoteStream, TrackKind, TrackRef,
    TrackSource,
};
pub use participants::{Participant, ParticipantRegistry};
pub use peer::{
    IgnoreReason, LinkEpoch, LinkUpdate, NegotiationError, NegotiationOutcome, PeerLink,
    PeerRegistry, PeerTransport, PeerTransportFactory, ReplaceReport, SignalingState,
    TransportError, TransportEvent, TransportEventKind, TransportEventSink,
};
#[cfg(feature = "webrtc-backend")]
pub use rtc::RtcPeerTransportFactory;
pub use service::{MeshCallService, MeshCallServiceBuilder, ServiceError};
pub use session::{CallController, CallError, CallSnapshot, LinkSnapshot, SessionPhase};
pub use signaling::{
    SignalingError, SignalingEvent, SignalingHandler, SignalingMessage, SignalingTransport,
};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::MeshCallConfig;
    pub use crate::identity::ParticipantId;
    pub use crate::media::{MediaError, MediaSource};
    pub use crate::peer::{PeerTransport, PeerTransportFactory};
    pub use crate::service::{MeshCallService, MeshCallServiceBuilder};
    pub use crate::session::{CallError, CallSnapshot, SessionPhase};
    pub use crate::signaling::{SignalingHandler, SignalingTransport};
    pub use crate::types::{CallEvent, CallId, CallType, MediaConstraints, RoomId};
}
