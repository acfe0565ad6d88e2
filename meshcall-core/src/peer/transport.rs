//! Peer transport seam
//!
//! A [`PeerTransport`] is one direct connection to one remote participant
//! (an `RTCPeerConnection` in the WebRTC backend). Its asynchronous callbacks
//! (gathered local candidates, connectivity changes, remote media) are pushed
//! through a [`TransportEventSink`] into the session's inbound queue, tagged
//! with the [`LinkEpoch`] of the link that owns the transport so results that
//! outlive their link can be recognised and dropped.

use crate::identity::ParticipantId;
use crate::media::{MediaTrack, RemoteStream};
use crate::types::{CallId, ConnectionState, IceCandidate, SessionDescription};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Session description rejected or could not be produced
    #[error("SDP error: {0}")]
    Sdp(String),

    /// Candidate rejected
    #[error("ICE candidate error: {0}")]
    Candidate(String),

    /// Track could not be attached or replaced
    #[error("Track error: {0}")]
    Track(String),

    /// Transport already closed
    #[error("Transport closed")]
    Closed,

    /// Backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Identity of one incarnation of a link
///
/// A link recreated for the same peer (glare, reconnect, next call) gets a
/// new serial, so events from the previous incarnation no longer match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkEpoch {
    /// Call the link was negotiated for
    pub call_id: CallId,
    /// Registry-wide link counter
    pub serial: u64,
}

/// Payload of a transport callback
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    /// A local candidate was gathered and must be signaled to the peer
    LocalCandidate(IceCandidate),
    /// Connectivity changed
    ConnectionState(ConnectionState),
    /// Remote media arrived
    RemoteStream(RemoteStream),
}

/// Transport callback routed back to the session
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    /// Remote participant of the link
    pub peer: ParticipantId,
    /// Link incarnation that produced the event
    pub epoch: LinkEpoch,
    /// What happened
    pub kind: TransportEventKind,
}

/// Handle given to a transport for reporting its callbacks
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    peer: ParticipantId,
    epoch: LinkEpoch,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEventSink {
    /// Create a sink bound to one link incarnation
    pub fn new(
        peer: ParticipantId,
        epoch: LinkEpoch,
        tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self { peer, epoch, tx }
    }

    /// Remote participant this sink reports for
    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    /// Report an event; returns `false` once the session is gone
    pub fn emit(&self, kind: TransportEventKind) -> bool {
        self.tx
            .send(TransportEvent {
                peer: self.peer.clone(),
                epoch: self.epoch.clone(),
                kind,
            })
            .is_ok()
    }
}

/// One direct connection to a remote participant
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Start sending a local track
    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError>;

    /// Produce an offer descriptor
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Produce an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a local descriptor (starts candidate gathering)
    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    /// Apply the remote descriptor
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Apply a remote candidate; fails if no remote description is set
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Swap the outbound video track in place, without renegotiation
    async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), TransportError>;

    /// Release the connection
    async fn close(&self);
}

/// Builds transports for new links
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Create a transport toward `peer` reporting through `sink`
    async fn create(
        &self,
        peer: &ParticipantId,
        sink: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_tags_events_with_epoch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let epoch = LinkEpoch {
            call_id: CallId::new("c1"),
            serial: 7,
        };
        let sink = TransportEventSink::new(ParticipantId::new("bob"), epoch.clone(), tx);

        assert!(sink.emit(TransportEventKind::ConnectionState(ConnectionState::Connecting)));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.peer, ParticipantId::new("bob"));
        assert_eq!(event.epoch, epoch);
    }

    #[test]
    fn test_sink_reports_closed_session() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = TransportEventSink::new(
            ParticipantId::new("bob"),
            LinkEpoch {
                call_id: CallId::new("c1"),
                serial: 1,
            },
            tx,
        );
        assert!(!sink.emit(TransportEventKind::ConnectionState(ConnectionState::Failed)));
    }
}
