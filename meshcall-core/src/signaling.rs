//! Signaling protocol
//!
//! Outbound messages ([`SignalingMessage`]) are addressed by the client to the
//! signaling authority, which relays peer-to-peer ones (offer, answer,
//! candidate) to the addressed participant. Inbound messages
//! ([`SignalingEvent`]) arrive with the sender filled in by the authority.
//!
//! Both directions are JSON objects tagged by `type` with camelCase fields.

use crate::identity::ParticipantId;
use crate::types::{CallId, CallType, CallerInfo, IceCandidate, PeerInfo, RoomId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Message could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The channel to the authority is gone
    #[error("Signaling channel closed")]
    ChannelClosed,
}

/// Signaling transport trait
///
/// Implement this for the concrete bus (websocket, socket.io bridge, the
/// in-process [`crate::loopback`] hub, ...). Implementations deliver inbound
/// messages in the order the authority sent them.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a message to the authority
    async fn send_message(&self, message: SignalingMessage) -> Result<(), Self::Error>;

    /// Receive the next message; `Ok(None)` once the channel is closed
    async fn receive_message(&self) -> Result<Option<SignalingEvent>, Self::Error>;
}

/// Client → authority messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalingMessage {
    /// Announce a new call in a room
    Start {
        /// Room the call belongs to
        room_id: RoomId,
        /// Audio or video
        call_type: CallType,
    },

    /// Join an ongoing call
    Join {
        /// Call to join
        call_id: CallId,
        /// Room of the call
        room_id: RoomId,
    },

    /// Leave the call
    Leave {
        /// Call being left
        call_id: CallId,
    },

    /// Decline an invite
    Reject {
        /// Declined call
        call_id: CallId,
        /// Who invited us
        caller_id: ParticipantId,
    },

    /// SDP offer for one peer
    Offer {
        /// Call the negotiation belongs to
        call_id: CallId,
        /// Addressee
        to_peer_id: ParticipantId,
        /// SDP content
        sdp: String,
    },

    /// SDP answer for one peer
    Answer {
        /// Call the negotiation belongs to
        call_id: CallId,
        /// Addressee
        to_peer_id: ParticipantId,
        /// SDP content
        sdp: String,
    },

    /// ICE candidate for one peer
    IceCandidate {
        /// Call the negotiation belongs to
        call_id: CallId,
        /// Addressee
        to_peer_id: ParticipantId,
        /// Candidate
        candidate: IceCandidate,
    },

    /// Local mute / camera state, fanned out to the call
    MediaState {
        /// Call
        call_id: CallId,
        /// Microphone muted
        muted: bool,
        /// Camera off
        video_off: bool,
    },
}

impl SignalingMessage {
    /// Call id the message refers to, if any
    #[must_use]
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::Start { .. } => None,
            Self::Join { call_id, .. }
            | Self::Leave { call_id }
            | Self::Reject { call_id, .. }
            | Self::Offer { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::IceCandidate { call_id, .. }
            | Self::MediaState { call_id, .. } => Some(call_id),
        }
    }

    /// Encode as JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a known message
    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Authority → client messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalingEvent {
    /// Id assigned to the call we started
    CallStarted {
        /// Assigned call id
        call_id: CallId,
    },

    /// SDP offer from a peer
    Offer {
        /// Call
        call_id: CallId,
        /// Sender
        from_user_id: ParticipantId,
        /// SDP content
        sdp: String,
    },

    /// SDP answer from a peer
    Answer {
        /// Call
        call_id: CallId,
        /// Sender
        from_user_id: ParticipantId,
        /// SDP content
        sdp: String,
    },

    /// ICE candidate from a peer
    IceCandidate {
        /// Call
        call_id: CallId,
        /// Sender
        from_user_id: ParticipantId,
        /// Candidate
        candidate: IceCandidate,
    },

    /// A participant joined the call we are in
    PeerJoined {
        /// Call
        call_id: CallId,
        /// Newcomer
        peer_id: ParticipantId,
        /// Newcomer presentation info
        #[serde(default)]
        peer_info: PeerInfo,
    },

    /// Participants already present when we joined
    ExistingParticipants {
        /// Call
        call_id: CallId,
        /// Present participants
        participant_ids: Vec<ParticipantId>,
    },

    /// A participant left
    PeerLeft {
        /// Who left
        peer_id: ParticipantId,
    },

    /// Someone invites us to a call
    IncomingCall {
        /// Call
        call_id: CallId,
        /// Room
        room_id: RoomId,
        /// Audio or video
        call_type: CallType,
        /// Caller
        caller: CallerInfo,
    },

    /// The authority ended the call
    CallEnded {
        /// Call
        call_id: CallId,
    },

    /// A callee declined
    CallRejected {
        /// Call
        call_id: CallId,
        /// Who declined
        rejected_by: ParticipantId,
    },

    /// A peer toggled mute / camera
    MediaState {
        /// Call
        call_id: CallId,
        /// Sender
        from_user_id: ParticipantId,
        /// Microphone muted
        muted: bool,
        /// Camera off
        video_off: bool,
    },
}

impl SignalingEvent {
    /// Call id the message refers to, if any
    #[must_use]
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::PeerLeft { .. } => None,
            Self::CallStarted { call_id }
            | Self::Offer { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::IceCandidate { call_id, .. }
            | Self::PeerJoined { call_id, .. }
            | Self::ExistingParticipants { call_id, .. }
            | Self::IncomingCall { call_id, .. }
            | Self::CallEnded { call_id }
            | Self::CallRejected { call_id, .. }
            | Self::MediaState { call_id, .. } => Some(call_id),
        }
    }

    /// Encode as JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a known message
    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Upper bound on the receive error backoff
const MAX_BACKOFF_STEPS: u32 = 10;

/// Signaling handler with tracing and receive backoff
pub struct SignalingHandler<T: SignalingTransport> {
    transport: Arc<T>,
    error_count: AtomicU32,
}

impl<T: SignalingTransport> SignalingHandler<T> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            error_count: AtomicU32::new(0),
        }
    }

    /// Send a signaling message
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    #[tracing::instrument(skip(self, message), fields(message_type = message_type(&message)))]
    pub async fn send_message(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        tracing::debug!("Sending signaling message");
        self.transport
            .send_message(message)
            .await
            .map_err(|e| SignalingError::TransportError(e.to_string()))
    }

    /// Receive the next signaling message
    ///
    /// Consecutive receive errors are spaced out by a linear backoff.
    ///
    /// # Errors
    ///
    /// Returns error if receiving fails or the channel is closed
    pub async fn receive_message(&self) -> Result<SignalingEvent, SignalingError> {
        match self.transport.receive_message().await {
            Ok(Some(event)) => {
                self.error_count.store(0, Ordering::Relaxed);
                tracing::debug!(message_type = event_type(&event), "Received signaling message");
                Ok(event)
            }
            Ok(None) => Err(SignalingError::ChannelClosed),
            Err(e) => {
                let count = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
                let backoff = Duration::from_millis(100 * u64::from(count.min(MAX_BACKOFF_STEPS)));
                tracing::warn!(
                    error = %e,
                    error_count = count,
                    backoff_ms = backoff.as_millis(),
                    "Error receiving signaling message, backing off"
                );
                sleep(backoff).await;
                Err(SignalingError::TransportError(e.to_string()))
            }
        }
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}

/// Message type name for tracing
pub(crate) fn message_type(msg: &SignalingMessage) -> &'static str {
    match msg {
        SignalingMessage::Start { .. } => "start",
        SignalingMessage::Join { .. } => "join",
        SignalingMessage::Leave { .. } => "leave",
        SignalingMessage::Reject { .. } => "reject",
        SignalingMessage::Offer { .. } => "offer",
        SignalingMessage::Answer { .. } => "answer",
        SignalingMessage::IceCandidate { .. } => "ice-candidate",
        SignalingMessage::MediaState { .. } => "media-state",
    }
}

/// Event type name for tracing
pub(crate) fn event_type(event: &SignalingEvent) -> &'static str {
    match event {
        SignalingEvent::CallStarted { .. } => "call-started",
        SignalingEvent::Offer { .. } => "offer",
        SignalingEvent::Answer { .. } => "answer",
        SignalingEvent::IceCandidate { .. } => "ice-candidate",
        SignalingEvent::PeerJoined { .. } => "peer-joined",
        SignalingEvent::ExistingParticipants { .. } => "existing-participants",
        SignalingEvent::PeerLeft { .. } => "peer-left",
        SignalingEvent::IncomingCall { .. } => "incoming-call",
        SignalingEvent::CallEnded { .. } => "call-ended",
        SignalingEvent::CallRejected { .. } => "call-rejected",
        SignalingEvent::MediaState { .. } => "media-state",
    }
}
