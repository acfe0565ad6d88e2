//! Per-peer negotiation state machine
//!
//! ```text
//!            SetLocalOffer              SetRemoteAnswer
//!     Idle ───────────────▶ HaveLocalOffer ───────────────▶ Stable
//!       │                                                     ▲
//!       │ SetRemoteOffer                     SetLocalAnswer   │
//!       └───────────────▶ HaveRemoteOffer ────────────────────┘
//!
//!     any ── Close ──▶ Closed
//! ```
//!
//! Every transition goes through [`SignalingState::next`]; a step the table
//! does not list is rejected before any transport work is started.

use crate::identity::ParticipantId;
use crate::media::{MediaTrack, RemoteStream, TrackKind, TrackRef};
use crate::peer::transport::{LinkEpoch, PeerTransport, TransportError};
use crate::types::{ConnectionState, IceCandidate, SessionDescription};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

/// Negotiation errors, contained to one link
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// Offers need local media to attach
    #[error("No local media stream")]
    NoLocalMedia,

    /// No call is bound to the registry
    #[error("No active call")]
    NoActiveCall,

    /// The transition table rejected the step
    #[error("Illegal transition for {peer}: {step:?} in {from:?}")]
    IllegalTransition {
        /// Remote participant
        peer: ParticipantId,
        /// State the link was in
        from: SignalingState,
        /// Rejected step
        step: NegotiationStep,
    },

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Outbound signaling failed
    #[error("Signaling error: {0}")]
    Signaling(String),
}

/// Offer/answer state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingState {
    /// Created, no descriptor applied
    Idle,
    /// Our offer is applied and in flight
    HaveLocalOffer,
    /// Their offer is applied, our answer pending
    HaveRemoteOffer,
    /// Offer and answer both applied
    Stable,
    /// Terminal
    Closed,
}

/// Input to the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationStep {
    /// Apply our own offer
    SetLocalOffer,
    /// Apply an inbound offer
    SetRemoteOffer,
    /// Apply our answer to their offer
    SetLocalAnswer,
    /// Apply their answer to our offer
    SetRemoteAnswer,
    /// Tear down
    Close,
}

impl SignalingState {
    /// Transition table; `None` means the step is illegal in this state
    #[must_use]
    pub fn next(self, step: NegotiationStep) -> Option<SignalingState> {
        use NegotiationStep as Step;
        use SignalingState as State;

        match (self, step) {
            (State::Closed, _) => None,
            (_, Step::Close) => Some(State::Closed),
            (State::Idle, Step::SetLocalOffer) => Some(State::HaveLocalOffer),
            (State::Idle, Step::SetRemoteOffer) => Some(State::HaveRemoteOffer),
            (State::HaveLocalOffer, Step::SetRemoteAnswer) => Some(State::Stable),
            (State::HaveRemoteOffer, Step::SetLocalAnswer) => Some(State::Stable),
            _ => None,
        }
    }
}

/// What happened to an inbound candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Handed to the transport
    Applied,
    /// Buffered until the remote description is set
    Queued,
}

/// Connection to one remote participant
pub struct PeerLink {
    peer: ParticipantId,
    epoch: LinkEpoch,
    state: SignalingState,
    remote_description_set: bool,
    pending: Option<VecDeque<IceCandidate>>,
    outbound: Vec<TrackRef>,
    remote_stream: Option<Arc<RemoteStream>>,
    connection: ConnectionState,
    transport: Box<dyn PeerTransport>,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer", &self.peer)
            .field("epoch", &self.epoch)
            .field("state", &self.state)
            .field("remote_description_set", &self.remote_description_set)
            .field("pending", &self.pending.as_ref().map(VecDeque::len))
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl PeerLink {
    /// Create an idle link around a fresh transport
    pub fn new(peer: ParticipantId, epoch: LinkEpoch, transport: Box<dyn PeerTransport>) -> Self {
        Self {
            peer,
            epoch,
            state: SignalingState::Idle,
            remote_description_set: false,
            pending: None,
            outbound: Vec::new(),
            remote_stream: None,
            connection: ConnectionState::New,
            transport,
            created_at: crate::types::now(),
        }
    }

    /// Remote participant
    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    /// Link incarnation
    pub fn epoch(&self) -> &LinkEpoch {
        &self.epoch
    }

    /// Offer/answer state
    pub fn state(&self) -> SignalingState {
        self.state
    }

    /// Whether the remote descriptor has been applied
    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    /// Connected with both descriptors applied
    pub fn is_established(&self) -> bool {
        self.state == SignalingState::Stable && self.remote_description_set
    }

    /// Last reported connectivity
    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    /// Remote media, once received
    pub fn remote_stream(&self) -> Option<&Arc<RemoteStream>> {
        self.remote_stream.as_ref()
    }

    /// Handles on the local tracks this link sends
    pub fn outbound_tracks(&self) -> &[TrackRef] {
        &self.outbound
    }

    /// Candidates waiting for the remote description
    pub fn pending_candidates(&self) -> usize {
        self.pending.as_ref().map_or(0, VecDeque::len)
    }

    /// When the link was created
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn check(&self, step: NegotiationStep) -> Result<SignalingState, NegotiationError> {
        self.state
            .next(step)
            .ok_or_else(|| NegotiationError::IllegalTransition {
                peer: self.peer.clone(),
                from: self.state,
                step,
            })
    }

    fn commit(&mut self, next: SignalingState) {
        tracing::debug!(
            peer = %self.peer,
            serial = self.epoch.serial,
            old_state = ?self.state,
            new_state = ?next,
            "Link state transition"
        );
        self.state = next;
    }

    /// Start sending local tracks; tracks whose owner already stopped them
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the transport refuses a track
    pub async fn attach_tracks(&mut self, tracks: &[TrackRef]) -> Result<(), NegotiationError> {
        for track_ref in tracks {
            match track_ref.upgrade() {
                Ok(track) => {
                    self.transport.add_track(&track).await?;
                    self.outbound.push(track_ref.clone());
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer, error = %e, "Skipping ended local track");
                }
            }
        }
        Ok(())
    }

    /// Create and apply an offer; `Idle → HaveLocalOffer`
    ///
    /// # Errors
    ///
    /// Returns error if the link is not idle or the transport fails
    pub async fn make_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let next = self.check(NegotiationStep::SetLocalOffer)?;
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.commit(next);
        Ok(offer)
    }

    /// Apply an inbound offer, flush buffered candidates, create and apply
    /// the answer; `Idle → HaveRemoteOffer → Stable`
    ///
    /// # Errors
    ///
    /// Returns error if the link is not idle or the transport fails
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        let have_remote = self.check(NegotiationStep::SetRemoteOffer)?;
        self.transport.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.commit(have_remote);

        self.flush_pending().await;

        let stable = self.check(NegotiationStep::SetLocalAnswer)?;
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        self.commit(stable);
        Ok(answer)
    }

    /// Apply their answer to our offer and flush buffered candidates;
    /// `HaveLocalOffer → Stable`
    ///
    /// # Errors
    ///
    /// Returns error if no offer of ours is in flight or the transport fails
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        let stable = self.check(NegotiationStep::SetRemoteAnswer)?;
        self.transport.set_remote_description(answer).await?;
        self.remote_description_set = true;
        self.commit(stable);
        self.flush_pending().await;
        Ok(())
    }

    /// Apply a remote candidate, or buffer it until the remote description
    /// is set
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects an immediately applied candidate
    pub async fn add_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, NegotiationError> {
        if !self.remote_description_set {
            self.enqueue(candidate);
            return Ok(CandidateDisposition::Queued);
        }
        self.transport.add_ice_candidate(candidate).await?;
        Ok(CandidateDisposition::Applied)
    }

    /// Buffer a candidate, creating the queue on first use
    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.pending.get_or_insert_with(VecDeque::new).push_back(candidate);
    }

    /// Adopt candidates buffered elsewhere, ahead of anything queued later
    pub fn adopt_pending(&mut self, candidates: VecDeque<IceCandidate>) {
        if candidates.is_empty() {
            return;
        }
        let queue = self.pending.get_or_insert_with(VecDeque::new);
        for candidate in candidates.into_iter().rev() {
            queue.push_front(candidate);
        }
    }

    /// Hand over the buffered candidates, leaving none behind
    pub fn take_pending(&mut self) -> VecDeque<IceCandidate> {
        self.pending.take().unwrap_or_default()
    }

    /// Apply every buffered candidate in arrival order; the queue is
    /// consumed exactly once. Returns how many were applied.
    async fn flush_pending(&mut self) -> usize {
        let Some(queue) = self.pending.take() else {
            return 0;
        };
        let total = queue.len();
        let mut applied = 0;
        for candidate in queue {
            match self.transport.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    tracing::warn!(peer = %self.peer, error = %e, "Buffered candidate rejected");
                }
            }
        }
        tracing::debug!(peer = %self.peer, total, applied, "Flushed buffered candidates");
        applied
    }

    /// Record a connectivity change
    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection = state;
    }

    /// Record the remote stream
    pub fn set_remote_stream(&mut self, stream: Arc<RemoteStream>) {
        self.remote_stream = Some(stream);
    }

    /// Swap the outbound video track in place
    ///
    /// # Errors
    ///
    /// Returns error if the transport refuses the swap
    pub async fn replace_video_track(&mut self, track: &Arc<MediaTrack>) -> Result<(), NegotiationError> {
        self.transport.replace_video_track(track).await?;
        let replacement = TrackRef::from_track(track);
        match self
            .outbound
            .iter_mut()
            .find(|t| t.kind() == TrackKind::Video)
        {
            Some(slot) => *slot = replacement,
            None => self.outbound.push(replacement),
        }
        Ok(())
    }

    /// Close the link: `Closed`, queue purged, transport released
    pub async fn close(&mut self) {
        if let Some(next) = self.state.next(NegotiationStep::Close) {
            self.commit(next);
        }
        self.pending = None;
        self.outbound.clear();
        self.connection = ConnectionState::Closed;
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NegotiationStep as Step;
    use SignalingState as State;

    #[test]
    fn test_offerer_path() {
        let s = State::Idle.next(Step::SetLocalOffer);
        assert_eq!(s, Some(State::HaveLocalOffer));
        assert_eq!(
            State::HaveLocalOffer.next(Step::SetRemoteAnswer),
            Some(State::Stable)
        );
    }

    #[test]
    fn test_answerer_path() {
        assert_eq!(
            State::Idle.next(Step::SetRemoteOffer),
            Some(State::HaveRemoteOffer)
        );
        assert_eq!(
            State::HaveRemoteOffer.next(Step::SetLocalAnswer),
            Some(State::Stable)
        );
    }

    #[test]
    fn test_close_from_every_live_state() {
        for state in [
            State::Idle,
            State::HaveLocalOffer,
            State::HaveRemoteOffer,
            State::Stable,
        ] {
            assert_eq!(state.next(Step::Close), Some(State::Closed));
        }
    }

    #[test]
    fn test_closed_is_terminal() {
        for step in [
            Step::SetLocalOffer,
            Step::SetRemoteOffer,
            Step::SetLocalAnswer,
            Step::SetRemoteAnswer,
            Step::Close,
        ] {
            assert_eq!(State::Closed.next(step), None);
        }
    }

    #[test]
    fn test_illegal_steps_rejected() {
        assert_eq!(State::Idle.next(Step::SetRemoteAnswer), None);
        assert_eq!(State::Stable.next(Step::SetRemoteAnswer), None);
        assert_eq!(State::Stable.next(Step::SetLocalOffer), None);
        assert_eq!(State::HaveLocalOffer.next(Step::SetRemoteOffer), None);
        assert_eq!(State::HaveRemoteOffer.next(Step::SetLocalOffer), None);
    }
}
