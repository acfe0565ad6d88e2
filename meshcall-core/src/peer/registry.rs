//! Peer connection registry
//!
//! Owns every [`PeerLink`] of the current call, at most one per remote
//! participant, and implements the negotiation operations on top of them:
//! offer creation, inbound offer/answer/candidate handling with glare
//! resolution, connectivity monitoring, track replacement and teardown.
//!
//! Inbound messages are checked against the call the registry is bound to;
//! anything for another (or a torn-down) call is logged and dropped.

use crate::identity::{GlareRole, ParticipantId};
use crate::media::{MediaTrack, RemoteStream, TrackRef};
use crate::peer::link::{CandidateDisposition, NegotiationError, PeerLink, SignalingState};
use crate::peer::transport::{
    LinkEpoch, PeerTransportFactory, TransportEvent, TransportEventKind, TransportEventSink,
};
use crate::signaling::{SignalingHandler, SignalingMessage, SignalingTransport};
use crate::types::{CallId, ConnectionState, IceCandidate, SessionDescription};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Why a negotiation input was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Link is already `Stable` with a remote description
    AlreadyConnected,
    /// Our offer is still waiting for an answer
    OfferInFlight,
    /// Their offer is applied; this side must answer, not offer
    AwaitingLocalAnswer,
    /// Simultaneous offers and our id sorts higher: ours stays in flight
    GlareHeld,
    /// Offer for a link that is already negotiated
    DuplicateOffer,
    /// Answer while no offer of ours is in flight
    UnexpectedAnswer,
    /// Message for a call other than the bound one
    StaleCall,
    /// Message addressed from ourselves
    SelfAddressed,
}

/// Result of a negotiation operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// Offer created and signaled
    OfferSent,
    /// Inbound offer answered
    AnswerSent,
    /// Our offer was discarded in favour of theirs, which was answered
    GlareYielded,
    /// Answer applied, link `Stable`
    Established,
    /// Candidate handed to the transport
    CandidateApplied,
    /// Candidate buffered until the remote description is set
    CandidateQueued,
    /// Input dropped
    Ignored(IgnoreReason),
}

/// Link change the session has to reflect in its other state
#[derive(Debug, Clone, PartialEq)]
pub enum LinkUpdate {
    /// Connectivity reached
    Connected(ParticipantId),
    /// Remote media arrived
    RemoteStream(ParticipantId, Arc<RemoteStream>),
    /// Connectivity lost; the link was torn down
    Removed(ParticipantId),
}

/// Outcome of swapping the outbound video track across links
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceReport {
    /// Links now sending the new track
    pub replaced: Vec<ParticipantId>,
    /// Links that refused, with the reason
    pub failed: Vec<(ParticipantId, String)>,
}

/// Registry of peer links for one participant
pub struct PeerRegistry<T: SignalingTransport> {
    local_id: ParticipantId,
    signaling: Arc<SignalingHandler<T>>,
    factory: Arc<dyn PeerTransportFactory>,
    events: mpsc::UnboundedSender<TransportEvent>,
    call_id: Option<CallId>,
    local_tracks: Vec<TrackRef>,
    links: HashMap<ParticipantId, PeerLink>,
    orphan_candidates: HashMap<ParticipantId, VecDeque<IceCandidate>>,
    next_serial: u64,
}

impl<T: SignalingTransport> PeerRegistry<T> {
    /// Create an unbound registry
    pub fn new(
        local_id: ParticipantId,
        signaling: Arc<SignalingHandler<T>>,
        factory: Arc<dyn PeerTransportFactory>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            local_id,
            signaling,
            factory,
            events,
            call_id: None,
            local_tracks: Vec::new(),
            links: HashMap::new(),
            orphan_candidates: HashMap::new(),
            next_serial: 0,
        }
    }

    /// Bind to a call and the local tracks new links will send
    pub fn bind(&mut self, call_id: CallId, local_tracks: Vec<TrackRef>) {
        tracing::debug!(call_id = %call_id, tracks = local_tracks.len(), "Registry bound to call");
        self.call_id = Some(call_id);
        self.local_tracks = local_tracks;
    }

    /// Call the registry is bound to
    pub fn call_id(&self) -> Option<&CallId> {
        self.call_id.as_ref()
    }

    /// Link toward `peer`
    pub fn link(&self, peer: &ParticipantId) -> Option<&PeerLink> {
        self.links.get(peer)
    }

    /// Number of live links
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether no link is live
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Signaling state of every link, sorted by peer id
    pub fn link_states(&self) -> Vec<(ParticipantId, SignalingState)> {
        let mut states: Vec<_> = self
            .links
            .iter()
            .map(|(peer, link)| (peer.clone(), link.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Candidates buffered for `peer`, whether or not a link exists yet
    pub fn pending_candidates(&self, peer: &ParticipantId) -> usize {
        self.links
            .get(peer)
            .map_or(0, PeerLink::pending_candidates)
            + self.orphan_candidates.get(peer).map_or(0, VecDeque::len)
    }

    fn accepts(&self, call_id: &CallId) -> bool {
        self.call_id.as_ref() == Some(call_id)
    }

    async fn open_link(&mut self, peer: &ParticipantId) -> Result<PeerLink, NegotiationError> {
        let call_id = self.call_id.clone().ok_or(NegotiationError::NoActiveCall)?;
        self.next_serial += 1;
        let epoch = LinkEpoch {
            call_id,
            serial: self.next_serial,
        };
        let sink = TransportEventSink::new(peer.clone(), epoch.clone(), self.events.clone());
        let transport = self.factory.create(peer, sink).await?;

        let mut link = PeerLink::new(peer.clone(), epoch, transport);
        if let Some(early) = self.orphan_candidates.remove(peer) {
            link.adopt_pending(early);
        }
        if let Err(e) = link.attach_tracks(&self.local_tracks).await {
            link.close().await;
            return Err(e);
        }
        tracing::debug!(peer = %peer, serial = self.next_serial, "Opened peer link");
        Ok(link)
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), NegotiationError> {
        self.signaling
            .send_message(message)
            .await
            .map_err(|e| NegotiationError::Signaling(e.to_string()))
    }

    /// Drop a link after a failed negotiation step
    async fn discard(&mut self, peer: &ParticipantId, error: &NegotiationError) {
        tracing::warn!(peer = %peer, error = %error, "Negotiation failed, discarding link");
        if let Some(mut link) = self.links.remove(peer) {
            link.close().await;
        }
    }

    /// Offer a connection to `peer`
    ///
    /// No-op while a negotiation with `peer` is in flight or done.
    ///
    /// # Errors
    ///
    /// Returns error without local media, without a bound call, or when the
    /// transport or signaling fails (the link is then discarded)
    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    pub async fn create_offer(
        &mut self,
        peer: &ParticipantId,
    ) -> Result<NegotiationOutcome, NegotiationError> {
        if self.local_tracks.is_empty() {
            return Err(NegotiationError::NoLocalMedia);
        }
        let call_id = self.call_id.clone().ok_or(NegotiationError::NoActiveCall)?;
        if *peer == self.local_id {
            return Ok(NegotiationOutcome::Ignored(IgnoreReason::SelfAddressed));
        }

        if let Some(link) = self.links.get(peer) {
            let reason = match link.state() {
                SignalingState::Stable if link.has_remote_description() => {
                    Some(IgnoreReason::AlreadyConnected)
                }
                SignalingState::HaveLocalOffer => Some(IgnoreReason::OfferInFlight),
                SignalingState::HaveRemoteOffer => Some(IgnoreReason::AwaitingLocalAnswer),
                _ => None,
            };
            if let Some(reason) = reason {
                tracing::debug!(peer = %peer, ?reason, "Skipping offer");
                return Ok(NegotiationOutcome::Ignored(reason));
            }
        } else {
            let link = self.open_link(peer).await?;
            self.links.insert(peer.clone(), link);
        }

        let result = match self.links.get_mut(peer) {
            Some(link) => link.make_offer().await,
            None => Err(NegotiationError::NoActiveCall),
        };
        let offer = match result {
            Ok(offer) => offer,
            Err(e) => {
                self.discard(peer, &e).await;
                return Err(e);
            }
        };

        let sent = self
            .send(SignalingMessage::Offer {
                call_id,
                to_peer_id: peer.clone(),
                sdp: offer.sdp,
            })
            .await;
        if let Err(e) = sent {
            self.discard(peer, &e).await;
            return Err(e);
        }
        tracing::info!(peer = %peer, "Offer sent");
        Ok(NegotiationOutcome::OfferSent)
    }

    /// Handle an offer from `peer`, resolving glare by id comparison
    ///
    /// # Errors
    ///
    /// Returns error when the transport or signaling fails (the link is then
    /// discarded)
    #[tracing::instrument(skip(self, sdp), fields(local = %self.local_id))]
    pub async fn handle_inbound_offer(
        &mut self,
        peer: &ParticipantId,
        sdp: String,
        call_id: &CallId,
    ) -> Result<NegotiationOutcome, NegotiationError> {
        if !self.accepts(call_id) {
            tracing::warn!(peer = %peer, call_id = %call_id, "Offer for unknown call ignored");
            return Ok(NegotiationOutcome::Ignored(IgnoreReason::StaleCall));
        }
        if *peer == self.local_id {
            return Ok(NegotiationOutcome::Ignored(IgnoreReason::SelfAddressed));
        }

        let mut glare = false;
        let mut carried = VecDeque::new();
        if let Some(link) = self.links.get_mut(peer) {
            match link.state() {
                SignalingState::Stable if link.has_remote_description() => {
                    tracing::debug!(peer = %peer, "Duplicate offer ignored");
                    return Ok(NegotiationOutcome::Ignored(IgnoreReason::DuplicateOffer));
                }
                SignalingState::HaveLocalOffer => match self.local_id.glare_role(peer) {
                    GlareRole::Hold => {
                        tracing::info!(peer = %peer, "Glare: keeping our offer");
                        return Ok(NegotiationOutcome::Ignored(IgnoreReason::GlareHeld));
                    }
                    GlareRole::Yield => {
                        tracing::info!(peer = %peer, "Glare: discarding our offer to answer");
                        glare = true;
                    }
                },
                _ => {}
            }
            // Reset: candidates buffered for the old incarnation came from
            // the peer and stay valid for the new one.
            carried = link.take_pending();
            link.close().await;
            self.links.remove(peer);
        }

        let mut link = self.open_link(peer).await?;
        link.adopt_pending(carried);
        let answer = match link.accept_offer(SessionDescription::offer(sdp)).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Failed to answer offer");
                link.close().await;
                return Err(e);
            }
        };
        self.links.insert(peer.clone(), link);

        let sent = self
            .send(SignalingMessage::Answer {
                call_id: call_id.clone(),
                to_peer_id: peer.clone(),
                sdp: answer.sdp,
            })
            .await;
        if let Err(e) = sent {
            self.discard(peer, &e).await;
            return Err(e);
        }
        tracing::info!(peer = %peer, glare, "Answer sent");
        Ok(if glare {
            NegotiationOutcome::GlareYielded
        } else {
            NegotiationOutcome::AnswerSent
        })
    }

    /// Handle an answer from `peer`; only valid while our offer is in flight
    ///
    /// # Errors
    ///
    /// Returns error when the transport rejects the answer (the link is then
    /// discarded)
    #[tracing::instrument(skip(self, sdp), fields(local = %self.local_id))]
    pub async fn handle_inbound_answer(
        &mut self,
        peer: &ParticipantId,
        sdp: String,
        call_id: &CallId,
    ) -> Result<NegotiationOutcome, NegotiationError> {
        if !self.accepts(call_id) {
            tracing::warn!(peer = %peer, call_id = %call_id, "Answer for unknown call ignored");
            return Ok(NegotiationOutcome::Ignored(IgnoreReason::StaleCall));
        }
        let result = match self.links.get_mut(peer) {
            Some(link) if link.state() == SignalingState::HaveLocalOffer => {
                link.accept_answer(SessionDescription::answer(sdp)).await
            }
            Some(link) => {
                tracing::warn!(peer = %peer, state = ?link.state(), "Unexpected answer ignored");
                return Ok(NegotiationOutcome::Ignored(IgnoreReason::UnexpectedAnswer));
            }
            None => {
                tracing::warn!(peer = %peer, "Answer without a link ignored");
                return Ok(NegotiationOutcome::Ignored(IgnoreReason::UnexpectedAnswer));
            }
        };
        match result {
            Ok(()) => {
                tracing::info!(peer = %peer, "Negotiation complete");
                Ok(NegotiationOutcome::Established)
            }
            Err(e) => {
                self.discard(peer, &e).await;
                Err(e)
            }
        }
    }

    /// Handle a candidate from `peer`: apply it, or buffer it while the link
    /// is absent or has no remote description
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects an immediately applied
    /// candidate; the link is kept
    pub async fn handle_inbound_candidate(
        &mut self,
        peer: &ParticipantId,
        candidate: IceCandidate,
        call_id: &CallId,
    ) -> Result<NegotiationOutcome, NegotiationError> {
        if !self.accepts(call_id) {
            tracing::warn!(peer = %peer, call_id = %call_id, "Candidate for unknown call ignored");
            return Ok(NegotiationOutcome::Ignored(IgnoreReason::StaleCall));
        }
        match self.links.get_mut(peer) {
            Some(link) => match link.add_candidate(candidate).await? {
                CandidateDisposition::Applied => Ok(NegotiationOutcome::CandidateApplied),
                CandidateDisposition::Queued => Ok(NegotiationOutcome::CandidateQueued),
            },
            None => {
                self.orphan_candidates
                    .entry(peer.clone())
                    .or_default()
                    .push_back(candidate);
                tracing::trace!(peer = %peer, "Candidate buffered ahead of link");
                Ok(NegotiationOutcome::CandidateQueued)
            }
        }
    }

    /// Route a transport callback to its link
    ///
    /// Events whose epoch no longer matches a live link are dropped. Local
    /// candidates are signaled to the peer; `Disconnected`/`Failed` closes
    /// and removes the link.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> Option<LinkUpdate> {
        let TransportEvent { peer, epoch, kind } = event;
        let Some(link) = self.links.get_mut(&peer) else {
            tracing::debug!(peer = %peer, serial = epoch.serial, "Event for closed link dropped");
            return None;
        };
        if *link.epoch() != epoch {
            tracing::debug!(
                peer = %peer,
                serial = epoch.serial,
                live_serial = link.epoch().serial,
                "Event for stale link dropped"
            );
            return None;
        }

        match kind {
            TransportEventKind::LocalCandidate(candidate) => {
                let sent = self
                    .send(SignalingMessage::IceCandidate {
                        call_id: epoch.call_id,
                        to_peer_id: peer.clone(),
                        candidate,
                    })
                    .await;
                if let Err(e) = sent {
                    tracing::warn!(peer = %peer, error = %e, "Failed to signal local candidate");
                }
                None
            }
            TransportEventKind::ConnectionState(state) => {
                link.set_connection_state(state);
                if state.is_terminal_failure() {
                    tracing::warn!(peer = %peer, ?state, "Peer connectivity lost, closing link");
                    self.close(&peer).await;
                    Some(LinkUpdate::Removed(peer))
                } else if state == ConnectionState::Connected {
                    tracing::info!(peer = %peer, "Peer connected");
                    Some(LinkUpdate::Connected(peer))
                } else {
                    None
                }
            }
            TransportEventKind::RemoteStream(stream) => {
                let stream = Arc::new(stream);
                link.set_remote_stream(Arc::clone(&stream));
                Some(LinkUpdate::RemoteStream(peer, stream))
            }
        }
    }

    /// Swap the outbound video track on every link, best effort
    ///
    /// A link that refuses keeps its previous track; links that succeeded are
    /// not rolled back.
    pub async fn replace_outbound_video_track(&mut self, track: &Arc<MediaTrack>) -> ReplaceReport {
        let mut report = ReplaceReport::default();
        for (peer, link) in self.links.iter_mut() {
            match link.replace_video_track(track).await {
                Ok(()) => report.replaced.push(peer.clone()),
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "Failed to replace video track");
                    report.failed.push((peer.clone(), e.to_string()));
                }
            }
        }
        // New links pick the current video track up on creation.
        let replacement = TrackRef::from_track(track);
        match self
            .local_tracks
            .iter_mut()
            .find(|t| t.kind() == replacement.kind())
        {
            Some(slot) => *slot = replacement,
            None => self.local_tracks.push(replacement),
        }
        report.replaced.sort();
        report
    }

    /// Close the link toward `peer`; returns whether one existed
    pub async fn close(&mut self, peer: &ParticipantId) -> bool {
        self.orphan_candidates.remove(peer);
        match self.links.remove(peer) {
            Some(mut link) => {
                link.close().await;
                tracing::debug!(peer = %peer, "Closed peer link");
                true
            }
            None => false,
        }
    }

    /// Close every link, purge every queue and unbind from the call
    pub async fn close_all(&mut self) {
        let count = self.links.len();
        for (_, mut link) in self.links.drain() {
            link.close().await;
        }
        self.orphan_candidates.clear();
        self.local_tracks.clear();
        self.call_id = None;
        tracing::info!(closed = count, "Closed all peer links");
    }
}
