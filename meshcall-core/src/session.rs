//! Call session controller
//!
//! Owns everything that lives for the duration of one call: the local capture
//! stream, the peer registry, the participant registry and the call toggles.
//! There is at most one session; `start`, `join` and `accept_invite` all fail
//! while one is in progress.
//!
//! The controller is driven by a single task (see [`crate::service`]): every
//! command, signaling message and transport event is handled to completion
//! before the next one is looked at.

use crate::config::MeshCallConfig;
use crate::gate::{IncomingCallGate, IncomingCallInvite};
use crate::identity::ParticipantId;
use crate::media::{LocalMediaStream, MediaError, MediaSource, MediaTrack};
use crate::participants::{Participant, ParticipantRegistry};
use crate::peer::{
    LinkUpdate, NegotiationError, NegotiationOutcome, PeerRegistry, PeerTransportFactory,
    ReplaceReport, SignalingState, TransportEvent,
};
use crate::signaling::{SignalingError, SignalingEvent, SignalingHandler, SignalingMessage, SignalingTransport};
use crate::types::{CallEvent, CallId, CallType, ConnectionState, RoomId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Call session errors
#[derive(Error, Debug)]
pub enum CallError {
    /// A session is already in progress
    #[error("Already in a call")]
    AlreadyInCall,

    /// No session is in progress
    #[error("Not in a call")]
    NotInCall,

    /// Accept/decline without a pending invite
    #[error("No pending invite")]
    NoPendingInvite,

    /// Local capture failed; the attempt was abandoned
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Outbound signaling failed
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// The call was left or ended before the authority assigned an id
    #[error("Call start aborted")]
    StartAborted,

    /// The authority never answered `start`
    #[error("Timed out waiting for call id")]
    Timeout,

    /// The session task is gone
    #[error("Call service stopped")]
    ServiceStopped,
}

/// Lifecycle phase of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// No call
    #[default]
    Idle,
    /// `start` sent, waiting for the authority's call id
    Starting,
    /// In a call with a known id
    Active,
}

/// Point-in-time view of one peer link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    /// Remote participant
    pub peer: ParticipantId,
    /// Offer/answer state
    pub state: SignalingState,
    /// Transport connectivity
    pub connection: ConnectionState,
    /// Whether remote media arrived
    pub has_remote_stream: bool,
    /// Id of the video track currently sent, if any
    pub outbound_video: Option<String>,
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    /// Local participant
    pub local_id: ParticipantId,
    /// Lifecycle phase
    pub phase: SessionPhase,
    /// Authority-assigned call id
    pub call_id: Option<CallId>,
    /// Room of the call
    pub room_id: Option<RoomId>,
    /// Audio or video
    pub call_type: Option<CallType>,
    /// Microphone muted
    pub muted: bool,
    /// Camera off
    pub video_off: bool,
    /// Screen being shared
    pub screen_sharing: bool,
    /// Remote participants, sorted by id
    pub participants: Vec<Participant>,
    /// Peer links, sorted by peer id
    pub links: Vec<LinkSnapshot>,
    /// Invite waiting for an answer
    pub pending_invite: Option<IncomingCallInvite>,
}

impl CallSnapshot {
    /// Whether a session is in progress
    pub fn in_call(&self) -> bool {
        self.phase != SessionPhase::Idle
    }

    /// Number of links that completed offer/answer
    pub fn stable_links(&self) -> usize {
        self.links
            .iter()
            .filter(|l| l.state == SignalingState::Stable)
            .count()
    }
}

/// The call session controller
pub struct CallController<T: SignalingTransport> {
    local_id: ParticipantId,
    config: MeshCallConfig,
    signaling: Arc<SignalingHandler<T>>,
    media: Arc<dyn MediaSource>,
    peers: PeerRegistry<T>,
    participants: ParticipantRegistry,
    gate: IncomingCallGate,
    events: broadcast::Sender<CallEvent>,

    phase: SessionPhase,
    call_id: Option<CallId>,
    room_id: Option<RoomId>,
    call_type: Option<CallType>,
    local_stream: Option<LocalMediaStream>,
    screen_track: Option<Arc<MediaTrack>>,
    muted: bool,
    video_off: bool,
}

impl<T: SignalingTransport> CallController<T> {
    /// Create an idle controller
    ///
    /// Transport callbacks of every link are delivered on `transport_events`.
    pub fn new(
        local_id: ParticipantId,
        config: MeshCallConfig,
        signaling: Arc<SignalingHandler<T>>,
        media: Arc<dyn MediaSource>,
        factory: Arc<dyn PeerTransportFactory>,
        transport_events: mpsc::UnboundedSender<TransportEvent>,
        events: broadcast::Sender<CallEvent>,
    ) -> Self {
        let peers = PeerRegistry::new(
            local_id.clone(),
            Arc::clone(&signaling),
            factory,
            transport_events,
        );
        Self {
            local_id,
            config,
            signaling,
            media,
            peers,
            participants: ParticipantRegistry::new(),
            gate: IncomingCallGate::new(),
            events,
            phase: SessionPhase::Idle,
            call_id: None,
            room_id: None,
            call_type: None,
            local_stream: None,
            screen_track: None,
            muted: false,
            video_off: false,
        }
    }

    /// Local participant
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Lifecycle phase
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Whether a session is in progress
    pub fn in_call(&self) -> bool {
        self.phase != SessionPhase::Idle
    }

    /// Authority-assigned call id
    pub fn call_id(&self) -> Option<&CallId> {
        self.call_id.as_ref()
    }

    /// Peer registry
    pub fn peers(&self) -> &PeerRegistry<T> {
        &self.peers
    }

    /// Participant registry
    pub fn participants(&self) -> &ParticipantRegistry {
        &self.participants
    }

    /// Pending invite
    pub fn pending_invite(&self) -> Option<&IncomingCallInvite> {
        self.gate.pending()
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn is_current(&self, call_id: &CallId) -> bool {
        self.call_id.as_ref() == Some(call_id)
    }

    async fn acquire_media(&self, call_type: CallType) -> Result<LocalMediaStream, CallError> {
        let constraints = self.config.media.for_call_type(call_type);
        self.media.acquire_user_media(&constraints).await.map_err(|e| {
            tracing::error!(error = %e, ?call_type, "Failed to acquire local media");
            CallError::Media(e)
        })
    }

    /// Start a new call in `room_id`
    ///
    /// Returns once `start` is sent; the session stays [`SessionPhase::Starting`]
    /// until `call-started` delivers the call id.
    ///
    /// # Errors
    ///
    /// Returns error if a call is in progress, media cannot be acquired
    /// (nothing is sent then), or `start` cannot be sent (the session resets)
    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    pub async fn start(&mut self, room_id: RoomId, call_type: CallType) -> Result<(), CallError> {
        if self.in_call() {
            return Err(CallError::AlreadyInCall);
        }
        let stream = self.acquire_media(call_type).await?;

        self.phase = SessionPhase::Starting;
        self.room_id = Some(room_id.clone());
        self.call_type = Some(call_type);
        self.local_stream = Some(stream);

        if let Err(e) = self
            .signaling
            .send_message(SignalingMessage::Start { room_id, call_type })
            .await
        {
            tracing::error!(error = %e, "Failed to announce call");
            self.reset().await;
            return Err(e.into());
        }
        tracing::info!("Call start requested");
        Ok(())
    }

    /// Join an ongoing call
    ///
    /// # Errors
    ///
    /// Returns error if a call is in progress, media cannot be acquired, or
    /// `join` cannot be sent (the session resets in both latter cases)
    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    pub async fn join(
        &mut self,
        call_id: CallId,
        room_id: RoomId,
        call_type: CallType,
    ) -> Result<(), CallError> {
        if self.in_call() {
            return Err(CallError::AlreadyInCall);
        }
        let stream = self.acquire_media(call_type).await?;
        self.activate(call_id.clone(), room_id.clone(), call_type, stream);

        if let Err(e) = self
            .signaling
            .send_message(SignalingMessage::Join {
                call_id: call_id.clone(),
                room_id,
            })
            .await
        {
            tracing::error!(error = %e, "Failed to join call");
            self.reset().await;
            return Err(e.into());
        }
        tracing::info!(call_id = %call_id, "Joined call");
        self.emit(CallEvent::Joined { call_id });
        Ok(())
    }

    /// Accept the pending invite and join its call
    ///
    /// The invite is cleared whether or not joining succeeds.
    ///
    /// # Errors
    ///
    /// Returns error if no invite is pending or joining fails
    pub async fn accept_invite(&mut self) -> Result<CallId, CallError> {
        let invite = self.gate.take().ok_or(CallError::NoPendingInvite)?;
        self.emit(CallEvent::InviteCleared {
            call_id: invite.call_id.clone(),
        });
        tracing::info!(call_id = %invite.call_id, caller = %invite.caller_id, "Accepting invite");
        self.join(invite.call_id.clone(), invite.room_id, invite.call_type)
            .await?;
        Ok(invite.call_id)
    }

    /// Decline the pending invite
    ///
    /// # Errors
    ///
    /// Returns error if no invite is pending or `reject` cannot be sent (the
    /// invite is cleared regardless)
    pub async fn decline_invite(&mut self) -> Result<(), CallError> {
        let invite = self.gate.take().ok_or(CallError::NoPendingInvite)?;
        self.emit(CallEvent::InviteCleared {
            call_id: invite.call_id.clone(),
        });
        tracing::info!(call_id = %invite.call_id, caller = %invite.caller_id, "Declining invite");
        self.signaling
            .send_message(SignalingMessage::Reject {
                call_id: invite.call_id,
                caller_id: invite.caller_id,
            })
            .await?;
        Ok(())
    }

    /// Leave the call and release everything it holds
    ///
    /// # Errors
    ///
    /// Returns error if no call is in progress
    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    pub async fn leave(&mut self) -> Result<(), CallError> {
        if !self.in_call() {
            return Err(CallError::NotInCall);
        }
        if let Some(call_id) = self.call_id.clone() {
            if let Err(e) = self
                .signaling
                .send_message(SignalingMessage::Leave { call_id })
                .await
            {
                tracing::warn!(error = %e, "Failed to notify leave, tearing down anyway");
            }
        }
        let call_id = self.reset().await;
        tracing::info!(call_id = ?call_id, "Left call");
        self.emit(CallEvent::Left { call_id });
        Ok(())
    }

    fn activate(
        &mut self,
        call_id: CallId,
        room_id: RoomId,
        call_type: CallType,
        stream: LocalMediaStream,
    ) {
        self.peers.bind(call_id.clone(), stream.track_refs());
        self.phase = SessionPhase::Active;
        self.call_id = Some(call_id);
        self.room_id = Some(room_id);
        self.call_type = Some(call_type);
        self.local_stream = Some(stream);
    }

    /// Tear the session down; returns the call id it had
    async fn reset(&mut self) -> Option<CallId> {
        self.peers.close_all().await;
        if let Some(stream) = self.local_stream.take() {
            stream.stop_all();
        }
        if let Some(screen) = self.screen_track.take() {
            screen.stop();
        }
        self.participants.clear();
        self.phase = SessionPhase::Idle;
        self.room_id = None;
        self.call_type = None;
        self.muted = false;
        self.video_off = false;
        self.call_id.take()
    }

    /// Mute or unmute the microphone and tell the call
    ///
    /// # Errors
    ///
    /// Returns error if no call is in progress
    pub async fn set_muted(&mut self, muted: bool) -> Result<(), CallError> {
        if !self.in_call() {
            return Err(CallError::NotInCall);
        }
        if let Some(track) = self.local_stream.as_ref().and_then(LocalMediaStream::audio_track) {
            track.set_enabled(!muted);
        }
        self.muted = muted;
        self.broadcast_media_state().await;
        Ok(())
    }

    /// Turn the camera off or on and tell the call
    ///
    /// # Errors
    ///
    /// Returns error if no call is in progress
    pub async fn set_video_off(&mut self, video_off: bool) -> Result<(), CallError> {
        if !self.in_call() {
            return Err(CallError::NotInCall);
        }
        if let Some(track) = self.local_stream.as_ref().and_then(LocalMediaStream::video_track) {
            track.set_enabled(!video_off);
        }
        self.video_off = video_off;
        self.broadcast_media_state().await;
        Ok(())
    }

    async fn broadcast_media_state(&self) {
        let Some(call_id) = self.call_id.clone() else {
            return;
        };
        let message = SignalingMessage::MediaState {
            call_id,
            muted: self.muted,
            video_off: self.video_off,
        };
        if let Err(e) = self.signaling.send_message(message).await {
            tracing::warn!(error = %e, "Failed to publish media state");
        }
    }

    /// Send the screen instead of the camera on every link
    ///
    /// Links that refuse the swap keep sending the camera and are listed in
    /// the report.
    ///
    /// # Errors
    ///
    /// Returns error if no call is in progress or screen capture fails
    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    pub async fn start_screen_share(&mut self) -> Result<ReplaceReport, CallError> {
        if !self.in_call() {
            return Err(CallError::NotInCall);
        }
        if self.screen_track.is_some() {
            tracing::debug!("Screen share already running");
            return Ok(ReplaceReport::default());
        }
        let screen = self.media.acquire_display_media().await?;
        let report = self.peers.replace_outbound_video_track(&screen).await;
        self.screen_track = Some(screen);
        tracing::info!(
            replaced = report.replaced.len(),
            failed = report.failed.len(),
            "Screen share started"
        );
        self.emit(CallEvent::ScreenShareChanged { sharing: true });
        Ok(report)
    }

    /// Restore the camera on every link and release the screen capture
    ///
    /// # Errors
    ///
    /// Returns error if no call is in progress
    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    pub async fn stop_screen_share(&mut self) -> Result<ReplaceReport, CallError> {
        if !self.in_call() {
            return Err(CallError::NotInCall);
        }
        let Some(screen) = self.screen_track.take() else {
            return Ok(ReplaceReport::default());
        };
        let camera = self
            .local_stream
            .as_ref()
            .and_then(LocalMediaStream::video_track)
            .cloned();
        let report = match camera {
            Some(camera) => self.peers.replace_outbound_video_track(&camera).await,
            None => ReplaceReport::default(),
        };
        screen.stop();
        tracing::info!(
            replaced = report.replaced.len(),
            failed = report.failed.len(),
            "Screen share stopped"
        );
        self.emit(CallEvent::ScreenShareChanged { sharing: false });
        Ok(report)
    }

    /// Dispatch one inbound signaling message
    pub async fn handle_signal(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::CallStarted { call_id } => self.on_call_started(call_id).await,
            SignalingEvent::Offer {
                call_id,
                from_user_id,
                sdp,
            } => {
                if !self.accepts_peer_message(&call_id, &from_user_id) {
                    return;
                }
                self.note_participant(&from_user_id);
                let result = self
                    .peers
                    .handle_inbound_offer(&from_user_id, sdp, &call_id)
                    .await;
                log_negotiation(&from_user_id, "offer", result);
            }
            SignalingEvent::Answer {
                call_id,
                from_user_id,
                sdp,
            } => {
                if !self.accepts_peer_message(&call_id, &from_user_id) {
                    return;
                }
                let result = self
                    .peers
                    .handle_inbound_answer(&from_user_id, sdp, &call_id)
                    .await;
                log_negotiation(&from_user_id, "answer", result);
            }
            SignalingEvent::IceCandidate {
                call_id,
                from_user_id,
                candidate,
            } => {
                if !self.accepts_peer_message(&call_id, &from_user_id) {
                    return;
                }
                let result = self
                    .peers
                    .handle_inbound_candidate(&from_user_id, candidate, &call_id)
                    .await;
                log_negotiation(&from_user_id, "ice-candidate", result);
            }
            SignalingEvent::PeerJoined {
                call_id,
                peer_id,
                peer_info,
            } => {
                if !self.accepts_peer_message(&call_id, &peer_id) {
                    return;
                }
                let participant = Participant::from_peer_info(peer_id.clone(), peer_info);
                if self.participants.upsert(participant) {
                    self.emit(CallEvent::ParticipantJoined {
                        participant_id: peer_id.clone(),
                    });
                }
                // A re-announced peer restarted; its old link is dead.
                if self.peers.close(&peer_id).await {
                    tracing::info!(peer = %peer_id, "Peer rejoined, replacing link");
                }
                // Members already in the call offer to the newcomer.
                let result = self.peers.create_offer(&peer_id).await;
                log_negotiation(&peer_id, "peer-joined", result);
            }
            SignalingEvent::ExistingParticipants {
                call_id,
                participant_ids,
            } => {
                if !self.is_current(&call_id) {
                    tracing::warn!(call_id = %call_id, "Roster for another call ignored");
                    return;
                }
                // They offer to us; only record who is there.
                let local = self.local_id.clone();
                for id in participant_ids.iter().filter(|id| **id != local) {
                    self.note_participant(id);
                }
            }
            SignalingEvent::PeerLeft { peer_id } => {
                if !self.in_call() {
                    return;
                }
                self.peers.close(&peer_id).await;
                if self.participants.remove(&peer_id).is_some() {
                    tracing::info!(peer = %peer_id, "Participant left");
                    self.emit(CallEvent::ParticipantLeft {
                        participant_id: peer_id,
                    });
                }
            }
            SignalingEvent::IncomingCall {
                call_id,
                room_id,
                call_type,
                caller,
            } => {
                let invite = IncomingCallInvite::new(call_id, room_id, call_type, caller);
                let in_call = self.in_call();
                match self.gate.offer(invite, &self.local_id, in_call) {
                    Ok(invite) => {
                        let invite = invite.clone();
                        self.emit(CallEvent::IncomingCall { invite });
                    }
                    Err(reason) => {
                        tracing::debug!(reason = %reason, "Invite not surfaced");
                    }
                }
            }
            SignalingEvent::CallEnded { call_id } => {
                if self.gate.clear_for(&call_id).is_some() {
                    tracing::info!(call_id = %call_id, "Invite withdrawn");
                    self.emit(CallEvent::InviteCleared {
                        call_id: call_id.clone(),
                    });
                }
                if self.is_current(&call_id) {
                    tracing::info!(call_id = %call_id, "Call ended by authority");
                    self.reset().await;
                    self.emit(CallEvent::CallEnded { call_id });
                }
            }
            SignalingEvent::CallRejected {
                call_id,
                rejected_by,
            } => {
                if self.is_current(&call_id) {
                    tracing::info!(call_id = %call_id, by = %rejected_by, "Invite declined");
                    self.emit(CallEvent::CallRejected {
                        call_id,
                        rejected_by,
                    });
                }
            }
            SignalingEvent::MediaState {
                call_id,
                from_user_id,
                muted,
                video_off,
            } => {
                if !self.accepts_peer_message(&call_id, &from_user_id) {
                    return;
                }
                if self
                    .participants
                    .set_media_state(&from_user_id, muted, video_off)
                {
                    self.emit(CallEvent::ParticipantMediaChanged {
                        participant_id: from_user_id,
                        muted,
                        video_off,
                    });
                }
            }
        }
    }

    async fn on_call_started(&mut self, call_id: CallId) {
        if self.phase != SessionPhase::Starting {
            tracing::warn!(call_id = %call_id, phase = ?self.phase, "Unexpected call-started");
            if self.phase == SessionPhase::Idle {
                // Start was abandoned; do not leave a call open at the authority.
                if let Err(e) = self
                    .signaling
                    .send_message(SignalingMessage::Leave { call_id })
                    .await
                {
                    tracing::warn!(error = %e, "Failed to leave abandoned call");
                }
            }
            return;
        }
        let Some(stream) = self.local_stream.take() else {
            tracing::error!("Starting without local media");
            self.reset().await;
            return;
        };
        let (Some(room_id), Some(call_type)) = (self.room_id.clone(), self.call_type) else {
            self.local_stream = Some(stream);
            self.reset().await;
            return;
        };
        self.activate(call_id.clone(), room_id, call_type, stream);
        tracing::info!(call_id = %call_id, "Call started");
        self.emit(CallEvent::CallStarted { call_id });
    }

    fn accepts_peer_message(&self, call_id: &CallId, peer: &ParticipantId) -> bool {
        if !self.is_current(call_id) {
            tracing::warn!(call_id = %call_id, peer = %peer, "Message for another call ignored");
            return false;
        }
        if *peer == self.local_id {
            tracing::warn!("Message from self ignored");
            return false;
        }
        true
    }

    fn note_participant(&mut self, id: &ParticipantId) {
        if self.participants.ensure(id) {
            self.emit(CallEvent::ParticipantJoined {
                participant_id: id.clone(),
            });
        }
    }

    /// Route one transport callback and reflect its effect
    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match self.peers.handle_transport_event(event).await {
            Some(LinkUpdate::Connected(peer)) => {
                self.emit(CallEvent::PeerConnected {
                    participant_id: peer,
                });
            }
            Some(LinkUpdate::RemoteStream(peer, stream)) => {
                let stream_id = stream.id.clone();
                self.participants.set_stream(&peer, stream);
                self.emit(CallEvent::RemoteStreamAdded {
                    participant_id: peer,
                    stream_id,
                });
            }
            Some(LinkUpdate::Removed(peer)) => {
                if self.participants.remove(&peer).is_some() {
                    self.emit(CallEvent::ParticipantLeft {
                        participant_id: peer,
                    });
                }
            }
            None => {}
        }
    }

    /// Leave any call and drop the pending invite
    pub async fn shutdown(&mut self) {
        if self.in_call() {
            if let Err(e) = self.leave().await {
                tracing::warn!(error = %e, "Leave during shutdown failed");
            }
        }
        self.gate.clear();
    }

    /// Current state of the session
    pub fn snapshot(&self) -> CallSnapshot {
        let links = self
            .peers
            .link_states()
            .into_iter()
            .filter_map(|(peer, _)| self.peers.link(&peer))
            .map(|link| LinkSnapshot {
                peer: link.peer().clone(),
                state: link.state(),
                connection: link.connection_state(),
                has_remote_stream: link.remote_stream().is_some(),
                outbound_video: link
                    .outbound_tracks()
                    .iter()
                    .find(|t| t.kind() == crate::media::TrackKind::Video)
                    .map(|t| t.id().to_string()),
            })
            .collect();
        CallSnapshot {
            local_id: self.local_id.clone(),
            phase: self.phase,
            call_id: self.call_id.clone(),
            room_id: self.room_id.clone(),
            call_type: self.call_type,
            muted: self.muted,
            video_off: self.video_off,
            screen_sharing: self.screen_track.is_some(),
            participants: self.participants.list(),
            links,
            pending_invite: self.gate.pending().cloned(),
        }
    }
}

fn log_negotiation(
    peer: &ParticipantId,
    input: &'static str,
    result: Result<NegotiationOutcome, NegotiationError>,
) {
    match result {
        Ok(NegotiationOutcome::Ignored(reason)) => {
            tracing::debug!(peer = %peer, input, ?reason, "Negotiation input ignored");
        }
        Ok(outcome) => {
            tracing::debug!(peer = %peer, input, ?outcome, "Negotiation step done");
        }
        Err(e) => {
            tracing::warn!(peer = %peer, input, error = %e, "Negotiation failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackHub, LoopbackMedia, LoopbackPeerFactory, LoopbackSignaling};
    use crate::types::CallerInfo;

    struct Harness {
        controller: CallController<LoopbackSignaling>,
        hub: LoopbackHub,
        media: Arc<LoopbackMedia>,
        signaling: Arc<SignalingHandler<LoopbackSignaling>>,
        events: broadcast::Receiver<CallEvent>,
        _transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    }

    fn harness(user: &str) -> Harness {
        let hub = LoopbackHub::new();
        let media = Arc::new(LoopbackMedia::new(user));
        let signaling = Arc::new(SignalingHandler::new(Arc::new(hub.connect(user))));
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events) = broadcast::channel(64);
        let controller = CallController::new(
            ParticipantId::new(user),
            MeshCallConfig::default(),
            Arc::clone(&signaling),
            media.clone(),
            Arc::new(LoopbackPeerFactory::new(user)),
            tx,
            events_tx,
        );
        Harness {
            controller,
            hub,
            media,
            signaling,
            events,
            _transport_rx: rx,
        }
    }

    fn invite_event(call: &str, caller: &str) -> SignalingEvent {
        SignalingEvent::IncomingCall {
            call_id: CallId::new(call),
            room_id: RoomId::new("room-1"),
            call_type: CallType::Video,
            caller: CallerInfo {
                id: ParticipantId::new(caller),
                name: caller.to_string(),
                avatar: None,
                is_group_call: false,
                participant_ids: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_start_media_failure_leaves_nothing_behind() {
        let mut h = harness("alice");
        h.media
            .deny_user_media(MediaError::PermissionDenied("camera".to_string()));

        let result = h.controller.start(RoomId::new("room-1"), CallType::Video).await;

        assert!(matches!(result, Err(CallError::Media(MediaError::PermissionDenied(_)))));
        assert!(!h.controller.in_call());
        assert!(h.controller.peers().is_empty());
        assert!(h.hub.sent_by(&ParticipantId::new("alice")).is_empty());
    }

    #[tokio::test]
    async fn test_start_then_call_started_activates() {
        let mut h = harness("alice");
        h.controller
            .start(RoomId::new("room-1"), CallType::Video)
            .await
            .unwrap();
        assert_eq!(h.controller.phase(), SessionPhase::Starting);
        assert!(h.controller.in_call());

        let event = h.signaling.receive_message().await.unwrap();
        h.controller.handle_signal(event).await;

        assert_eq!(h.controller.phase(), SessionPhase::Active);
        let call_id = h.controller.call_id().cloned().unwrap();
        assert_eq!(h.controller.peers().call_id(), Some(&call_id));
        assert_eq!(
            h.events.try_recv().unwrap(),
            CallEvent::CallStarted { call_id }
        );

        let again = h.controller.start(RoomId::new("room-2"), CallType::Audio).await;
        assert!(matches!(again, Err(CallError::AlreadyInCall)));
    }

    #[tokio::test]
    async fn test_leave_releases_media_and_resets_toggles() {
        let mut h = harness("alice");
        h.controller
            .join(CallId::new("call-1"), RoomId::new("room-1"), CallType::Video)
            .await
            .unwrap();
        h.controller.set_muted(true).await.unwrap();
        assert_eq!(h.media.live_tracks(), 2);

        h.controller.leave().await.unwrap();

        let snapshot = h.controller.snapshot();
        assert!(!snapshot.in_call());
        assert!(!snapshot.muted);
        assert!(snapshot.call_id.is_none());
        assert_eq!(h.media.live_tracks(), 0);
        assert!(matches!(h.controller.leave().await, Err(CallError::NotInCall)));
    }

    #[tokio::test]
    async fn test_invite_accept_clears_gate() {
        let mut h = harness("bob");
        h.controller.handle_signal(invite_event("call-9", "alice")).await;
        assert!(h.controller.pending_invite().is_some());

        let call_id = h.controller.accept_invite().await.unwrap();
        assert_eq!(call_id, CallId::new("call-9"));
        assert!(h.controller.pending_invite().is_none());
        assert_eq!(h.controller.phase(), SessionPhase::Active);
    }

    #[tokio::test]
    async fn test_accept_with_media_failure_clears_invite_and_stays_idle() {
        let mut h = harness("bob");
        h.controller.handle_signal(invite_event("call-9", "alice")).await;
        h.media
            .deny_user_media(MediaError::DeviceUnavailable("no camera".to_string()));

        let result = h.controller.accept_invite().await;

        assert!(matches!(result, Err(CallError::Media(_))));
        assert!(h.controller.pending_invite().is_none());
        assert!(!h.controller.in_call());
    }

    #[tokio::test]
    async fn test_decline_sends_reject() {
        let mut h = harness("bob");
        h.controller.handle_signal(invite_event("call-9", "alice")).await;

        h.controller.decline_invite().await.unwrap();

        let sent = h.hub.sent_by(&ParticipantId::new("bob"));
        assert_eq!(
            sent,
            vec![SignalingMessage::Reject {
                call_id: CallId::new("call-9"),
                caller_id: ParticipantId::new("alice"),
            }]
        );
        assert!(matches!(
            h.controller.decline_invite().await,
            Err(CallError::NoPendingInvite)
        ));
    }

    #[tokio::test]
    async fn test_invite_while_in_call_is_not_surfaced() {
        let mut h = harness("bob");
        h.controller
            .join(CallId::new("call-1"), RoomId::new("room-1"), CallType::Audio)
            .await
            .unwrap();

        h.controller.handle_signal(invite_event("call-2", "carol")).await;
        assert!(h.controller.pending_invite().is_none());
    }

    #[tokio::test]
    async fn test_call_ended_withdraws_invite() {
        let mut h = harness("bob");
        h.controller.handle_signal(invite_event("call-9", "alice")).await;

        h.controller
            .handle_signal(SignalingEvent::CallEnded {
                call_id: CallId::new("call-9"),
            })
            .await;

        assert!(h.controller.pending_invite().is_none());
    }

    #[tokio::test]
    async fn test_call_started_while_idle_is_left() {
        let mut h = harness("alice");
        let alice = ParticipantId::new("alice");
        h.controller
            .handle_signal(SignalingEvent::CallStarted {
                call_id: CallId::new("call-7"),
            })
            .await;

        assert_eq!(
            h.hub.sent_by(&alice),
            vec![SignalingMessage::Leave {
                call_id: CallId::new("call-7")
            }]
        );
        assert_eq!(h.controller.phase(), SessionPhase::Idle);

        // A failed leave is logged, not fatal.
        h.hub.disconnect(&alice);
        h.controller
            .handle_signal(SignalingEvent::CallStarted {
                call_id: CallId::new("call-8"),
            })
            .await;
        assert_eq!(h.controller.phase(), SessionPhase::Idle);
        assert_eq!(h.hub.sent_by(&alice).len(), 1);
    }

    #[tokio::test]
    async fn test_roster_only_records_placeholders() {
        let mut h = harness("carol");
        h.controller
            .join(CallId::new("call-1"), RoomId::new("room-1"), CallType::Video)
            .await
            .unwrap();

        h.controller
            .handle_signal(SignalingEvent::ExistingParticipants {
                call_id: CallId::new("call-1"),
                participant_ids: vec![
                    ParticipantId::new("alice"),
                    ParticipantId::new("bob"),
                    ParticipantId::new("carol"),
                ],
            })
            .await;

        assert_eq!(h.controller.participants().len(), 2);
        assert!(h.controller.peers().is_empty());
    }

    #[tokio::test]
    async fn test_toggles_require_call() {
        let mut h = harness("alice");
        assert!(matches!(h.controller.set_muted(true).await, Err(CallError::NotInCall)));
        assert!(matches!(
            h.controller.start_screen_share().await,
            Err(CallError::NotInCall)
        ));
    }
}
