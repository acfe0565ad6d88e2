//! In-process collaborators
//!
//! [`LoopbackHub`] plays the signaling authority for any number of local
//! users, [`LoopbackMedia`] hands out synthetic capture tracks, and
//! [`LoopbackPeerFactory`] builds simulated peer transports that enforce the
//! same ordering rules as a real peer connection. Together they run a whole
//! mesh call inside one process.

use crate::identity::ParticipantId;
use crate::media::{LocalMediaStream, MediaError, MediaSource, MediaTrack, RemoteStream, TrackKind, TrackSource};
use crate::peer::transport::{
    PeerTransport, PeerTransportFactory, TransportError, TransportEventKind, TransportEventSink,
};
use crate::signaling::{SignalingEvent, SignalingMessage, SignalingTransport};
use crate::types::{
    CallId, CallerInfo, ConnectionState, IceCandidate, MediaConstraints, PeerInfo,
    RoomId, SdpType, SessionDescription,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Loopback signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoopbackError {
    /// The user was disconnected from the hub
    #[error("{0} is not connected")]
    Disconnected(ParticipantId),
}

#[derive(Debug)]
struct HubCall {
    room_id: RoomId,
    members: BTreeSet<ParticipantId>,
    invited: BTreeSet<ParticipantId>,
}

#[derive(Debug, Default)]
struct HubState {
    users: HashMap<ParticipantId, mpsc::UnboundedSender<SignalingEvent>>,
    rooms: HashMap<RoomId, BTreeSet<ParticipantId>>,
    calls: HashMap<CallId, HubCall>,
    sent: Vec<(ParticipantId, SignalingMessage)>,
}

impl HubState {
    fn deliver(&self, to: &ParticipantId, event: SignalingEvent) {
        match self.users.get(to) {
            Some(tx) => {
                if tx.send(event).is_err() {
                    tracing::debug!(to = %to, "Recipient gone, message dropped");
                }
            }
            None => tracing::debug!(to = %to, "Recipient not connected, message dropped"),
        }
    }
}

/// In-process signaling authority
///
/// Assigns call ids, tracks room and call membership, fans out call
/// lifecycle notifications and relays offers, answers and candidates.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    /// Hub with no users and no rooms
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `user` and return its signaling transport
    ///
    /// Reconnecting replaces the previous transport's inbound channel.
    pub fn connect(&self, user: impl Into<ParticipantId>) -> LoopbackSignaling {
        let user = user.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().users.insert(user.clone(), tx);
        LoopbackSignaling {
            user,
            hub: self.clone(),
            inbound: tokio::sync::Mutex::new(rx),
        }
    }

    /// Drop `user`'s channel; its transport then reports closed
    pub fn disconnect(&self, user: &ParticipantId) {
        self.state.lock().users.remove(user);
    }

    /// Add `user` to the chat room that call invites go to
    pub fn add_room_member(&self, room_id: &RoomId, user: impl Into<ParticipantId>) {
        self.state
            .lock()
            .rooms
            .entry(room_id.clone())
            .or_default()
            .insert(user.into());
    }

    /// Members currently in `call_id`
    pub fn call_members(&self, call_id: &CallId) -> Vec<ParticipantId> {
        self.state
            .lock()
            .calls
            .get(call_id)
            .map(|call| call.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every message `user` sent, in order
    pub fn sent_by(&self, user: &ParticipantId) -> Vec<SignalingMessage> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(from, _)| from == user)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Deliver an arbitrary message to `user`, bypassing the authority logic
    pub fn inject(&self, user: &ParticipantId, event: SignalingEvent) {
        self.state.lock().deliver(user, event);
    }

    fn dispatch(&self, from: &ParticipantId, message: SignalingMessage) -> Result<(), LoopbackError> {
        let mut state = self.state.lock();
        if !state.users.contains_key(from) {
            return Err(LoopbackError::Disconnected(from.clone()));
        }
        state.sent.push((from.clone(), message.clone()));

        match message {
            SignalingMessage::Start { room_id, call_type } => {
                let call_id = CallId::new(Uuid::new_v4().to_string());
                let room: BTreeSet<ParticipantId> =
                    state.rooms.get(&room_id).cloned().unwrap_or_default();
                let invited: BTreeSet<ParticipantId> =
                    room.iter().filter(|m| *m != from).cloned().collect();
                tracing::debug!(call_id = %call_id, room_id = %room_id, invited = invited.len(), "Hub: call created");

                state.deliver(
                    from,
                    SignalingEvent::CallStarted {
                        call_id: call_id.clone(),
                    },
                );
                let caller = CallerInfo {
                    id: from.clone(),
                    name: from.to_string(),
                    avatar: None,
                    is_group_call: room.len() > 2,
                    participant_ids: room.iter().cloned().collect(),
                };
                for member in &invited {
                    state.deliver(
                        member,
                        SignalingEvent::IncomingCall {
                            call_id: call_id.clone(),
                            room_id: room_id.clone(),
                            call_type,
                            caller: caller.clone(),
                        },
                    );
                }
                state.calls.insert(
                    call_id,
                    HubCall {
                        room_id,
                        members: BTreeSet::from([from.clone()]),
                        invited,
                    },
                );
            }
            SignalingMessage::Join { call_id, .. } => {
                let Some(call) = state.calls.get_mut(&call_id) else {
                    state.deliver(from, SignalingEvent::CallEnded { call_id });
                    return Ok(());
                };
                let existing: Vec<ParticipantId> =
                    call.members.iter().filter(|m| *m != from).cloned().collect();
                call.members.insert(from.clone());
                call.invited.remove(from);

                state.deliver(
                    from,
                    SignalingEvent::ExistingParticipants {
                        call_id: call_id.clone(),
                        participant_ids: existing.clone(),
                    },
                );
                for member in &existing {
                    state.deliver(
                        member,
                        SignalingEvent::PeerJoined {
                            call_id: call_id.clone(),
                            peer_id: from.clone(),
                            peer_info: PeerInfo {
                                display_name: Some(from.to_string()),
                                avatar: None,
                            },
                        },
                    );
                }
            }
            SignalingMessage::Leave { call_id } => {
                let Some(call) = state.calls.get_mut(&call_id) else {
                    return Ok(());
                };
                call.members.remove(from);
                let remaining: Vec<ParticipantId> = call.members.iter().cloned().collect();
                let ended = remaining.is_empty();
                let invited: Vec<ParticipantId> = call.invited.iter().cloned().collect();
                if ended {
                    tracing::debug!(call_id = %call_id, room_id = %call.room_id, "Hub: call over");
                    state.calls.remove(&call_id);
                }

                for member in &remaining {
                    state.deliver(
                        member,
                        SignalingEvent::PeerLeft {
                            peer_id: from.clone(),
                        },
                    );
                }
                if ended {
                    for member in &invited {
                        state.deliver(
                            member,
                            SignalingEvent::CallEnded {
                                call_id: call_id.clone(),
                            },
                        );
                    }
                }
            }
            SignalingMessage::Reject { call_id, caller_id } => {
                if let Some(call) = state.calls.get_mut(&call_id) {
                    call.invited.remove(from);
                }
                state.deliver(
                    &caller_id,
                    SignalingEvent::CallRejected {
                        call_id,
                        rejected_by: from.clone(),
                    },
                );
            }
            SignalingMessage::Offer {
                call_id,
                to_peer_id,
                sdp,
            } => state.deliver(
                &to_peer_id,
                SignalingEvent::Offer {
                    call_id,
                    from_user_id: from.clone(),
                    sdp,
                },
            ),
            SignalingMessage::Answer {
                call_id,
                to_peer_id,
                sdp,
            } => state.deliver(
                &to_peer_id,
                SignalingEvent::Answer {
                    call_id,
                    from_user_id: from.clone(),
                    sdp,
                },
            ),
            SignalingMessage::IceCandidate {
                call_id,
                to_peer_id,
                candidate,
            } => state.deliver(
                &to_peer_id,
                SignalingEvent::IceCandidate {
                    call_id,
                    from_user_id: from.clone(),
                    candidate,
                },
            ),
            SignalingMessage::MediaState {
                call_id,
                muted,
                video_off,
            } => {
                let members: Vec<ParticipantId> = state
                    .calls
                    .get(&call_id)
                    .map(|call| call.members.iter().filter(|m| *m != from).cloned().collect())
                    .unwrap_or_default();
                for member in &members {
                    state.deliver(
                        member,
                        SignalingEvent::MediaState {
                            call_id: call_id.clone(),
                            from_user_id: from.clone(),
                            muted,
                            video_off,
                        },
                    );
                }
            }
        }
        Ok(())
    }
}

/// One user's connection to a [`LoopbackHub`]
pub struct LoopbackSignaling {
    user: ParticipantId,
    hub: LoopbackHub,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalingEvent>>,
}

impl LoopbackSignaling {
    /// User this transport belongs to
    pub fn user(&self) -> &ParticipantId {
        &self.user
    }
}

#[async_trait]
impl SignalingTransport for LoopbackSignaling {
    type Error = LoopbackError;

    async fn send_message(&self, message: SignalingMessage) -> Result<(), LoopbackError> {
        self.hub.dispatch(&self.user, message)
    }

    async fn receive_message(&self) -> Result<Option<SignalingEvent>, LoopbackError> {
        Ok(self.inbound.lock().await.recv().await)
    }
}

/// Synthetic capture devices
pub struct LoopbackMedia {
    owner: String,
    counter: AtomicU64,
    deny_user: Mutex<Option<MediaError>>,
    deny_display: Mutex<Option<MediaError>>,
    issued: Mutex<Vec<Weak<MediaTrack>>>,
}

impl LoopbackMedia {
    /// Devices for `owner`; track ids are prefixed with it
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            counter: AtomicU64::new(0),
            deny_user: Mutex::new(None),
            deny_display: Mutex::new(None),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next camera/microphone requests with `error`
    pub fn deny_user_media(&self, error: MediaError) {
        *self.deny_user.lock() = Some(error);
    }

    /// Fail screen capture requests with `error`
    pub fn deny_display_media(&self, error: MediaError) {
        *self.deny_display.lock() = Some(error);
    }

    /// Grant every request again
    pub fn allow_all(&self) {
        *self.deny_user.lock() = None;
        *self.deny_display.lock() = None;
    }

    /// Number of issued tracks still capturing
    pub fn live_tracks(&self) -> usize {
        self.issued
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|t| t.is_live())
            .count()
    }

    fn track(&self, stream_id: &str, source: TrackSource) -> Arc<MediaTrack> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let label = match source {
            TrackSource::Microphone => "mic",
            TrackSource::Camera => "cam",
            TrackSource::Screen => "screen",
        };
        let track = Arc::new(MediaTrack::new(
            format!("{}-{label}-{n}", self.owner),
            stream_id,
            source,
        ));
        self.issued.lock().push(Arc::downgrade(&track));
        track
    }
}

#[async_trait]
impl MediaSource for LoopbackMedia {
    async fn acquire_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaStream, MediaError> {
        if let Some(error) = self.deny_user.lock().clone() {
            return Err(error);
        }
        let stream_id = format!("{}-stream-{}", self.owner, self.counter.load(Ordering::Relaxed));
        let mut tracks = Vec::new();
        if constraints.has_audio() {
            tracks.push(self.track(&stream_id, TrackSource::Microphone));
        }
        if constraints.has_video() {
            tracks.push(self.track(&stream_id, TrackSource::Camera));
        }
        if tracks.is_empty() {
            return Err(MediaError::DeviceUnavailable(
                "no audio or video requested".to_string(),
            ));
        }
        Ok(LocalMediaStream::new(stream_id, tracks))
    }

    async fn acquire_display_media(&self) -> Result<Arc<MediaTrack>, MediaError> {
        if let Some(error) = self.deny_display.lock().clone() {
            return Err(error);
        }
        let stream_id = format!("{}-display", self.owner);
        Ok(self.track(&stream_id, TrackSource::Screen))
    }
}

#[derive(Debug, Default)]
struct SimState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<(String, TrackKind)>,
    applied: Vec<IceCandidate>,
    connected: bool,
    closed: bool,
    refuse_replace: bool,
}

struct SimLink {
    sink: TransportEventSink,
    state: Mutex<SimState>,
}

impl SimLink {
    /// Report connectivity once both descriptions and a remote candidate are in
    fn check_connected(&self, state: &mut SimState) {
        if state.connected || state.closed {
            return;
        }
        if state.local.is_some() && state.remote.is_some() && !state.applied.is_empty() {
            state.connected = true;
            self.sink
                .emit(TransportEventKind::ConnectionState(ConnectionState::Connecting));
            self.sink
                .emit(TransportEventKind::ConnectionState(ConnectionState::Connected));
        }
    }
}

struct SimTransport {
    local: ParticipantId,
    serial: u64,
    link: Arc<SimLink>,
}

impl SimTransport {
    fn describe(&self, sdp_type: SdpType, state: &SimState) -> SessionDescription {
        let mut sdp = format!(
            "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns={}\r\nt=0 0\r\n",
            self.serial, self.local
        );
        for (id, kind) in &state.tracks {
            let media = match kind {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            sdp.push_str(&format!("m={media} 9 UDP/TLS/RTP/SAVPF 0\r\na=msid:{} {id}\r\n", self.local));
        }
        SessionDescription { sdp_type, sdp }
    }
}

#[async_trait]
impl PeerTransport for SimTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        let mut state = self.link.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.tracks.push((track.id().to_string(), track.kind()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let state = self.link.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        Ok(self.describe(SdpType::Offer, &state))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let state = self.link.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        match &state.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => {
                Ok(self.describe(SdpType::Answer, &state))
            }
            _ => Err(TransportError::Sdp("no remote offer to answer".to_string())),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let mut state = self.link.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.local = Some(desc);
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.serial,
                40_000 + self.serial % 20_000
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        self.link
            .sink
            .emit(TransportEventKind::LocalCandidate(candidate));
        self.link.check_connected(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let mut state = self.link.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if !desc.sdp.starts_with("v=0") {
            return Err(TransportError::Sdp("malformed session description".to_string()));
        }
        let track_ids: Vec<String> = desc
            .sdp
            .lines()
            .filter_map(|line| line.strip_prefix("a=msid:"))
            .filter_map(|msid| msid.split_whitespace().nth(1))
            .map(str::to_string)
            .collect();
        state.remote = Some(desc);
        self.link.sink.emit(TransportEventKind::RemoteStream(RemoteStream::new(
            format!("{}-stream", self.link.sink.peer()),
            track_ids,
        )));
        self.link.check_connected(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.link.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.remote.is_none() {
            return Err(TransportError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        state.applied.push(candidate);
        self.link.check_connected(&mut state);
        Ok(())
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        let mut state = self.link.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.refuse_replace {
            return Err(TransportError::Track("sender refused replacement".to_string()));
        }
        let Some(slot) = state
            .tracks
            .iter_mut()
            .find(|(_, kind)| *kind == TrackKind::Video)
        else {
            return Err(TransportError::Track("no video sender".to_string()));
        };
        slot.0 = track.id().to_string();
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.link.state.lock();
        state.closed = true;
        state.connected = false;
    }
}

#[derive(Default)]
struct FactoryState {
    links: HashMap<ParticipantId, Vec<Arc<SimLink>>>,
    refuse_replace: BTreeSet<ParticipantId>,
}

/// Builds simulated peer transports and lets tests look inside them
#[derive(Clone)]
pub struct LoopbackPeerFactory {
    local: ParticipantId,
    serial: Arc<AtomicU64>,
    state: Arc<Mutex<FactoryState>>,
}

impl LoopbackPeerFactory {
    /// Factory for the transports of `local`
    pub fn new(local: impl Into<ParticipantId>) -> Self {
        Self {
            local: local.into(),
            serial: Arc::new(AtomicU64::new(0)),
            state: Arc::new(Mutex::new(FactoryState::default())),
        }
    }

    fn current(&self, peer: &ParticipantId) -> Option<Arc<SimLink>> {
        self.state
            .lock()
            .links
            .get(peer)
            .and_then(|history| history.last().cloned())
    }

    /// How many transports were built toward `peer`
    pub fn created_count(&self, peer: &ParticipantId) -> usize {
        self.state.lock().links.get(peer).map_or(0, Vec::len)
    }

    /// Candidates the latest transport toward `peer` applied, in order
    pub fn applied_candidates(&self, peer: &ParticipantId) -> Vec<IceCandidate> {
        self.current(peer)
            .map(|link| link.state.lock().applied.clone())
            .unwrap_or_default()
    }

    /// Whether the latest transport toward `peer` was closed
    pub fn is_closed(&self, peer: &ParticipantId) -> bool {
        self.current(peer)
            .is_some_and(|link| link.state.lock().closed)
    }

    /// Whether the latest transport toward `peer` reported connectivity
    pub fn is_connected(&self, peer: &ParticipantId) -> bool {
        self.current(peer)
            .is_some_and(|link| link.state.lock().connected)
    }

    /// Id of the video track the latest transport toward `peer` sends
    pub fn video_track_id(&self, peer: &ParticipantId) -> Option<String> {
        self.current(peer).and_then(|link| {
            link.state
                .lock()
                .tracks
                .iter()
                .find(|(_, kind)| *kind == TrackKind::Video)
                .map(|(id, _)| id.clone())
        })
    }

    /// Make transports toward `peer` refuse video track replacement
    pub fn refuse_replace(&self, peer: &ParticipantId) {
        let link = {
            let mut state = self.state.lock();
            state.refuse_replace.insert(peer.clone());
            state.links.get(peer).and_then(|h| h.last().cloned())
        };
        if let Some(link) = link {
            link.state.lock().refuse_replace = true;
        }
    }

    /// Report a connectivity change on the latest transport toward `peer`,
    /// as the network would; returns `false` if there is none or it is closed
    pub fn emit_state(&self, peer: &ParticipantId, connection: ConnectionState) -> bool {
        match self.current(peer) {
            Some(link) if !link.state.lock().closed => link
                .sink
                .emit(TransportEventKind::ConnectionState(connection)),
            _ => false,
        }
    }
}

#[async_trait]
impl PeerTransportFactory for LoopbackPeerFactory {
    async fn create(
        &self,
        peer: &ParticipantId,
        sink: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.lock();
        let link = Arc::new(SimLink {
            sink,
            state: Mutex::new(SimState {
                refuse_replace: state.refuse_replace.contains(peer),
                ..SimState::default()
            }),
        });
        state
            .links
            .entry(peer.clone())
            .or_default()
            .push(Arc::clone(&link));
        tracing::trace!(local = %self.local, peer = %peer, serial, "Simulated transport created");
        Ok(Box::new(SimTransport {
            local: self.local.clone(),
            serial,
            link,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::peer::transport::{LinkEpoch, TransportEvent};
    use crate::types::CallType;

    #[tokio::test]
    async fn test_hub_assigns_call_and_invites_room() {
        let hub = LoopbackHub::new();
        let room = RoomId::new("room-1");
        hub.add_room_member(&room, "alice");
        hub.add_room_member(&room, "bob");
        let alice = hub.connect("alice");
        let bob = hub.connect("bob");

        alice
            .send_message(SignalingMessage::Start {
                room_id: room.clone(),
                call_type: CallType::Video,
            })
            .await
            .unwrap();

        let started = alice.receive_message().await.unwrap().unwrap();
        let SignalingEvent::CallStarted { call_id } = started else {
            unreachable!("expected call-started");
        };
        let invite = bob.receive_message().await.unwrap().unwrap();
        assert!(matches!(
            invite,
            SignalingEvent::IncomingCall { call_id: ref id, ref caller, .. }
                if *id == call_id && caller.id == ParticipantId::new("alice")
        ));
        assert_eq!(hub.call_members(&call_id), vec![ParticipantId::new("alice")]);
    }

    #[tokio::test]
    async fn test_hub_join_fans_out_roster() {
        let hub = LoopbackHub::new();
        let alice = hub.connect("alice");
        let bob = hub.connect("bob");
        alice
            .send_message(SignalingMessage::Start {
                room_id: RoomId::new("r"),
                call_type: CallType::Audio,
            })
            .await
            .unwrap();
        let Some(SignalingEvent::CallStarted { call_id }) = alice.receive_message().await.unwrap()
        else {
            unreachable!("expected call-started");
        };

        bob.send_message(SignalingMessage::Join {
            call_id: call_id.clone(),
            room_id: RoomId::new("r"),
        })
        .await
        .unwrap();

        assert_eq!(
            bob.receive_message().await.unwrap(),
            Some(SignalingEvent::ExistingParticipants {
                call_id: call_id.clone(),
                participant_ids: vec![ParticipantId::new("alice")],
            })
        );
        assert!(matches!(
            alice.receive_message().await.unwrap(),
            Some(SignalingEvent::PeerJoined { peer_id, .. }) if peer_id == ParticipantId::new("bob")
        ));
    }

    #[tokio::test]
    async fn test_disconnected_user_cannot_send() {
        let hub = LoopbackHub::new();
        let alice = hub.connect("alice");
        hub.disconnect(&ParticipantId::new("alice"));

        let result = alice
            .send_message(SignalingMessage::Leave {
                call_id: CallId::new("c"),
            })
            .await;
        assert_eq!(
            result,
            Err(LoopbackError::Disconnected(ParticipantId::new("alice")))
        );
        assert_eq!(alice.receive_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_media_denial_and_release() {
        let media = LoopbackMedia::new("alice");
        let stream = media
            .acquire_user_media(&MediaConstraints::video_call())
            .await
            .unwrap();
        assert_eq!(stream.tracks().len(), 2);
        assert_eq!(media.live_tracks(), 2);
        drop(stream);
        assert_eq!(media.live_tracks(), 0);

        media.deny_user_media(MediaError::PermissionDenied("user said no".to_string()));
        assert!(media
            .acquire_user_media(&MediaConstraints::audio_only())
            .await
            .is_err());
        media.allow_all();
        assert!(media.acquire_display_media().await.is_ok());
    }

    #[tokio::test]
    async fn test_sim_transport_enforces_candidate_ordering() {
        let factory = LoopbackPeerFactory::new("alice");
        let (tx, mut rx) = mpsc::unbounded_channel::<TransportEvent>();
        let bob = ParticipantId::new("bob");
        let sink = TransportEventSink::new(
            bob.clone(),
            LinkEpoch {
                call_id: CallId::new("c"),
                serial: 1,
            },
            tx,
        );
        let transport = factory.create(&bob, sink).await.unwrap();

        let early = transport
            .add_ice_candidate(IceCandidate::new("candidate:1"))
            .await;
        assert!(matches!(early, Err(TransportError::Candidate(_))));

        let offer = transport.create_offer().await.unwrap();
        transport.set_local_description(offer).await.unwrap();
        transport
            .set_remote_description(SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap();
        transport
            .add_ice_candidate(IceCandidate::new("candidate:1"))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        assert!(matches!(kinds[0], TransportEventKind::LocalCandidate(_)));
        assert!(matches!(kinds[1], TransportEventKind::RemoteStream(_)));
        assert_eq!(
            kinds.last(),
            Some(&TransportEventKind::ConnectionState(ConnectionState::Connected))
        );
        assert!(factory.is_connected(&bob));
    }
}
