//! Mesh call service orchestration
//!
//! [`MeshCallService`] is the handle applications hold. Building it spawns a
//! single task that owns the [`CallController`] and drains its queues one
//! message at a time (handle commands, inbound signaling, transport
//! callbacks). Nothing else touches the session state.

use crate::config::MeshCallConfig;
use crate::identity::ParticipantId;
use crate::media::MediaSource;
use crate::peer::{PeerTransportFactory, ReplaceReport, TransportEvent};
use crate::session::{CallController, CallError, CallSnapshot, SessionPhase};
use crate::signaling::{SignalingError, SignalingEvent, SignalingHandler, SignalingTransport};
use crate::types::{CallEvent, CallId, CallType, RoomId};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    Start {
        room_id: RoomId,
        call_type: CallType,
        reply: Reply<CallId>,
    },
    Join {
        call_id: CallId,
        room_id: RoomId,
        call_type: CallType,
        reply: Reply<()>,
    },
    AcceptInvite {
        reply: Reply<CallId>,
    },
    DeclineInvite {
        reply: Reply<()>,
    },
    Leave {
        reply: Reply<()>,
    },
    SetMuted {
        muted: bool,
        reply: Reply<()>,
    },
    SetVideoOff {
        video_off: bool,
        reply: Reply<()>,
    },
    StartScreenShare {
        reply: Reply<ReplaceReport>,
    },
    StopScreenShare {
        reply: Reply<ReplaceReport>,
    },
    Snapshot {
        reply: oneshot::Sender<CallSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running mesh call session
pub struct MeshCallService {
    local_id: ParticipantId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CallEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MeshCallService {
    /// Start building a service for `local_id`
    pub fn builder<T: SignalingTransport>(
        local_id: ParticipantId,
        signaling: Arc<SignalingHandler<T>>,
    ) -> MeshCallServiceBuilder<T> {
        MeshCallServiceBuilder::new(local_id, signaling)
    }

    /// Local participant
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Subscribe to call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| CallError::ServiceStopped)?;
        rx.await.map_err(|_| CallError::ServiceStopped)
    }

    /// Start a call in `room_id` and wait for the authority to assign its id
    ///
    /// # Errors
    ///
    /// Returns error if a call is in progress, media cannot be acquired, the
    /// authority does not answer in time (the attempt is unwound), or the call
    /// is left before it started
    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    pub async fn start_call(&self, room_id: RoomId, call_type: CallType) -> Result<CallId, CallError> {
        self.request(|reply| Command::Start {
            room_id,
            call_type,
            reply,
        })
        .await?
    }

    /// Join an ongoing call
    ///
    /// # Errors
    ///
    /// Returns error if a call is in progress, media cannot be acquired or
    /// `join` cannot be sent
    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    pub async fn join_call(
        &self,
        call_id: CallId,
        room_id: RoomId,
        call_type: CallType,
    ) -> Result<(), CallError> {
        self.request(|reply| Command::Join {
            call_id,
            room_id,
            call_type,
            reply,
        })
        .await?
    }

    /// Accept the pending invite
    ///
    /// # Errors
    ///
    /// Returns error if no invite is pending or joining fails
    pub async fn accept_invite(&self) -> Result<CallId, CallError> {
        self.request(|reply| Command::AcceptInvite { reply }).await?
    }

    /// Decline the pending invite
    ///
    /// # Errors
    ///
    /// Returns error if no invite is pending or `reject` cannot be sent
    pub async fn decline_invite(&self) -> Result<(), CallError> {
        self.request(|reply| Command::DeclineInvite { reply }).await?
    }

    /// Leave the current call
    ///
    /// # Errors
    ///
    /// Returns error if no call is in progress
    pub async fn leave_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Leave { reply }).await?
    }

    /// Mute or unmute the microphone
    ///
    /// # Errors
    ///
    /// Returns error if no call is in progress
    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetMuted { muted, reply }).await?
    }

    /// Turn the camera off or on
    ///
    /// # Errors
    ///
    /// Returns error if no call is in progress
    pub async fn set_video_off(&self, video_off: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetVideoOff { video_off, reply })
            .await?
    }

    /// Share the screen instead of the camera
    ///
    /// # Errors
    ///
    /// Returns error if no call is in progress or screen capture fails
    pub async fn start_screen_share(&self) -> Result<ReplaceReport, CallError> {
        self.request(|reply| Command::StartScreenShare { reply })
            .await?
    }

    /// Go back to the camera
    ///
    /// # Errors
    ///
    /// Returns error if no call is in progress
    pub async fn stop_screen_share(&self) -> Result<ReplaceReport, CallError> {
        self.request(|reply| Command::StopScreenShare { reply })
            .await?
    }

    /// Current state of the session
    ///
    /// # Errors
    ///
    /// Returns error if the service stopped
    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Leave any call and stop the session task
    ///
    /// # Errors
    ///
    /// Returns error if the service already stopped
    pub async fn shutdown(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Shutdown { reply }).await?;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Session task ended abnormally");
            }
        }
        Ok(())
    }
}

/// Mesh call service builder
pub struct MeshCallServiceBuilder<T: SignalingTransport> {
    local_id: ParticipantId,
    signaling: Arc<SignalingHandler<T>>,
    config: MeshCallConfig,
    media: Option<Arc<dyn MediaSource>>,
    factory: Option<Arc<dyn PeerTransportFactory>>,
}

impl<T: SignalingTransport> MeshCallServiceBuilder<T> {
    /// Create new builder
    #[must_use]
    pub fn new(local_id: ParticipantId, signaling: Arc<SignalingHandler<T>>) -> Self {
        Self {
            local_id,
            signaling,
            config: MeshCallConfig::default(),
            media: None,
            factory: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: MeshCallConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the capture device source
    #[must_use]
    pub fn with_media_source(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = Some(media);
        self
    }

    /// Set the peer transport factory
    #[must_use]
    pub fn with_transport_factory(mut self, factory: Arc<dyn PeerTransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Spawn the session task and return its handle
    ///
    /// Without an explicit factory the WebRTC-backed one is used when the
    /// `webrtc-backend` feature is on.
    ///
    /// # Errors
    ///
    /// Returns error if no media source is set, or no transport factory is
    /// set and none is compiled in
    pub async fn build(self) -> Result<MeshCallService, ServiceError> {
        let media = self
            .media
            .ok_or_else(|| ServiceError::InitError("no media source configured".to_string()))?;
        let factory = match self.factory {
            Some(factory) => factory,
            None => default_factory(&self.config)?,
        };

        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let (commands_tx, commands_rx) = mpsc::channel(self.config.command_capacity.max(1));
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let controller = CallController::new(
            self.local_id.clone(),
            self.config.clone(),
            Arc::clone(&self.signaling),
            media,
            factory,
            transport_tx,
            events.clone(),
        );
        let actor = SessionActor {
            controller,
            signaling: self.signaling,
            config: self.config,
            pending_start: None,
            start_deadline: None,
        };
        tracing::info!(local = %self.local_id, "Mesh call service started");
        let task = tokio::spawn(actor.run(commands_rx, transport_rx));

        Ok(MeshCallService {
            local_id: self.local_id,
            commands: commands_tx,
            events,
            task: Mutex::new(Some(task)),
        })
    }
}

#[cfg(feature = "webrtc-backend")]
fn default_factory(config: &MeshCallConfig) -> Result<Arc<dyn PeerTransportFactory>, ServiceError> {
    let factory = crate::rtc::RtcPeerTransportFactory::new(&config.ice_servers)
        .map_err(|e| ServiceError::InitError(e.to_string()))?;
    Ok(Arc::new(factory))
}

#[cfg(not(feature = "webrtc-backend"))]
fn default_factory(_config: &MeshCallConfig) -> Result<Arc<dyn PeerTransportFactory>, ServiceError> {
    Err(ServiceError::InitError(
        "no peer transport factory configured".to_string(),
    ))
}

struct SessionActor<T: SignalingTransport> {
    controller: CallController<T>,
    signaling: Arc<SignalingHandler<T>>,
    config: MeshCallConfig,
    pending_start: Option<Reply<CallId>>,
    start_deadline: Option<Instant>,
}

impl<T: SignalingTransport> SessionActor<T> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (signal_tx, mut signals) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_signaling(Arc::clone(&self.signaling), signal_tx));

        loop {
            let deadline = self.start_deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.controller.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        tracing::debug!("Service handle dropped");
                        self.controller.shutdown().await;
                        break;
                    }
                },
                Some(event) = signals.recv() => self.controller.handle_signal(event).await,
                Some(event) = transport_events.recv() => {
                    self.controller.handle_transport_event(event).await;
                }
                () = wait_until(deadline) => self.expire_start().await,
            }
            self.resolve_pending_start();
        }

        pump.abort();
        self.resolve_pending_start();
        tracing::info!(local = %self.controller.local_id(), "Mesh call service stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                room_id,
                call_type,
                reply,
            } => match self.controller.start(room_id, call_type).await {
                Ok(()) => {
                    self.pending_start = Some(reply);
                    self.start_deadline = Some(Instant::now() + self.config.call_started_timeout());
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Join {
                call_id,
                room_id,
                call_type,
                reply,
            } => {
                let _ = reply.send(self.controller.join(call_id, room_id, call_type).await);
            }
            Command::AcceptInvite { reply } => {
                let _ = reply.send(self.controller.accept_invite().await);
            }
            Command::DeclineInvite { reply } => {
                let _ = reply.send(self.controller.decline_invite().await);
            }
            Command::Leave { reply } => {
                let _ = reply.send(self.controller.leave().await);
            }
            Command::SetMuted { muted, reply } => {
                let _ = reply.send(self.controller.set_muted(muted).await);
            }
            Command::SetVideoOff { video_off, reply } => {
                let _ = reply.send(self.controller.set_video_off(video_off).await);
            }
            Command::StartScreenShare { reply } => {
                let _ = reply.send(self.controller.start_screen_share().await);
            }
            Command::StopScreenShare { reply } => {
                let _ = reply.send(self.controller.stop_screen_share().await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.controller.snapshot());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    /// Give up on a start the authority never acknowledged
    async fn expire_start(&mut self) {
        self.start_deadline = None;
        if self.controller.phase() != SessionPhase::Starting {
            return;
        }
        tracing::warn!(
            timeout_ms = self.config.call_started_timeout_ms,
            "No call-started from authority, abandoning start"
        );
        if let Err(e) = self.controller.leave().await {
            tracing::warn!(error = %e, "Unwinding start failed");
        }
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(CallError::Timeout));
        }
    }

    /// Answer a waiting `start_call` once the session left `Starting`
    fn resolve_pending_start(&mut self) {
        let Some(reply) = self.pending_start.take() else {
            return;
        };
        match (self.controller.phase(), self.controller.call_id()) {
            (SessionPhase::Active, Some(call_id)) => {
                let _ = reply.send(Ok(call_id.clone()));
            }
            (SessionPhase::Starting, _) => {
                self.pending_start = Some(reply);
                return;
            }
            _ => {
                let _ = reply.send(Err(CallError::StartAborted));
            }
        }
        self.start_deadline = None;
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Forward inbound signaling into the session queue until the channel closes
async fn pump_signaling<T: SignalingTransport>(
    signaling: Arc<SignalingHandler<T>>,
    tx: mpsc::UnboundedSender<SignalingEvent>,
) {
    loop {
        match signaling.receive_message().await {
            Ok(event) => {
                if tx.send(event).is_err() {
                    break;
                }
            }
            Err(SignalingError::ChannelClosed) => {
                tracing::warn!("Signaling channel closed");
                break;
            }
            Err(SignalingError::Serialization(e)) => {
                tracing::warn!(error = %e, "Dropping undecodable signaling message");
            }
            Err(e) => {
                tracing::debug!(error = %e, "Signaling receive failed, retrying");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackHub, LoopbackMedia, LoopbackPeerFactory};

    async fn service(hub: &LoopbackHub, user: &str) -> MeshCallService {
        let signaling = Arc::new(SignalingHandler::new(Arc::new(hub.connect(user))));
        MeshCallService::builder(ParticipantId::new(user), signaling)
            .with_media_source(Arc::new(LoopbackMedia::new(user)))
            .with_transport_factory(Arc::new(LoopbackPeerFactory::new(user)))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_call_resolves_with_assigned_id() {
        let hub = LoopbackHub::new();
        let alice = service(&hub, "alice").await;
        let mut events = alice.subscribe_events();

        let call_id = alice
            .start_call(RoomId::new("room-1"), CallType::Video)
            .await
            .unwrap();

        assert_eq!(hub.call_members(&call_id), vec![ParticipantId::new("alice")]);
        assert_eq!(
            events.recv().await.unwrap(),
            CallEvent::CallStarted {
                call_id: call_id.clone()
            }
        );
        let snapshot = alice.snapshot().await.unwrap();
        assert_eq!(snapshot.phase, SessionPhase::Active);
        assert_eq!(snapshot.call_id, Some(call_id));

        alice.shutdown().await.unwrap();
        assert!(matches!(
            alice.snapshot().await,
            Err(CallError::ServiceStopped)
        ));
    }

    #[tokio::test]
    async fn test_builder_requires_media_source() {
        let hub = LoopbackHub::new();
        let signaling = Arc::new(SignalingHandler::new(Arc::new(hub.connect("alice"))));
        let result = MeshCallService::builder(ParticipantId::new("alice"), signaling)
            .with_transport_factory(Arc::new(LoopbackPeerFactory::new("alice")))
            .build()
            .await;
        assert!(matches!(result, Err(ServiceError::InitError(_))));
    }
}
