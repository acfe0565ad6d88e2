//! Call types and data structures

use crate::identity::ParticipantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a call
///
/// Call ids are always assigned by the signaling authority (see the
/// `call-started` message); clients never mint their own, which keeps two
/// simultaneous starts in the same room from colliding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Wrap an authority-assigned call id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of the chat room a call belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Wrap a room id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of call announced on `start`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Audio only
    Audio,
    /// Audio and camera video
    #[default]
    Video,
}

/// Video resolution options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoResolution {
    /// 640x480
    SD480,
    /// 1280x720
    HD720,
    /// 1920x1080
    HD1080,
}

impl VideoResolution {
    /// Get width in pixels
    pub fn width(&self) -> u32 {
        match self {
            Self::SD480 => 640,
            Self::HD720 => 1280,
            Self::HD1080 => 1920,
        }
    }

    /// Get height in pixels
    pub fn height(&self) -> u32 {
        match self {
            Self::SD480 => 480,
            Self::HD720 => 720,
            Self::HD1080 => 1080,
        }
    }
}

/// Audio capture processing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    /// Echo cancellation
    pub echo_cancellation: bool,
    /// Noise suppression
    pub noise_suppression: bool,
    /// Automatic gain control
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Camera capture request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    /// Resolution the device should aim for
    pub ideal: VideoResolution,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal: VideoResolution::HD720,
        }
    }
}

/// Media constraints for local capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Microphone request, `None` to skip audio
    pub audio: Option<AudioConstraints>,
    /// Camera request, `None` to skip video
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Audio-only capture
    pub fn audio_only() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: None,
        }
    }

    /// Camera and microphone capture
    pub fn video_call() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: Some(VideoConstraints::default()),
        }
    }

    /// Narrow these constraints to what a call type needs
    #[must_use]
    pub fn for_call_type(&self, call_type: CallType) -> Self {
        match call_type {
            CallType::Audio => Self {
                audio: self.audio.clone(),
                video: None,
            },
            CallType::Video => self.clone(),
        }
    }

    /// Check if audio is requested
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Check if video is requested
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Offer/answer descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Descriptor type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer descriptor
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer descriptor
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as carried on the signaling channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// ICE candidate string
    pub candidate: String,
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate with no media line hints
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Connectivity of a peer transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, nothing attempted
    New,
    /// Connectivity checks running
    Connecting,
    /// Media can flow
    Connected,
    /// Lost connectivity
    Disconnected,
    /// Connectivity checks failed
    Failed,
    /// Closed locally
    Closed,
}

impl ConnectionState {
    /// Whether this state ends the link
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

/// Presentation info about a participant, as announced by the authority
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Display name
    pub display_name: Option<String>,
    /// Avatar URL or storage key
    pub avatar: Option<String>,
}

/// Caller details carried by `incoming-call`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerInfo {
    /// Caller user id
    pub id: ParticipantId,
    /// Caller display name
    pub name: String,
    /// Caller avatar
    pub avatar: Option<String>,
    /// Whether the call targets a group room
    #[serde(default)]
    pub is_group_call: bool,
    /// Room members invited to the call
    #[serde(default)]
    pub participant_ids: Vec<ParticipantId>,
}

/// Call event for notifications
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// The authority assigned an id to the call we started
    CallStarted {
        /// Call identifier
        call_id: CallId,
    },
    /// We joined an existing call (join or accepted invite)
    Joined {
        /// Call identifier
        call_id: CallId,
    },
    /// A remote participant became known
    ParticipantJoined {
        /// Participant
        participant_id: ParticipantId,
    },
    /// A remote participant left or their link failed
    ParticipantLeft {
        /// Participant
        participant_id: ParticipantId,
    },
    /// The link to a participant reached connectivity
    PeerConnected {
        /// Participant
        participant_id: ParticipantId,
    },
    /// A participant's media stream arrived
    RemoteStreamAdded {
        /// Participant
        participant_id: ParticipantId,
        /// Stream identifier
        stream_id: String,
    },
    /// A participant toggled mute or camera
    ParticipantMediaChanged {
        /// Participant
        participant_id: ParticipantId,
        /// Microphone muted
        muted: bool,
        /// Camera off
        video_off: bool,
    },
    /// An invite is waiting for accept/decline
    IncomingCall {
        /// Pending invite
        invite: crate::gate::IncomingCallInvite,
    },
    /// The pending invite went away (accepted, declined, or call ended)
    InviteCleared {
        /// Call identifier
        call_id: CallId,
    },
    /// A callee declined our call
    CallRejected {
        /// Call identifier
        call_id: CallId,
        /// Who declined
        rejected_by: ParticipantId,
    },
    /// The authority ended the call
    CallEnded {
        /// Call identifier
        call_id: CallId,
    },
    /// We left the call and released everything
    Left {
        /// Call identifier, if one had been assigned
        call_id: Option<CallId>,
    },
    /// Screen share toggled
    ScreenShareChanged {
        /// Whether the screen is now being shared
        sharing: bool,
    },
}

/// Timestamp helper shared by records that note when they were seen
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_media_constraints_defaults() {
        let constraints = MediaConstraints::default();
        assert!(constraints.has_audio());
        assert!(constraints.has_video());

        let audio = constraints.audio.unwrap();
        assert!(audio.echo_cancellation);
        assert!(audio.noise_suppression);
        assert!(audio.auto_gain_control);

        let video = constraints.video.unwrap();
        assert_eq!(video.ideal.width(), 1280);
        assert_eq!(video.ideal.height(), 720);
    }

    #[test]
    fn test_constraints_narrowed_for_audio_calls() {
        let audio = MediaConstraints::video_call().for_call_type(CallType::Audio);
        assert!(audio.has_audio());
        assert!(!audio.has_video());

        let video = MediaConstraints::video_call().for_call_type(CallType::Video);
        assert!(video.has_video());
    }

    #[test]
    fn test_terminal_failure_states() {
        assert!(ConnectionState::Disconnected.is_terminal_failure());
        assert!(ConnectionState::Failed.is_terminal_failure());
        assert!(!ConnectionState::Connecting.is_terminal_failure());
        assert!(!ConnectionState::Closed.is_terminal_failure());
    }

    #[test]
    fn test_candidate_wire_format() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
    }
}
