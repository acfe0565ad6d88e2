//! Participant registry
//!
//! Presentation-facing record of every known remote participant. Streams are
//! shared with the owning peer link, never owned here.

use crate::identity::ParticipantId;
use crate::media::RemoteStream;
use crate::types::PeerInfo;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// A remote participant
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    /// Participant id
    pub participant_id: ParticipantId,
    /// Display name
    pub display_name: String,
    /// Avatar
    pub avatar: Option<String>,
    /// Media stream once the link delivered one
    pub stream: Option<Arc<RemoteStream>>,
    /// Microphone muted
    pub is_muted: bool,
    /// Camera off
    pub is_video_off: bool,
    /// First time this participant was seen
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    /// Record with no stream and default toggles
    pub fn new(participant_id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            participant_id,
            display_name: display_name.into(),
            avatar: None,
            stream: None,
            is_muted: false,
            is_video_off: false,
            joined_at: crate::types::now(),
        }
    }

    /// Record built from the `peer-joined` announcement
    pub fn from_peer_info(participant_id: ParticipantId, info: PeerInfo) -> Self {
        let display_name = info
            .display_name
            .unwrap_or_else(|| participant_id.to_string());
        let mut participant = Self::new(participant_id, display_name);
        participant.avatar = info.avatar;
        participant
    }

    /// Minimal record for an id we only know from a stream or a roster
    pub fn placeholder(participant_id: ParticipantId) -> Self {
        let display_name = participant_id.to_string();
        Self::new(participant_id, display_name)
    }
}

/// Participants of the current call, keyed by id
#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    participants: HashMap<ParticipantId, Participant>,
}

impl ParticipantRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge a record; returns `true` if the id was new
    ///
    /// Merging keeps the existing stream and avatar when the incoming record
    /// carries none, the known media flags, and the original join time.
    pub fn upsert(&mut self, mut participant: Participant) -> bool {
        match self.participants.get_mut(&participant.participant_id) {
            Some(existing) => {
                if participant.stream.is_none() {
                    participant.stream = existing.stream.take();
                }
                if participant.avatar.is_none() {
                    participant.avatar = existing.avatar.take();
                }
                // Flags only change through media-state.
                participant.is_muted = existing.is_muted;
                participant.is_video_off = existing.is_video_off;
                participant.joined_at = existing.joined_at;
                *existing = participant;
                false
            }
            None => {
                tracing::debug!(participant = %participant.participant_id, "Participant added");
                self.participants
                    .insert(participant.participant_id.clone(), participant);
                true
            }
        }
    }

    /// Insert a placeholder unless the id is already known
    pub fn ensure(&mut self, participant_id: &ParticipantId) -> bool {
        if self.participants.contains_key(participant_id) {
            return false;
        }
        self.upsert(Participant::placeholder(participant_id.clone()))
    }

    /// Attach a stream, creating a placeholder for an unknown id
    pub fn set_stream(&mut self, participant_id: &ParticipantId, stream: Arc<RemoteStream>) {
        self.participants
            .entry(participant_id.clone())
            .or_insert_with(|| Participant::placeholder(participant_id.clone()))
            .stream = Some(stream);
    }

    /// Update mute/camera flags; returns `false` for unknown ids
    pub fn set_media_state(
        &mut self,
        participant_id: &ParticipantId,
        muted: bool,
        video_off: bool,
    ) -> bool {
        match self.participants.get_mut(participant_id) {
            Some(p) => {
                p.is_muted = muted;
                p.is_video_off = video_off;
                true
            }
            None => false,
        }
    }

    /// Remove a participant
    pub fn remove(&mut self, participant_id: &ParticipantId) -> Option<Participant> {
        self.participants.remove(participant_id)
    }

    /// Look up a participant
    pub fn get(&self, participant_id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(participant_id)
    }

    /// Whether the id is known
    pub fn contains(&self, participant_id: &ParticipantId) -> bool {
        self.participants.contains_key(participant_id)
    }

    /// All participants, sorted by id
    pub fn list(&self) -> Vec<Participant> {
        let mut all: Vec<_> = self.participants.values().cloned().collect();
        all.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        all
    }

    /// Number of participants
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Forget everyone
    pub fn clear(&mut self) {
        self.participants.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stream(id: &str) -> Arc<RemoteStream> {
        Arc::new(RemoteStream::new(id, vec![format!("{id}-audio")]))
    }

    #[test]
    fn test_upsert_preserves_existing_stream() {
        let mut registry = ParticipantRegistry::new();
        let bob = ParticipantId::new("bob");
        registry.set_stream(&bob, stream("s1"));

        assert!(!registry.upsert(Participant::new(bob.clone(), "Bob")));

        let record = registry.get(&bob).unwrap();
        assert_eq!(record.display_name, "Bob");
        assert_eq!(record.stream.as_deref(), Some(&*stream("s1")));
    }

    #[test]
    fn test_reannounce_keeps_media_flags_and_avatar() {
        let mut registry = ParticipantRegistry::new();
        let bob = ParticipantId::new("bob");
        let info = PeerInfo {
            display_name: Some("Bob".to_string()),
            avatar: Some("bob.png".to_string()),
        };
        registry.upsert(Participant::from_peer_info(bob.clone(), info));
        registry.set_media_state(&bob, true, true);

        let again = PeerInfo {
            display_name: Some("Bob B.".to_string()),
            avatar: None,
        };
        assert!(!registry.upsert(Participant::from_peer_info(bob.clone(), again)));

        let record = registry.get(&bob).unwrap();
        assert_eq!(record.display_name, "Bob B.");
        assert_eq!(record.avatar.as_deref(), Some("bob.png"));
        assert!(record.is_muted);
        assert!(record.is_video_off);
    }

    #[test]
    fn test_upsert_replaces_stream_when_provided() {
        let mut registry = ParticipantRegistry::new();
        let bob = ParticipantId::new("bob");
        registry.set_stream(&bob, stream("s1"));

        let mut update = Participant::new(bob.clone(), "Bob");
        update.stream = Some(stream("s2"));
        registry.upsert(update);

        assert_eq!(registry.get(&bob).unwrap().stream.as_ref().unwrap().id, "s2");
    }

    #[test]
    fn test_set_stream_creates_placeholder() {
        let mut registry = ParticipantRegistry::new();
        let carol = ParticipantId::new("carol");
        registry.set_stream(&carol, stream("s3"));

        let record = registry.get(&carol).unwrap();
        assert_eq!(record.display_name, "carol");
        assert!(record.stream.is_some());
    }

    #[test]
    fn test_from_peer_info_falls_back_to_id() {
        let p = Participant::from_peer_info(ParticipantId::new("dave"), PeerInfo::default());
        assert_eq!(p.display_name, "dave");

        let info = PeerInfo {
            display_name: Some("Dave D.".to_string()),
            avatar: Some("dave.png".to_string()),
        };
        let p = Participant::from_peer_info(ParticipantId::new("dave"), info);
        assert_eq!(p.display_name, "Dave D.");
        assert_eq!(p.avatar.as_deref(), Some("dave.png"));
    }

    #[test]
    fn test_media_state_and_removal() {
        let mut registry = ParticipantRegistry::new();
        let bob = ParticipantId::new("bob");
        assert!(!registry.set_media_state(&bob, true, false));

        assert!(registry.ensure(&bob));
        assert!(!registry.ensure(&bob));
        assert!(registry.set_media_state(&bob, true, true));
        assert!(registry.get(&bob).unwrap().is_video_off);

        assert!(registry.remove(&bob).is_some());
        assert!(registry.is_empty());
    }
}
