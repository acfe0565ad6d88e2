//! Incoming call gate
//!
//! Holds at most one pending invite. Competing invites are rejected outright,
//! never queued.

use crate::identity::ParticipantId;
use crate::types::{CallId, CallType, CallerInfo, RoomId};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use thiserror::Error;

/// Why an invite was not surfaced
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InviteRejected {
    /// We started the call ourselves
    #[error("Invite from self")]
    FromSelf,

    /// A call is already in progress
    #[error("Already in a call")]
    AlreadyInCall,

    /// Another invite is waiting for an answer
    #[error("Invite for {0} already pending")]
    InvitePending(CallId),
}

/// An invite waiting for accept/decline
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCallInvite {
    /// Call identifier
    pub call_id: CallId,
    /// Room of the call
    pub room_id: RoomId,
    /// Audio or video
    pub call_type: CallType,
    /// Caller id
    pub caller_id: ParticipantId,
    /// Caller display name
    pub caller_name: String,
    /// Caller avatar
    pub caller_avatar: Option<String>,
    /// Whether the call targets a group room
    pub is_group_call: bool,
    /// Invited members
    pub participant_ids: BTreeSet<ParticipantId>,
    /// When the invite arrived
    pub received_at: DateTime<Utc>,
}

impl IncomingCallInvite {
    /// Build from an `incoming-call` message
    pub fn new(call_id: CallId, room_id: RoomId, call_type: CallType, caller: CallerInfo) -> Self {
        Self {
            call_id,
            room_id,
            call_type,
            caller_id: caller.id,
            caller_name: caller.name,
            caller_avatar: caller.avatar,
            is_group_call: caller.is_group_call,
            participant_ids: caller.participant_ids.into_iter().collect(),
            received_at: crate::types::now(),
        }
    }
}

/// The single-slot invite holder
#[derive(Debug, Default)]
pub struct IncomingCallGate {
    pending: Option<IncomingCallInvite>,
}

impl IncomingCallGate {
    /// Empty gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Surface an invite unless it is from ourselves, we are busy, or another
    /// invite is pending
    ///
    /// # Errors
    ///
    /// Returns the reason the invite was dropped
    pub fn offer(
        &mut self,
        invite: IncomingCallInvite,
        self_id: &ParticipantId,
        in_call: bool,
    ) -> Result<&IncomingCallInvite, InviteRejected> {
        if invite.caller_id == *self_id {
            return Err(InviteRejected::FromSelf);
        }
        if in_call {
            return Err(InviteRejected::AlreadyInCall);
        }
        if let Some(current) = &self.pending {
            return Err(InviteRejected::InvitePending(current.call_id.clone()));
        }
        tracing::info!(call_id = %invite.call_id, caller = %invite.caller_id, "Incoming call");
        Ok(self.pending.insert(invite))
    }

    /// Pending invite
    pub fn pending(&self) -> Option<&IncomingCallInvite> {
        self.pending.as_ref()
    }

    /// Take the pending invite for accept/decline
    pub fn take(&mut self) -> Option<IncomingCallInvite> {
        self.pending.take()
    }

    /// Drop the pending invite if it belongs to `call_id`
    pub fn clear_for(&mut self, call_id: &CallId) -> Option<IncomingCallInvite> {
        match &self.pending {
            Some(invite) if invite.call_id == *call_id => self.pending.take(),
            _ => None,
        }
    }

    /// Drop any pending invite
    pub fn clear(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn invite(call: &str, caller: &str) -> IncomingCallInvite {
        IncomingCallInvite::new(
            CallId::new(call),
            RoomId::new("room-1"),
            CallType::Video,
            CallerInfo {
                id: ParticipantId::new(caller),
                name: caller.to_uppercase(),
                avatar: None,
                is_group_call: true,
                participant_ids: vec![ParticipantId::new("bob"), ParticipantId::new("bob")],
            },
        )
    }

    #[test]
    fn test_invite_surfaced_once() {
        let mut gate = IncomingCallGate::new();
        let me = ParticipantId::new("bob");

        let pending = gate.offer(invite("c1", "alice"), &me, false).unwrap();
        assert_eq!(pending.caller_name, "ALICE");
        assert_eq!(pending.participant_ids.len(), 1);

        assert_eq!(
            gate.offer(invite("c2", "carol"), &me, false),
            Err(InviteRejected::InvitePending(CallId::new("c1")))
        );
        assert_eq!(gate.pending().unwrap().call_id, CallId::new("c1"));
    }

    #[test]
    fn test_invite_from_self_or_while_busy_rejected() {
        let mut gate = IncomingCallGate::new();
        let me = ParticipantId::new("alice");

        assert_eq!(
            gate.offer(invite("c1", "alice"), &me, false),
            Err(InviteRejected::FromSelf)
        );
        assert_eq!(
            gate.offer(invite("c1", "carol"), &me, true),
            Err(InviteRejected::AlreadyInCall)
        );
        assert!(gate.pending().is_none());
    }

    #[test]
    fn test_clear_for_only_matching_call() {
        let mut gate = IncomingCallGate::new();
        let me = ParticipantId::new("bob");
        gate.offer(invite("c1", "alice"), &me, false).unwrap();

        assert!(gate.clear_for(&CallId::new("c9")).is_none());
        assert!(gate.clear_for(&CallId::new("c1")).is_some());
        assert!(gate.take().is_none());
    }
}
