use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Relay-assigned, unique per signaling session.
    pub id: String,
    #[serde(rename = "username")]
    pub display_name: String,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRequest {
    Create,
    Join(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RoomPhase {
    #[default]
    Idle,
    /// Waiting for the relay to acknowledge a create/join.
    Joining(JoinRequest),
    InRoom,
}

/// Membership of the room the local client is in. Never contains the local
/// participant itself.
#[derive(Debug, Clone)]
pub struct RoomSession {
    room_id: String,
    local_participant_id: String,
    members: BTreeMap<String, Participant>,
}

impl RoomSession {
    pub fn new(room_id: impl Into<String>, local_participant_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            local_participant_id: local_participant_id.into(),
            members: BTreeMap::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn local_participant_id(&self) -> &str {
        &self.local_participant_id
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains_key(id)
    }

    pub fn member(&self, id: &str) -> Option<&Participant> {
        self.members.get(id)
    }

    pub fn member_ids(&self) -> impl Iterator<Item = &String> {
        self.members.keys()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns true when `participant` was not known before.
    pub fn add_member(&mut self, participant: Participant) -> bool {
        if participant.id == self.local_participant_id {
            return false;
        }
        self.members
            .insert(participant.id.clone(), participant)
            .is_none()
    }

    pub fn remove_member(&mut self, id: &str) -> Option<Participant> {
        self.members.remove(id)
    }

    /// Replaces the member set and returns the ids that dropped out.
    pub fn replace_members(&mut self, participants: impl IntoIterator<Item = Participant>) -> Vec<String> {
        let fresh: BTreeMap<String, Participant> = participants
            .into_iter()
            .filter(|p| p.id != self.local_participant_id)
            .map(|p| (p.id.clone(), p))
            .collect();
        let removed = self
            .members
            .keys()
            .filter(|id| !fresh.contains_key(*id))
            .cloned()
            .collect();
        self.members = fresh;
        removed
    }
}
