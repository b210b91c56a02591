use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::message::model::Message;
use crate::{message, participant};

use super::{Id, Kind, Role};

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    id: Id,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    kind: Kind,
    is_public: bool,
    is_active: bool,
    updated_at: DateTime<Utc>,
}

impl Room {
    pub fn new(
        id: Id,
        name: Option<String>,
        kind: Kind,
        is_public: bool,
        is_active: bool,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            kind,
            is_public,
            is_active,
            updated_at,
        }
    }

    pub const fn id(&self) -> &Id {
        &self.id
    }

    pub const fn kind(&self) -> Kind {
        self.kind
    }

    pub const fn is_active(&self) -> bool {
        self.is_active
    }

    pub const fn updated_at(&self) -> &DateTime<Utc> {
        &self.updated_at
    }

    pub(crate) fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    pub(crate) fn deactivate(&mut self) {
        self.is_active = false;
    }
}

/// The (room, participant) relation. At most one row per pair; leaving flips `is_active`.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    room_id: Id,
    participant: participant::Key,
    display_name: String,
    role: Role,
    is_active: bool,
    joined_at: DateTime<Utc>,
    #[serde(skip)]
    last_read: Option<message::Id>,
}

impl Membership {
    pub fn new(
        room_id: Id,
        participant: participant::Key,
        display_name: impl Into<String>,
        role: Role,
        joined_at: DateTime<Utc>,
    ) -> Self {
        Self {
            room_id,
            participant,
            display_name: display_name.into(),
            role,
            is_active: true,
            joined_at,
            last_read: None,
        }
    }

    pub(crate) fn restored(
        mut self,
        is_active: bool,
        last_read: Option<message::Id>,
    ) -> Self {
        self.is_active = is_active;
        self.last_read = last_read;
        self
    }

    pub const fn room_id(&self) -> &Id {
        &self.room_id
    }

    pub const fn participant(&self) -> &participant::Key {
        &self.participant
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    pub const fn is_active(&self) -> bool {
        self.is_active
    }

    pub const fn joined_at(&self) -> &DateTime<Utc> {
        &self.joined_at
    }

    pub const fn last_read(&self) -> Option<message::Id> {
        self.last_read
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.is_active = active;
    }

    pub(crate) fn advance_last_read(&mut self, to: message::Id) {
        if self.last_read.is_none_or(|current| current < to) {
            self.last_read = Some(to);
        }
    }
}

/// A member to add when creating a room.
#[derive(Clone, Debug)]
pub struct NewMember {
    pub participant: participant::Key,
    pub display_name: String,
    pub role: Role,
}

impl NewMember {
    pub fn new(participant: participant::Key, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            participant,
            display_name: display_name.into(),
            role,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    #[serde(flatten)]
    room: Room,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_message: Option<Message>,
    members: Vec<String>,
    unread_count: i64,
}

impl RoomSummary {
    pub fn new(
        room: Room,
        last_message: Option<Message>,
        members: Vec<String>,
        unread_count: i64,
    ) -> Self {
        Self {
            room,
            last_message,
            members,
            unread_count,
        }
    }

    pub const fn room(&self) -> &Room {
        &self.room
    }

    pub const fn last_message(&self) -> Option<&Message> {
        self.last_message.as_ref()
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub const fn unread_count(&self) -> i64 {
        self.unread_count
    }
}
