use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{participant, room};

use super::{Content, Id, Kind};

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 200;

/// An appended message. Immutable; ordered by `created_at`, then `id`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    id: Id,
    room_id: room::Id,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender: Option<participant::Key>,
    sender_display_name: String,
    content: String,
    message_type: Kind,
    created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        id: Id,
        room_id: room::Id,
        sender: Option<participant::Key>,
        sender_display_name: impl Into<String>,
        content: impl Into<String>,
        message_type: Kind,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            room_id,
            sender,
            sender_display_name: sender_display_name.into(),
            content: content.into(),
            message_type,
            created_at,
        }
    }

    pub const fn id(&self) -> &Id {
        &self.id
    }

    pub const fn room_id(&self) -> &room::Id {
        &self.room_id
    }

    pub const fn sender(&self) -> Option<&participant::Key> {
        self.sender.as_ref()
    }

    pub fn sender_display_name(&self) -> &str {
        &self.sender_display_name
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub const fn message_type(&self) -> Kind {
        self.message_type
    }

    pub const fn created_at(&self) -> &DateTime<Utc> {
        &self.created_at
    }
}

/// A message about to be appended; `sender: None` marks a system message.
#[derive(Clone, Debug)]
pub struct NewMessage {
    room_id: room::Id,
    sender: Option<participant::Key>,
    sender_display_name: String,
    content: String,
    kind: Kind,
}

impl NewMessage {
    pub fn text(room_id: room::Id, sender: &participant::Participant, content: Content) -> Self {
        Self {
            room_id,
            sender: Some(sender.key()),
            sender_display_name: sender.display_name().to_string(),
            content: content.as_str().to_string(),
            kind: Kind::Text,
        }
    }

    pub fn system(room_id: room::Id, content: impl Into<String>) -> Self {
        Self {
            room_id,
            sender: None,
            sender_display_name: String::from("system"),
            content: content.into(),
            kind: Kind::System,
        }
    }

    pub(crate) fn with_room(mut self, room_id: room::Id) -> Self {
        self.room_id = room_id;
        self
    }

    pub const fn room_id(&self) -> &room::Id {
        &self.room_id
    }

    pub const fn sender(&self) -> Option<&participant::Key> {
        self.sender.as_ref()
    }

    pub fn sender_display_name(&self) -> &str {
        &self.sender_display_name
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub const fn kind(&self) -> Kind {
        self.kind
    }

    pub(crate) fn stored(self, id: Id, created_at: DateTime<Utc>) -> Message {
        Message {
            id,
            room_id: self.room_id,
            sender: self.sender,
            sender_display_name: self.sender_display_name,
            content: self.content,
            message_type: self.kind,
            created_at,
        }
    }
}

/// Offset/limit paging over a room's history; offset 0 is the newest page.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct Page {
    #[serde(default)]
    offset: i64,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    DEFAULT_PAGE_LIMIT
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl Page {
    pub fn new(offset: i64, limit: i64) -> Self {
        Self { offset, limit }
    }

    pub fn offset(&self) -> i64 {
        self.offset.max(0)
    }

    pub fn limit(&self) -> i64 {
        self.limit.clamp(1, MAX_PAGE_LIMIT)
    }

    pub fn is_newest(&self) -> bool {
        self.offset() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_clamp_page() {
        let page = Page::new(-5, 10_000);
        assert_eq!(page.offset(), 0);
        assert_eq!(page.limit(), MAX_PAGE_LIMIT);
        assert_eq!(Page::new(0, 0).limit(), 1);
        assert!(Page::default().is_newest());
    }
}
