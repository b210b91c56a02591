use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{participant, room, user};

use super::{Id, Kind, Priority};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    id: Id,
    title: String,
    body: String,
    #[serde(rename = "type")]
    kind: Kind,
    priority: Priority,
    created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        id: Id,
        title: impl Into<String>,
        body: impl Into<String>,
        kind: Kind,
        priority: Priority,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            body: body.into(),
            kind,
            priority,
            created_at,
        }
    }

    pub const fn id(&self) -> &Id {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub const fn kind(&self) -> Kind {
        self.kind
    }

    pub const fn priority(&self) -> Priority {
        self.priority
    }

    pub const fn created_at(&self) -> &DateTime<Utc> {
        &self.created_at
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewNotification {
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default, rename = "type")]
    kind: Kind,
    #[serde(default)]
    priority: Priority,
}

impl NewNotification {
    pub fn new(
        title: impl Into<String>,
        body: impl Into<String>,
        kind: Kind,
        priority: Priority,
    ) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            kind,
            priority,
        }
    }

    pub fn validated(self) -> super::Result<Self> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(super::Error::EmptyTitle);
        }
        Ok(Self {
            title: title.to_string(),
            ..self
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub const fn kind(&self) -> Kind {
        self.kind
    }

    pub const fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn stored(self, id: Id, created_at: DateTime<Utc>) -> Notification {
        Notification::new(id, self.title, self.body, self.kind, self.priority, created_at)
    }
}

/// Per-participant delivery record. `read_at` is set once and never cleared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryStatus {
    notification_id: Id,
    participant: participant::Key,
    delivered_at: DateTime<Utc>,
    read_at: Option<DateTime<Utc>>,
}

impl DeliveryStatus {
    pub fn new(notification_id: Id, participant: participant::Key, delivered_at: DateTime<Utc>) -> Self {
        Self {
            notification_id,
            participant,
            delivered_at,
            read_at: None,
        }
    }

    pub const fn notification_id(&self) -> &Id {
        &self.notification_id
    }

    pub const fn participant(&self) -> &participant::Key {
        &self.participant
    }

    pub const fn delivered_at(&self) -> &DateTime<Utc> {
        &self.delivered_at
    }

    pub const fn read_at(&self) -> Option<&DateTime<Utc>> {
        self.read_at.as_ref()
    }

    /// Returns `false` when it was already read.
    pub(crate) fn mark_read(&mut self, at: DateTime<Utc>) -> bool {
        if self.read_at.is_some() {
            return false;
        }
        self.read_at = Some(at);
        true
    }
}

/// A notification as seen by one recipient.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InboxItem {
    #[serde(flatten)]
    notification: Notification,
    delivered_at: DateTime<Utc>,
    read_at: Option<DateTime<Utc>>,
}

impl InboxItem {
    pub fn new(
        notification: Notification,
        delivered_at: DateTime<Utc>,
        read_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            notification,
            delivered_at,
            read_at,
        }
    }

    pub const fn notification(&self) -> &Notification {
        &self.notification
    }

    pub const fn read_at(&self) -> Option<&DateTime<Utc>> {
        self.read_at.as_ref()
    }
}

/// Who a notification is addressed to; resolved once, at send time.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Target {
    All,
    Role { role: user::Role },
    Group { room_id: room::Id },
    Participant { participant: participant::Key },
}
