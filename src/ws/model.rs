use serde::{Deserialize, Serialize};

use crate::message::model::Message;
use crate::notification::model::{InboxItem, Notification};
use crate::room::model::RoomSummary;
use crate::{notification, room};

/// Frames a client sends over the live channel.
#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Inbound {
    Ping,
    GetNotifications,
    GetRooms,
    MarkRead {
        notification_id: notification::Id,
    },
    SendMessage {
        room_id: room::Id,
        content: String,
    },
}

/// Frames the server sends: replies to `Inbound` plus pushed events.
#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Pong,
    Notifications { data: Vec<InboxItem> },
    NewNotification { data: Notification },
    NewMessage { data: Message },
    Rooms { data: Vec<RoomSummary> },
    Error { message: String },
}

impl Outbound {
    pub fn error(message: impl Into<String>) -> Self {
        Outbound::Error {
            message: message.into(),
        }
    }
}
