use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::user::{self, Role};

const MEMBER_PREFIX: &str = "member:";
const GUEST_PREFIX: &str = "guest:";
pub const MAX_GUEST_ID_LEN: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed participant key: {0}")]
    MalformedKey(String),
    #[error("guest id must be 1..={MAX_GUEST_ID_LEN} characters")]
    InvalidGuestId,
}

/// Client-chosen guest identifier, stable for the lifetime of the guest's local session.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct GuestId(String);

impl GuestId {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let raw = raw.trim();
        if raw.is_empty() || raw.chars().count() > MAX_GUEST_ID_LEN {
            return Err(Error::InvalidGuestId);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for GuestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        GuestId::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl Display for GuestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage and wire identity of a participant: `member:<uuid>` or `guest:<id>`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Key {
    Member(user::Id),
    Guest(GuestId),
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Member(id) => write!(f, "{MEMBER_PREFIX}{id}"),
            Key::Guest(id) => write!(f, "{GUEST_PREFIX}{id}"),
        }
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(id) = s.strip_prefix(MEMBER_PREFIX) {
            let uuid = Uuid::parse_str(id).map_err(|_| Error::MalformedKey(s.to_string()))?;
            return Ok(Key::Member(uuid.into()));
        }
        if let Some(id) = s.strip_prefix(GUEST_PREFIX) {
            return GuestId::parse(id)
                .map(Key::Guest)
                .map_err(|_| Error::MalformedKey(s.to_string()));
        }
        Err(Error::MalformedKey(s.to_string()))
    }
}

impl Serialize for Key {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A resolved identity: either a directory member or a self-asserted guest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Participant {
    Member {
        id: user::Id,
        display_name: String,
        role: Role,
    },
    Guest {
        guest_id: GuestId,
        display_name: String,
    },
}

impl Participant {
    pub fn key(&self) -> Key {
        match self {
            Participant::Member { id, .. } => Key::Member(*id),
            Participant::Guest { guest_id, .. } => Key::Guest(guest_id.clone()),
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            Participant::Member { display_name, .. } | Participant::Guest { display_name, .. } => {
                display_name
            }
        }
    }

    pub fn has_role(&self, role: &Role) -> bool {
        matches!(self, Participant::Member { role: r, .. } if r == role)
    }
}

impl From<user::model::User> for Participant {
    fn from(u: user::model::User) -> Self {
        Participant::Member {
            id: *u.id(),
            display_name: u.display_name().to_string(),
            role: u.role().clone(),
        }
    }
}
