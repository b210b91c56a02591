use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod model;

pub const MAX_CONTENT_LEN: usize = 4000;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Id(i64);

impl Id {
    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for Id {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Text,
    System,
}

impl Kind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Kind::Text => "text",
            Kind::System => "system",
        }
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Kind::Text),
            "system" => Ok(Kind::System),
            other => Err(Error::UnknownKind(other.to_string())),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("message content is empty")]
    EmptyContent,
    #[error("message content exceeds {MAX_CONTENT_LEN} characters")]
    TooLong,
    #[error("unknown message kind: {0}")]
    UnknownKind(String),
}

/// Validated message body: non-blank, at most `MAX_CONTENT_LEN` characters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Content(String);

impl Content {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if raw.trim().is_empty() {
            return Err(Error::EmptyContent);
        }
        if raw.chars().count() > MAX_CONTENT_LEN {
            return Err(Error::TooLong);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
