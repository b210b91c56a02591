use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use repository::NotificationRepository;
use service::NotificationService;

use crate::{integration, participant, room, state::AppState, user};

mod handler;
pub mod model;
pub mod repository;
pub mod service;

type Result<T> = std::result::Result<T, Error>;
pub type Repository = Arc<dyn NotificationRepository + Send + Sync>;
pub type Service = Arc<dyn NotificationService + Send + Sync>;

pub fn api<S>(s: AppState) -> Router<S> {
    Router::new()
        .route(
            "/notifications",
            get(handler::api::find_all).post(handler::api::send),
        )
        .route("/notifications/{id}/read", post(handler::api::mark_read))
        .with_state(s)
}

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

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
    Announcement,
}

impl Kind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Kind::Info => "info",
            Kind::Success => "success",
            Kind::Warning => "warning",
            Kind::Error => "error",
            Kind::Announcement => "announcement",
        }
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "info" => Ok(Kind::Info),
            "success" => Ok(Kind::Success),
            "warning" => Ok(Kind::Warning),
            "error" => Ok(Kind::Error),
            "announcement" => Ok(Kind::Announcement),
            other => Err(Error::Malformed(format!("notification kind '{other}'"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(Error::Malformed(format!("notification priority '{other}'"))),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    recent: i64,
    sender_role: user::Role,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recent: 50,
            sender_role: user::Role::new("admin"),
        }
    }
}

impl Config {
    pub fn env() -> std::result::Result<Self, integration::Error> {
        let recent = integration::env_u64("RECENT_NOTIFICATIONS", 50)?;
        let sender_role = std::env::var("ADMIN_ROLE").unwrap_or_else(|_| "admin".into());

        Ok(Self {
            recent: i64::try_from(recent).unwrap_or(i64::MAX),
            sender_role: user::Role::new(sender_role),
        })
    }

    /// How many already-read notifications accompany the unread ones.
    pub const fn recent(&self) -> i64 {
        self.recent
    }

    pub const fn sender_role(&self) -> &user::Role {
        &self.sender_role
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("notification not found: {0}")]
    NotFound(Id),
    #[error("only {0} members can send notifications")]
    Forbidden(user::Role),
    #[error("notification title is empty")]
    EmptyTitle,
    #[error("room {0} is not a group")]
    NotAGroup(room::Id),
    #[error("unexpected stored value: {0}")]
    Malformed(String),

    #[error(transparent)]
    _Participant(#[from] participant::Error),
    #[error(transparent)]
    _Room(#[from] room::Error),
    #[error(transparent)]
    _User(#[from] user::Error),
    #[error(transparent)]
    _R2d2(#[from] r2d2::Error),
    #[error(transparent)]
    _Diesel(#[from] diesel::result::Error),
}
