use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use repository::RoomRepository;
use service::RoomService;

use crate::{integration, message, participant, state::AppState, user};

mod handler;
pub mod model;
pub mod repository;
pub mod service;

type Result<T> = std::result::Result<T, Error>;
pub type Repository = Arc<dyn RoomRepository + Send + Sync>;
pub type Service = Arc<dyn RoomService + Send + Sync>;

pub fn api<S>(s: AppState) -> Router<S> {
    Router::new()
        .route("/rooms", get(handler::api::find_all))
        .route("/rooms/support", post(handler::api::open_support))
        .route("/rooms/private", post(handler::api::open_private))
        .route("/rooms/group", post(handler::api::create_group))
        .route(
            "/rooms/{id}/messages",
            get(handler::api::find_messages).post(handler::api::send_message),
        )
        .route("/rooms/{id}/close", post(handler::api::close))
        .route("/rooms/{id}/leave", post(handler::api::leave))
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

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Private,
    Group,
    Support,
}

impl Kind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Kind::Private => "private",
            Kind::Group => "group",
            Kind::Support => "support",
        }
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "private" => Ok(Kind::Private),
            "group" => Ok(Kind::Group),
            "support" => Ok(Kind::Support),
            other => Err(Error::Malformed(format!("room kind '{other}'"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "member" => Ok(Role::Member),
            "admin" => Ok(Role::Admin),
            other => Err(Error::Malformed(format!("membership role '{other}'"))),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    admin_role: user::Role,
    retention: Duration,
    sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin_role: user::Role::new("admin"),
            retention: Duration::from_secs(180 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl Config {
    pub fn env() -> std::result::Result<Self, integration::Error> {
        let admin_role = std::env::var("ADMIN_ROLE").unwrap_or_else(|_| "admin".into());
        let retention_days = integration::env_u64("RETENTION_DAYS", 180)?;
        let sweep_secs = integration::env_u64("RETENTION_SWEEP_SECS", 60 * 60)?;

        Ok(Self {
            admin_role: user::Role::new(admin_role),
            retention: Duration::from_secs(retention_days * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(sweep_secs.max(1)),
        })
    }

    pub const fn admin_role(&self) -> &user::Role {
        &self.admin_role
    }

    pub const fn retention(&self) -> Duration {
        self.retention
    }

    pub const fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("room not found: {0}")]
    NotFound(Id),
    #[error("not an active member of room {0}")]
    NotAMember(Id),
    #[error("room {0} is closed")]
    Closed(Id),
    #[error("only guests can open a support room")]
    NotAGuest,
    #[error("only members can open private or group rooms")]
    NotAMemberAccount,
    #[error("cannot open a private room with oneself")]
    SelfChat,
    #[error("missing group name")]
    MissingName,
    #[error("group needs at least one other member")]
    NotEnoughMembers,
    #[error("unexpected stored value: {0}")]
    Malformed(String),

    #[error(transparent)]
    _Message(#[from] message::Error),
    #[error(transparent)]
    _Participant(#[from] participant::Error),
    #[error(transparent)]
    _User(#[from] user::Error),
    #[error(transparent)]
    _R2d2(#[from] r2d2::Error),
    #[error(transparent)]
    _Diesel(#[from] diesel::result::Error),
}
