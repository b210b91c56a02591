use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::{integration, participant, user};

pub mod middleware;
pub mod service;

type Result<T> = std::result::Result<T, Error>;
pub type Service = Arc<dyn service::IdentityService + Send + Sync>;

const DEFAULT_GUEST_NAME: &str = "Guest";
const MAX_DISPLAY_NAME_LEN: usize = 64;

#[derive(Clone)]
pub struct Config {
    jwt_secret: String,
    token_ttl: Duration,
}

impl Config {
    pub fn new(jwt_secret: impl Into<String>, token_ttl: Duration) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            token_ttl,
        }
    }

    pub fn env() -> std::result::Result<Self, integration::Error> {
        let jwt_secret = integration::env_required("JWT_SECRET")?;
        let ttl = integration::env_u64("TOKEN_TTL", 3600)?;
        Ok(Self::new(jwt_secret, Duration::from_secs(ttl)))
    }

    pub fn jwt_secret(&self) -> &[u8] {
        self.jwt_secret.as_bytes()
    }

    pub const fn token_ttl(&self) -> Duration {
        self.token_ttl
    }
}

/// Credentials presented by a connection or a request, before resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    Token(String),
    Guest {
        guest_id: String,
        guest_name: Option<String>,
    },
    Anonymous,
}

/// Query string of the live-channel URL: `?token=` for members, `?guestId=&guestName=` for guests.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsParams {
    token: Option<String>,
    guest_id: Option<String>,
    guest_name: Option<String>,
}

impl From<CredentialsParams> for Credentials {
    fn from(p: CredentialsParams) -> Self {
        match (p.token, p.guest_id) {
            (Some(token), _) if !token.is_empty() => Credentials::Token(token),
            (_, Some(guest_id)) => Credentials::Guest {
                guest_id,
                guest_name: p.guest_name,
            },
            _ => Credentials::Anonymous,
        }
    }
}

pub(crate) fn guest_display_name(name: Option<&str>) -> String {
    match name.map(str::trim) {
        Some(n) if !n.is_empty() => n.chars().take(MAX_DISPLAY_NAME_LEN).collect(),
        _ => DEFAULT_GUEST_NAME.to_string(),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unauthorized")]
    Unauthorized,
    #[error("token is malformed or expired")]
    InvalidToken,
    #[error("unknown member: {0}")]
    UnknownMember(user::Id),
    #[error(transparent)]
    InvalidGuest(#[from] participant::Error),

    #[error(transparent)]
    _User(#[from] user::Error),
    #[error(transparent)]
    _Jwt(#[from] jsonwebtoken::errors::Error),
}

impl From<&Error> for axum::http::StatusCode {
    fn from(e: &Error) -> Self {
        match e {
            Error::Unauthorized
            | Error::InvalidToken
            | Error::UnknownMember(_)
            | Error::InvalidGuest(_)
            | Error::_Jwt(_) => Self::UNAUTHORIZED,
            Error::_User(_) => Self::INTERNAL_SERVER_ERROR,
        }
    }
}
