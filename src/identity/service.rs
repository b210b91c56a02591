use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Config, Credentials};
use crate::participant::{GuestId, Participant};
use crate::user;

#[derive(Serialize, Deserialize)]
struct Claims {
    sub: Uuid,
    exp: u64,
}

#[async_trait]
pub trait IdentityService {
    /// Maps credentials to a participant; anything unverifiable is `Unauthorized`.
    async fn resolve(&self, credentials: &Credentials) -> super::Result<Participant>;

    /// Issues a member session token.
    fn issue(&self, member: &user::Id) -> super::Result<String>;
}

pub struct JwtIdentityService {
    cfg: Config,
    user_service: user::Service,
    validation: Validation,
}

impl JwtIdentityService {
    pub fn new(cfg: Config, user_service: user::Service) -> Self {
        let validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        Self {
            cfg,
            user_service,
            validation,
        }
    }
}

#[async_trait]
impl IdentityService for JwtIdentityService {
    async fn resolve(&self, credentials: &Credentials) -> super::Result<Participant> {
        match credentials {
            Credentials::Token(token) => {
                let claims = decode::<Claims>(
                    token,
                    &DecodingKey::from_secret(self.cfg.jwt_secret()),
                    &self.validation,
                )
                .map_err(|e| {
                    debug!("rejecting session token: {e}");
                    super::Error::InvalidToken
                })?
                .claims;

                let id = user::Id::from(claims.sub);
                match self.user_service.find(&id).await {
                    Ok(u) => Ok(Participant::from(u)),
                    Err(user::Error::NotFound(_)) => {
                        warn!("valid token for unknown member {id}");
                        Err(super::Error::UnknownMember(id))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Credentials::Guest {
                guest_id,
                guest_name,
            } => {
                let guest_id = GuestId::parse(guest_id)?;
                Ok(Participant::Guest {
                    guest_id,
                    display_name: super::guest_display_name(guest_name.as_deref()),
                })
            }
            Credentials::Anonymous => Err(super::Error::Unauthorized),
        }
    }

    fn issue(&self, member: &user::Id) -> super::Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let claims = Claims {
            sub: *member.get(),
            exp: now + self.cfg.token_ttl().as_secs(),
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.cfg.jwt_secret()),
        )?;
        Ok(token)
    }
}
