use std::sync::Arc;

use axum::extract::FromRef;

use crate::hub::Hub;
use crate::identity::service::JwtIdentityService;
use crate::integration::{self, cache, db};
use crate::notification::repository::{MemNotificationRepository, PgNotificationRepository};
use crate::notification::service::NotificationServiceImpl;
use crate::room::repository::{MemRoomRepository, PgRoomRepository};
use crate::room::service::RoomServiceImpl;
use crate::user::repository::{MemUserRepository, PgUserRepository};
use crate::user::service::UserServiceImpl;
use crate::{identity, notification, room, user};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub identity_service: identity::Service,
    pub user_service: user::Service,
    pub room_service: room::Service,
    pub notification_service: notification::Service,
    pub hub: Hub,
}

/// Storage backends behind the services.
pub struct Repositories {
    pub user: user::Repository,
    pub room: room::Repository,
    pub notification: notification::Repository,
}

impl Repositories {
    pub fn postgres(pool: db::Pool) -> Self {
        Self {
            user: Arc::new(PgUserRepository::new(pool.clone())),
            room: Arc::new(PgRoomRepository::new(pool.clone())),
            notification: Arc::new(PgNotificationRepository::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            user: Arc::new(MemUserRepository::new()),
            room: Arc::new(MemRoomRepository::new()),
            notification: Arc::new(MemNotificationRepository::new()),
        }
    }
}

impl AppState {
    pub async fn init(cfg: &integration::Config) -> Result<Self, integration::Error> {
        let repos = match cfg.db.as_ref() {
            Some(db_cfg) => {
                let pool = db::init(db_cfg)?;
                db::migrate(&pool)?;
                Repositories::postgres(pool)
            }
            None => Repositories::in_memory(),
        };
        let redis = cache::Redis::connect(cfg.redis.as_ref()).await;

        Ok(Self::assemble(repos, redis, cfg))
    }

    /// Wires services over the given repositories. Spawns the hub, so it needs a running runtime.
    pub fn assemble(repos: Repositories, redis: cache::Redis, cfg: &integration::Config) -> Self {
        let hub = Hub::spawn(cfg.hub.clone());

        let user_service: user::Service = Arc::new(UserServiceImpl::new(repos.user, redis));
        let identity_service: identity::Service = Arc::new(JwtIdentityService::new(
            cfg.identity.clone(),
            user_service.clone(),
        ));
        let room_service: room::Service = Arc::new(RoomServiceImpl::new(
            repos.room,
            user_service.clone(),
            hub.clone(),
            cfg.room.clone(),
        ));
        let notification_service: notification::Service =
            Arc::new(NotificationServiceImpl::new(
                repos.notification,
                user_service.clone(),
                room_service.clone(),
                hub.clone(),
                cfg.notification.clone(),
            ));

        Self {
            identity_service,
            user_service,
            room_service,
            notification_service,
            hub,
        }
    }
}
