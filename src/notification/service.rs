use std::collections::BTreeSet;

use async_trait::async_trait;
use log::{debug, info};

use super::model::{InboxItem, NewNotification, Notification, Target};
use super::{Config, Id, Repository};
use crate::hub::Hub;
use crate::participant::{Key, Participant};
use crate::ws::model::Outbound;
use crate::{room, user};

#[async_trait]
pub trait NotificationService {
    /// Resolves `target` once, records a delivery row per recipient and pushes
    /// the notification to whoever is live.
    async fn send(
        &self,
        author: &Participant,
        notification: NewNotification,
        target: &Target,
    ) -> super::Result<Notification>;

    async fn mark_read(&self, participant: &Participant, id: &Id) -> super::Result<()>;

    async fn find_for(&self, participant: &Participant) -> super::Result<Vec<InboxItem>>;
}

pub struct NotificationServiceImpl {
    repo: Repository,
    user_service: user::Service,
    room_service: room::Service,
    hub: Hub,
    cfg: Config,
}

impl NotificationServiceImpl {
    pub fn new(
        repo: Repository,
        user_service: user::Service,
        room_service: room::Service,
        hub: Hub,
        cfg: Config,
    ) -> Self {
        Self {
            repo,
            user_service,
            room_service,
            hub,
            cfg,
        }
    }

    async fn resolve(&self, target: &Target) -> super::Result<BTreeSet<Key>> {
        let members = |users: Vec<user::model::User>| {
            users
                .into_iter()
                .map(|u| Key::Member(*u.id()))
                .collect::<BTreeSet<_>>()
        };

        let recipients = match target {
            Target::All => members(self.user_service.find_all().await?),
            Target::Role { role } => members(self.user_service.find_by_role(role).await?),
            Target::Group { room_id } => {
                let room = self.room_service.find_by_id(room_id).await?;
                if room.kind() != room::Kind::Group {
                    return Err(super::Error::NotAGroup(*room_id));
                }
                self.room_service
                    .find_active_members(room_id)
                    .await?
                    .into_iter()
                    .map(|m| m.participant().clone())
                    .collect()
            }
            Target::Participant { participant } => {
                if let Key::Member(id) = participant {
                    self.user_service.find(id).await?;
                }
                BTreeSet::from([participant.clone()])
            }
        };

        Ok(recipients)
    }
}

#[async_trait]
impl NotificationService for NotificationServiceImpl {
    async fn send(
        &self,
        author: &Participant,
        notification: NewNotification,
        target: &Target,
    ) -> super::Result<Notification> {
        if !author.has_role(self.cfg.sender_role()) {
            return Err(super::Error::Forbidden(self.cfg.sender_role().clone()));
        }

        let notification = notification.validated()?;
        let recipients = self.resolve(target).await?;
        let keys = recipients.iter().cloned().collect::<Vec<_>>();

        let stored = self.repo.create(notification, &keys)?;
        info!(
            "notification {} sent by {} to {} participants",
            stored.id(),
            author.key(),
            keys.len()
        );

        self.hub.push(
            recipients.into_iter().collect(),
            &Outbound::NewNotification {
                data: stored.clone(),
            },
        );

        Ok(stored)
    }

    async fn mark_read(&self, participant: &Participant, id: &Id) -> super::Result<()> {
        if !self.repo.mark_read(&participant.key(), id)? {
            debug!("notification {id} already read by {}", participant.key());
        }
        Ok(())
    }

    async fn find_for(&self, participant: &Participant) -> super::Result<Vec<InboxItem>> {
        self.repo.find_for(&participant.key(), self.cfg.recent())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::hub;
    use crate::integration::cache;
    use crate::notification::repository::MemNotificationRepository;
    use crate::notification::{Error, Kind, Priority};
    use crate::participant::GuestId;
    use crate::room::repository::MemRoomRepository;
    use crate::room::service::{RoomService, RoomServiceImpl};
    use crate::user::model::User;
    use crate::user::repository::{MemUserRepository, UserRepository};
    use crate::user::service::UserServiceImpl;

    struct Fixture {
        service: NotificationServiceImpl,
        rooms: room::Service,
        users: Arc<MemUserRepository>,
        hub: Hub,
    }

    fn fixture() -> Fixture {
        let users = Arc::new(MemUserRepository::new());
        let user_service: user::Service =
            Arc::new(UserServiceImpl::new(users.clone(), cache::Redis::disabled()));
        let hub = Hub::spawn(hub::Config::default());
        let rooms: room::Service = Arc::new(RoomServiceImpl::new(
            Arc::new(MemRoomRepository::new()),
            user_service.clone(),
            hub.clone(),
            room::Config::default(),
        ));
        let service = NotificationServiceImpl::new(
            Arc::new(MemNotificationRepository::new()),
            user_service,
            rooms.clone(),
            hub.clone(),
            Config::default(),
        );
        Fixture {
            service,
            rooms,
            users,
            hub,
        }
    }

    impl Fixture {
        fn member(&self, name: &str, role: &str) -> Participant {
            let user = User::new(user::Id::random(), name, user::Role::new(role));
            self.users.upsert(&user).unwrap();
            Participant::from(user)
        }
    }

    fn notice(title: &str) -> NewNotification {
        NewNotification::new(title, "body", Kind::Announcement, Priority::High)
    }

    fn guest(id: &str) -> Participant {
        Participant::Guest {
            guest_id: GuestId::parse(id).unwrap(),
            display_name: "Guest".into(),
        }
    }

    #[tokio::test]
    async fn should_mark_read_idempotently() {
        let f = fixture();
        let admin = f.member("Ada", "admin");
        let bob = f.member("Bob", "member");

        let sent = f
            .service
            .send(&admin, notice("hi"), &Target::Participant { participant: bob.key() })
            .await
            .unwrap();

        f.service.mark_read(&bob, sent.id()).await.unwrap();
        let first = f.service.find_for(&bob).await.unwrap()[0]
            .read_at()
            .copied()
            .unwrap();

        f.service.mark_read(&bob, sent.id()).await.unwrap();
        let second = f.service.find_for(&bob).await.unwrap()[0]
            .read_at()
            .copied()
            .unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn should_not_mark_unaddressed_notification() {
        let f = fixture();
        let admin = f.member("Ada", "admin");
        let bob = f.member("Bob", "member");
        let eve = f.member("Eve", "member");

        let sent = f
            .service
            .send(&admin, notice("hi"), &Target::Participant { participant: bob.key() })
            .await
            .unwrap();

        assert!(matches!(
            f.service.mark_read(&eve, sent.id()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn should_resolve_role_at_send_time() {
        let f = fixture();
        let admin = f.member("Ada", "admin");
        let early = f.member("Early", "staff");

        f.service
            .send(
                &admin,
                notice("staff meeting"),
                &Target::Role {
                    role: user::Role::new("staff"),
                },
            )
            .await
            .unwrap();
        let late = f.member("Late", "staff");

        assert_eq!(f.service.find_for(&early).await.unwrap().len(), 1);
        assert!(f.service.find_for(&late).await.unwrap().is_empty());
        assert!(f.service.find_for(&admin).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_address_every_member_for_all() {
        let f = fixture();
        let admin = f.member("Ada", "admin");
        let bob = f.member("Bob", "member");
        let visitor = guest("visitor");

        f.service
            .send(&admin, notice("maintenance"), &Target::All)
            .await
            .unwrap();

        assert_eq!(f.service.find_for(&admin).await.unwrap().len(), 1);
        assert_eq!(f.service.find_for(&bob).await.unwrap().len(), 1);
        assert!(f.service.find_for(&visitor).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_address_active_group_members() {
        let f = fixture();
        let admin = f.member("Ada", "admin");
        let bob = f.member("Bob", "member");
        let cid = f.member("Cid", "member");
        let bob_id = match &bob {
            Participant::Member { id, .. } => *id,
            Participant::Guest { .. } => unreachable!(),
        };
        let cid_id = match &cid {
            Participant::Member { id, .. } => *id,
            Participant::Guest { .. } => unreachable!(),
        };

        let group = f
            .rooms
            .create_group(&admin, "ops", false, &[bob_id, cid_id])
            .await
            .unwrap();
        f.rooms.leave_room(group.id(), &cid).await.unwrap();

        f.service
            .send(&admin, notice("deploy"), &Target::Group { room_id: *group.id() })
            .await
            .unwrap();

        assert_eq!(f.service.find_for(&bob).await.unwrap().len(), 1);
        assert!(f.service.find_for(&cid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_refuse_non_admin_author() {
        let f = fixture();
        let bob = f.member("Bob", "member");

        assert!(matches!(
            f.service.send(&bob, notice("spam"), &Target::All).await,
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            f.service
                .send(&guest("g"), notice("spam"), &Target::All)
                .await,
            Err(Error::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn should_push_to_live_recipients() {
        let f = fixture();
        let admin = f.member("Ada", "admin");
        let visitor = guest("visitor");

        let mut conn = f.hub.register(visitor.key()).await.unwrap();
        f.service
            .send(
                &admin,
                notice("welcome"),
                &Target::Participant {
                    participant: visitor.key(),
                },
            )
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), conn.outbox.recv())
            .await
            .unwrap()
            .unwrap();
        let frame: serde_json::Value = serde_json::from_str(frame.as_str()).unwrap();
        assert_eq!(frame["type"], "new_notification");
        assert_eq!(frame["data"]["title"], "welcome");
        assert_eq!(frame["data"]["priority"], "high");
    }
}
