use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info};
use tokio::sync::OwnedMutexGuard;

use super::model::{Membership, NewMember, Room, RoomSummary};
use super::{Config, Id, Repository, Role};
use crate::hub::Hub;
use crate::message::Content;
use crate::message::model::{Message, NewMessage, Page};
use crate::participant::{Key, Participant};
use crate::ws::model::Outbound;
use crate::user;

#[async_trait]
pub trait RoomService {
    /// Finds the guest's active support room or opens one staffed by every admin.
    async fn open_support(&self, guest: &Participant) -> super::Result<Room>;

    async fn open_private(&self, caller: &Participant, other: &user::Id) -> super::Result<Room>;

    async fn create_group(
        &self,
        creator: &Participant,
        name: &str,
        is_public: bool,
        members: &[user::Id],
    ) -> super::Result<Room>;

    async fn list_rooms(&self, participant: &Participant) -> super::Result<Vec<RoomSummary>>;

    async fn list_messages(
        &self,
        room_id: &Id,
        participant: &Participant,
        page: &Page,
    ) -> super::Result<Vec<Message>>;

    /// Appends a text message and fans it out to the room's live members.
    async fn send_message(
        &self,
        room_id: &Id,
        sender: &Participant,
        content: &str,
    ) -> super::Result<Message>;

    async fn close_room(&self, room_id: &Id, participant: &Participant) -> super::Result<()>;

    async fn leave_room(&self, room_id: &Id, participant: &Participant) -> super::Result<()>;

    async fn find_by_id(&self, room_id: &Id) -> super::Result<Room>;

    async fn find_active_members(&self, room_id: &Id) -> super::Result<Vec<Membership>>;

    /// Deletes messages past the retention window.
    async fn prune_messages(&self) -> super::Result<usize>;
}

type Gates = Mutex<HashMap<Id, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive turn on one room. Dropping it removes the room's gate once
/// nobody else holds or waits for it.
struct Turn<'a> {
    gates: &'a Gates,
    room_id: Id,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        drop(self.guard.take());
        if gates
            .get(&self.room_id)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            gates.remove(&self.room_id);
        }
    }
}

pub struct RoomServiceImpl {
    repo: Repository,
    user_service: user::Service,
    hub: Hub,
    cfg: Config,
    gates: Gates,
}

impl RoomServiceImpl {
    pub fn new(repo: Repository, user_service: user::Service, hub: Hub, cfg: Config) -> Self {
        Self {
            repo,
            user_service,
            hub,
            cfg,
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Per-room gate held from append until the push is queued, so every
    /// recipient sees a room's messages in append order.
    async fn turn(&self, room_id: &Id) -> Turn<'_> {
        let gate = {
            let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
            gates.entry(*room_id).or_default().clone()
        };
        Turn {
            gates: &self.gates,
            room_id: *room_id,
            guard: Some(gate.lock_owned().await),
        }
    }

    fn fan_out(&self, recipients: HashSet<Key>, msg: &Message) {
        debug!(
            "fanning out message {} of room {} to {} participants",
            msg.id(),
            msg.room_id(),
            recipients.len()
        );
        self.hub.push(
            recipients,
            &Outbound::NewMessage {
                data: msg.clone(),
            },
        );
    }

    fn active_keys(&self, room_id: &Id) -> super::Result<HashSet<Key>> {
        Ok(self
            .repo
            .find_active_members(room_id)?
            .into_iter()
            .map(|m| m.participant().clone())
            .collect())
    }

    async fn member_of(&self, caller: &Participant, id: &user::Id) -> super::Result<NewMember> {
        let user = self.user_service.find(id).await?;
        let key = Key::Member(*user.id());
        if key == caller.key() {
            return Err(super::Error::SelfChat);
        }
        Ok(NewMember::new(key, user.display_name(), Role::Member))
    }

    async fn display_name_of(&self, membership: &Membership) -> String {
        match membership.participant() {
            Key::Member(id) => match self.user_service.find(id).await {
                Ok(u) => u.display_name().to_string(),
                Err(e) => {
                    debug!("falling back to stored name of {id}: {e}");
                    membership.display_name().to_string()
                }
            },
            Key::Guest(_) => membership.display_name().to_string(),
        }
    }
}

#[async_trait]
impl RoomService for RoomServiceImpl {
    async fn open_support(&self, guest: &Participant) -> super::Result<Room> {
        if !matches!(guest, Participant::Guest { .. }) {
            return Err(super::Error::NotAGuest);
        }

        let admins = self
            .user_service
            .find_by_role(self.cfg.admin_role())
            .await?
            .into_iter()
            .map(|u| NewMember::new(Key::Member(*u.id()), u.display_name(), Role::Admin))
            .collect::<Vec<_>>();

        let guest_member = NewMember::new(guest.key(), guest.display_name(), Role::Member);
        let greeting = format!("{} started a support chat", guest.display_name());

        let room = self
            .repo
            .find_or_create_support(&guest_member, &admins, &greeting)?;
        debug!("support room {} for {}", room.id(), guest.key());
        Ok(room)
    }

    async fn open_private(&self, caller: &Participant, other: &user::Id) -> super::Result<Room> {
        if !matches!(caller, Participant::Member { .. }) {
            return Err(super::Error::NotAMemberAccount);
        }

        let me = NewMember::new(caller.key(), caller.display_name(), Role::Member);
        let them = self.member_of(caller, other).await?;

        self.repo.find_or_create_private(&me, &them)
    }

    async fn create_group(
        &self,
        creator: &Participant,
        name: &str,
        is_public: bool,
        members: &[user::Id],
    ) -> super::Result<Room> {
        if !matches!(creator, Participant::Member { .. }) {
            return Err(super::Error::NotAMemberAccount);
        }

        let name = name.trim();
        if name.is_empty() {
            return Err(super::Error::MissingName);
        }

        let creator_key = creator.key();
        let mut seen = HashSet::new();
        let mut new_members = vec![NewMember::new(
            creator_key.clone(),
            creator.display_name(),
            Role::Admin,
        )];
        for id in members {
            if Key::Member(*id) == creator_key || !seen.insert(*id) {
                continue;
            }
            new_members.push(self.member_of(creator, id).await?);
        }

        if new_members.len() < 2 {
            return Err(super::Error::NotEnoughMembers);
        }

        self.repo.create_group(name, is_public, &new_members)
    }

    async fn list_rooms(&self, participant: &Participant) -> super::Result<Vec<RoomSummary>> {
        let key = participant.key();
        let rooms = self.repo.find_by_participant(&key)?;

        let mut summaries = Vec::with_capacity(rooms.len());
        for (room, membership) in rooms {
            let last_message = self.repo.find_last_message(room.id())?;
            let unread = self.repo.count_unread(&membership)?;

            let mut members = Vec::new();
            for m in self.repo.find_active_members(room.id())? {
                if m.participant() != &key {
                    members.push(self.display_name_of(&m).await);
                }
            }

            summaries.push(RoomSummary::new(room, last_message, members, unread));
        }

        Ok(summaries)
    }

    async fn list_messages(
        &self,
        room_id: &Id,
        participant: &Participant,
        page: &Page,
    ) -> super::Result<Vec<Message>> {
        let room = self.repo.find_by_id(room_id)?;
        let key = participant.key();

        // history of a closed room stays readable to anyone who was in it
        let membership = match self.repo.find_membership(room_id, &key)? {
            Some(m) if m.is_active() || !room.is_active() => m,
            _ => return Err(super::Error::NotAMember(*room_id)),
        };

        let messages = self.repo.find_messages(room_id, page)?;

        if page.is_newest() && membership.is_active() {
            if let Some(newest) = messages.last() {
                self.repo.mark_read(room_id, &key, newest.id())?;
            }
        }

        Ok(messages)
    }

    async fn send_message(
        &self,
        room_id: &Id,
        sender: &Participant,
        content: &str,
    ) -> super::Result<Message> {
        let content = Content::parse(content)?;

        let _turn = self.turn(room_id).await;

        let msg = self
            .repo
            .append(&NewMessage::text(*room_id, sender, content))?;

        // the append is committed; a failed lookup only costs the live push
        match self.active_keys(room_id) {
            Ok(recipients) => self.fan_out(recipients, &msg),
            Err(e) => error!("failed to resolve members of room {room_id}: {e}"),
        }

        Ok(msg)
    }

    async fn close_room(&self, room_id: &Id, participant: &Participant) -> super::Result<()> {
        let _turn = self.turn(room_id).await;

        let recipients = self.active_keys(room_id)?;
        let notice = NewMessage::system(
            *room_id,
            format!("{} closed the room", participant.display_name()),
        );

        if let Some(msg) = self.repo.close(room_id, &participant.key(), notice)? {
            info!("room {room_id} closed by {}", participant.key());
            self.fan_out(recipients, &msg);
        }

        Ok(())
    }

    async fn leave_room(&self, room_id: &Id, participant: &Participant) -> super::Result<()> {
        let key = participant.key();
        if self.repo.deactivate_member(room_id, &key)? {
            debug!("{key} left room {room_id}");
            return Ok(());
        }

        self.repo.find_by_id(room_id)?;
        Err(super::Error::NotAMember(*room_id))
    }

    async fn find_by_id(&self, room_id: &Id) -> super::Result<Room> {
        self.repo.find_by_id(room_id)
    }

    async fn find_active_members(&self, room_id: &Id) -> super::Result<Vec<Membership>> {
        self.repo.find_by_id(room_id)?;
        self.repo.find_active_members(room_id)
    }

    async fn prune_messages(&self) -> super::Result<usize> {
        let retention = chrono::Duration::from_std(self.cfg.retention())
            .map_err(|e| super::Error::Malformed(e.to_string()))?;

        self.repo.prune_messages_older_than(Utc::now() - retention)
    }
}

/// Background retention sweep; runs until the process exits.
pub async fn run_retention(service: super::Service, cfg: Config) {
    let mut interval = tokio::time::interval(cfg.sweep_interval());
    loop {
        interval.tick().await;
        match service.prune_messages().await {
            Ok(0) => debug!("retention sweep removed nothing"),
            Ok(n) => info!("retention sweep removed {n} messages"),
            Err(e) => error!("retention sweep failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::hub::{self, Frame};
    use crate::message;
    use crate::participant::GuestId;
    use crate::room::repository::MemRoomRepository;
    use crate::user::model::User;
    use crate::user::repository::{MemUserRepository, UserRepository};
    use crate::integration::cache;
    use crate::user::service::UserServiceImpl;
    use crate::room::{Error, Kind};

    struct Fixture {
        service: RoomServiceImpl,
        users: Arc<MemUserRepository>,
        hub: Hub,
    }

    fn fixture() -> Fixture {
        let users = Arc::new(MemUserRepository::new());
        let user_service: user::Service =
            Arc::new(UserServiceImpl::new(users.clone(), cache::Redis::disabled()));
        let hub = Hub::spawn(hub::Config::default());
        let service = RoomServiceImpl::new(
            Arc::new(MemRoomRepository::new()),
            user_service,
            hub.clone(),
            Config::default(),
        );
        Fixture {
            service,
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

    fn guest(id: &str, name: &str) -> Participant {
        Participant::Guest {
            guest_id: GuestId::parse(id).unwrap(),
            display_name: name.into(),
        }
    }

    fn member_id(p: &Participant) -> user::Id {
        match p {
            Participant::Member { id, .. } => *id,
            Participant::Guest { .. } => panic!("not a member"),
        }
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Frame>) -> serde_json::Value {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame should arrive")
            .expect("outbox should be open");
        serde_json::from_str(frame.as_str()).unwrap()
    }

    #[tokio::test]
    async fn should_return_same_support_room_for_concurrent_calls() {
        let f = fixture();
        f.member("Ada", "admin");
        let g = guest("visitor-1", "Vi");

        let (a, b) = tokio::join!(f.service.open_support(&g), f.service.open_support(&g));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.id(), b.id());
        assert_eq!(a.kind(), Kind::Support);
    }

    #[tokio::test]
    async fn should_staff_support_room_with_admins() {
        let f = fixture();
        let ada = f.member("Ada", "admin");
        f.member("Bob", "member");
        let g = guest("visitor-2", "Vi");

        let room = f.service.open_support(&g).await.unwrap();
        let members = f.service.find_active_members(room.id()).await.unwrap();

        let keys: HashSet<Key> = members.iter().map(|m| m.participant().clone()).collect();
        assert_eq!(keys, HashSet::from([g.key(), ada.key()]));

        let admin = members.iter().find(|m| m.participant() == &ada.key()).unwrap();
        assert_eq!(admin.role(), Role::Admin);

        let history = f
            .service
            .list_messages(room.id(), &g, &Page::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message_type(), message::Kind::System);
    }

    #[tokio::test]
    async fn should_refuse_support_room_for_members() {
        let f = fixture();
        let bob = f.member("Bob", "member");

        assert!(matches!(
            f.service.open_support(&bob).await,
            Err(Error::NotAGuest)
        ));
    }

    #[tokio::test]
    async fn should_resolve_private_room_on_unordered_pair() {
        let f = fixture();
        let a = f.member("Ann", "member");
        let b = f.member("Ben", "member");

        let ab = f.service.open_private(&a, &member_id(&b)).await.unwrap();
        f.service.send_message(ab.id(), &a, "hi").await.unwrap();
        f.service.send_message(ab.id(), &b, "hey").await.unwrap();
        let ba = f.service.open_private(&b, &member_id(&a)).await.unwrap();

        assert_eq!(ab.id(), ba.id());
        assert!(matches!(
            f.service.open_private(&a, &member_id(&a)).await,
            Err(Error::SelfChat)
        ));
    }

    #[tokio::test]
    async fn should_not_reuse_group_as_private_room() {
        let f = fixture();
        let a = f.member("Ann", "member");
        let b = f.member("Ben", "member");
        let c = f.member("Cid", "member");

        let group = f
            .service
            .create_group(&a, "trio", false, &[member_id(&b), member_id(&c)])
            .await
            .unwrap();
        let private = f.service.open_private(&a, &member_id(&b)).await.unwrap();

        assert_ne!(group.id(), private.id());
    }

    #[tokio::test]
    async fn should_keep_append_order_in_listing() {
        let f = fixture();
        let a = f.member("Ann", "member");
        let b = f.member("Ben", "member");
        let room = f.service.open_private(&a, &member_id(&b)).await.unwrap();

        for i in 0..10 {
            let sender = if i % 2 == 0 { &a } else { &b };
            f.service
                .send_message(room.id(), sender, &format!("m{i}"))
                .await
                .unwrap();
        }

        let listed = f
            .service
            .list_messages(room.id(), &b, &Page::default())
            .await
            .unwrap();
        let texts: Vec<&str> = listed.iter().map(Message::content).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        assert_eq!(texts, expected);
    }

    #[tokio::test]
    async fn should_reject_non_member_without_writing() {
        let f = fixture();
        let a = f.member("Ann", "member");
        let b = f.member("Ben", "member");
        let outsider = guest("lurker", "Lu");
        let room = f.service.open_private(&a, &member_id(&b)).await.unwrap();

        assert!(matches!(
            f.service.send_message(room.id(), &outsider, "let me in").await,
            Err(Error::NotAMember(_))
        ));

        let listed = f
            .service
            .list_messages(room.id(), &a, &Page::default())
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn should_reject_invalid_content() {
        let f = fixture();
        let a = f.member("Ann", "member");
        let b = f.member("Ben", "member");
        let room = f.service.open_private(&a, &member_id(&b)).await.unwrap();

        assert!(matches!(
            f.service.send_message(room.id(), &a, "   ").await,
            Err(Error::_Message(message::Error::EmptyContent))
        ));
    }

    #[tokio::test]
    async fn should_push_guest_message_to_live_admins() {
        let f = fixture();
        let ada = f.member("Ada", "admin");
        let g = guest("visitor-3", "Vi");

        let mut ada_conn = f.hub.register(ada.key()).await.unwrap();
        let room = f.service.open_support(&g).await.unwrap();
        f.service.send_message(room.id(), &g, "hello").await.unwrap();

        let frame = next_frame(&mut ada_conn.outbox).await;
        assert_eq!(frame["type"], "new_message");
        assert_eq!(frame["data"]["content"], "hello");
        assert_eq!(frame["data"]["roomId"], room.id().get());
    }

    #[tokio::test]
    async fn should_list_history_missed_while_offline() {
        let f = fixture();
        let a = f.member("Ann", "member");
        let b = f.member("Ben", "member");
        let room = f.service.open_private(&a, &member_id(&b)).await.unwrap();

        f.service
            .send_message(room.id(), &a, "while you were out")
            .await
            .unwrap();

        let b_conn = f.hub.register(b.key()).await.unwrap();
        let summaries = f.service.list_rooms(&b).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].unread_count(), 1);
        assert_eq!(summaries[0].members(), ["Ann".to_string()]);

        let listed = f
            .service
            .list_messages(room.id(), &b, &Page::default())
            .await
            .unwrap();
        assert_eq!(listed[0].content(), "while you were out");

        let summaries = f.service.list_rooms(&b).await.unwrap();
        assert_eq!(summaries[0].unread_count(), 0);
        drop(b_conn);
    }

    #[tokio::test]
    async fn should_stop_pushing_after_membership_change() {
        let f = fixture();
        let a = f.member("Ann", "member");
        let b = f.member("Ben", "member");
        let c = f.member("Cid", "member");
        let room = f
            .service
            .create_group(&a, "team", false, &[member_id(&b), member_id(&c)])
            .await
            .unwrap();

        let mut c_conn = f.hub.register(c.key()).await.unwrap();
        f.service.leave_room(room.id(), &c).await.unwrap();
        f.service.send_message(room.id(), &a, "after").await.unwrap();

        // sender's own echo proves the push was processed
        let mut a_conn = f.hub.register(a.key()).await.unwrap();
        f.service.send_message(room.id(), &a, "again").await.unwrap();
        assert_eq!(next_frame(&mut a_conn.outbox).await["data"]["content"], "again");
        assert!(c_conn.outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn should_block_sends_after_close_and_keep_history() {
        let f = fixture();
        let a = f.member("Ann", "member");
        let b = f.member("Ben", "member");
        let room = f.service.open_private(&a, &member_id(&b)).await.unwrap();
        f.service.send_message(room.id(), &a, "before").await.unwrap();

        f.service.close_room(room.id(), &a).await.unwrap();

        for sender in [&a, &b] {
            let res = f.service.send_message(room.id(), sender, "after").await;
            assert!(matches!(
                res,
                Err(Error::Closed(_) | Error::NotAMember(_))
            ));
        }

        let listed = f
            .service
            .list_messages(room.id(), &b, &Page::default())
            .await
            .unwrap();
        let texts: Vec<&str> = listed.iter().map(Message::content).collect();
        assert_eq!(texts, vec!["before", "Ann closed the room"]);

        assert!(f.service.list_rooms(&b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_require_active_membership_to_close() {
        let f = fixture();
        let a = f.member("Ann", "member");
        let b = f.member("Ben", "member");
        let room = f.service.open_private(&a, &member_id(&b)).await.unwrap();

        assert!(matches!(
            f.service.close_room(room.id(), &guest("x", "X")).await,
            Err(Error::NotAMember(_))
        ));
        assert!(matches!(
            f.service.close_room(&Id::from(999), &a).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn should_validate_group_creation() {
        let f = fixture();
        let a = f.member("Ann", "member");

        assert!(matches!(
            f.service.create_group(&a, " ", false, &[]).await,
            Err(Error::MissingName)
        ));
        assert!(matches!(
            f.service
                .create_group(&a, "solo", false, &[member_id(&a)])
                .await,
            Err(Error::NotEnoughMembers)
        ));
    }

    #[tokio::test]
    async fn should_order_rooms_by_latest_activity() {
        let f = fixture();
        let a = f.member("Ann", "member");
        let b = f.member("Ben", "member");
        let c = f.member("Cid", "member");

        let with_b = f.service.open_private(&a, &member_id(&b)).await.unwrap();
        let with_c = f.service.open_private(&a, &member_id(&c)).await.unwrap();
        f.service.send_message(with_c.id(), &a, "first").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.service.send_message(with_b.id(), &a, "second").await.unwrap();

        let rooms = f.service.list_rooms(&a).await.unwrap();
        let ids: Vec<&Id> = rooms.iter().map(|s| s.room().id()).collect();
        assert_eq!(ids, vec![with_b.id(), with_c.id()]);
        assert_eq!(rooms[0].last_message().unwrap().content(), "second");
    }

    #[tokio::test]
    async fn should_release_room_gates_after_use() {
        let f = fixture();
        let a = f.member("Ann", "member");
        let b = f.member("Ben", "member");

        for i in 0..20 {
            let room = f
                .service
                .create_group(&a, &format!("g{i}"), false, &[member_id(&b)])
                .await
                .unwrap();
            f.service.send_message(room.id(), &a, "hi").await.unwrap();
            f.service.close_room(room.id(), &a).await.unwrap();
        }

        assert!(f.service.gates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_keep_order_under_concurrent_sends() {
        let f = fixture();
        let a = f.member("Ann", "member");
        let b = f.member("Ben", "member");
        let room = f.service.open_private(&a, &member_id(&b)).await.unwrap();
        let mut b_conn = f.hub.register(b.key()).await.unwrap();

        let bodies: Vec<String> = (0..8).map(|i| format!("m{i}")).collect();
        let sends = bodies.iter().map(|body| f.service.send_message(room.id(), &a, body));
        let sent = futures::future::join_all(sends).await;
        let mut ids: Vec<i64> = sent.into_iter().map(|m| m.unwrap().id().get()).collect();
        ids.sort_unstable();

        let mut pushed = Vec::new();
        for _ in 0..8 {
            pushed.push(next_frame(&mut b_conn.outbox).await["data"]["id"].as_i64().unwrap());
        }
        assert_eq!(pushed, ids);
        assert!(f.service.gates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_prune_nothing_within_retention() {
        let f = fixture();
        let g = guest("visitor-4", "Vi");
        f.service.open_support(&g).await.unwrap();

        assert_eq!(f.service.prune_messages().await.unwrap(), 0);
    }
}
