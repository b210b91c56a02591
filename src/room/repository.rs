use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use diesel::prelude::{Insertable, Queryable, Selectable};
use diesel::{
    Connection, ExpressionMethods, OptionalExtension, PgConnection, PgExpressionMethods, QueryDsl,
    RunQueryDsl, SelectableHelper,
};

use crate::integration::db::Pool;
use crate::message::{
    self,
    model::{Message, NewMessage, Page},
};
use crate::participant::Key;
use crate::schema::{messages, room_members, rooms};

use super::model::{Membership, NewMember, Room};
use super::{Id, Kind};

/// Durable rooms, memberships and messages. Every write that must observe a
/// consistent room state (find-or-create, append, close) is one critical section.
pub trait RoomRepository {
    fn find_by_id(&self, id: &Id) -> super::Result<Room>;

    /// Returns the guest's active support room, creating it with `admins` and a
    /// `greeting` system message when there is none.
    fn find_or_create_support(
        &self,
        guest: &NewMember,
        admins: &[NewMember],
        greeting: &str,
    ) -> super::Result<Room>;

    /// Returns the active private room whose active members are exactly `{a, b}`,
    /// creating it when there is none.
    fn find_or_create_private(&self, a: &NewMember, b: &NewMember) -> super::Result<Room>;

    fn create_group(
        &self,
        name: &str,
        is_public: bool,
        members: &[NewMember],
    ) -> super::Result<Room>;

    /// Idempotent: an active row is returned untouched, an inactive one is reactivated.
    fn add_member(&self, room_id: &Id, member: &NewMember) -> super::Result<Membership>;

    fn find_membership(&self, room_id: &Id, participant: &Key)
    -> super::Result<Option<Membership>>;

    fn find_active_members(&self, room_id: &Id) -> super::Result<Vec<Membership>>;

    /// Active rooms where `participant` holds an active membership, most recently updated first.
    fn find_by_participant(&self, participant: &Key) -> super::Result<Vec<(Room, Membership)>>;

    /// Returns `false` when there was no active membership to deactivate.
    fn deactivate_member(&self, room_id: &Id, participant: &Key) -> super::Result<bool>;

    /// Deactivates the room and the caller's membership. The `notice` is appended
    /// only if the room was still active and is returned for fan-out.
    fn close(
        &self,
        room_id: &Id,
        participant: &Key,
        notice: NewMessage,
    ) -> super::Result<Option<Message>>;

    /// Appends a message and bumps the room's `updated_at`. Text messages need an
    /// active membership of the sender; any message needs an active room.
    fn append(&self, msg: &NewMessage) -> super::Result<Message>;

    /// One page of history, newest page first, chronological within the page.
    fn find_messages(&self, room_id: &Id, page: &Page) -> super::Result<Vec<Message>>;

    fn find_last_message(&self, room_id: &Id) -> super::Result<Option<Message>>;

    /// Messages after the membership's read marker not sent by the member itself.
    fn count_unread(&self, membership: &Membership) -> super::Result<i64>;

    fn mark_read(&self, room_id: &Id, participant: &Key, up_to: &message::Id)
    -> super::Result<()>;

    /// Hard-deletes messages created before `cutoff`; returns how many were removed.
    fn prune_messages_older_than(&self, cutoff: DateTime<Utc>) -> super::Result<usize>;
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = rooms)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct RoomRow {
    id: i64,
    name: Option<String>,
    kind: String,
    is_public: bool,
    is_active: bool,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RoomRow> for Room {
    type Error = super::Error;

    fn try_from(r: RoomRow) -> super::Result<Self> {
        Ok(Room::new(
            r.id.into(),
            r.name,
            r.kind.parse()?,
            r.is_public,
            r.is_active,
            r.updated_at,
        ))
    }
}

#[derive(Insertable)]
#[diesel(table_name = rooms)]
struct NewRoomRow<'a> {
    name: Option<&'a str>,
    kind: &'a str,
    is_public: bool,
    is_active: bool,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = room_members)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct MemberRow {
    room_id: i64,
    participant: String,
    display_name: String,
    role: String,
    is_active: bool,
    joined_at: DateTime<Utc>,
    last_read_message_id: Option<i64>,
}

#[derive(Insertable)]
#[diesel(table_name = room_members)]
struct NewMemberRow<'a> {
    room_id: i64,
    participant: String,
    display_name: &'a str,
    role: &'a str,
}

impl TryFrom<MemberRow> for Membership {
    type Error = super::Error;

    fn try_from(r: MemberRow) -> super::Result<Self> {
        let membership = Membership::new(
            r.room_id.into(),
            r.participant.parse()?,
            r.display_name,
            r.role.parse()?,
            r.joined_at,
        );
        Ok(membership.restored(r.is_active, r.last_read_message_id.map(message::Id::from)))
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct MessageRow {
    id: i64,
    room_id: i64,
    sender: Option<String>,
    sender_name: String,
    content: String,
    kind: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = super::Error;

    fn try_from(r: MessageRow) -> super::Result<Self> {
        let sender = r.sender.map(|s| s.parse::<Key>()).transpose()?;
        let kind = r
            .kind
            .parse::<message::Kind>()
            .map_err(|e| super::Error::Malformed(e.to_string()))?;

        Ok(Message::new(
            r.id.into(),
            r.room_id.into(),
            sender,
            r.sender_name,
            r.content,
            kind,
            r.created_at,
        ))
    }
}

#[derive(Insertable)]
#[diesel(table_name = messages)]
struct NewMessageRow<'a> {
    room_id: i64,
    sender: Option<String>,
    sender_name: &'a str,
    content: &'a str,
    kind: &'a str,
}

pub struct PgRoomRepository {
    pool: Pool,
}

impl PgRoomRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

/// Transaction-scoped advisory lock; released on commit or rollback.
fn advisory_lock(conn: &mut PgConnection, key: &str) -> super::Result<()> {
    diesel::sql_query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind::<diesel::sql_types::Text, _>(key)
        .execute(conn)?;
    Ok(())
}

fn insert_room(
    conn: &mut PgConnection,
    name: Option<&str>,
    kind: Kind,
    is_public: bool,
) -> super::Result<Room> {
    diesel::insert_into(rooms::table)
        .values(NewRoomRow {
            name,
            kind: kind.as_str(),
            is_public,
            is_active: true,
        })
        .returning(RoomRow::as_returning())
        .get_result::<RoomRow>(conn)?
        .try_into()
}

fn lock_room(conn: &mut PgConnection, room_id: &Id) -> super::Result<Room> {
    rooms::table
        .find(room_id.get())
        .select(RoomRow::as_select())
        .for_update()
        .first::<RoomRow>(conn)
        .optional()?
        .ok_or(super::Error::NotFound(*room_id))?
        .try_into()
}

fn select_member(
    conn: &mut PgConnection,
    room_id: &Id,
    participant: &Key,
) -> super::Result<Option<Membership>> {
    room_members::table
        .find((room_id.get(), participant.to_string()))
        .select(MemberRow::as_select())
        .first::<MemberRow>(conn)
        .optional()?
        .map(Membership::try_from)
        .transpose()
}

fn upsert_member(
    conn: &mut PgConnection,
    room_id: &Id,
    member: &NewMember,
) -> super::Result<Membership> {
    match select_member(conn, room_id, &member.participant)? {
        Some(existing) if existing.is_active() => Ok(existing),
        Some(_) => diesel::update(
            room_members::table.find((room_id.get(), member.participant.to_string())),
        )
        .set(room_members::is_active.eq(true))
        .returning(MemberRow::as_returning())
        .get_result::<MemberRow>(conn)?
        .try_into(),
        None => {
            diesel::insert_into(room_members::table)
                .values(NewMemberRow {
                    room_id: room_id.get(),
                    participant: member.participant.to_string(),
                    display_name: &member.display_name,
                    role: member.role.as_str(),
                })
                .on_conflict((room_members::room_id, room_members::participant))
                .do_nothing()
                .execute(conn)?;

            select_member(conn, room_id, &member.participant)?
                .ok_or(super::Error::NotAMember(*room_id))
        }
    }
}

/// `created_at` comes from the database clock, read after the room lock is taken.
fn insert_message(conn: &mut PgConnection, msg: &NewMessage) -> super::Result<Message> {
    let stored: Message = diesel::insert_into(messages::table)
        .values(NewMessageRow {
            room_id: msg.room_id().get(),
            sender: msg.sender().map(Key::to_string),
            sender_name: msg.sender_display_name(),
            content: msg.content(),
            kind: msg.kind().as_str(),
        })
        .returning(MessageRow::as_returning())
        .get_result::<MessageRow>(conn)?
        .try_into()?;

    diesel::update(rooms::table.find(msg.room_id().get()))
        .set(rooms::updated_at.eq(*stored.created_at()))
        .execute(conn)?;

    Ok(stored)
}

fn active_member_keys(conn: &mut PgConnection, room_id: i64) -> super::Result<BTreeSet<String>> {
    let keys = room_members::table
        .filter(room_members::room_id.eq(room_id))
        .filter(room_members::is_active.eq(true))
        .select(room_members::participant)
        .load::<String>(conn)?;
    Ok(keys.into_iter().collect())
}

impl RoomRepository for PgRoomRepository {
    fn find_by_id(&self, id: &Id) -> super::Result<Room> {
        let mut conn = self.pool.get()?;

        rooms::table
            .find(id.get())
            .select(RoomRow::as_select())
            .first::<RoomRow>(&mut conn)
            .optional()?
            .ok_or(super::Error::NotFound(*id))?
            .try_into()
    }

    fn find_or_create_support(
        &self,
        guest: &NewMember,
        admins: &[NewMember],
        greeting: &str,
    ) -> super::Result<Room> {
        let mut conn = self.pool.get()?;
        let guest_key = guest.participant.to_string();

        conn.transaction::<_, super::Error, _>(|conn| {
            advisory_lock(conn, &format!("support:{guest_key}"))?;

            let existing = rooms::table
                .inner_join(room_members::table)
                .filter(rooms::kind.eq(Kind::Support.as_str()))
                .filter(rooms::is_active.eq(true))
                .filter(room_members::participant.eq(&guest_key))
                .filter(room_members::is_active.eq(true))
                .order(rooms::id)
                .select(RoomRow::as_select())
                .first::<RoomRow>(conn)
                .optional()?;

            if let Some(row) = existing {
                return row.try_into();
            }

            let mut room = insert_room(conn, Some(&guest.display_name), Kind::Support, false)?;
            upsert_member(conn, room.id(), guest)?;
            for admin in admins {
                upsert_member(conn, room.id(), admin)?;
            }
            let notice = NewMessage::system(*room.id(), greeting);
            let notice = insert_message(conn, &notice)?;

            room.touch(*notice.created_at());
            Ok(room)
        })
    }

    fn find_or_create_private(&self, a: &NewMember, b: &NewMember) -> super::Result<Room> {
        let mut conn = self.pool.get()?;
        let pair: BTreeSet<String> = [a.participant.to_string(), b.participant.to_string()].into();
        let lock_key = format!(
            "private:{}",
            pair.iter().cloned().collect::<Vec<_>>().join(":")
        );

        conn.transaction::<_, super::Error, _>(|conn| {
            advisory_lock(conn, &lock_key)?;

            let candidates = rooms::table
                .inner_join(room_members::table)
                .filter(rooms::kind.eq(Kind::Private.as_str()))
                .filter(rooms::is_active.eq(true))
                .filter(room_members::participant.eq(a.participant.to_string()))
                .filter(room_members::is_active.eq(true))
                .order(rooms::id)
                .select(RoomRow::as_select())
                .load::<RoomRow>(conn)?;

            for row in candidates {
                if active_member_keys(conn, row.id)? == pair {
                    return row.try_into();
                }
            }

            let room = insert_room(conn, None, Kind::Private, false)?;
            upsert_member(conn, room.id(), a)?;
            upsert_member(conn, room.id(), b)?;
            Ok(room)
        })
    }

    fn create_group(
        &self,
        name: &str,
        is_public: bool,
        members: &[NewMember],
    ) -> super::Result<Room> {
        let mut conn = self.pool.get()?;

        conn.transaction::<_, super::Error, _>(|conn| {
            let room = insert_room(conn, Some(name), Kind::Group, is_public)?;
            for m in members {
                upsert_member(conn, room.id(), m)?;
            }
            Ok(room)
        })
    }

    fn add_member(&self, room_id: &Id, member: &NewMember) -> super::Result<Membership> {
        let mut conn = self.pool.get()?;

        conn.transaction::<_, super::Error, _>(|conn| {
            lock_room(conn, room_id)?;
            upsert_member(conn, room_id, member)
        })
    }

    fn find_membership(
        &self,
        room_id: &Id,
        participant: &Key,
    ) -> super::Result<Option<Membership>> {
        let mut conn = self.pool.get()?;
        select_member(&mut conn, room_id, participant)
    }

    fn find_active_members(&self, room_id: &Id) -> super::Result<Vec<Membership>> {
        let mut conn = self.pool.get()?;

        room_members::table
            .filter(room_members::room_id.eq(room_id.get()))
            .filter(room_members::is_active.eq(true))
            .order(room_members::joined_at)
            .select(MemberRow::as_select())
            .load::<MemberRow>(&mut conn)?
            .into_iter()
            .map(Membership::try_from)
            .collect()
    }

    fn find_by_participant(&self, participant: &Key) -> super::Result<Vec<(Room, Membership)>> {
        let mut conn = self.pool.get()?;

        rooms::table
            .inner_join(room_members::table)
            .filter(room_members::participant.eq(participant.to_string()))
            .filter(room_members::is_active.eq(true))
            .filter(rooms::is_active.eq(true))
            .order((rooms::updated_at.desc(), rooms::id.desc()))
            .select((RoomRow::as_select(), MemberRow::as_select()))
            .load::<(RoomRow, MemberRow)>(&mut conn)?
            .into_iter()
            .map(|(r, m)| Ok((Room::try_from(r)?, Membership::try_from(m)?)))
            .collect()
    }

    fn deactivate_member(&self, room_id: &Id, participant: &Key) -> super::Result<bool> {
        let mut conn = self.pool.get()?;

        let updated = diesel::update(
            room_members::table
                .find((room_id.get(), participant.to_string()))
                .filter(room_members::is_active.eq(true)),
        )
        .set(room_members::is_active.eq(false))
        .execute(&mut conn)?;

        Ok(updated > 0)
    }

    fn close(
        &self,
        room_id: &Id,
        participant: &Key,
        notice: NewMessage,
    ) -> super::Result<Option<Message>> {
        let mut conn = self.pool.get()?;

        conn.transaction::<_, super::Error, _>(|conn| {
            let room = lock_room(conn, room_id)?;

            match select_member(conn, room_id, participant)? {
                Some(m) if m.is_active() => {}
                _ => return Err(super::Error::NotAMember(*room_id)),
            }

            let appended = if room.is_active() {
                let msg = insert_message(conn, &notice.with_room(*room_id))?;
                diesel::update(rooms::table.find(room_id.get()))
                    .set(rooms::is_active.eq(false))
                    .execute(conn)?;
                Some(msg)
            } else {
                None
            };

            diesel::update(room_members::table.find((room_id.get(), participant.to_string())))
                .set(room_members::is_active.eq(false))
                .execute(conn)?;

            Ok(appended)
        })
    }

    fn append(&self, msg: &NewMessage) -> super::Result<Message> {
        let mut conn = self.pool.get()?;
        let room_id = *msg.room_id();

        conn.transaction::<_, super::Error, _>(|conn| {
            // row lock serializes appends to the same room
            let room = lock_room(conn, &room_id)?;

            if let Some(sender) = msg.sender() {
                match select_member(conn, &room_id, sender)? {
                    Some(m) if m.is_active() => {}
                    _ => return Err(super::Error::NotAMember(room_id)),
                }
            }
            if !room.is_active() {
                return Err(super::Error::Closed(room_id));
            }

            insert_message(conn, msg)
        })
    }

    fn find_messages(&self, room_id: &Id, page: &Page) -> super::Result<Vec<Message>> {
        let mut conn = self.pool.get()?;

        let mut page: Vec<Message> = messages::table
            .filter(messages::room_id.eq(room_id.get()))
            .order((messages::created_at.desc(), messages::id.desc()))
            .offset(page.offset())
            .limit(page.limit())
            .select(MessageRow::as_select())
            .load::<MessageRow>(&mut conn)?
            .into_iter()
            .map(Message::try_from)
            .collect::<super::Result<_>>()?;

        page.reverse();
        Ok(page)
    }

    fn find_last_message(&self, room_id: &Id) -> super::Result<Option<Message>> {
        let mut conn = self.pool.get()?;

        messages::table
            .filter(messages::room_id.eq(room_id.get()))
            .order((messages::created_at.desc(), messages::id.desc()))
            .select(MessageRow::as_select())
            .first::<MessageRow>(&mut conn)
            .optional()?
            .map(Message::try_from)
            .transpose()
    }

    fn count_unread(&self, membership: &Membership) -> super::Result<i64> {
        let mut conn = self.pool.get()?;
        let after = membership.last_read().map(|id| id.get()).unwrap_or(0);

        let count: i64 = messages::table
            .filter(messages::room_id.eq(membership.room_id().get()))
            .filter(messages::id.gt(after))
            .filter(
                messages::sender.is_distinct_from(membership.participant().to_string()),
            )
            .count()
            .get_result(&mut conn)?;

        Ok(count)
    }

    fn mark_read(
        &self,
        room_id: &Id,
        participant: &Key,
        up_to: &message::Id,
    ) -> super::Result<()> {
        let mut conn = self.pool.get()?;

        conn.transaction::<_, super::Error, _>(|conn| {
            let current = room_members::table
                .find((room_id.get(), participant.to_string()))
                .select(room_members::last_read_message_id)
                .for_update()
                .first::<Option<i64>>(conn)
                .optional()?
                .ok_or(super::Error::NotAMember(*room_id))?;

            if current.is_none_or(|c| c < up_to.get()) {
                diesel::update(room_members::table.find((room_id.get(), participant.to_string())))
                    .set(room_members::last_read_message_id.eq(Some(up_to.get())))
                    .execute(conn)?;
            }
            Ok(())
        })
    }

    fn prune_messages_older_than(&self, cutoff: DateTime<Utc>) -> super::Result<usize> {
        let mut conn = self.pool.get()?;

        let deleted = diesel::delete(messages::table.filter(messages::created_at.lt(cutoff)))
            .execute(&mut conn)?;

        Ok(deleted)
    }
}

#[derive(Default)]
struct MemRooms {
    last_room_id: i64,
    last_message_id: i64,
    rooms: BTreeMap<Id, Room>,
    members: BTreeMap<(Id, Key), Membership>,
    messages: Vec<Message>,
}

impl MemRooms {
    fn insert_room(&mut self, name: Option<&str>, kind: Kind, is_public: bool) -> Room {
        self.last_room_id += 1;
        let room = Room::new(
            self.last_room_id.into(),
            name.map(str::to_string),
            kind,
            is_public,
            true,
            Utc::now(),
        );
        self.rooms.insert(*room.id(), room.clone());
        room
    }

    fn upsert_member(&mut self, room_id: &Id, m: &NewMember) -> Membership {
        let entry = self
            .members
            .entry((*room_id, m.participant.clone()))
            .or_insert_with(|| {
                Membership::new(
                    *room_id,
                    m.participant.clone(),
                    m.display_name.clone(),
                    m.role,
                    Utc::now(),
                )
            });
        entry.set_active(true);
        entry.clone()
    }

    fn is_active_member(&self, room_id: &Id, participant: &Key) -> bool {
        self.members
            .get(&(*room_id, participant.clone()))
            .is_some_and(Membership::is_active)
    }

    fn active_members(&self, room_id: &Id) -> impl Iterator<Item = &Membership> {
        self.members
            .iter()
            .filter(move |((rid, _), m)| rid == room_id && m.is_active())
            .map(|(_, m)| m)
    }

    fn insert_message(&mut self, msg: &NewMessage) -> Message {
        self.last_message_id += 1;
        let now = Utc::now();
        let stored = msg.clone().stored(self.last_message_id.into(), now);
        self.messages.push(stored.clone());
        if let Some(room) = self.rooms.get_mut(msg.room_id()) {
            room.touch(now);
        }
        stored
    }

    fn room_messages(&self, room_id: &Id) -> Vec<&Message> {
        let mut msgs: Vec<&Message> = self
            .messages
            .iter()
            .filter(|m| m.room_id() == room_id)
            .collect();
        msgs.sort_by(|a, b| (a.created_at(), a.id()).cmp(&(b.created_at(), b.id())));
        msgs
    }
}

/// In-process Room Store; one mutex makes every operation a critical section.
#[derive(Default)]
pub struct MemRoomRepository {
    inner: Mutex<MemRooms>,
}

impl MemRoomRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemRooms> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RoomRepository for MemRoomRepository {
    fn find_by_id(&self, id: &Id) -> super::Result<Room> {
        self.lock()
            .rooms
            .get(id)
            .cloned()
            .ok_or(super::Error::NotFound(*id))
    }

    fn find_or_create_support(
        &self,
        guest: &NewMember,
        admins: &[NewMember],
        greeting: &str,
    ) -> super::Result<Room> {
        let mut store = self.lock();

        let existing = store
            .rooms
            .values()
            .find(|r| {
                r.kind() == Kind::Support
                    && r.is_active()
                    && store.is_active_member(r.id(), &guest.participant)
            })
            .cloned();
        if let Some(room) = existing {
            return Ok(room);
        }

        let room = store.insert_room(Some(&guest.display_name), Kind::Support, false);
        store.upsert_member(room.id(), guest);
        for admin in admins {
            store.upsert_member(room.id(), admin);
        }
        store.insert_message(&NewMessage::system(*room.id(), greeting));

        Ok(store.rooms[room.id()].clone())
    }

    fn find_or_create_private(&self, a: &NewMember, b: &NewMember) -> super::Result<Room> {
        let mut store = self.lock();
        let pair: BTreeSet<&Key> = [&a.participant, &b.participant].into();

        let existing = store
            .rooms
            .values()
            .filter(|r| r.kind() == Kind::Private && r.is_active())
            .find(|r| {
                let members: BTreeSet<&Key> = store
                    .active_members(r.id())
                    .map(Membership::participant)
                    .collect();
                members == pair
            })
            .cloned();
        if let Some(room) = existing {
            return Ok(room);
        }

        let room = store.insert_room(None, Kind::Private, false);
        store.upsert_member(room.id(), a);
        store.upsert_member(room.id(), b);
        Ok(room)
    }

    fn create_group(
        &self,
        name: &str,
        is_public: bool,
        members: &[NewMember],
    ) -> super::Result<Room> {
        let mut store = self.lock();
        let room = store.insert_room(Some(name), Kind::Group, is_public);
        for m in members {
            store.upsert_member(room.id(), m);
        }
        Ok(room)
    }

    fn add_member(&self, room_id: &Id, member: &NewMember) -> super::Result<Membership> {
        let mut store = self.lock();
        if !store.rooms.contains_key(room_id) {
            return Err(super::Error::NotFound(*room_id));
        }
        Ok(store.upsert_member(room_id, member))
    }

    fn find_membership(
        &self,
        room_id: &Id,
        participant: &Key,
    ) -> super::Result<Option<Membership>> {
        Ok(self
            .lock()
            .members
            .get(&(*room_id, participant.clone()))
            .cloned())
    }

    fn find_active_members(&self, room_id: &Id) -> super::Result<Vec<Membership>> {
        Ok(self.lock().active_members(room_id).cloned().collect())
    }

    fn find_by_participant(&self, participant: &Key) -> super::Result<Vec<(Room, Membership)>> {
        let store = self.lock();

        let mut rooms: Vec<(Room, Membership)> = store
            .members
            .iter()
            .filter(|((_, key), m)| key == participant && m.is_active())
            .filter_map(|((rid, _), m)| {
                store
                    .rooms
                    .get(rid)
                    .filter(|r| r.is_active())
                    .map(|r| (r.clone(), m.clone()))
            })
            .collect();

        rooms.sort_by(|(a, _), (b, _)| {
            (b.updated_at(), b.id()).cmp(&(a.updated_at(), a.id()))
        });
        Ok(rooms)
    }

    fn deactivate_member(&self, room_id: &Id, participant: &Key) -> super::Result<bool> {
        let mut store = self.lock();
        match store.members.get_mut(&(*room_id, participant.clone())) {
            Some(m) if m.is_active() => {
                m.set_active(false);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn close(
        &self,
        room_id: &Id,
        participant: &Key,
        notice: NewMessage,
    ) -> super::Result<Option<Message>> {
        let mut store = self.lock();

        let room_active = store
            .rooms
            .get(room_id)
            .ok_or(super::Error::NotFound(*room_id))?
            .is_active();
        if !store.is_active_member(room_id, participant) {
            return Err(super::Error::NotAMember(*room_id));
        }

        let appended = if room_active {
            let msg = store.insert_message(&notice.with_room(*room_id));
            if let Some(room) = store.rooms.get_mut(room_id) {
                room.deactivate();
            }
            Some(msg)
        } else {
            None
        };

        if let Some(m) = store.members.get_mut(&(*room_id, participant.clone())) {
            m.set_active(false);
        }
        Ok(appended)
    }

    fn append(&self, msg: &NewMessage) -> super::Result<Message> {
        let mut store = self.lock();
        let room_id = *msg.room_id();

        let room_active = store
            .rooms
            .get(&room_id)
            .ok_or(super::Error::NotFound(room_id))?
            .is_active();
        if let Some(sender) = msg.sender() {
            if !store.is_active_member(&room_id, sender) {
                return Err(super::Error::NotAMember(room_id));
            }
        }
        if !room_active {
            return Err(super::Error::Closed(room_id));
        }

        Ok(store.insert_message(msg))
    }

    fn find_messages(&self, room_id: &Id, page: &Page) -> super::Result<Vec<Message>> {
        let store = self.lock();
        let msgs = store.room_messages(room_id);

        let end = msgs.len().saturating_sub(page.offset() as usize);
        let start = end.saturating_sub(page.limit() as usize);
        Ok(msgs[start..end].iter().map(|m| (*m).clone()).collect())
    }

    fn find_last_message(&self, room_id: &Id) -> super::Result<Option<Message>> {
        Ok(self
            .lock()
            .room_messages(room_id)
            .last()
            .map(|m| (*m).clone()))
    }

    fn count_unread(&self, membership: &Membership) -> super::Result<i64> {
        let store = self.lock();
        let count = store
            .messages
            .iter()
            .filter(|m| m.room_id() == membership.room_id())
            .filter(|m| membership.last_read().is_none_or(|last| *m.id() > last))
            .filter(|m| m.sender() != Some(membership.participant()))
            .count();
        Ok(count as i64)
    }

    fn mark_read(
        &self,
        room_id: &Id,
        participant: &Key,
        up_to: &message::Id,
    ) -> super::Result<()> {
        let mut store = self.lock();
        let m = store
            .members
            .get_mut(&(*room_id, participant.clone()))
            .ok_or(super::Error::NotAMember(*room_id))?;
        m.advance_last_read(*up_to);
        Ok(())
    }

    fn prune_messages_older_than(&self, cutoff: DateTime<Utc>) -> super::Result<usize> {
        let mut store = self.lock();
        let before = store.messages.len();
        store.messages.retain(|m| *m.created_at() >= cutoff);
        Ok(before - store.messages.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::GuestId;
    use crate::room::Role;
    use crate::user;

    fn guest(id: &str) -> NewMember {
        NewMember::new(
            Key::Guest(GuestId::parse(id).unwrap()),
            format!("guest {id}"),
            Role::Member,
        )
    }

    fn member(name: &str) -> NewMember {
        NewMember::new(Key::Member(user::Id::random()), name, Role::Member)
    }

    #[test]
    fn should_keep_single_membership_row_per_pair() {
        let repo = MemRoomRepository::new();
        let a = member("a");
        let room = repo.create_group("team", false, &[a.clone()]).unwrap();

        let first = repo.add_member(room.id(), &a).unwrap();
        let second = repo.add_member(room.id(), &a).unwrap();

        assert_eq!(first, second);
        assert_eq!(repo.find_active_members(room.id()).unwrap().len(), 1);
    }

    #[test]
    fn should_reactivate_left_membership() {
        let repo = MemRoomRepository::new();
        let a = member("a");
        let room = repo.create_group("team", false, &[a.clone()]).unwrap();

        assert!(repo.deactivate_member(room.id(), &a.participant).unwrap());
        assert!(!repo.deactivate_member(room.id(), &a.participant).unwrap());

        let back = repo.add_member(room.id(), &a).unwrap();
        assert!(back.is_active());
    }

    #[test]
    fn should_page_newest_first_and_chronological_within_page() {
        let repo = MemRoomRepository::new();
        let sender = crate::participant::Participant::Member {
            id: user::Id::random(),
            display_name: "a".into(),
            role: user::Role::new("member"),
        };
        let a = NewMember::new(sender.key(), "a", Role::Member);
        let room = repo.create_group("team", false, &[a]).unwrap();

        for i in 0..5 {
            let content = message::Content::parse(&format!("m{i}")).unwrap();
            repo.append(&NewMessage::text(*room.id(), &sender, content))
                .unwrap();
        }

        let newest = repo.find_messages(room.id(), &Page::new(0, 2)).unwrap();
        let texts: Vec<&str> = newest.iter().map(Message::content).collect();
        assert_eq!(texts, vec!["m3", "m4"]);

        let older = repo.find_messages(room.id(), &Page::new(2, 2)).unwrap();
        let texts: Vec<&str> = older.iter().map(Message::content).collect();
        assert_eq!(texts, vec!["m1", "m2"]);

        let beyond = repo.find_messages(room.id(), &Page::new(10, 2)).unwrap();
        assert!(beyond.is_empty());
    }

    #[test]
    fn should_prune_only_old_messages() {
        let repo = MemRoomRepository::new();
        let g = guest("g1");
        repo.find_or_create_support(&g, &[], "hello").unwrap();

        assert_eq!(
            repo.prune_messages_older_than(Utc::now() - chrono::Duration::days(1))
                .unwrap(),
            0
        );
        assert_eq!(
            repo.prune_messages_older_than(Utc::now() + chrono::Duration::seconds(1))
                .unwrap(),
            1
        );
    }

    #[test]
    fn should_not_match_group_for_private_lookup() {
        let repo = MemRoomRepository::new();
        let (a, b, c) = (member("a"), member("b"), member("c"));
        repo.create_group("trio", false, &[a.clone(), b.clone(), c])
            .unwrap();

        let private = repo.find_or_create_private(&a, &b).unwrap();
        assert_eq!(private.kind(), Kind::Private);
        assert_eq!(repo.find_or_create_private(&b, &a).unwrap(), private);
    }
}
