use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use diesel::prelude::{Insertable, Queryable, Selectable};
use diesel::{
    Connection, ExpressionMethods, OptionalExtension, QueryDsl, RunQueryDsl, SelectableHelper,
};

use crate::integration::db::Pool;
use crate::participant::Key;
use crate::schema::{notification_deliveries, notifications};

use super::Id;
use super::model::{DeliveryStatus, InboxItem, NewNotification, Notification};

pub trait NotificationRepository {
    /// Stores the notification with one delivery row per recipient, atomically.
    fn create(&self, n: NewNotification, recipients: &[Key]) -> super::Result<Notification>;

    /// Every unread notification of `participant` plus the `recent` newest read ones,
    /// newest first.
    fn find_for(&self, participant: &Key, recent: i64) -> super::Result<Vec<InboxItem>>;

    /// Sets `read_at` if unset. `Ok(false)` means it was already read;
    /// `NotFound` means it was never addressed to `participant`.
    fn mark_read(&self, participant: &Key, id: &Id) -> super::Result<bool>;
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = notifications)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct NotificationRow {
    id: i64,
    title: String,
    body: String,
    kind: String,
    priority: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = super::Error;

    fn try_from(r: NotificationRow) -> super::Result<Self> {
        Ok(Notification::new(
            r.id.into(),
            r.title,
            r.body,
            r.kind.parse()?,
            r.priority.parse()?,
            r.created_at,
        ))
    }
}

#[derive(Insertable)]
#[diesel(table_name = notifications)]
struct NewNotificationRow<'a> {
    title: &'a str,
    body: &'a str,
    kind: &'a str,
    priority: &'a str,
}

#[derive(Insertable)]
#[diesel(table_name = notification_deliveries)]
struct DeliveryRow {
    notification_id: i64,
    participant: String,
    delivered_at: DateTime<Utc>,
}

type InboxRow = (NotificationRow, DateTime<Utc>, Option<DateTime<Utc>>);

fn into_inbox((n, delivered_at, read_at): InboxRow) -> super::Result<InboxItem> {
    Ok(InboxItem::new(n.try_into()?, delivered_at, read_at))
}

fn newest_first(items: &mut [InboxItem]) {
    items.sort_by(|a, b| {
        let (a, b) = (a.notification(), b.notification());
        (b.created_at(), b.id()).cmp(&(a.created_at(), a.id()))
    });
}

pub struct PgNotificationRepository {
    pool: Pool,
}

impl PgNotificationRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl NotificationRepository for PgNotificationRepository {
    fn create(&self, n: NewNotification, recipients: &[Key]) -> super::Result<Notification> {
        let mut conn = self.pool.get()?;

        conn.transaction::<_, super::Error, _>(|conn| {
            let stored: Notification = diesel::insert_into(notifications::table)
                .values(NewNotificationRow {
                    title: n.title(),
                    body: n.body(),
                    kind: n.kind().as_str(),
                    priority: n.priority().as_str(),
                })
                .returning(NotificationRow::as_returning())
                .get_result::<NotificationRow>(conn)?
                .try_into()?;

            let rows = recipients
                .iter()
                .map(|p| DeliveryRow {
                    notification_id: stored.id().get(),
                    participant: p.to_string(),
                    delivered_at: *stored.created_at(),
                })
                .collect::<Vec<_>>();

            if !rows.is_empty() {
                diesel::insert_into(notification_deliveries::table)
                    .values(&rows)
                    .on_conflict_do_nothing()
                    .execute(conn)?;
            }

            Ok(stored)
        })
    }

    fn find_for(&self, participant: &Key, recent: i64) -> super::Result<Vec<InboxItem>> {
        let mut conn = self.pool.get()?;
        let key = participant.to_string();

        let unread = notification_deliveries::table
            .inner_join(notifications::table)
            .filter(notification_deliveries::participant.eq(&key))
            .filter(notification_deliveries::read_at.is_null())
            .select((
                NotificationRow::as_select(),
                notification_deliveries::delivered_at,
                notification_deliveries::read_at,
            ))
            .load::<InboxRow>(&mut conn)?;

        let read = notification_deliveries::table
            .inner_join(notifications::table)
            .filter(notification_deliveries::participant.eq(&key))
            .filter(notification_deliveries::read_at.is_not_null())
            .order((notifications::created_at.desc(), notifications::id.desc()))
            .limit(recent)
            .select((
                NotificationRow::as_select(),
                notification_deliveries::delivered_at,
                notification_deliveries::read_at,
            ))
            .load::<InboxRow>(&mut conn)?;

        let mut items = unread
            .into_iter()
            .chain(read)
            .map(into_inbox)
            .collect::<super::Result<Vec<_>>>()?;
        newest_first(&mut items);
        Ok(items)
    }

    fn mark_read(&self, participant: &Key, id: &Id) -> super::Result<bool> {
        let mut conn = self.pool.get()?;
        let key = participant.to_string();

        let updated = diesel::update(
            notification_deliveries::table
                .find((id.get(), &key))
                .filter(notification_deliveries::read_at.is_null()),
        )
        .set(notification_deliveries::read_at.eq(Some(Utc::now())))
        .execute(&mut conn)?;

        if updated > 0 {
            return Ok(true);
        }

        notification_deliveries::table
            .find((id.get(), &key))
            .select(notification_deliveries::notification_id)
            .first::<i64>(&mut conn)
            .optional()?
            .map(|_| false)
            .ok_or(super::Error::NotFound(*id))
    }
}

#[derive(Default)]
struct MemNotifications {
    last_id: i64,
    notifications: BTreeMap<Id, Notification>,
    deliveries: BTreeMap<(Key, Id), DeliveryStatus>,
}

/// In-process Notification Ledger; one mutex covers creation and read-marking.
#[derive(Default)]
pub struct MemNotificationRepository {
    inner: Mutex<MemNotifications>,
}

impl MemNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemNotifications> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl NotificationRepository for MemNotificationRepository {
    fn create(&self, n: NewNotification, recipients: &[Key]) -> super::Result<Notification> {
        let mut store = self.lock();
        let now = Utc::now();

        store.last_id += 1;
        let stored = n.stored(store.last_id.into(), now);
        store.notifications.insert(*stored.id(), stored.clone());

        for p in recipients {
            store
                .deliveries
                .entry((p.clone(), *stored.id()))
                .or_insert_with(|| DeliveryStatus::new(*stored.id(), p.clone(), now));
        }

        Ok(stored)
    }

    fn find_for(&self, participant: &Key, recent: i64) -> super::Result<Vec<InboxItem>> {
        let store = self.lock();

        let mut items = store
            .deliveries
            .values()
            .filter(|d| d.participant() == participant)
            .filter_map(|d| {
                store.notifications.get(d.notification_id()).map(|n| {
                    InboxItem::new(n.clone(), *d.delivered_at(), d.read_at().copied())
                })
            })
            .collect::<Vec<_>>();
        newest_first(&mut items);

        let mut read_kept = 0;
        items.retain(|i| {
            if i.read_at().is_none() {
                return true;
            }
            read_kept += 1;
            read_kept <= recent
        });

        Ok(items)
    }

    fn mark_read(&self, participant: &Key, id: &Id) -> super::Result<bool> {
        let mut store = self.lock();
        let status = store
            .deliveries
            .get_mut(&(participant.clone(), *id))
            .ok_or(super::Error::NotFound(*id))?;
        Ok(status.mark_read(Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{Kind, Priority};

    fn notice(title: &str) -> NewNotification {
        NewNotification::new(title, "", Kind::Info, Priority::Normal)
    }

    #[test]
    fn should_keep_unread_and_limit_read() {
        let repo = MemNotificationRepository::new();
        let me: Key = "guest:me".parse().unwrap();

        let ids = (0..4)
            .map(|i| *repo.create(notice(&format!("n{i}")), &[me.clone()]).unwrap().id())
            .collect::<Vec<_>>();
        for id in &ids[..3] {
            repo.mark_read(&me, id).unwrap();
        }

        let inbox = repo.find_for(&me, 1).unwrap();
        let titles = inbox
            .iter()
            .map(|i| i.notification().title())
            .collect::<Vec<_>>();
        assert_eq!(titles, vec!["n3", "n2"]);
    }

    #[test]
    fn should_not_duplicate_delivery_rows() {
        let repo = MemNotificationRepository::new();
        let me: Key = "guest:me".parse().unwrap();

        repo.create(notice("twice"), &[me.clone(), me.clone()]).unwrap();
        assert_eq!(repo.find_for(&me, 10).unwrap().len(), 1);
    }
}
