use std::collections::BTreeMap;
use std::sync::Mutex;

use diesel::ExpressionMethods;
use diesel::OptionalExtension;
use diesel::QueryDsl;
use diesel::RunQueryDsl;
use diesel::SelectableHelper;
use diesel::upsert::excluded;

use crate::integration::db::Pool;
use crate::schema::users;

use super::model::{User, UserRow};
use super::{Id, Role};

/// Read side of the member directory. `upsert` exists for seeding and tests;
/// the directory itself is owned elsewhere.
pub trait UserRepository {
    fn upsert(&self, user: &User) -> super::Result<()>;

    fn find_by_id(&self, id: &Id) -> super::Result<User>;

    fn find_by_role(&self, role: &Role) -> super::Result<Vec<User>>;

    fn find_all(&self) -> super::Result<Vec<User>>;
}

pub struct PgUserRepository {
    pool: Pool,
}

impl PgUserRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl UserRepository for PgUserRepository {
    fn upsert(&self, u: &User) -> super::Result<()> {
        let mut conn = self.pool.get()?;

        diesel::insert_into(users::table)
            .values(UserRow::from(u))
            .on_conflict(users::id)
            .do_update()
            .set((
                users::display_name.eq(excluded(users::display_name)),
                users::role.eq(excluded(users::role)),
            ))
            .execute(&mut conn)?;

        Ok(())
    }

    fn find_by_id(&self, id: &Id) -> super::Result<User> {
        let mut conn = self.pool.get()?;

        users::table
            .find(*id.get())
            .select(UserRow::as_select())
            .first::<UserRow>(&mut conn)
            .optional()?
            .map(User::from)
            .ok_or(super::Error::NotFound(*id))
    }

    fn find_by_role(&self, role: &Role) -> super::Result<Vec<User>> {
        let mut conn = self.pool.get()?;

        let users = users::table
            .filter(users::role.eq(role.as_str()))
            .order(users::id)
            .select(UserRow::as_select())
            .load::<UserRow>(&mut conn)?;

        Ok(users.into_iter().map(User::from).collect())
    }

    fn find_all(&self) -> super::Result<Vec<User>> {
        let mut conn = self.pool.get()?;

        let users = users::table
            .order(users::id)
            .select(UserRow::as_select())
            .load::<UserRow>(&mut conn)?;

        Ok(users.into_iter().map(User::from).collect())
    }
}

#[derive(Default)]
pub struct MemUserRepository {
    users: Mutex<BTreeMap<Id, User>>,
}

impl MemUserRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserRepository for MemUserRepository {
    fn upsert(&self, user: &User) -> super::Result<()> {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users.insert(*user.id(), user.clone());
        Ok(())
    }

    fn find_by_id(&self, id: &Id) -> super::Result<User> {
        let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users.get(id).cloned().ok_or(super::Error::NotFound(*id))
    }

    fn find_by_role(&self, role: &Role) -> super::Result<Vec<User>> {
        let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        Ok(users.values().filter(|u| u.role() == role).cloned().collect())
    }

    fn find_all(&self) -> super::Result<Vec<User>> {
        let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        Ok(users.values().cloned().collect())
    }
}
