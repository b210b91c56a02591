use crate::integration::cache;

use super::model::User;
use super::{Id, Repository, Role};

#[async_trait::async_trait]
pub trait UserService {
    async fn find(&self, id: &Id) -> super::Result<User>;

    async fn find_by_role(&self, role: &Role) -> super::Result<Vec<User>>;

    async fn find_all(&self) -> super::Result<Vec<User>>;
}

#[derive(Clone)]
pub struct UserServiceImpl {
    repo: Repository,
    redis: cache::Redis,
}

impl UserServiceImpl {
    pub fn new(repo: Repository, redis: cache::Redis) -> Self {
        Self { repo, redis }
    }
}

#[async_trait::async_trait]
impl UserService for UserServiceImpl {
    async fn find(&self, id: &Id) -> super::Result<User> {
        let key = cache::Key::User(*id);
        if let Some(user) = self.redis.json_get::<User>(key.clone()).await {
            return Ok(user);
        }

        let user = self.repo.find_by_id(id)?;
        self.redis.json_set_ex(key, &user).await;
        Ok(user)
    }

    async fn find_by_role(&self, role: &Role) -> super::Result<Vec<User>> {
        self.repo.find_by_role(role)
    }

    async fn find_all(&self) -> super::Result<Vec<User>> {
        self.repo.find_all()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::user::repository::{MemUserRepository, UserRepository};

    #[tokio::test]
    async fn should_find_users_by_role() {
        let repo = Arc::new(MemUserRepository::new());
        let admin = User::new(Id::random(), "Ada", Role::new("admin"));
        let member = User::new(Id::random(), "Bob", Role::new("member"));
        repo.upsert(&admin).unwrap();
        repo.upsert(&member).unwrap();

        let service = UserServiceImpl::new(repo, cache::Redis::disabled());

        let admins = service.find_by_role(&Role::new("admin")).await.unwrap();
        assert_eq!(admins, vec![admin.clone()]);
        assert_eq!(service.find(admin.id()).await.unwrap(), admin);
        assert_eq!(service.find_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn should_fail_on_unknown_user() {
        let service = UserServiceImpl::new(
            Arc::new(MemUserRepository::new()),
            cache::Redis::disabled(),
        );

        let missing = Id::random();
        match service.find(&missing).await {
            Err(crate::user::Error::NotFound(id)) => assert_eq!(id, missing),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
