use std::env;
use std::time::Duration;

use diesel::PgConnection;
use diesel::connection::SimpleConnection;
use diesel::r2d2::ConnectionManager;
use log::info;

pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

const INIT_SCHEMA: &str = include_str!("../../migrations/00000000000000_init/up.sql");

#[derive(Clone)]
pub struct Config {
    url: String,
    pool_size: u32,
    connection_timeout: Duration,
}

impl Config {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: 10,
            connection_timeout: Duration::from_secs(5),
        }
    }

    pub fn env() -> Option<Self> {
        let url = env::var("DATABASE_URL").ok()?;
        let pool_size = env::var("DB_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        Some(Self {
            pool_size,
            ..Self::new(url)
        })
    }
}

pub fn init(config: &Config) -> super::Result<Pool> {
    let manager = ConnectionManager::<PgConnection>::new(&config.url);
    let pool = r2d2::Pool::builder()
        .max_size(config.pool_size)
        .connection_timeout(config.connection_timeout)
        .build(manager)?;

    Ok(pool)
}

/// Applies the bundled schema; every statement is `IF NOT EXISTS`, so reruns are harmless.
pub fn migrate(pool: &Pool) -> super::Result<()> {
    let mut conn = pool.get()?;
    conn.batch_execute(INIT_SCHEMA)?;
    info!("database schema is up to date");
    Ok(())
}
