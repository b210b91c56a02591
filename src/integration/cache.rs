use std::env;
use std::fmt::{self, Display};

use log::{error, info};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::user;

const DEFAULT_TTL_SECS: u64 = 300;

#[derive(Clone)]
pub struct Config {
    host: String,
    port: u16,
    ttl: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 6379,
            ttl: DEFAULT_TTL_SECS,
        }
    }
}

impl Config {
    pub fn env() -> Option<Self> {
        let host = env::var("REDIS_HOST").ok()?;
        let port = env::var("REDIS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(6379);
        let ttl = env::var("REDIS_TTL_SECS")
            .ok()
            .and_then(|t| t.parse().ok())
            .unwrap_or(DEFAULT_TTL_SECS);

        Some(Self { host, port, ttl })
    }
}

pub async fn init(config: &Config) -> super::Result<ConnectionManager> {
    let con = redis::Client::open(format!("redis://{}:{}", config.host, config.port))?
        .get_connection_manager()
        .await?;
    Ok(con)
}

#[derive(Clone, Debug)]
pub enum Key {
    User(user::Id),
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::User(id) => write!(f, "user:{id}"),
        }
    }
}

/// Best-effort cache: a disabled or failing Redis behaves like a permanent miss.
#[derive(Clone)]
pub struct Redis {
    con: Option<ConnectionManager>,
    ttl: u64,
}

impl Redis {
    pub async fn connect(config: Option<&Config>) -> Self {
        let Some(config) = config else {
            return Self::disabled();
        };

        match init(config).await {
            Ok(con) => {
                info!("connected to redis at {}:{}", config.host, config.port);
                Self {
                    con: Some(con),
                    ttl: config.ttl,
                }
            }
            Err(e) => {
                error!("failed to connect to redis, caching disabled: {e}");
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self {
            con: None,
            ttl: DEFAULT_TTL_SECS,
        }
    }

    pub async fn json_get<T: DeserializeOwned>(&self, key: Key) -> Option<T> {
        let mut con = self.con.clone()?;
        let raw: Option<String> = match con.get(key.to_string()).await {
            Ok(v) => v,
            Err(e) => {
                error!("failed to read {key} from cache: {e}");
                return None;
            }
        };

        raw.and_then(|s| serde_json::from_str(&s).ok())
    }

    pub async fn json_set_ex<T: Serialize>(&self, key: Key, value: &T) {
        let Some(mut con) = self.con.clone() else {
            return;
        };

        let payload = match serde_json::to_string(value) {
            Ok(p) => p,
            Err(e) => {
                error!("could not serialize cache value for {key}: {e}");
                return;
            }
        };

        if let Err(e) = con
            .set_ex::<_, _, ()>(key.to_string(), payload, self.ttl)
            .await
        {
            error!("failed to write {key} to cache: {e}");
        }
    }
}
