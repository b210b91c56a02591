use std::collections::HashSet;
use std::fmt::{self, Display};
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use log::error;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::{integration, participant};

mod actor;

type Result<T> = std::result::Result<T, Error>;

/// Serialized outbound frame, shared by every connection it is pushed to.
pub type Frame = Utf8Bytes;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct ConnectionId(u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Clone)]
pub struct Config {
    ping_interval: Duration,
    idle_timeout: Duration,
    outbox_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            outbox_capacity: 64,
        }
    }
}

impl Config {
    pub fn new(ping_interval: Duration, idle_timeout: Duration, outbox_capacity: usize) -> Self {
        Self {
            ping_interval,
            idle_timeout,
            outbox_capacity: outbox_capacity.max(1),
        }
    }

    pub fn env() -> std::result::Result<Self, integration::Error> {
        let ping = integration::env_u64("PING_INTERVAL_SECS", 30)?;
        let idle = integration::env_u64("IDLE_TIMEOUT_SECS", 90)?;
        let capacity = integration::env_u64("HUB_OUTBOX_CAPACITY", 64)?;

        Ok(Self::new(
            Duration::from_secs(ping.max(1)),
            Duration::from_secs(idle.max(ping.max(1))),
            capacity as usize,
        ))
    }

    pub const fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    pub const fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub const fn outbox_capacity(&self) -> usize {
        self.outbox_capacity
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("delivery hub is not running")]
    Stopped,
}

/// A registered live connection: its id and the receiving end of its outbox.
pub struct Registration {
    pub id: ConnectionId,
    pub outbox: mpsc::Receiver<Frame>,
}

/// Handle to the Delivery Hub. The connection map lives in a single task;
/// every read or write of it goes through a command on this channel.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<actor::Command>,
    cfg: Config,
}

impl Hub {
    /// Spawns the hub task. It stops once every handle is dropped.
    pub fn spawn(cfg: Config) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(actor::run(cfg.clone(), rx));
        Self { tx, cfg }
    }

    pub const fn config(&self) -> &Config {
        &self.cfg
    }

    pub async fn register(&self, participant: participant::Key) -> Result<Registration> {
        let (reply, rx) = oneshot::channel();
        self.send(actor::Command::Register { participant, reply })?;
        rx.await.map_err(|_| Error::Stopped)
    }

    pub fn unregister(&self, id: ConnectionId) {
        let _ = self.send(actor::Command::Unregister(id));
    }

    /// Records inbound activity on a connection.
    pub fn touch(&self, id: ConnectionId) {
        let _ = self.send(actor::Command::Touch(id));
    }

    /// Queues `frame` for every live connection of `recipients`. Delivery
    /// failures are handled inside the hub and never reported to the caller.
    pub fn push<T: Serialize>(&self, recipients: HashSet<participant::Key>, frame: &T) {
        if recipients.is_empty() {
            return;
        }

        let frame = match serde_json::to_string(frame) {
            Ok(json) => Frame::from(json),
            Err(e) => {
                error!("failed to serialize outbound frame: {e}");
                return;
            }
        };

        if let Err(e) = self.send(actor::Command::Push { recipients, frame }) {
            error!("failed to push frame: {e}");
        }
    }

    pub async fn live_count(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(actor::Command::LiveCount(reply))?;
        rx.await.map_err(|_| Error::Stopped)
    }

    fn send(&self, cmd: actor::Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| Error::Stopped)
    }
}
