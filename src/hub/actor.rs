use std::collections::{HashMap, HashSet};

use log::{debug, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::participant;

use super::{Config, ConnectionId, Frame, Registration};

pub(super) enum Command {
    Register {
        participant: participant::Key,
        reply: oneshot::Sender<Registration>,
    },
    Unregister(ConnectionId),
    Touch(ConnectionId),
    Push {
        recipients: HashSet<participant::Key>,
        frame: Frame,
    },
    LiveCount(oneshot::Sender<usize>),
}

struct Connection {
    participant: participant::Key,
    outbox: mpsc::Sender<Frame>,
    last_seen: Instant,
}

struct Connections {
    cfg: Config,
    last_id: u64,
    live: HashMap<ConnectionId, Connection>,
}

pub(super) async fn run(cfg: Config, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut sweep = tokio::time::interval(cfg.ping_interval());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut conns = Connections {
        cfg,
        last_id: 0,
        live: HashMap::new(),
    };

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => conns.handle(cmd),
                None => break,
            },
            _ = sweep.tick() => conns.sweep(),
        }
    }

    debug!("delivery hub stopped, {} connections dropped", conns.live.len());
}

impl Connections {
    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Register { participant, reply } => self.register(participant, reply),
            Command::Unregister(id) => {
                if let Some(conn) = self.live.remove(&id) {
                    debug!("{id} of {} disconnected", conn.participant);
                }
            }
            Command::Touch(id) => {
                if let Some(conn) = self.live.get_mut(&id) {
                    conn.last_seen = Instant::now();
                }
            }
            Command::Push { recipients, frame } => self.push(&recipients, frame),
            Command::LiveCount(reply) => {
                let _ = reply.send(self.live.len());
            }
        }
    }

    fn register(&mut self, participant: participant::Key, reply: oneshot::Sender<Registration>) {
        self.last_id += 1;
        let id = ConnectionId(self.last_id);
        let (outbox, rx) = mpsc::channel(self.cfg.outbox_capacity());

        if reply.send(Registration { id, outbox: rx }).is_err() {
            return;
        }

        debug!("{id} of {participant} registered");
        self.live.insert(
            id,
            Connection {
                participant,
                outbox,
                last_seen: Instant::now(),
            },
        );
    }

    fn push(&mut self, recipients: &HashSet<participant::Key>, frame: Frame) {
        let mut failed = Vec::new();

        for (id, conn) in self
            .live
            .iter()
            .filter(|(_, c)| recipients.contains(&c.participant))
        {
            match conn.outbox.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("outbox of {id} ({}) is full, dropping connection", conn.participant);
                    failed.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    warn!("{id} ({}) is closed, dropping connection", conn.participant);
                    failed.push(*id);
                }
            }
        }

        // dropping the outbox sender ends the socket writer
        for id in failed {
            self.live.remove(&id);
        }
    }

    fn sweep(&mut self) {
        let idle_timeout = self.cfg.idle_timeout();
        let before = self.live.len();

        self.live
            .retain(|_, c| !c.outbox.is_closed() && c.last_seen.elapsed() <= idle_timeout);

        let reaped = before - self.live.len();
        if reaped > 0 {
            warn!("reaped {reaped} stale connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::Hub;
    use super::*;
    use crate::participant::GuestId;
    use crate::user;

    fn guest(id: &str) -> participant::Key {
        participant::Key::Guest(GuestId::parse(id).unwrap())
    }

    fn recipients(keys: &[&participant::Key]) -> HashSet<participant::Key> {
        keys.iter().map(|k| (*k).clone()).collect()
    }

    #[tokio::test]
    async fn should_push_to_every_connection_of_recipients_only() {
        let hub = Hub::spawn(Config::default());
        let alice = participant::Key::Member(user::Id::random());
        let bob = guest("bob");

        let mut alice_tab1 = hub.register(alice.clone()).await.unwrap();
        let mut alice_tab2 = hub.register(alice.clone()).await.unwrap();
        let mut bob_conn = hub.register(bob.clone()).await.unwrap();

        hub.push(recipients(&[&alice]), &serde_json::json!({"type": "pong"}));

        assert_eq!(alice_tab1.outbox.recv().await.unwrap().as_str(), r#"{"type":"pong"}"#);
        assert_eq!(alice_tab2.outbox.recv().await.unwrap().as_str(), r#"{"type":"pong"}"#);

        assert_eq!(hub.live_count().await.unwrap(), 3);
        assert!(bob_conn.outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn should_drop_full_connection_without_blocking_others() {
        let hub = Hub::spawn(Config::new(
            Duration::from_secs(30),
            Duration::from_secs(90),
            1,
        ));
        let slow = guest("slow");
        let fast = guest("fast");

        let _slow_conn = hub.register(slow.clone()).await.unwrap();
        let mut fast_conn = hub.register(fast.clone()).await.unwrap();
        let both = recipients(&[&slow, &fast]);

        hub.push(both.clone(), &"first");
        assert_eq!(fast_conn.outbox.recv().await.unwrap().as_str(), "\"first\"");

        hub.push(both, &"second");
        assert_eq!(fast_conn.outbox.recv().await.unwrap().as_str(), "\"second\"");

        assert_eq!(hub.live_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn should_drop_closed_connection_on_push() {
        let hub = Hub::spawn(Config::default());
        let gone = guest("gone");

        let conn = hub.register(gone.clone()).await.unwrap();
        drop(conn.outbox);

        hub.push(recipients(&[&gone]), &"hello");
        assert_eq!(hub.live_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn should_reap_idle_and_closed_connections() {
        let hub = Hub::spawn(Config::new(
            Duration::from_millis(10),
            Duration::from_millis(200),
            8,
        ));

        let idle = hub.register(guest("idle")).await.unwrap();
        let closed = hub.register(guest("closed")).await.unwrap();
        drop(closed.outbox);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.live_count().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hub.live_count().await.unwrap(), 0);
        drop(idle);
    }

    #[tokio::test]
    async fn should_keep_touched_connection_alive() {
        let hub = Hub::spawn(Config::new(
            Duration::from_millis(10),
            Duration::from_millis(150),
            8,
        ));
        let conn = hub.register(guest("busy")).await.unwrap();

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            hub.touch(conn.id);
        }

        assert_eq!(hub.live_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn should_forget_unregistered_connection() {
        let hub = Hub::spawn(Config::default());
        let conn = hub.register(guest("brief")).await.unwrap();

        hub.unregister(conn.id);
        assert_eq!(hub.live_count().await.unwrap(), 0);
    }
}
