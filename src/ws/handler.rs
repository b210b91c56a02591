use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{self, Message::Close, Message::Text, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, error, warn};
use tokio::sync::{Notify, mpsc};

use super::model::{Inbound, Outbound};
use crate::hub::{ConnectionId, Frame, Hub};
use crate::identity::{self, Credentials, CredentialsParams, middleware::credentials_from_headers};
use crate::participant::Participant;
use crate::{notification, room};

/// Resolves the caller before the upgrade; bad credentials get a 401 and no socket.
pub async fn ws(
    ws: WebSocketUpgrade,
    Query(params): Query<CredentialsParams>,
    headers: HeaderMap,
    State(identity_service): State<identity::Service>,
    State(hub): State<Hub>,
    State(room_service): State<room::Service>,
    State(notification_service): State<notification::Service>,
) -> crate::Result<Response> {
    let credentials = match Credentials::from(params) {
        Credentials::Anonymous => credentials_from_headers(&headers),
        c => c,
    };
    let participant = identity_service.resolve(&credentials).await?;

    Ok(ws.on_upgrade(move |socket| {
        handle_socket(
            socket,
            Session {
                participant,
                hub,
                room_service,
                notification_service,
            },
        )
    }))
}

/// What the reader needs to serve one connection's requests.
struct Session {
    participant: Participant,
    hub: Hub,
    room_service: room::Service,
    notification_service: notification::Service,
}

async fn handle_socket(socket: WebSocket, session: Session) {
    let registration = match session.hub.register(session.participant.key()).await {
        Ok(r) => r,
        Err(e) => {
            error!("could not register connection of {}: {e}", session.participant.key());
            return;
        }
    };

    let conn_id = registration.id;
    let cfg = session.hub.config().clone();
    let hub = session.hub.clone();
    debug!("{conn_id} opened by {}", session.participant.key());

    let (sender, receiver) = socket.split();
    let (reply_tx, reply_rx) = mpsc::channel::<Frame>(cfg.outbox_capacity());
    let close = Arc::new(Notify::new());

    let read_task = tokio::spawn(read(
        conn_id,
        session,
        receiver,
        reply_tx,
        close.clone(),
        cfg.idle_timeout(),
    ));
    let write_task = tokio::spawn(write(
        conn_id,
        sender,
        registration.outbox,
        reply_rx,
        close,
        cfg.ping_interval(),
    ));

    let (r, w) = tokio::join!(read_task, write_task);
    if let Err(e) = r.and(w) {
        error!("{conn_id} task failed: {e}");
    }

    hub.unregister(conn_id);
    debug!("{conn_id} closed");
}

async fn read(
    conn_id: ConnectionId,
    session: Session,
    mut receiver: SplitStream<WebSocket>,
    replies: mpsc::Sender<Frame>,
    close: Arc<Notify>,
    idle_timeout: Duration,
) {
    loop {
        let next = tokio::select! {
            // writer is gone => stop reading
            _ = close.notified() => break,
            next = tokio::time::timeout(idle_timeout, receiver.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                warn!("{conn_id} silent for {idle_timeout:?}, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("{conn_id} read failed: {e}");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        session.hub.touch(conn_id);

        match frame {
            Text(text) => {
                let Some(reply) = dispatch(&session, text.as_str()).await else {
                    continue;
                };
                match serde_json::to_string(&reply) {
                    Ok(json) => {
                        if replies.send(Frame::from(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("failed to serialize reply: {e}"),
                }
            }
            Close(frame) => {
                debug!("{conn_id} closed by client: {frame:?}");
                break;
            }
            ws::Message::Binary(_) => warn!("{conn_id} sent a binary frame, ignoring"),
            // pings are answered by axum; pongs only count as activity
            ws::Message::Ping(_) | ws::Message::Pong(_) => {}
        }
    }

    close.notify_one();
}

async fn dispatch(session: &Session, text: &str) -> Option<Outbound> {
    let inbound = match serde_json::from_str::<Inbound>(text) {
        Ok(i) => i,
        Err(e) => {
            debug!("malformed frame: {e}");
            return Some(Outbound::error(format!("malformed frame: {e}")));
        }
    };

    let participant = &session.participant;
    let result: crate::Result<Option<Outbound>> = match inbound {
        Inbound::Ping => Ok(Some(Outbound::Pong)),
        Inbound::GetNotifications => session
            .notification_service
            .find_for(participant)
            .await
            .map(|data| Some(Outbound::Notifications { data }))
            .map_err(Into::into),
        Inbound::GetRooms => session
            .room_service
            .list_rooms(participant)
            .await
            .map(|data| Some(Outbound::Rooms { data }))
            .map_err(Into::into),
        Inbound::MarkRead { notification_id } => session
            .notification_service
            .mark_read(participant, &notification_id)
            .await
            .map(|_| None)
            .map_err(Into::into),
        // the sender's own connections get the message through the room fan-out
        Inbound::SendMessage { room_id, content } => session
            .room_service
            .send_message(&room_id, participant, &content)
            .await
            .map(|_| None)
            .map_err(Into::into),
    };

    result.unwrap_or_else(|e| Some(Outbound::error(e.public_message())))
}

async fn write(
    conn_id: ConnectionId,
    mut sender: SplitSink<WebSocket, ws::Message>,
    mut outbox: mpsc::Receiver<Frame>,
    mut replies: mpsc::Receiver<Frame>,
    close: Arc<Notify>,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);

    loop {
        let frame = tokio::select! {
            // reader is gone => stop writing
            _ = close.notified() => break,

            pushed = outbox.recv() => match pushed {
                Some(frame) => Text(frame),
                None => {
                    debug!("{conn_id} dropped by the hub");
                    break;
                }
            },
            reply = replies.recv() => match reply {
                Some(frame) => Text(frame),
                None => break,
            },
            _ = ping.tick() => ws::Message::Ping(Bytes::new()),
        };

        if let Err(e) = sender.send(frame).await {
            debug!("{conn_id} write failed: {e}");
            break;
        }
    }

    close.notify_one();
    let _ = sender.close().await;
}
