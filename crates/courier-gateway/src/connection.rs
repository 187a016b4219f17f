use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use courier_core::{ChatError, Courier, OutgoingMessage};
use courier_types::events::{GatewayCommand, GatewayEvent};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Conversations this connection joined. Shared by the send and recv tasks.
type Subscriptions = Arc<RwLock<HashSet<Uuid>>>;

/// Per-connection state handed to command handling.
struct Session {
    courier: Courier,
    user_id: Uuid,
    username: String,
    conn_id: Uuid,
    subscriptions: Subscriptions,
    /// Replies meant for this connection only, even if a newer one owns presence.
    reply_tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl Session {
    fn reply(&self, event: GatewayEvent) {
        let _ = self.reply_tx.send(event);
    }

    fn reply_error(&self, err: &ChatError, client_ref: Option<String>) {
        self.reply(GatewayEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            client_ref,
        });
    }

    fn is_subscribed(&self, conversation_id: Uuid) -> bool {
        is_subscribed(&self.subscriptions, conversation_id)
    }
}

fn is_subscribed(subscriptions: &Subscriptions, conversation_id: Uuid) -> bool {
    subscriptions
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .contains(&conversation_id)
}

/// Decide whether a broadcast reaches this connection. Conversation events
/// need a joined channel; the user's own typing is not echoed back. Seeing
/// itself leave a conversation drops that channel.
fn should_forward(event: &GatewayEvent, user_id: Uuid, subscriptions: &Subscriptions) -> bool {
    if let Some(conversation_id) = event.conversation_id() {
        if !is_subscribed(subscriptions, conversation_id) {
            return false;
        }
    }
    match event {
        GatewayEvent::UserTyping { user_id: from, .. }
        | GatewayEvent::UserStoppedTyping { user_id: from, .. } => *from != user_id,
        GatewayEvent::ParticipantLeft { conversation_id, user_id: leaver } => {
            if *leaver == user_id {
                subscriptions
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(conversation_id);
            }
            true
        }
        _ => true,
    }
}

fn encode(event: &GatewayEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!("Failed to encode gateway event: {}", e);
            None
        }
    }
}

/// Handle a pre-authenticated WebSocket connection. The bearer token was
/// verified at the HTTP upgrade, so the connection starts with `ready`.
pub async fn handle_connection(socket: WebSocket, courier: Courier, user_id: Uuid, username: String) {
    let (mut sender, mut receiver) = socket.split();
    let dispatcher = courier.dispatcher().clone();

    info!("{} ({}) connected to gateway", username, user_id);

    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    let Some(ready) = encode(&ready) else { return };
    if sender.send(ready).await.is_err() {
        return;
    }

    // Subscribe before registering so our own status broadcast can't be missed by others.
    let mut broadcast_rx = dispatcher.subscribe();
    let (conn_id, mut user_rx) = dispatcher.connect(user_id).await;
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    let _ = reply_tx.send(GatewayEvent::OnlineUsers {
        users: dispatcher.online_users().await,
    });

    let subscriptions: Subscriptions = Arc::new(RwLock::new(HashSet::new()));
    let send_subscriptions = subscriptions.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward broadcasts, private events and replies to the client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            let event = tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };
                    if !should_forward(&event, user_id, &send_subscriptions) {
                        continue;
                    }
                    event
                }
                result = user_rx.recv() => match result {
                    Some(event) => event,
                    None => break,
                },
                result = reply_rx.recv() => match result {
                    Some(event) => event,
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let Some(frame) = encode(&event) else { continue };
            if sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    let session = Session {
        courier,
        user_id,
        username: username.clone(),
        conn_id,
        subscriptions,
        reply_tx,
    };

    // Read commands from client
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        session.courier.dispatcher().touch(session.user_id, session.conn_id).await;
                        handle_command(&session, cmd).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            session.username,
                            session.user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        session.reply(GatewayEvent::Error {
                            code: "bad_command".into(),
                            message: e.to_string(),
                            client_ref: None,
                        });
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.disconnect(user_id, conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn handle_command(session: &Session, cmd: GatewayCommand) {
    let user_id = session.user_id;
    let dispatcher = session.courier.dispatcher();

    match cmd {
        GatewayCommand::SendMessage {
            conversation_id,
            receiver_id,
            content,
            client_ref,
        } => {
            let outgoing = OutgoingMessage {
                conversation_id,
                receiver_id,
                content,
                client_ref: client_ref.clone(),
            };
            // The delivery acknowledgment arrives on the private channel.
            if let Err(e) = session.courier.send_message(user_id, outgoing).await {
                debug!("send-message from {} failed: {}", user_id, e);
                session.reply_error(&e, client_ref);
            }
        }

        GatewayCommand::JoinConversation { conversation_id } => {
            match session.courier.conversation_for(user_id, conversation_id).await {
                Ok(_) => {
                    session
                        .subscriptions
                        .write()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .insert(conversation_id);
                    debug!("{} ({}) joined conversation {}", session.username, user_id, conversation_id);
                }
                Err(e) => session.reply_error(&e, None),
            }
        }

        GatewayCommand::LeaveConversation { conversation_id } => {
            session
                .subscriptions
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&conversation_id);
        }

        GatewayCommand::Typing { conversation_id } => {
            if session.is_subscribed(conversation_id) {
                trace!("{} typing in {}", user_id, conversation_id);
                dispatcher.broadcast(GatewayEvent::UserTyping {
                    conversation_id,
                    user_id,
                    username: session.username.clone(),
                });
            }
        }

        GatewayCommand::StopTyping { conversation_id } => {
            if session.is_subscribed(conversation_id) {
                trace!("{} stopped typing in {}", user_id, conversation_id);
                dispatcher.broadcast(GatewayEvent::UserStoppedTyping {
                    conversation_id,
                    user_id,
                });
            }
        }

        GatewayCommand::MessageRead { message_id } => {
            if let Err(e) = session.courier.mark_read(user_id, message_id).await {
                session.reply_error(&e, None);
            }
        }

        GatewayCommand::UpdateStatus { status } => {
            if !dispatcher.set_status(user_id, session.conn_id, status).await {
                session.reply(GatewayEvent::Error {
                    code: "invalid_status".into(),
                    message: "status cannot be set on this connection".into(),
                    client_ref: None,
                });
            }
        }

        GatewayCommand::GetOnlineUsers => {
            let users = dispatcher.online_users().await;
            session.reply(GatewayEvent::OnlineUsers { users });
        }
    }
}
