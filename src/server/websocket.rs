// WebSocket transport for subscriptions

//! # WebSocket Transport
//!
//! One upgraded socket is one [`Connection`]. The session splits the socket:
//!
//! - the reader (this task) decodes client messages through the negotiated
//!   [`WsProtocol`] and forwards subscribe/complete to the registry
//! - a writer task drains the connection's outbound queue plus a small
//!   control channel (acks, pongs, protocol errors) into the socket
//!
//! When the reader ends for any reason the connection is released, which
//! cancels every subscription it owns. Every socket write is bounded by the
//! slow-consumer grace period; a peer that stops reading loses its socket.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderMap},
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{close_code, ClientMessage, ServerMessage, WsProtocol};
use super::readiness::{Readiness, ReadinessStrategy};
use super::{blocked_payload, AppState};
use crate::engine::connection::{Connection, OutboundFrame};
use crate::models::{GraphQLError, SubscriptionRequest, TransportKind};

pub const TOO_MANY_SUBSCRIPTIONS: &str = "Too many subscriptions";

/// `GET /graphql` with an upgrade header
pub async fn graphql_ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let offered = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok());
    let protocol = WsProtocol::from_header(offered);

    ws.protocols([protocol.name()])
        .on_upgrade(move |socket| handle_socket(socket, state, protocol))
}

async fn handle_socket(socket: WebSocket, state: AppState, protocol: WsProtocol) {
    if state.block_subscriptions {
        run_blocked(socket, protocol).await;
        return;
    }

    let (sink, mut stream) = socket.split();
    let (connection, outbound) = state.connections.open(TransportKind::WebSocket).await;
    let (control, control_rx) = mpsc::unbounded_channel();
    info!(
        connection_id = %connection.id(),
        protocol = protocol.name(),
        "🔌 WebSocket connection opened"
    );

    let grace = state.engine.slow_consumer_grace();
    let mut writer = tokio::spawn(write_loop(
        sink,
        protocol,
        outbound,
        control_rx,
        connection.cancellation(),
        grace,
    ));

    let mut session = Session {
        readiness: state.readiness(),
        state: state.clone(),
        connection: Arc::clone(&connection),
        protocol,
        control,
        acknowledged: false,
    };
    session.run(&mut stream).await;

    state.connections.release(connection.id()).await;
    drop(session);
    match tokio::time::timeout(grace, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(connection_id = %connection.id(), error = %e, "WebSocket writer failed"),
        Err(_) => {
            warn!(connection_id = %connection.id(), "WebSocket writer stalled, dropping socket");
            writer.abort();
        }
    }
    info!(connection_id = %connection.id(), "WebSocket connection closed");
}

struct Session {
    state: AppState,
    connection: Arc<Connection>,
    protocol: WsProtocol,
    readiness: ReadinessStrategy,
    control: mpsc::UnboundedSender<ServerMessage>,
    acknowledged: bool,
}

impl Session {
    async fn run(&mut self, stream: &mut SplitStream<WebSocket>) {
        let cancel = self.connection.cancellation();
        let init_deadline = Instant::now() + self.state.engine.connection_init_timeout();

        loop {
            let next = if self.acknowledged {
                self.readiness.next_item(stream, &cancel).await
            } else {
                match tokio::time::timeout_at(init_deadline, self.readiness.next_item(stream, &cancel))
                    .await
                {
                    Ok(next) => next,
                    Err(_) => {
                        self.close(close_code::INIT_TIMEOUT, "Connection initialisation timeout");
                        break;
                    }
                }
            };

            match next {
                Readiness::Item(Ok(Message::Text(text))) => {
                    if !self.handle_text(&text).await {
                        break;
                    }
                }
                Readiness::Item(Ok(Message::Binary(_))) => {
                    self.close(close_code::INVALID_MESSAGE, "Binary messages are not supported");
                    break;
                }
                // Control frames are answered by the socket itself
                Readiness::Item(Ok(Message::Ping(_))) | Readiness::Item(Ok(Message::Pong(_))) => {}
                Readiness::Item(Ok(Message::Close(_))) => break,
                Readiness::Item(Err(e)) => {
                    debug!(connection_id = %self.connection.id(), error = %e, "WebSocket read failed");
                    break;
                }
                Readiness::Idle => continue,
                Readiness::Closed | Readiness::Cancelled => break,
            }
        }
    }

    /// Handles one text message; false ends the session
    async fn handle_text(&mut self, text: &str) -> bool {
        let message = match self.protocol.decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection_id = %self.connection.id(), error = %e, "invalid WebSocket message");
                self.close(close_code::INVALID_MESSAGE, &e.client_message());
                return false;
            }
        };

        match message {
            ClientMessage::ConnectionInit(_) => {
                if self.acknowledged {
                    self.close(close_code::TOO_MANY_INIT_REQUESTS, "Too many initialisation requests");
                    return false;
                }
                self.acknowledged = true;
                self.send(ServerMessage::ConnectionAck);
                if self.protocol == WsProtocol::LegacyWs {
                    self.send(ServerMessage::KeepAlive);
                }
            }
            ClientMessage::Ping(payload) => self.send(ServerMessage::Pong(payload)),
            ClientMessage::Pong => {}
            ClientMessage::Subscribe { id, request } => {
                if !self.acknowledged {
                    self.close(close_code::UNAUTHORIZED, "Unauthorized");
                    return false;
                }
                return self.subscribe(id, request).await;
            }
            ClientMessage::Complete { id } => {
                if let Some(subscription_id) = self.connection.subscription_for(&id) {
                    self.state.registry.unsubscribe(subscription_id).await;
                    // graphql-ws acknowledges `stop`; graphql-transport-ws never echoes `complete`
                    if self.protocol == WsProtocol::LegacyWs {
                        self.send(ServerMessage::Complete { id });
                    }
                }
            }
            ClientMessage::Terminate => return false,
        }
        true
    }

    async fn subscribe(&mut self, id: String, request: SubscriptionRequest) -> bool {
        if self.connection.subscription_for(&id).is_some() {
            let message = format!("Subscriber for {} already exists", id);
            return match self.protocol {
                WsProtocol::TransportWs => {
                    self.close(close_code::SUBSCRIBER_EXISTS, &message);
                    false
                }
                WsProtocol::LegacyWs => {
                    self.send(ServerMessage::Error {
                        id,
                        errors: vec![GraphQLError::new(message)],
                    });
                    true
                }
            };
        }

        if self.connection.subscription_count() >= self.state.engine.max_subscriptions_per_connection {
            self.reject(id, GraphQLError::new(TOO_MANY_SUBSCRIPTIONS));
            return true;
        }

        match self.state.registry.subscribe(&self.connection, &id, &request).await {
            Ok(subscription_id) => {
                debug!(
                    connection_id = %self.connection.id(),
                    subscription_id = %subscription_id,
                    client_id = %id,
                    "subscribed"
                );
            }
            Err(e) => {
                warn!(connection_id = %self.connection.id(), client_id = %id, error = %e, "subscribe failed");
                self.reject(id, GraphQLError::new(e.client_message()));
            }
        }
        true
    }

    fn reject(&self, id: String, error: GraphQLError) {
        self.send(ServerMessage::Error {
            id: id.clone(),
            errors: vec![error],
        });
        self.send(ServerMessage::Complete { id });
    }

    fn send(&self, message: ServerMessage) {
        // The writer is gone only when the connection is already closing
        let _ = self.control.send(message);
    }

    fn close(&self, code: u16, reason: &str) {
        self.send(ServerMessage::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    protocol: WsProtocol,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    mut control: mpsc::UnboundedReceiver<ServerMessage>,
    cancel: CancellationToken,
    grace: Duration,
) {
    loop {
        // Queued frames go out before cancellation is honoured
        let message = tokio::select! {
            biased;
            Some(message) = control.recv() => message,
            Some(frame) = outbound.recv() => ServerMessage::from(frame),
            _ = cancel.cancelled() => break,
            else => break,
        };

        let message = match message {
            ServerMessage::Close { code, reason } => {
                let frame = CloseFrame {
                    code,
                    reason: Cow::Owned(reason),
                };
                let _ = tokio::time::timeout(grace, sink.send(Message::Close(Some(frame)))).await;
                return;
            }
            message => match protocol.encode(&message) {
                Ok(text) => Message::Text(text),
                Err(e) => {
                    error!(error = %e, "failed to encode WebSocket message");
                    continue;
                }
            },
        };

        match tokio::time::timeout(grace, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_) => {
                // The peer stopped reading; dropping the sink closes the socket
                warn!(grace_ms = grace.as_millis() as u64, "WebSocket write timed out");
                cancel.cancel();
                return;
            }
        }
    }
    let _ = tokio::time::timeout(grace, sink.close()).await;
}

/// Serves a socket while subscriptions are blocked.
///
/// No connection or subscription is created; every subscribe gets one
/// error payload followed by `complete`.
async fn run_blocked(socket: WebSocket, protocol: WsProtocol) {
    let (mut sink, mut stream) = socket.split();
    debug!(protocol = protocol.name(), "serving WebSocket with subscriptions blocked");

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let replies = match protocol.decode(&text) {
            Ok(ClientMessage::ConnectionInit(_)) => vec![ServerMessage::ConnectionAck],
            Ok(ClientMessage::Ping(payload)) => vec![ServerMessage::Pong(payload)],
            Ok(ClientMessage::Subscribe { id, .. }) => vec![
                ServerMessage::Next {
                    id: id.clone(),
                    payload: blocked_payload(),
                },
                ServerMessage::Complete { id },
            ],
            Ok(ClientMessage::Terminate) | Err(_) => break,
            Ok(_) => Vec::new(),
        };

        for reply in replies {
            let Ok(text) = protocol.encode(&reply) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
    }
    let _ = sink.close().await;
}
