// Server-Sent Events transport for subscriptions

//! # SSE Transport
//!
//! `POST /graphql` with `Accept: text/event-stream` runs exactly one
//! subscription per HTTP response:
//!
//! ```text
//! event: next
//! data: {"data":{...}}
//!
//! event: complete
//! ```
//!
//! The response stream owns a guard for its connection. When the client goes
//! away axum drops the stream, the guard releases the connection and the
//! subscription is cancelled.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::ACCEPT, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{blocked_payload, AppState};
use crate::engine::connection::{Connection, ConnectionManager, Frame, OutboundFrame};
use crate::models::event::errors_payload;
use crate::models::{ConnectionId, GraphQLError, SubscriptionRequest, TransportKind};

/// SSE responses carry a single subscription with this protocol id
pub const SSE_CLIENT_ID: &str = "1";

const EVENT_STREAM: &str = "text/event-stream";

type EventStream = BoxStream<'static, Result<Event, Infallible>>;

pub async fn graphql_sse_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !accepts_event_stream(&headers) {
        return (
            StatusCode::NOT_ACCEPTABLE,
            "subscriptions over HTTP require Accept: text/event-stream",
        )
            .into_response();
    }

    let request: SubscriptionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid GraphQL request: {}", e)).into_response()
        }
    };

    let keep_alive = KeepAlive::new().interval(state.engine.sse_keep_alive());

    if state.block_subscriptions {
        debug!("SSE subscription refused, subscriptions are blocked");
        return Sse::new(single_error(blocked_payload())).keep_alive(keep_alive).into_response();
    }

    let (connection, outbound) = state.connections.open(TransportKind::Sse).await;
    if let Err(e) = state
        .registry
        .subscribe(&connection, SSE_CLIENT_ID, &request)
        .await
    {
        warn!(connection_id = %connection.id(), error = %e, "SSE subscribe failed");
        state.connections.release(connection.id()).await;
        let payload = errors_payload(&[GraphQLError::new(e.client_message())]);
        return Sse::new(single_error(payload)).keep_alive(keep_alive).into_response();
    }

    debug!(connection_id = %connection.id(), "SSE subscription started");
    Sse::new(subscription_events(state.connections.clone(), connection, outbound))
        .keep_alive(keep_alive)
        .into_response()
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|media| media.trim().starts_with(EVENT_STREAM))
}

fn next_event(payload: &serde_json::Value) -> Event {
    Event::default().event("next").data(payload.to_string())
}

fn complete_event() -> Event {
    Event::default().event("complete").data("")
}

fn single_error(payload: serde_json::Value) -> EventStream {
    stream::iter([Ok(next_event(&payload)), Ok(complete_event())]).boxed()
}

/// Releases the connection when the response stream is dropped
struct ReleaseGuard {
    connections: ConnectionManager,
    id: ConnectionId,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let connections = self.connections.clone();
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                connections.release(id).await;
            });
        }
    }
}

struct StreamState {
    outbound: mpsc::Receiver<OutboundFrame>,
    connection: Arc<Connection>,
    _guard: ReleaseGuard,
    done: bool,
}

fn subscription_events(
    connections: ConnectionManager,
    connection: Arc<Connection>,
    outbound: mpsc::Receiver<OutboundFrame>,
) -> EventStream {
    let initial = StreamState {
        outbound,
        _guard: ReleaseGuard {
            connections,
            id: connection.id(),
        },
        connection,
        done: false,
    };

    stream::unfold(initial, |mut state| async move {
        if state.done {
            return None;
        }

        let cancel = state.connection.cancellation();
        let frame = tokio::select! {
            biased;
            frame = state.outbound.recv() => frame?,
            _ = cancel.cancelled() => return None,
        };

        let event = match frame.frame {
            Frame::Next(payload) => next_event(&payload),
            Frame::Error(errors) => next_event(&errors_payload(&errors)),
            Frame::Complete => {
                state.done = true;
                complete_event()
            }
        };
        Some((Ok(event), state))
    })
    .boxed()
}
