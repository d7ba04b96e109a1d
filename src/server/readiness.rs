// Socket read strategies

//! # Readiness Strategy
//!
//! How a connection loop waits for the next client message:
//!
//! - [`ReadinessStrategy::Evented`]: wait on socket readiness and the
//!   connection's cancellation together; the loop wakes only when one fires.
//! - [`ReadinessStrategy::ReadDeadline`]: read with a fixed deadline; when it
//!   expires the loop gets [`Readiness::Idle`], re-checks cancellation and
//!   reads again.
//!
//! Both strategies produce the same sequence of items for the same socket.

use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessStrategy {
    Evented,
    ReadDeadline(Duration),
}

/// Outcome of one wait
#[derive(Debug, PartialEq)]
pub enum Readiness<T> {
    Item(T),
    /// The read deadline passed without input
    Idle,
    /// The client side of the stream ended
    Closed,
    Cancelled,
}

impl ReadinessStrategy {
    pub fn from_config(engine: &EngineConfig) -> Self {
        if engine.enable_readiness_polling {
            ReadinessStrategy::Evented
        } else {
            ReadinessStrategy::ReadDeadline(engine.websocket_read_timeout())
        }
    }

    pub async fn next_item<S>(&self, stream: &mut S, cancel: &CancellationToken) -> Readiness<S::Item>
    where
        S: Stream + Unpin,
    {
        match self {
            ReadinessStrategy::Evented => tokio::select! {
                biased;
                _ = cancel.cancelled() => Readiness::Cancelled,
                item = stream.next() => match item {
                    Some(item) => Readiness::Item(item),
                    None => Readiness::Closed,
                },
            },
            ReadinessStrategy::ReadDeadline(deadline) => {
                if cancel.is_cancelled() {
                    return Readiness::Cancelled;
                }
                match tokio::time::timeout(*deadline, stream.next()).await {
                    Ok(Some(item)) => Readiness::Item(item),
                    Ok(None) => Readiness::Closed,
                    Err(_) => Readiness::Idle,
                }
            }
        }
    }
}
