//! Resolve a message's recipients and queue it to each of them.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use switchboard_wire::{Message, encode};

use crate::metrics::ServerMetrics;
use crate::registry::Registry;

/// What happened to one routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Queued to `queued` connections; `failed` recipients could not keep up
    /// and were closed.
    Sent { queued: usize, failed: usize },
    /// Directed at a user who is not online. Nothing was sent.
    NoRecipient,
    /// Anonymous or unencodable. Nothing was sent.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<Registry>,
    metrics: Arc<ServerMetrics>,
}

impl Router {
    pub fn new(registry: Arc<Registry>, metrics: Arc<ServerMetrics>) -> Self {
        Self { registry, metrics }
    }

    /// Deliver `msg` to its receiver, or to every other online user if it is
    /// a broadcast. Never blocks and never reports failure to the sender.
    ///
    /// A message with an empty sender id is never routed.
    pub fn route_message(&self, msg: &Message) -> RouteOutcome {
        if msg.sender_id().is_empty() {
            debug!(
                receiver = %msg.receiver_id(),
                kind = %msg.kind(),
                "empty sender id, dropping message"
            );
            self.metrics.message_dropped();
            return RouteOutcome::Rejected;
        }

        let frame = match encode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    sender = %msg.sender_id(),
                    code = e.error_code(),
                    "cannot re-encode message: {}", e
                );
                self.metrics.message_dropped();
                return RouteOutcome::Rejected;
            }
        };

        if msg.is_broadcast() {
            return self.broadcast(msg, frame);
        }

        let Some(target) = self.registry.lookup(msg.receiver_id()) else {
            debug!(
                sender = %msg.sender_id(),
                receiver = %msg.receiver_id(),
                kind = %msg.kind(),
                "receiver offline, dropping message"
            );
            self.metrics.message_dropped();
            return RouteOutcome::NoRecipient;
        };

        if target.send_frame(frame) {
            self.metrics.frame_delivered();
            RouteOutcome::Sent {
                queued: 1,
                failed: 0,
            }
        } else {
            self.metrics.send_failed();
            RouteOutcome::Sent {
                queued: 0,
                failed: 1,
            }
        }
    }

    fn broadcast(&self, msg: &Message, frame: Bytes) -> RouteOutcome {
        let mut queued = 0;
        let mut failed = 0;

        for handle in self.registry.handles() {
            if handle.user_id() == msg.sender_id() {
                continue;
            }
            // Bytes clone is a refcount bump; every recipient shares one encoding.
            if handle.send_frame(frame.clone()) {
                self.metrics.frame_delivered();
                queued += 1;
            } else {
                self.metrics.send_failed();
                failed += 1;
            }
        }

        debug!(sender = %msg.sender_id(), kind = %msg.kind(), queued, failed, "broadcast");
        RouteOutcome::Sent { queued, failed }
    }
}
