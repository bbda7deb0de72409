use crate::client::ClientRegistry;
use crate::protocol::Envelope;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// No `to`, or an empty one.
    NoRecipient,
    /// Recipient not connected (or already gone).
    Offline,
    /// Recipient was registered but the write failed.
    Failed,
    /// Not a kind clients may address to each other.
    Ignored,
}

#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<ClientRegistry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    // Fire-and-forget: nothing is ever reported back to the sender.
    // `from` must already be stamped.
    pub async fn route(&self, envelope: &Envelope) -> RouteOutcome {
        if !envelope.kind.is_negotiation() {
            debug!(kind = ?envelope.kind, from = ?envelope.from, "Ignoring non-routable message");
            return RouteOutcome::Ignored;
        }

        let Some(to) = envelope.recipient() else {
            return RouteOutcome::NoRecipient;
        };

        let Some(target) = self.registry.get(to) else {
            debug!(%to, from = ?envelope.from, "Recipient offline, dropping message");
            return RouteOutcome::Offline;
        };

        match target.send_json(envelope).await {
            Ok(()) => RouteOutcome::Delivered,
            Err(e) => {
                warn!(%to, kind = ?envelope.kind, error = %e, "Failed to send message");
                RouteOutcome::Failed
            }
        }
    }
}
