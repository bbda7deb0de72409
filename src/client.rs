//! Client record and the registry of live connections.
//!
//! A [`Client`] owns the write half of one WebSocket. Every write goes through
//! an async mutex and is bounded by the configured write deadline, because the
//! match maker, the router and the heartbeat may all target the same client
//! concurrently.

use crate::error::{RelayError, Result};
use axum::extract::ws::Message;
use dashmap::DashMap;
use futures::{Sink, SinkExt};
use serde::Serialize;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, info};
use uuid::Uuid;

/// Write half of a client connection.
pub type ClientSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

/// One authenticated connection. Never reused: a reconnect builds a new `Client`.
pub struct Client {
    /// Verified subject claim of the identity token.
    pub id: String,
    /// Distinguishes successive connections of the same identity in logs.
    pub conn_id: Uuid,
    sink: Mutex<ClientSink>,
    write_wait: Duration,
    evicted: Notify,
}

impl Client {
    pub fn new<S>(id: impl Into<String>, sink: S, write_wait: Duration) -> Self
    where
        S: Sink<Message, Error = axum::Error> + Send + 'static,
    {
        let sink: ClientSink = Box::pin(sink);
        Self {
            id: id.into(),
            conn_id: Uuid::new_v4(),
            sink: Mutex::new(sink),
            write_wait,
            evicted: Notify::new(),
        }
    }

    /// Write one frame. Waiting for the lock counts against the deadline too.
    pub async fn send_frame(&self, msg: Message) -> Result<()> {
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(msg).await
        };
        match timeout(self.write_wait, write).await {
            Ok(result) => result.map_err(RelayError::from),
            Err(_) => Err(RelayError::WriteTimeout),
        }
    }

    /// Serialize `msg` as one JSON text frame.
    pub async fn send_json<T: Serialize>(&self, msg: &T) -> Result<()> {
        let text = serde_json::to_string(msg)?;
        self.send_frame(Message::Text(text.into())).await
    }

    /// Transport-level liveness check.
    pub async fn ping(&self) -> Result<()> {
        self.send_frame(Message::Ping(Vec::new().into())).await
    }

    /// Ask the connection task to end this session. Sticky: an eviction that
    /// lands before the read loop starts waiting is not lost.
    pub fn evict(&self) {
        debug!(client_id = %self.id, conn_id = %self.conn_id, "Evicting client");
        self.evicted.notify_one();
    }

    /// Resolves once [`Client::evict`] has been called.
    pub async fn evicted(&self) {
        self.evicted.notified().await
    }

    /// Flush and close the write half; errors are irrelevant at this point.
    pub async fn close(&self) {
        let close = async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };
        if let Ok(Err(e)) = timeout(self.write_wait, close).await {
            debug!(client_id = %self.id, error = %e, "close after teardown failed");
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("conn_id", &self.conn_id)
            .finish_non_exhaustive()
    }
}

/// Identity -> live client. Last connection for an identity wins.
pub struct ClientRegistry {
    clients: DashMap<String, Arc<Client>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Register `client`, returning the connection it superseded, if any.
    pub fn put(&self, client: Arc<Client>) -> Option<Arc<Client>> {
        let id = client.id.clone();
        let conn_id = client.conn_id;
        let previous = self.clients.insert(id.clone(), client);
        match &previous {
            Some(old) => info!(
                client_id = %id,
                %conn_id,
                old_conn_id = %old.conn_id,
                "Client reconnected, superseding previous connection"
            ),
            None => info!(client_id = %id, %conn_id, "Client registered"),
        }
        previous
    }

    pub fn get(&self, id: &str) -> Option<Arc<Client>> {
        self.clients.get(id).map(|entry| entry.value().clone())
    }

    /// Remove `client` only if it is still the registered connection for its
    /// identity, so a stale teardown cannot evict a newer reconnection.
    pub fn remove_if_current(&self, client: &Arc<Client>) -> bool {
        let removed = self
            .clients
            .remove_if(&client.id, |_, current| Arc::ptr_eq(current, client))
            .is_some();
        if removed {
            info!(client_id = %client.id, conn_id = %client.conn_id, "Client unregistered");
        }
        removed
    }

    /// Whether `client` is still the live connection for its identity.
    pub fn is_current(&self, client: &Arc<Client>) -> bool {
        self.clients
            .get(&client.id)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), client))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::protocol::ServerSignal;
    use std::task::{Context, Poll};

    type SinkResult = std::result::Result<(), axum::Error>;

    /// Never accepts a frame, like a peer that stopped reading.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = axum::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<SinkResult> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> SinkResult {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<SinkResult> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<SinkResult> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_send_json_writes_text_frame() {
        let (client, mut rx) = channel_client("alice");
        client
            .send_json(&ServerSignal::Init("alice".into()))
            .await
            .unwrap();

        let frames = drain_json(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "init");
        assert_eq!(frames[0]["payload"], "alice");
    }

    #[tokio::test]
    async fn test_write_to_dead_peer_is_transport_error() {
        let client = dead_client("ghost");
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));
    }

    #[tokio::test]
    async fn test_stalled_peer_hits_write_deadline() {
        let client = Client::new("slow", StalledSink, Duration::from_millis(50));

        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, RelayError::WriteTimeout));

        // The stalled write released the lock, so the next one times out too
        // instead of hanging forever behind it.
        let err = client
            .send_json(&ServerSignal::Match("bob".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::WriteTimeout));
    }

    #[tokio::test]
    async fn test_eviction_is_not_lost_before_waiting() {
        let (client, _rx) = channel_client("alice");
        client.evict();

        tokio::time::timeout(Duration::from_millis(100), client.evicted())
            .await
            .expect("eviction observed");
    }

    #[test]
    fn test_put_is_last_connection_wins() {
        let registry = ClientRegistry::new();
        let (first, _rx1) = channel_client("alice");
        let (second, _rx2) = channel_client("alice");

        assert!(registry.put(first.clone()).is_none());
        let superseded = registry.put(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&superseded, &first));

        let current = registry.get("alice").unwrap();
        assert!(Arc::ptr_eq(&current, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_teardown_keeps_newer_connection() {
        let registry = ClientRegistry::new();
        let (old, _rx1) = channel_client("alice");
        let (new, _rx2) = channel_client("alice");
        registry.put(old.clone());
        registry.put(new.clone());

        assert!(!registry.is_current(&old));
        assert!(!registry.remove_if_current(&old));
        assert!(registry.is_current(&new));

        assert!(registry.remove_if_current(&new));
        assert!(registry.get("alice").is_none());
        // Second teardown of the same client is a no-op.
        assert!(!registry.remove_if_current(&new));
        assert!(registry.is_empty());
    }
}
