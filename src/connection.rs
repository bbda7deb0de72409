use crate::auth::AuthenticatedClient;
use crate::client::Client;
use crate::error::{RelayError, Result};
use crate::protocol::{Envelope, ServerSignal, SignalKind};
use crate::server::AppState;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::stream::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, timeout_at};
use tracing::{debug, error, info, warn};

/// Upgrade handler for `/ws`. Authentication runs first, so a rejected
/// request never gets a socket.
pub async fn ws_handler(
    client: AuthenticatedClient,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    let limit = state.config.max_message_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_failed_upgrade(|e| error!(error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| handle_socket(socket, client.id, state))
}

async fn handle_socket(socket: WebSocket, client_id: String, state: AppState) {
    let (sink, mut stream) = socket.split();
    let client = Arc::new(Client::new(client_id, sink, state.config.write_wait));

    info!(client_id = %client.id, conn_id = %client.conn_id, "Client connected (authenticated)");

    if let Err(e) = establish(&state, &client).await {
        warn!(client_id = %client.id, error = %e, "Failed to send init, dropping connection");
        teardown(&state, &client, None).await;
        return;
    }

    let mut heartbeat = tokio::spawn(heartbeat(client.clone(), state.config.ping_period()));

    match read_loop(&state, &client, &mut stream, &mut heartbeat).await {
        Ok(()) => info!(client_id = %client.id, "Client disconnected"),
        Err(e) if e.is_peer_death() => {
            info!(client_id = %client.id, error = %e, "Client connection lost")
        }
        Err(e) => warn!(client_id = %client.id, error = %e, "Closing misbehaving client"),
    }

    teardown(&state, &client, Some(heartbeat)).await;
}

/// Register the client, tell it who it is and queue it for matching.
pub async fn establish(state: &AppState, client: &Arc<Client>) -> Result<()> {
    state.registry.put(client.clone());
    client
        .send_json(&ServerSignal::Init(client.id.clone()))
        .await?;
    state.matchmaker.add(client.clone());
    Ok(())
}

/// Periodic transport-level ping. Only returns once a ping cannot be written.
async fn heartbeat(client: Arc<Client>, period: Duration) -> RelayError {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        if let Err(e) = client.ping().await {
            info!(client_id = %client.id, error = %e, "Ping failed, closing connection");
            return e;
        }
    }
}

/// Read frames in arrival order until the peer leaves, misbehaves, stops
/// answering pings, gets evicted, or the heartbeat gives up.
async fn read_loop<S>(
    state: &AppState,
    client: &Arc<Client>,
    stream: &mut S,
    heartbeat: &mut JoinHandle<RelayError>,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin,
{
    let pong_wait = state.config.pong_wait;
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let frame = tokio::select! {
            next = timeout_at(deadline, stream.next()) => match next {
                Err(_) => return Err(RelayError::ReadTimeout),
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(RelayError::Transport(e)),
                Ok(Some(Ok(frame))) => frame,
            },
            ended = &mut *heartbeat => {
                return Err(ended.unwrap_or_else(|e| RelayError::Transport(axum::Error::new(e))));
            }
            _ = client.evicted() => return Err(RelayError::Evicted),
        };

        match frame {
            Message::Text(text) => handle_frame(state, client, text.as_bytes()).await?,
            Message::Binary(data) => handle_frame(state, client, &data).await?,
            Message::Pong(_) => deadline = Instant::now() + pong_wait,
            // Answered by the transport.
            Message::Ping(_) => {}
            Message::Close(reason) => {
                debug!(client_id = %client.id, ?reason, "Close frame received");
                return Ok(());
            }
        }
    }
}

/// Decode one data frame, stamp the sender and hand it to the router.
async fn handle_frame(state: &AppState, client: &Arc<Client>, bytes: &[u8]) -> Result<()> {
    if bytes.len() > state.config.max_message_size {
        return Err(RelayError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            bytes.len()
        )));
    }

    let mut envelope = Envelope::decode(bytes)
        .map_err(|e| RelayError::Protocol(format!("malformed frame: {e}")))?;
    envelope.stamp_sender(&client.id);

    if envelope.kind == SignalKind::Bye {
        info!(client_id = %client.id, to = ?envelope.recipient(), "Client ended session");
    }

    let outcome = state.router.route(&envelope).await;
    debug!(client_id = %client.id, kind = ?envelope.kind, ?outcome, "Routed message");
    Ok(())
}

/// Release everything the connection held. Each step tolerates the client
/// already being gone.
async fn teardown(state: &AppState, client: &Arc<Client>, heartbeat: Option<JoinHandle<RelayError>>) {
    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }
    state.registry.remove_if_current(client);
    state.matchmaker.remove(client);
    client.close().await;
    info!(client_id = %client.id, conn_id = %client.conn_id, "Client fully disconnected");
}
