use crate::auth::TokenVerifier;
use crate::client::ClientRegistry;
use crate::config::RelayConfig;
use crate::connection::ws_handler;
use crate::matchmaker::MatchMaker;
use crate::router::MessageRouter;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, Uri, header::LOCATION},
    response::IntoResponse,
    routing::get,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ClientRegistry>,
    pub matchmaker: Arc<MatchMaker>,
    pub router: MessageRouter,
    pub verifier: Arc<dyn TokenVerifier>,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(config: RelayConfig, verifier: Arc<dyn TokenVerifier>) -> Self {
        let registry = Arc::new(ClientRegistry::new());
        Self {
            matchmaker: Arc::new(MatchMaker::new(registry.clone(), config.requeue_survivor)),
            router: MessageRouter::new(registry.clone()),
            registry,
            verifier,
            config: Arc::new(config),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .fallback(redirect_fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Anything that is not the signaling endpoint goes to the project page.
async fn redirect_fallback(State(state): State<AppState>, uri: Uri) -> impl IntoResponse {
    if uri.path() != "/" {
        info!(path = %uri.path(), "Redirecting unknown path");
    }
    (
        StatusCode::FOUND,
        [(LOCATION, state.config.redirect_url.clone())],
    )
}

/// Serve until `shutdown` resolves, running the match maker alongside.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (matcher_shutdown_tx, matcher_shutdown_rx) = mpsc::channel(1);
    let matchmaker = state.matchmaker.clone();
    let matcher_handle = tokio::spawn(async move { matchmaker.run(matcher_shutdown_rx).await });

    let app = create_router(state);
    info!(addr = %listener.local_addr()?, "Relay listening");

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;

    info!("Shutting down match maker...");
    let _ = matcher_shutdown_tx.send(()).await;
    if let Err(e) = matcher_handle.await {
        error!(error = %e, "Match maker task failed");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SecretVerifier;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        let config = RelayConfig {
            redirect_url: "https://example.org".into(),
            ..RelayConfig::default()
        };
        create_router(AppState::new(config, Arc::new(SecretVerifier::new(b"k"))))
    }

    #[tokio::test]
    async fn test_unknown_path_redirects() {
        let response = app()
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "https://example.org");

        let response = app()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    #[tokio::test]
    async fn test_ws_without_token_is_unauthorized() {
        let response = app()
            .oneshot(Request::get("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_ws_with_invalid_token_is_unauthorized() {
        let response = app()
            .oneshot(
                Request::get("/ws?token=not-a-jwt")
                    .header("Connection", "upgrade")
                    .header("Upgrade", "websocket")
                    .header("Sec-WebSocket-Version", "13")
                    .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
