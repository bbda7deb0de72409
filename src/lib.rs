//! Signaling and matchmaking relay for anonymous one-to-one video chat.
//!
//! Clients connect over a WebSocket authenticated by an OIDC identity token,
//! get paired with the next waiting client, and then exchange opaque
//! negotiation messages (`offer`, `answer`, `ice_candidate`, `bye`) through the
//! relay until one side leaves.
//!
//! ## Architecture
//!
//! ```text
//! GET /ws?token=...
//!         ↓
//! auth (TokenVerifier) ── 401 on failure, no upgrade
//!         ↓
//! connection: establish → read loop + heartbeat → teardown
//!         ↓                        ↓
//! MatchMaker (pool + loop)   MessageRouter
//!         ↘                  ↙
//!          ClientRegistry (DashMap)
//! ```
//!
//! All state is in memory and local to one process.

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod matchmaker;
pub mod protocol;
pub mod router;
pub mod server;

pub use auth::{JwksVerifier, SecretVerifier, TokenVerifier, verifier_from_config};
pub use client::{Client, ClientRegistry};
pub use config::{RelayConfig, VerifierConfig};
pub use error::{AuthError, RelayError, Result};
pub use matchmaker::{MatchMaker, PairingOutcome};
pub use protocol::{Envelope, ServerSignal, SignalKind};
pub use router::{MessageRouter, RouteOutcome};
pub use server::{AppState, create_router, serve};
