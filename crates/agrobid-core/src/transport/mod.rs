// Transport seams: the real-time channel and the REST API, plus the events
// the transport delivers to the session driver.

pub mod reconnect;
pub mod rest;
pub mod ws;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{AuctionId, AuctionView, BidAcceptance, BidValidation, ClientSignal, ProtocolAnomaly, ServerEvent};

pub use reconnect::{ConnectionState, DisconnectReason, ReconnectDecision, ReconnectPolicy};
pub use rest::{ApiError, RestClient};
pub use ws::{WsConfig, WsTransport};

/// Everything the transport hands to the session driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Server(ServerEvent),
    Connection(ConnectionEvent),
    /// A frame that failed boundary validation.
    Anomaly(ProtocolAnomaly),
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected(DisconnectReason),
    ConnectError(String),
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// The reconnect cap was reached; the transport has stopped.
    ReconnectExhausted { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no auth token available")]
    MissingToken,

    #[error("invalid server url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("real-time channel is not connected")]
    NotConnected,

    #[error("transport is closed")]
    Closed,
}

/// The outgoing half of the real-time connection.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn send(&self, signal: ClientSignal) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

/// Request/response calls against the auction server.
#[async_trait]
pub trait AuctionApi: Send + Sync {
    /// `GET auction-state`: a full snapshot.
    async fn auction_state(&self, auction_id: &AuctionId) -> Result<AuctionView, ApiError>;

    /// `POST validate-bid`: non-committing pre-flight check.
    async fn validate_bid(&self, auction_id: &AuctionId, amount: u64) -> Result<BidValidation, ApiError>;

    /// `POST place-bid`: used only when the real-time channel is unavailable.
    async fn place_bid(&self, auction_id: &AuctionId, amount: u64) -> Result<BidAcceptance, ApiError>;
}

/// Normalise a configured token: blank counts as absent.
pub(crate) fn usable_token(token: Option<&str>) -> Option<&str> {
    token.map(str::trim).filter(|t| !t.is_empty())
}
