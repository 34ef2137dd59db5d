//! Peer-connection capability surface.
//!
//! The actual transport (ICE, DTLS, SCTP) is a black box. This module names
//! the operations and events the rest of the crate relies on, so that a
//! native WebRTC stack and the in-memory loopback in [`memory`] are
//! interchangeable.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::signal::{ClientId, IceCandidate, SessionDescription};
use crate::subscription::Subscription;

/// Offer/answer state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    /// No negotiation in progress.
    Stable,
    /// Local offer applied, waiting for the answer.
    HaveLocalOffer,
    /// Remote offer applied, answer not yet committed.
    HaveRemoteOffer,
    /// Connection closed.
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stable => "stable",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Aggregate transport connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not started.
    New,
    /// ICE/DTLS in progress.
    Connecting,
    /// Usable.
    Connected,
    /// Connectivity lost, may recover.
    Disconnected,
    /// Connectivity lost for good.
    Failed,
    /// Closed locally.
    Closed,
}

impl ConnectionState {
    /// Whether the connection can no longer carry traffic.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Events raised by a peer connection.
#[derive(Clone)]
pub enum PeerEvent {
    /// The connection wants a new offer.
    NegotiationNeeded,
    /// A local candidate was gathered; `None` marks the end of gathering.
    IceCandidate(Option<IceCandidate>),
    /// Connectivity changed.
    ConnectionStateChange(ConnectionState),
    /// The remote side opened a data channel.
    DataChannel(Arc<dyn DataChannel>),
    /// The connection was closed.
    Closed,
    /// Backend-reported error.
    Error(String),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            Self::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            Self::ConnectionStateChange(s) => f.debug_tuple("ConnectionStateChange").field(s).finish(),
            Self::DataChannel(ch) => f.debug_tuple("DataChannel").field(&ch.label()).finish(),
            Self::Closed => f.write_str("Closed"),
            Self::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

/// Events raised by a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Channel is ready for traffic.
    Open,
    /// Text message received.
    Message(String),
    /// Channel closed.
    Close,
    /// Channel failed.
    Error(String),
}

/// A bidirectional message channel to one peer.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Channel label.
    fn label(&self) -> &str;

    /// Whether `send_text` can currently succeed.
    fn is_open(&self) -> bool;

    /// Send a text message.
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    /// Close the channel. Idempotent.
    async fn close(&self);

    /// Subscribe to channel events.
    fn events(&self) -> Subscription<ChannelEvent>;
}

/// A peer connection as consumed by the negotiation state machine.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an offer for the current local configuration.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Create an answer to the applied remote offer.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Commit a local description (offer, answer or rollback).
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError>;

    /// Apply a remote description.
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError>;

    /// Apply a remote ICE candidate.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Create an outgoing data channel.
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError>;

    /// Close the connection and all of its channels. Idempotent.
    async fn close(&self);

    /// Current signaling state.
    fn signaling_state(&self) -> SignalingState;

    /// Subscribe to connection events.
    fn events(&self) -> Subscription<PeerEvent>;
}

/// Creates the server-side peer connection for a new client session.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a peer connection dedicated to `client`.
    async fn create(&self, client: &ClientId) -> Result<Arc<dyn PeerConnection>, TransportError>;
}
