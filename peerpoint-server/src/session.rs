//! Client session registry.
//!
//! One entry per connected control socket. An entry owns the outbound half
//! of the control socket, the server-side peer connection (hub mode) and the
//! data channel once negotiation produced one. [`SessionRegistry::teardown`]
//! removes the entry first and then closes all three, so a session is never
//! half-registered and concurrent teardowns of the same id are no-ops.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use peerpoint_core::{ClientId, ControlFrame, DataChannel, PeerConnection};
use tokio::sync::mpsc;

use crate::metrics;

/// A frame queued for a client's control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Text frame.
    Text(String),
    /// Close the socket.
    Close,
}

/// Resources owned by one session.
pub struct SessionHandle {
    control: mpsc::UnboundedSender<Outbound>,
    peer: Option<Arc<dyn PeerConnection>>,
    channel: Option<Arc<dyn DataChannel>>,
}

impl SessionHandle {
    /// Handle for a session with no peer connection (forward mode).
    #[must_use]
    pub fn new(control: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            control,
            peer: None,
            channel: None,
        }
    }

    /// Attach the server-side peer connection.
    #[must_use]
    pub fn with_peer(mut self, peer: Arc<dyn PeerConnection>) -> Self {
        self.peer = Some(peer);
        self
    }
}

/// Registry of connected clients.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<ClientId, SessionHandle>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and return the ids of everyone already connected.
    pub fn register(&self, client: &ClientId, handle: SessionHandle) -> Vec<ClientId> {
        match self.sessions.write() {
            Ok(mut sessions) => {
                let mut existing: Vec<ClientId> = sessions.keys().cloned().collect();
                existing.sort();
                if sessions.insert(client.clone(), handle).is_none() {
                    metrics::inc_sessions();
                }
                tracing::info!(client = %client, sessions = sessions.len(), "Session registered");
                existing
            }
            Err(e) => {
                tracing::error!(client = %client, "Failed to register session (lock poisoned): {}", e);
                Vec::new()
            }
        }
    }

    /// Attach a negotiated data channel to a registered session.
    ///
    /// Returns `false` if the session is gone.
    pub fn attach_channel(&self, client: &ClientId, channel: Arc<dyn DataChannel>) -> bool {
        match self.sessions.write() {
            Ok(mut sessions) => match sessions.get_mut(client) {
                Some(handle) => {
                    if handle.channel.is_some() {
                        tracing::debug!(client = %client, label = channel.label(), "Replacing data channel");
                    }
                    handle.channel = Some(channel);
                    true
                }
                None => false,
            },
            Err(e) => {
                tracing::error!(client = %client, "Failed to attach channel (lock poisoned): {}", e);
                false
            }
        }
    }

    /// The data channel of one session.
    #[must_use]
    pub fn channel_of(&self, client: &ClientId) -> Option<Arc<dyn DataChannel>> {
        match self.sessions.read() {
            Ok(sessions) => sessions.get(client).and_then(|h| h.channel.clone()),
            Err(e) => {
                tracing::error!("Failed to read sessions (lock poisoned): {}", e);
                None
            }
        }
    }

    /// Whether `client` is registered.
    #[must_use]
    pub fn contains(&self, client: &ClientId) -> bool {
        self.sessions
            .read()
            .map(|sessions| sessions.contains_key(client))
            .unwrap_or(false)
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().map(|sessions| sessions.len()).unwrap_or(0)
    }

    /// Whether no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sessions with a data channel attached.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.sessions
            .read()
            .map(|sessions| sessions.values().filter(|h| h.channel.is_some()).count())
            .unwrap_or(0)
    }

    /// Registered ids, sorted.
    #[must_use]
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = match self.sessions.read() {
            Ok(sessions) => sessions.keys().cloned().collect(),
            Err(e) => {
                tracing::error!("Failed to read sessions (lock poisoned): {}", e);
                Vec::new()
            }
        };
        ids.sort();
        ids
    }

    /// Every registered id except `client`, sorted.
    #[must_use]
    pub fn others(&self, client: &ClientId) -> Vec<ClientId> {
        self.client_ids().into_iter().filter(|id| id != client).collect()
    }

    /// Data channels of every session except `client`.
    #[must_use]
    pub fn channels_except(&self, client: &ClientId) -> Vec<Arc<dyn DataChannel>> {
        match self.sessions.read() {
            Ok(sessions) => sessions
                .iter()
                .filter(|(id, _)| *id != client)
                .filter_map(|(_, h)| h.channel.clone())
                .collect(),
            Err(e) => {
                tracing::error!("Failed to read sessions (lock poisoned): {}", e);
                Vec::new()
            }
        }
    }

    /// Queue a text frame for one client.
    ///
    /// Returns `false` if the client is gone or its socket writer stopped.
    pub fn send_text(&self, client: &ClientId, text: String) -> bool {
        match self.sessions.read() {
            Ok(sessions) => match sessions.get(client) {
                Some(handle) => handle.control.send(Outbound::Text(text)).is_ok(),
                None => {
                    tracing::debug!(client = %client, "Client not found for control frame");
                    false
                }
            },
            Err(e) => {
                tracing::error!("Failed to read sessions (lock poisoned): {}", e);
                false
            }
        }
    }

    /// Encode and queue a control frame for one client.
    pub fn send_control(&self, client: &ClientId, frame: &ControlFrame) -> bool {
        match frame.encode() {
            Ok(text) => {
                let sent = self.send_text(client, text);
                if sent {
                    metrics::record_control_message("outbound", frame_kind(frame));
                }
                sent
            }
            Err(e) => {
                tracing::error!(client = %client, "Failed to encode control frame: {}", e);
                false
            }
        }
    }

    /// Queue a control frame for every client except `except`.
    ///
    /// Returns the number of clients it was queued for.
    pub fn broadcast_control(&self, except: &ClientId, frame: &ControlFrame) -> usize {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to encode control frame: {}", e);
                return 0;
            }
        };
        let sent = match self.sessions.read() {
            Ok(sessions) => sessions
                .iter()
                .filter(|(id, _)| *id != except)
                .filter(|(_, h)| h.control.send(Outbound::Text(text.clone())).is_ok())
                .count(),
            Err(e) => {
                tracing::error!("Failed to read sessions (lock poisoned): {}", e);
                0
            }
        };
        for _ in 0..sent {
            metrics::record_control_message("outbound", frame_kind(frame));
        }
        sent
    }

    /// Remove a session and release everything it owns.
    ///
    /// The control socket is asked to close, the data channel and peer
    /// connection are closed. Returns `false` if the session was already
    /// gone.
    pub async fn teardown(&self, client: &ClientId, reason: &str) -> bool {
        let removed = match self.sessions.write() {
            Ok(mut sessions) => sessions.remove(client),
            Err(e) => {
                tracing::error!(client = %client, "Failed to remove session (lock poisoned): {}", e);
                None
            }
        };
        let Some(handle) = removed else {
            return false;
        };

        metrics::dec_sessions();
        metrics::record_session_teardown(reason);
        tracing::info!(client = %client, reason, "Session torn down");

        // The writer may already be gone if the socket closed first.
        let _ = handle.control.send(Outbound::Close);
        if let Some(channel) = handle.channel {
            channel.close().await;
        }
        if let Some(peer) = handle.peer {
            peer.close().await;
        }
        true
    }

    /// Tear down every session.
    pub async fn shutdown(&self) -> usize {
        let mut closed = 0;
        for client in self.client_ids() {
            if self.teardown(&client, "shutdown").await {
                closed += 1;
            }
        }
        closed
    }

    /// Whether the registry lock is usable.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.sessions.read().is_ok()
    }
}

fn frame_kind(frame: &ControlFrame) -> &'static str {
    match frame {
        ControlFrame::Signal(_) => "signal",
        ControlFrame::Welcome { .. } => "welcome",
        ControlFrame::PeerJoined(_) => "peer_joined",
        ControlFrame::PeerLeft(_) => "peer_left",
    }
}
