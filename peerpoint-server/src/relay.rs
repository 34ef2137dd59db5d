//! Signaling relay.
//!
//! Every control socket becomes one session task. In hub mode the relay
//! owns a peer connection per client, answers the client's offers through
//! a polite [`Negotiator`] and copies each data-channel message to every
//! other client's channel. In forward mode it only stamps signaling with
//! the sender's id and passes it on, addressed or broadcast.
//!
//! A session task is the only place its negotiator, subscriptions and frame
//! budget are touched, so each session is processed strictly in order.

use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use peerpoint_core::{
    broadcast_text, ChannelEvent, ClientId, ControlFrame, DataChannel, DataMessage, Negotiator,
    PeerConnectionFactory, PeerEvent, Replica, Role, SharedState, SignalEnvelope, SignalMessage,
    SignalOutcome, SignalSink, Subscription, SubscriptionScope, TransportError,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::{RelayMode, ServerConfig, DEFAULT_RATE_LIMIT_BURST, DEFAULT_RATE_LIMIT_SUSTAINED};
use crate::metrics;
use crate::rate_limit::FrameBudget;
use crate::session::{Outbound, SessionHandle, SessionRegistry};
use crate::validation::{validate_client_id, validate_data_message_size, validate_message_size, validate_signal};

/// Per-connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayLimits {
    /// Control-message burst capacity.
    pub rate_limit_burst: u32,
    /// Control messages per second sustained.
    pub rate_limit_sustained: u32,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            rate_limit_burst: DEFAULT_RATE_LIMIT_BURST,
            rate_limit_sustained: DEFAULT_RATE_LIMIT_SUSTAINED,
        }
    }
}

impl From<&ServerConfig> for RelayLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            rate_limit_burst: config.rate_limit_burst,
            rate_limit_sustained: config.rate_limit_sustained,
        }
    }
}

enum Backend {
    Hub(Arc<dyn PeerConnectionFactory>),
    Forward,
}

struct RelayInner {
    backend: Backend,
    registry: SessionRegistry,
    replica: Mutex<Replica>,
    limits: RelayLimits,
}

/// Shared relay state, cheap to clone into every session.
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<RelayInner>,
}

impl RelayState {
    fn new(backend: Backend, limits: RelayLimits) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                backend,
                registry: SessionRegistry::new(),
                replica: Mutex::new(Replica::new()),
                limits,
            }),
        }
    }

    /// Relay that terminates each client's peer connection.
    #[must_use]
    pub fn hub(factory: Arc<dyn PeerConnectionFactory>, limits: RelayLimits) -> Self {
        Self::new(Backend::Hub(factory), limits)
    }

    /// Relay that only forwards signaling between clients.
    #[must_use]
    pub fn forward(limits: RelayLimits) -> Self {
        Self::new(Backend::Forward, limits)
    }

    /// Operating mode.
    #[must_use]
    pub fn mode(&self) -> RelayMode {
        match self.inner.backend {
            Backend::Hub(_) => RelayMode::Hub,
            Backend::Forward => RelayMode::Forward,
        }
    }

    /// Connected sessions.
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Copy of the hub's view of the shared state.
    #[must_use]
    pub fn replica_state(&self) -> SharedState {
        self.with_replica(|replica| replica.state().clone())
            .unwrap_or_default()
    }

    /// Whether the replica lock is usable.
    #[must_use]
    pub fn replica_is_healthy(&self) -> bool {
        self.inner.replica.lock().is_ok()
    }

    fn frame_budget(&self) -> FrameBudget {
        FrameBudget::new(self.inner.limits.rate_limit_burst, self.inner.limits.rate_limit_sustained)
    }

    fn with_replica<T>(&self, f: impl FnOnce(&mut Replica) -> T) -> Option<T> {
        match self.inner.replica.lock() {
            Ok(mut replica) => Some(f(&mut replica)),
            Err(e) => {
                tracing::error!("Replica lock poisoned: {}", e);
                None
            }
        }
    }

    fn forward_signal(&self, from: &ClientId, envelope: SignalEnvelope) {
        let kind = envelope.message.kind();
        let target = envelope.to.clone();
        let frame = ControlFrame::Signal(envelope.sent_by(from.clone()));

        match target {
            Some(to) if &to == from => {
                tracing::debug!(client = %from, "Ignoring signal addressed to its sender");
            }
            Some(to) => {
                if let Err(e) = validate_client_id(&to) {
                    tracing::debug!(client = %from, "Invalid recipient: {}", e);
                    metrics::record_validation_failure(e.kind());
                    return;
                }
                if self.registry().send_control(&to, &frame) {
                    metrics::record_signaling_message(kind, "addressed");
                } else {
                    tracing::debug!(client = %from, to = %to, "Recipient not connected; dropping {}", kind);
                }
            }
            None => {
                let delivered = self.registry().broadcast_control(from, &frame);
                metrics::record_signaling_message(kind, "broadcast");
                tracing::debug!(client = %from, delivered, "Broadcast {}", kind);
            }
        }
    }

    /// Relay one data-channel message from `from`.
    ///
    /// Returns the number of channels the message was copied to.
    pub async fn relay_data(&self, from: &ClientId, text: &str) -> usize {
        if let Err(e) = validate_data_message_size(text.len()) {
            tracing::warn!(client = %from, "Data message rejected: {}", e);
            metrics::record_validation_failure(e.kind());
            return 0;
        }

        let kind = match DataMessage::decode(text) {
            Ok(DataMessage::ResyncRequest(id)) => {
                if self.answer_resync(from, &id).await {
                    metrics::record_data_message("resync", 1);
                    return 1;
                }
                "resync"
            }
            Ok(message) => {
                match message.writer() {
                    Ok(Some(writer)) if &writer == from => {}
                    Ok(writer) => {
                        tracing::warn!(client = %from, writer = ?writer, "Dropping data message for an entry the sender does not own");
                        metrics::record_malformed_payload("data");
                        return 0;
                    }
                    Err(e) => {
                        tracing::warn!(client = %from, "Dropping data message: {}", e);
                        metrics::record_malformed_payload("data");
                        return 0;
                    }
                }
                let kind = if matches!(message, DataMessage::Snapshot(_)) { "snapshot" } else { "patches" };
                if let Some(Err(e)) = self.with_replica(|replica| replica.observe(&message)) {
                    tracing::warn!(client = %from, "Replica dropped a batch: {}", e);
                }
                kind
            }
            Err(e) => {
                tracing::debug!(client = %from, "Relaying undecodable data message: {}", e);
                metrics::record_malformed_payload("data");
                "opaque"
            }
        };

        let channels = self.registry().channels_except(from);
        let delivered = broadcast_text(text, &channels).await;
        metrics::record_data_message(kind, delivered);
        delivered
    }

    async fn answer_resync(&self, requester: &ClientId, subject: &ClientId) -> bool {
        let Some(snapshot) = self.with_replica(|replica| replica.snapshot_of(subject)).flatten() else {
            return false;
        };
        let Some(channel) = self.registry().channel_of(requester) else {
            return false;
        };
        send_data(&channel, &snapshot).await
    }

    async fn send_snapshots(&self, client: &ClientId, channel: &Arc<dyn DataChannel>) {
        let snapshots = self
            .with_replica(|replica| replica.snapshots())
            .unwrap_or_default();
        let mut sent = 0;
        for snapshot in &snapshots {
            if matches!(snapshot, DataMessage::Snapshot(data) if &data.client_id == client) {
                continue;
            }
            if send_data(channel, snapshot).await {
                sent += 1;
            }
        }
        if sent > 0 {
            tracing::debug!(client = %client, sent, "Sent replica snapshots");
        }
    }

    async fn forget(&self, client: &ClientId) {
        let Some(removal) = self.with_replica(|replica| replica.forget(client)).flatten() else {
            return;
        };
        let channels = self.registry().channels_except(client);
        match removal.encode() {
            Ok(text) => {
                let delivered = broadcast_text(&text, &channels).await;
                metrics::record_data_message("patches", delivered);
            }
            Err(e) => tracing::error!(client = %client, "Failed to encode removal: {}", e),
        }
    }
}

async fn send_data(channel: &Arc<dyn DataChannel>, message: &DataMessage) -> bool {
    let text = match message.encode() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to encode data message: {}", e);
            return false;
        }
    };
    match channel.send_text(&text).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(label = channel.label(), "Data send failed: {}", e);
            false
        }
    }
}

/// Two ends of one client's control socket, as seen by a session task.
pub struct ControlLink {
    /// Text frames received from the client. Ends when the socket closes.
    pub inbound: mpsc::UnboundedReceiver<String>,
    /// Frames to send to the client.
    pub outbound: mpsc::UnboundedSender<Outbound>,
}

/// Error notice sent to a client whose frame was refused.
#[derive(Debug, Serialize)]
struct ErrorNotice<'a> {
    error: ErrorBody<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

fn notify_error(outbound: &mpsc::UnboundedSender<Outbound>, code: &str, message: String) {
    let notice = ErrorNotice {
        error: ErrorBody { code, message },
    };
    if let Ok(json) = serde_json::to_string(&notice) {
        let _ = outbound.send(Outbound::Text(json));
    }
}

/// Apply rate limiting, size and shape checks to one inbound frame.
fn admit(
    client: &ClientId,
    budget: &mut FrameBudget,
    outbound: &mpsc::UnboundedSender<Outbound>,
    text: &str,
) -> Option<SignalEnvelope> {
    if let Err(wait) = budget.spend() {
        tracing::warn!(client = %client, "Rate limit exceeded");
        metrics::record_rate_limited("websocket");
        let retry_after = wait.as_millis();
        notify_error(outbound, "rate_limited", format!("Rate limit exceeded. Retry after {retry_after}ms"));
        return None;
    }

    if let Err(e) = validate_message_size(text.len()) {
        tracing::warn!(client = %client, "Control message rejected: {}", e);
        metrics::record_validation_failure(e.kind());
        notify_error(outbound, "message_too_large", e.to_string());
        return None;
    }

    match ControlFrame::decode(text) {
        Ok(ControlFrame::Signal(envelope)) => {
            metrics::record_control_message("inbound", "signal");
            if let Err(e) = validate_signal(&envelope.message) {
                tracing::warn!(client = %client, "Signal rejected: {}", e);
                metrics::record_validation_failure(e.kind());
                notify_error(outbound, "invalid_signal", e.to_string());
                return None;
            }
            Some(envelope)
        }
        Ok(other) => {
            tracing::debug!(client = %client, frame = ?other, "Ignoring relay-only frame from client");
            metrics::record_malformed_payload("control");
            None
        }
        Err(e) => {
            tracing::debug!(client = %client, "Ignoring malformed control payload: {}", e);
            metrics::record_malformed_payload("control");
            None
        }
    }
}

/// Outbound signaling for a hub-side negotiator.
struct ControlSink {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl SignalSink for ControlSink {
    fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    fn send(&self, message: &SignalMessage) -> Result<(), TransportError> {
        let text = message
            .encode()
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| TransportError::Closed)?;
        metrics::record_control_message("outbound", "signal");
        Ok(())
    }
}

fn outcome_label(outcome: &SignalOutcome) -> &'static str {
    match outcome {
        SignalOutcome::Applied => "applied",
        SignalOutcome::Answered => "answered",
        SignalOutcome::Queued => "queued",
        SignalOutcome::Ignored => "ignored",
        SignalOutcome::EndOfCandidates => "end_of_candidates",
        SignalOutcome::Failed(_) => "failed",
    }
}

async fn next_channel_event(events: &mut Option<Subscription<ChannelEvent>>) -> Option<ChannelEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

/// Run one client session to completion.
pub async fn run_session(relay: RelayState, link: ControlLink) {
    let client = ClientId::generate();
    let span = tracing::info_span!("session", client = %client, mode = %relay.mode());

    async move {
        tracing::info!("Client connected");
        match &relay.inner.backend {
            Backend::Hub(factory) => hub_session(&relay, factory.as_ref(), client, link).await,
            Backend::Forward => forward_session(&relay, client, link).await,
        }
        tracing::info!("Client disconnected");
    }
    .instrument(span)
    .await;
}

fn announce(relay: &RelayState, client: &ClientId, handle: SessionHandle) {
    let peers = relay.registry().register(client, handle);
    relay.registry().send_control(
        client,
        &ControlFrame::Welcome {
            client_id: client.clone(),
            peers,
        },
    );
    relay
        .registry()
        .broadcast_control(client, &ControlFrame::PeerJoined(client.clone()));
}

async fn depart(relay: &RelayState, client: &ClientId, reason: &str) {
    if relay.registry().teardown(client, reason).await {
        relay
            .registry()
            .broadcast_control(client, &ControlFrame::PeerLeft(client.clone()));
    }
}

async fn forward_session(relay: &RelayState, client: ClientId, mut link: ControlLink) {
    let mut budget = relay.frame_budget();
    announce(relay, &client, SessionHandle::new(link.outbound.clone()));

    while let Some(text) = link.inbound.recv().await {
        if let Some(envelope) = admit(&client, &mut budget, &link.outbound, &text) {
            relay.forward_signal(&client, envelope);
        }
    }

    depart(relay, &client, "control_closed").await;
}

async fn hub_session(relay: &RelayState, factory: &dyn PeerConnectionFactory, client: ClientId, mut link: ControlLink) {
    let peer = match factory.create(&client).await {
        Ok(peer) => peer,
        Err(e) => {
            tracing::error!(client = %client, "Failed to create peer connection: {}", e);
            metrics::record_session_teardown("peer_create_failed");
            let _ = link.outbound.send(Outbound::Close);
            return;
        }
    };

    let scope = SubscriptionScope::new();
    let mut peer_events = scope.track(peer.events());
    let sink = Arc::new(ControlSink {
        outbound: link.outbound.clone(),
    });
    let mut negotiator = Negotiator::new(Arc::clone(&peer), sink, Role::Polite);
    let mut budget = relay.frame_budget();
    let mut channel_events: Option<Subscription<ChannelEvent>> = None;

    announce(
        relay,
        &client,
        SessionHandle::new(link.outbound.clone()).with_peer(Arc::clone(&peer)),
    );

    let reason = loop {
        tokio::select! {
            text = link.inbound.recv() => {
                let Some(text) = text else { break "control_closed" };
                let Some(envelope) = admit(&client, &mut budget, &link.outbound, &text) else { continue };
                if let Some(to) = &envelope.to {
                    tracing::debug!(client = %client, to = %to, "Ignoring addressing in hub mode");
                }
                metrics::record_signaling_message(envelope.message.kind(), "negotiator");
                let outcome = negotiator.handle_signal(envelope.message).await;
                metrics::record_negotiation_outcome(outcome_label(&outcome));
            }
            event = peer_events.recv() => {
                match event {
                    Some(PeerEvent::NegotiationNeeded) => {
                        if let Err(e) = negotiator.negotiation_needed().await {
                            tracing::warn!(client = %client, "Offer failed: {}", e);
                        }
                    }
                    Some(PeerEvent::IceCandidate(candidate)) => {
                        if let Err(e) = negotiator.local_candidate(candidate) {
                            tracing::warn!(client = %client, "Failed to send local candidate: {}", e);
                        }
                    }
                    Some(PeerEvent::ConnectionStateChange(state)) => {
                        tracing::debug!(client = %client, %state, "Connection state changed");
                        if state.is_terminal() {
                            break "peer_failed";
                        }
                    }
                    Some(PeerEvent::DataChannel(channel)) => {
                        tracing::info!(client = %client, label = channel.label(), "Data channel attached");
                        channel_events = Some(scope.track(channel.events()));
                        if !relay.registry().attach_channel(&client, channel) {
                            break "session_removed";
                        }
                    }
                    Some(PeerEvent::Error(e)) => {
                        tracing::warn!(client = %client, "Peer connection error: {}", e);
                    }
                    Some(PeerEvent::Closed) | None => break "peer_closed",
                }
            }
            event = next_channel_event(&mut channel_events) => {
                match event {
                    Some(ChannelEvent::Open) => {
                        if let Some(channel) = relay.registry().channel_of(&client) {
                            relay.send_snapshots(&client, &channel).await;
                        }
                    }
                    Some(ChannelEvent::Message(text)) => {
                        relay.relay_data(&client, &text).await;
                    }
                    Some(ChannelEvent::Error(e)) => {
                        tracing::warn!(client = %client, "Data channel failed: {}", e);
                        break "channel_error";
                    }
                    Some(ChannelEvent::Close) | None => break "channel_closed",
                }
            }
        }
    };

    let revoked = scope.detach_all();
    tracing::debug!(client = %client, reason, revoked, "Session ending");
    drop(negotiator);
    depart(relay, &client, reason).await;
    relay.forget(&client).await;
}

/// Drive a WebSocket as a control link until either side closes it.
pub async fn handle_control_socket(socket: WebSocket, relay: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match frame {
                Outbound::Text(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = sender.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if inbound_tx.send(text.as_str().to_owned()).is_err() {
                        break;
                    }
                }
                Ok(Message::Binary(_)) => {
                    tracing::debug!("Ignoring binary control frame");
                    metrics::record_malformed_payload("control");
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Control socket error: {}", e);
                    break;
                }
            }
        }
    });

    run_session(
        relay,
        ControlLink {
            inbound: inbound_rx,
            outbound: outbound_tx,
        },
    )
    .await;

    reader.abort();
    if let Err(e) = writer.await {
        tracing::debug!("Control writer ended abnormally: {}", e);
    }
}
