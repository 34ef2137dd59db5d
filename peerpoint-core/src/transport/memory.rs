//! In-memory loopback transport.
//!
//! A [`MemoryPeer`] follows the offer/answer state rules of a browser peer
//! connection closely enough to exercise the negotiation state machine:
//! descriptions are validated against the signaling state, candidates are
//! rejected until a remote description exists, and data channels created
//! by the offerer show up on the linked remote peer once the answer is
//! applied. Nothing leaves the process.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ChannelEvent, ConnectionState, DataChannel, PeerConnection, PeerConnectionFactory, PeerEvent, SignalingState};
use crate::error::TransportError;
use crate::signal::{ClientId, IceCandidate, SdpType, SessionDescription};
use crate::subscription::{EventHub, Subscription};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Memory transport lock poisoned; continuing with inner state");
        poisoned.into_inner()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// One end of an in-memory data channel.
pub struct MemoryChannel {
    label: String,
    state: Mutex<ChannelState>,
    peer: Mutex<Weak<MemoryChannel>>,
    events: EventHub<ChannelEvent>,
}

impl MemoryChannel {
    fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(ChannelState::Connecting),
            peer: Mutex::new(Weak::new()),
            events: EventHub::with_backlog(),
        })
    }

    fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *lock(&a.peer) = Arc::downgrade(b);
        *lock(&b.peer) = Arc::downgrade(a);
    }

    fn open(&self) {
        let opened = {
            let mut state = lock(&self.state);
            if *state == ChannelState::Connecting {
                *state = ChannelState::Open;
                true
            } else {
                false
            }
        };
        if opened {
            self.events.emit(ChannelEvent::Open);
        }
    }

    fn deliver(&self, text: &str) -> bool {
        if *lock(&self.state) != ChannelState::Open {
            return false;
        }
        self.events.emit(ChannelEvent::Message(text.to_string()));
        true
    }

    fn close_local(&self) -> bool {
        let mut state = lock(&self.state);
        if *state == ChannelState::Closed {
            return false;
        }
        *state = ChannelState::Closed;
        true
    }

    /// Simulate a transport failure on this end.
    pub fn fail(&self, reason: &str) {
        tracing::debug!(label = %self.label, "Injecting data channel failure: {}", reason);
        self.events.emit(ChannelEvent::Error(reason.to_string()));
    }
}

/// Create two linked, already-open channel ends.
#[must_use]
pub fn channel_pair(label: &str) -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
    let a = MemoryChannel::new(label);
    let b = MemoryChannel::new(label);
    MemoryChannel::link(&a, &b);
    a.open();
    b.open();
    (a, b)
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        *lock(&self.state) == ChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelNotOpen(self.label.clone()));
        }
        let peer = lock(&self.peer).upgrade();
        match peer {
            Some(peer) if peer.deliver(text) => Ok(()),
            _ => Err(TransportError::ChannelNotOpen(self.label.clone())),
        }
    }

    async fn close(&self) {
        if !self.close_local() {
            return;
        }
        self.events.emit(ChannelEvent::Close);
        let peer = lock(&self.peer).upgrade();
        if let Some(peer) = peer {
            if peer.close_local() {
                peer.events.emit(ChannelEvent::Close);
            }
        }
    }

    fn events(&self) -> Subscription<ChannelEvent> {
        self.events.attach()
    }
}

struct PeerInner {
    signaling: SignalingState,
    connection: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    committed_local: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    unlinked: Vec<Arc<MemoryChannel>>,
    channels: Vec<Arc<MemoryChannel>>,
    gathered: bool,
    reject_candidates: bool,
}

/// In-memory peer connection.
pub struct MemoryPeer {
    name: String,
    version: AtomicU32,
    inner: Mutex<PeerInner>,
    remote: Mutex<Weak<MemoryPeer>>,
    events: EventHub<PeerEvent>,
}

/// Create two peers that will connect to each other once negotiated.
#[must_use]
pub fn pair(a: &str, b: &str) -> (Arc<MemoryPeer>, Arc<MemoryPeer>) {
    let a = MemoryPeer::new(a);
    let b = MemoryPeer::new(b);
    MemoryPeer::link(&a, &b);
    (a, b)
}

impl MemoryPeer {
    /// Create an unlinked peer.
    #[must_use]
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            version: AtomicU32::new(0),
            inner: Mutex::new(PeerInner {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                local: None,
                remote: None,
                committed_local: None,
                candidates: Vec::new(),
                unlinked: Vec::new(),
                channels: Vec::new(),
                gathered: false,
                reject_candidates: false,
            }),
            remote: Mutex::new(Weak::new()),
            events: EventHub::with_backlog(),
        })
    }

    /// Link two peers so their data channels connect.
    pub fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *lock(&a.remote) = Arc::downgrade(b);
        *lock(&b.remote) = Arc::downgrade(a);
    }

    /// Peer name used in generated SDP.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Currently applied local description.
    #[must_use]
    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).local.clone()
    }

    /// Currently applied remote description.
    #[must_use]
    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).remote.clone()
    }

    /// Remote candidates applied so far, in order.
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.inner).candidates.clone()
    }

    /// Current connectivity state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.inner).connection
    }

    /// Data channel with `label` on this side, if one exists.
    #[must_use]
    pub fn channel(&self, label: &str) -> Option<Arc<MemoryChannel>> {
        lock(&self.inner)
            .channels
            .iter()
            .find(|channel| channel.label == label)
            .cloned()
    }

    /// Make `add_ice_candidate` fail, for failure-path tests.
    pub fn reject_candidates(&self, reject: bool) {
        lock(&self.inner).reject_candidates = reject;
    }

    fn sdp(&self, kind: SdpType) -> String {
        let version = self.version.fetch_add(1, Ordering::Relaxed);
        let setup = if kind == SdpType::Offer { "actpass" } else { "active" };
        format!(
            "v=0\r\no=- {version} 2 IN IP4 127.0.0.1\r\ns={}\r\nt=0 0\r\na=group:BUNDLE 0\r\n\
             m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:0\r\na=setup:{setup}\r\n",
            self.name
        )
    }

    fn host_candidate(&self) -> IceCandidate {
        let port = 50_000 + self.name.bytes().map(u16::from).fold(0u16, u16::wrapping_add) % 1000;
        IceCandidate::new(format!(
            "candidate:1 1 udp 2130706431 127.0.0.1 {port} typ host"
        ))
    }

    /// Called whenever an offer/answer round completes on this side.
    fn on_stable(&self, as_offerer: bool) {
        let (first_connect, to_link, leftover) = {
            let mut inner = lock(&self.inner);
            inner.committed_local = inner.local.clone();
            let first_connect = inner.connection == ConnectionState::New;
            if first_connect {
                inner.connection = ConnectionState::Connected;
            }
            let to_link: Vec<_> = if as_offerer {
                inner.unlinked.drain(..).collect()
            } else {
                Vec::new()
            };
            (first_connect, to_link, !inner.unlinked.is_empty())
        };

        if first_connect {
            self.events
                .emit(PeerEvent::ConnectionStateChange(ConnectionState::Connecting));
            self.events
                .emit(PeerEvent::ConnectionStateChange(ConnectionState::Connected));
        }

        let remote = lock(&self.remote).upgrade();
        for channel in to_link {
            self.announce(&channel, remote.as_ref());
        }

        if leftover {
            self.events.emit(PeerEvent::NegotiationNeeded);
        }
    }

    fn announce(&self, channel: &Arc<MemoryChannel>, remote: Option<&Arc<MemoryPeer>>) {
        let Some(remote) = remote else {
            tracing::debug!(peer = %self.name, "No linked remote; channel {} stays pending", channel.label);
            return;
        };
        let remote_end = MemoryChannel::new(&channel.label);
        MemoryChannel::link(channel, &remote_end);
        lock(&remote.inner).channels.push(Arc::clone(&remote_end));
        channel.open();
        remote_end.open();
        remote.events.emit(PeerEvent::DataChannel(remote_end));
    }
}

#[async_trait]
impl PeerConnection for MemoryPeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if lock(&self.inner).signaling == SignalingState::Closed {
            return Err(TransportError::Closed);
        }
        Ok(SessionDescription::offer(self.sdp(SdpType::Offer)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let state = lock(&self.inner).signaling;
        match state {
            SignalingState::HaveRemoteOffer => Ok(SessionDescription::answer(self.sdp(SdpType::Answer))),
            SignalingState::Closed => Err(TransportError::Closed),
            other => Err(TransportError::InvalidState(format!(
                "cannot create answer in {other}"
            ))),
        }
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let kind = description.sdp_type;
        let (gather, completed) = {
            let mut inner = lock(&self.inner);
            let next = match (inner.signaling, kind) {
                (SignalingState::Closed, _) => return Err(TransportError::Closed),
                (SignalingState::Stable | SignalingState::HaveLocalOffer, SdpType::Offer) => {
                    SignalingState::HaveLocalOffer
                }
                (SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
                (SignalingState::HaveRemoteOffer, SdpType::Pranswer) => SignalingState::HaveRemoteOffer,
                (SignalingState::HaveLocalOffer, SdpType::Rollback) => SignalingState::Stable,
                (state, kind) => {
                    return Err(TransportError::InvalidState(format!(
                        "cannot set local {kind} in {state}"
                    )))
                }
            };
            inner.signaling = next;
            if kind == SdpType::Rollback {
                inner.local = inner.committed_local.clone();
            } else {
                inner.local = Some(description);
            }
            let gather = kind != SdpType::Rollback && !inner.gathered;
            if gather {
                inner.gathered = true;
            }
            (gather, kind == SdpType::Answer)
        };

        if gather {
            self.events
                .emit(PeerEvent::IceCandidate(Some(self.host_candidate())));
            self.events.emit(PeerEvent::IceCandidate(None));
        }
        if completed {
            self.on_stable(false);
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let kind = description.sdp_type;
        let completed = {
            let mut inner = lock(&self.inner);
            let next = match (inner.signaling, kind) {
                (SignalingState::Closed, _) => return Err(TransportError::Closed),
                (SignalingState::Stable | SignalingState::HaveRemoteOffer, SdpType::Offer) => {
                    SignalingState::HaveRemoteOffer
                }
                (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
                (SignalingState::HaveLocalOffer, SdpType::Pranswer) => SignalingState::HaveLocalOffer,
                (SignalingState::HaveRemoteOffer, SdpType::Rollback) => SignalingState::Stable,
                (state, kind) => {
                    return Err(TransportError::InvalidState(format!(
                        "cannot set remote {kind} in {state}"
                    )))
                }
            };
            inner.signaling = next;
            if kind != SdpType::Rollback {
                inner.remote = Some(description);
            }
            kind == SdpType::Answer
        };

        if completed {
            self.on_stable(true);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        if inner.signaling == SignalingState::Closed {
            return Err(TransportError::Closed);
        }
        if inner.remote.is_none() {
            return Err(TransportError::InvalidState(
                "remote description not set".to_string(),
            ));
        }
        if inner.reject_candidates {
            return Err(TransportError::Rejected(candidate.candidate));
        }
        inner.candidates.push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel = MemoryChannel::new(label);
        let (link_now, needs_negotiation) = {
            let mut inner = lock(&self.inner);
            if inner.signaling == SignalingState::Closed {
                return Err(TransportError::Closed);
            }
            inner.channels.push(Arc::clone(&channel));
            if inner.connection == ConnectionState::Connected {
                (true, false)
            } else {
                inner.unlinked.push(Arc::clone(&channel));
                (false, inner.unlinked.len() == 1)
            }
        };

        if link_now {
            let remote = lock(&self.remote).upgrade();
            self.announce(&channel, remote.as_ref());
        } else if needs_negotiation {
            self.events.emit(PeerEvent::NegotiationNeeded);
        }
        Ok(channel)
    }

    async fn close(&self) {
        let channels = {
            let mut inner = lock(&self.inner);
            if inner.signaling == SignalingState::Closed {
                return;
            }
            inner.signaling = SignalingState::Closed;
            inner.connection = ConnectionState::Closed;
            inner.unlinked.clear();
            std::mem::take(&mut inner.channels)
        };
        for channel in channels {
            channel.close().await;
        }
        self.events
            .emit(PeerEvent::ConnectionStateChange(ConnectionState::Closed));
        self.events.emit(PeerEvent::Closed);
    }

    fn signaling_state(&self) -> SignalingState {
        lock(&self.inner).signaling
    }

    fn events(&self) -> Subscription<PeerEvent> {
        self.events.attach()
    }
}

/// Factory that hands out the server end of a fresh [`pair`] and queues the
/// client end for whoever plays the browser.
pub struct MemoryPeerFactory {
    remotes_tx: mpsc::UnboundedSender<(ClientId, Arc<MemoryPeer>)>,
    remotes_rx: Mutex<Option<mpsc::UnboundedReceiver<(ClientId, Arc<MemoryPeer>)>>>,
    created: Mutex<Vec<(ClientId, Arc<MemoryPeer>)>>,
}

impl Default for MemoryPeerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPeerFactory {
    /// Create an empty factory.
    #[must_use]
    pub fn new() -> Self {
        let (remotes_tx, remotes_rx) = mpsc::unbounded_channel();
        Self {
            remotes_tx,
            remotes_rx: Mutex::new(Some(remotes_rx)),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Take the stream of client-side peers, one per created session.
    ///
    /// Returns `None` after the first call.
    pub fn take_remotes(&self) -> Option<mpsc::UnboundedReceiver<(ClientId, Arc<MemoryPeer>)>> {
        lock(&self.remotes_rx).take()
    }

    /// Ids of every client a peer was created for, in order.
    #[must_use]
    pub fn created(&self) -> Vec<ClientId> {
        lock(&self.created).iter().map(|(id, _)| id.clone()).collect()
    }

    /// The relay-side peer created for `client`.
    #[must_use]
    pub fn relay_peer(&self, client: &ClientId) -> Option<Arc<MemoryPeer>> {
        lock(&self.created)
            .iter()
            .find(|(id, _)| id == client)
            .map(|(_, peer)| Arc::clone(peer))
    }
}

#[async_trait]
impl PeerConnectionFactory for MemoryPeerFactory {
    async fn create(&self, client: &ClientId) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let (server, browser) = pair(&format!("relay-{client}"), &format!("client-{client}"));
        lock(&self.created).push((client.clone(), Arc::clone(&server)));
        if self.remotes_tx.send((client.clone(), browser)).is_err() {
            tracing::debug!(client = %client, "Nobody is collecting memory client peers");
        }
        Ok(server)
    }
}
