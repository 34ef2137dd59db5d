//! Native WebRTC transport backed by the `webrtc` crate.
//!
//! Callbacks registered on the `RTCPeerConnection` and `RTCDataChannel`
//! are turned into [`PeerEvent`] / [`ChannelEvent`] emissions on hubs that
//! replay their backlog to the first subscriber, so events raised before
//! the session task subscribes are not lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use peerpoint_core::{
    ChannelEvent, ClientId, ConnectionState, DataChannel, EventHub, IceCandidate, PeerConnection,
    PeerConnectionFactory, PeerEvent, SdpType, SessionDescription, SignalingState, Subscription,
    TransportError,
};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

fn backend(e: &webrtc::Error) -> TransportError {
    TransportError::Backend(e.to_string())
}

fn rejected(e: &webrtc::Error) -> TransportError {
    TransportError::Rejected(e.to_string())
}

/// Convert a wire description into the backend's representation.
///
/// # Errors
///
/// Returns [`TransportError::Rejected`] if the SDP does not parse.
pub fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let sdp = description.sdp.clone();
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp).map_err(|e| rejected(&e)),
        SdpType::Answer => RTCSessionDescription::answer(sdp).map_err(|e| rejected(&e)),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp).map_err(|e| rejected(&e)),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            Ok(rollback)
        }
    }
}

/// Convert a backend description to the wire type.
///
/// # Errors
///
/// Returns [`TransportError::Backend`] for the `unspecified` type.
pub fn from_rtc_description(description: &RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(TransportError::Backend("unspecified SDP type".to_string()));
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp.clone(),
    })
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_rtc_candidate(candidate: &RTCIceCandidate) -> Result<IceCandidate, TransportError> {
    let init = candidate.to_json().map_err(|e| backend(&e))?;
    Ok(IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    })
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
    }
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

/// A data channel of a [`WebRtcPeer`].
pub struct WebRtcChannel {
    label: String,
    inner: Arc<RTCDataChannel>,
    events: EventHub<ChannelEvent>,
}

impl WebRtcChannel {
    /// Wrap a backend channel and start listening to it.
    #[must_use]
    pub fn wrap(inner: Arc<RTCDataChannel>) -> Arc<Self> {
        let events = EventHub::with_backlog();
        let opened = Arc::new(AtomicBool::new(false));

        let hub = events.clone();
        let flag = Arc::clone(&opened);
        inner.on_open(Box::new(move || {
            Box::pin(async move {
                if !flag.swap(true, Ordering::SeqCst) {
                    hub.emit(ChannelEvent::Open);
                }
            })
        }));

        let hub = events.clone();
        let label = inner.label().to_string();
        inner.on_message(Box::new(move |msg: DataChannelMessage| {
            let hub = hub.clone();
            let label = label.clone();
            Box::pin(async move {
                if !msg.is_string {
                    tracing::debug!(label = %label, bytes = msg.data.len(), "Ignoring binary data channel message");
                    return;
                }
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        hub.emit(ChannelEvent::Message(text));
                    }
                    Err(e) => tracing::warn!(label = %label, "Dropping non-UTF-8 text message: {}", e),
                }
            })
        }));

        let hub = events.clone();
        inner.on_close(Box::new(move || {
            let hub = hub.clone();
            Box::pin(async move {
                hub.emit(ChannelEvent::Close);
            })
        }));

        let hub = events.clone();
        inner.on_error(Box::new(move |err| {
            let hub = hub.clone();
            Box::pin(async move {
                hub.emit(ChannelEvent::Error(err.to_string()));
            })
        }));

        if inner.ready_state() == RTCDataChannelState::Open && !opened.swap(true, Ordering::SeqCst) {
            events.emit(ChannelEvent::Open);
        }

        Arc::new(Self {
            label: inner.label().to_string(),
            inner,
            events,
        })
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelNotOpen(self.label.clone()));
        }
        self.inner
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|e| backend(&e))
    }

    async fn close(&self) {
        if let Err(e) = self.inner.close().await {
            tracing::debug!(label = %self.label, "Data channel close failed: {}", e);
        }
    }

    fn events(&self) -> Subscription<ChannelEvent> {
        self.events.attach()
    }
}

/// A server-side peer connection.
pub struct WebRtcPeer {
    inner: Arc<RTCPeerConnection>,
    events: EventHub<PeerEvent>,
    closed: AtomicBool,
}

impl WebRtcPeer {
    fn wrap(inner: Arc<RTCPeerConnection>, client: &ClientId) -> Arc<Self> {
        let events = EventHub::with_backlog();

        let hub = events.clone();
        inner.on_negotiation_needed(Box::new(move || {
            let hub = hub.clone();
            Box::pin(async move {
                hub.emit(PeerEvent::NegotiationNeeded);
            })
        }));

        let hub = events.clone();
        let id = client.clone();
        inner.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let hub = hub.clone();
            let id = id.clone();
            Box::pin(async move {
                match candidate.as_ref().map(from_rtc_candidate).transpose() {
                    Ok(candidate) => {
                        hub.emit(PeerEvent::IceCandidate(candidate));
                    }
                    Err(e) => tracing::warn!(client = %id, "Dropping local candidate: {}", e),
                }
            })
        }));

        let hub = events.clone();
        let id = client.clone();
        inner.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let hub = hub.clone();
            let id = id.clone();
            Box::pin(async move {
                tracing::debug!(client = %id, %state, "Peer connection state changed");
                hub.emit(PeerEvent::ConnectionStateChange(connection_state(state)));
            })
        }));

        let hub = events.clone();
        inner.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let hub = hub.clone();
            Box::pin(async move {
                let channel: Arc<dyn DataChannel> = WebRtcChannel::wrap(channel);
                hub.emit(PeerEvent::DataChannel(channel));
            })
        }));

        Arc::new(Self {
            inner,
            events,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.inner.create_offer(None).await.map_err(|e| backend(&e))?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.inner.create_answer(None).await.map_err(|e| backend(&e))?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let description = to_rtc_description(&description)?;
        self.inner
            .set_local_description(description)
            .await
            .map_err(|e| rejected(&e))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let description = to_rtc_description(&description)?;
        self.inner
            .set_remote_description(description)
            .await
            .map_err(|e| rejected(&e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.inner
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(|e| rejected(&e))
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel = self
            .inner
            .create_data_channel(label, None)
            .await
            .map_err(|e| backend(&e))?;
        Ok(WebRtcChannel::wrap(channel))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.inner.close().await {
            tracing::debug!("Peer connection close failed: {}", e);
        }
        self.events.emit(PeerEvent::Closed);
    }

    fn signaling_state(&self) -> SignalingState {
        if self.closed.load(Ordering::SeqCst) {
            return SignalingState::Closed;
        }
        signaling_state(self.inner.signaling_state())
    }

    fn events(&self) -> Subscription<PeerEvent> {
        self.events.attach()
    }
}

/// Creates one [`WebRtcPeer`] per client session.
pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    /// Build the WebRTC API with default interceptors.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Backend`] if interceptor registration fails.
    pub fn new(ice_servers: Vec<String>) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media_engine).map_err(|e| backend(&e))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(&self, client: &ClientId) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let pc = self
            .api
            .new_peer_connection(self.configuration())
            .await
            .map_err(|e| backend(&e))?;
        tracing::debug!(client = %client, "Created server-side peer connection");
        Ok(WebRtcPeer::wrap(Arc::new(pc), client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_conversion() {
        let rollback = to_rtc_description(&SessionDescription::rollback()).expect("rollback");
        assert_eq!(rollback.sdp_type, RTCSdpType::Rollback);
        assert_eq!(
            from_rtc_description(&rollback).expect("back").sdp_type,
            SdpType::Rollback
        );

        let unspecified = RTCSessionDescription::default();
        assert!(from_rtc_description(&unspecified).is_err());
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(signaling_state(RTCSignalingState::HaveRemoteOffer), SignalingState::HaveRemoteOffer);
        assert_eq!(signaling_state(RTCSignalingState::HaveLocalPranswer), SignalingState::HaveLocalOffer);
        assert_eq!(connection_state(RTCPeerConnectionState::Failed), ConnectionState::Failed);
        assert!(connection_state(RTCPeerConnectionState::Closed).is_terminal());
    }

    #[test]
    fn test_candidate_fields_survive() {
        let mut candidate = IceCandidate::new("candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host");
        candidate.username_fragment = Some("abcd".to_string());
        let init = to_rtc_candidate(candidate);
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(init.sdp_mline_index, Some(0));
        assert_eq!(init.username_fragment.as_deref(), Some("abcd"));
    }

    #[tokio::test]
    async fn test_offer_with_data_channel() {
        let factory = WebRtcFactory::new(Vec::new()).expect("api");
        let peer = factory.create(&ClientId::new("local")).await.expect("peer");

        let channel = peer.create_data_channel("pointers").await.expect("channel");
        assert_eq!(channel.label(), "pointers");
        assert!(!channel.is_open());

        let offer = peer.create_offer().await.expect("offer");
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("webrtc-datachannel"));

        peer.set_local_description(offer).await.expect("local offer");
        assert_eq!(peer.signaling_state(), SignalingState::HaveLocalOffer);

        peer.close().await;
        peer.close().await;
        assert_eq!(peer.signaling_state(), SignalingState::Closed);
    }
}
