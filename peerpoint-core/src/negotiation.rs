//! Perfect-negotiation driver for one peer connection.
//!
//! Both ends run the same code. Roles are decided up front only for
//! collisions: when both sides offer at once, the [`Role::Impolite`] side
//! ignores the incoming offer and the [`Role::Polite`] side rolls its own
//! offer back and answers. Outbound signaling goes through a [`SignalSink`]
//! and is buffered, in order, until the sink reports ready.
//!
//! The negotiator is driven from a single task; every `await` on the peer
//! connection is followed by a fresh look at its signaling state before
//! acting on the result.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::error::TransportError;
use crate::signal::{IceCandidate, SdpType, SessionDescription, SignalMessage};
use crate::transport::{PeerConnection, SignalingState};

/// Collision role of this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Yields on collision: rolls back its own offer.
    Polite,
    /// Wins on collision: ignores the remote offer.
    Impolite,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Polite => "polite",
            Self::Impolite => "impolite",
        })
    }
}

/// Negotiation progress as seen by this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    /// No round has started.
    Idle,
    /// Our offer is committed; waiting for the answer.
    HaveLocalOffer,
    /// A remote offer is applied; answer pending.
    HaveRemoteOffer,
    /// At least one round completed and none is in flight.
    Stable,
}

/// Errors from negotiation steps that the caller asked for directly.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The peer connection rejected an operation.
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The control channel refused an outbound message.
    #[error("Control channel failure: {0}")]
    Control(TransportError),

    /// Signaling state changed while an offer was being created.
    #[error("Offer abandoned: signaling state became {0}")]
    Abandoned(SignalingState),
}

/// Result of handling one inbound signaling message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Remote description or candidate applied.
    Applied,
    /// Remote offer applied and an answer sent.
    Answered,
    /// Candidate held until a remote description exists.
    Queued,
    /// Message dropped because a colliding offer is being ignored.
    Ignored,
    /// End-of-candidates sentinel; nothing to do.
    EndOfCandidates,
    /// Application failed; the error was logged and state is unchanged.
    Failed(String),
}

/// Outbound half of the control channel.
pub trait SignalSink: Send + Sync {
    /// Whether `send` may be called now.
    fn is_open(&self) -> bool;

    /// Transmit one signaling message.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the control channel is gone.
    fn send(&self, message: &SignalMessage) -> Result<(), TransportError>;
}

/// Perfect-negotiation state machine bound to one peer connection.
pub struct Negotiator {
    peer: Arc<dyn PeerConnection>,
    sink: Arc<dyn SignalSink>,
    role: Role,
    state: NegotiationState,
    making_offer: bool,
    ignore_offer: bool,
    has_remote_description: bool,
    completed_rounds: u64,
    pending_candidates: Vec<IceCandidate>,
    outbox: VecDeque<SignalMessage>,
}

impl Negotiator {
    /// Create a negotiator in the `Idle` state.
    pub fn new(peer: Arc<dyn PeerConnection>, sink: Arc<dyn SignalSink>, role: Role) -> Self {
        Self {
            peer,
            sink,
            role,
            state: NegotiationState::Idle,
            making_offer: false,
            ignore_offer: false,
            has_remote_description: false,
            completed_rounds: 0,
            pending_candidates: Vec::new(),
            outbox: VecDeque::new(),
        }
    }

    /// Collision role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current negotiation state.
    #[must_use]
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Whether an offer is currently being created.
    #[must_use]
    pub fn is_making_offer(&self) -> bool {
        self.making_offer
    }

    /// Whether a remote description has been applied.
    #[must_use]
    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    /// Remote candidates waiting for a remote description.
    #[must_use]
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Outbound messages waiting for the control channel.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.outbox.len()
    }

    /// The peer connection this negotiator drives.
    #[must_use]
    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }

    /// React to the transport asking for (re)negotiation.
    ///
    /// Returns `Ok(true)` if an offer was committed and transmitted (or
    /// buffered), `Ok(false)` if a round was already in progress.
    ///
    /// # Errors
    ///
    /// Returns a [`NegotiationError`] if the offer could not be created or
    /// committed, or the signaling state moved while it was being created.
    pub async fn negotiation_needed(&mut self) -> Result<bool, NegotiationError> {
        let signaling = self.peer.signaling_state();
        if signaling != SignalingState::Stable {
            tracing::debug!(role = %self.role, %signaling, "Negotiation already in progress; skipping offer");
            return Ok(false);
        }

        self.making_offer = true;
        let result = self.make_offer().await;
        self.making_offer = false;
        result.map(|()| true)
    }

    async fn make_offer(&mut self) -> Result<(), NegotiationError> {
        let offer = self.peer.create_offer().await?;

        let signaling = self.peer.signaling_state();
        if signaling != SignalingState::Stable {
            return Err(NegotiationError::Abandoned(signaling));
        }

        self.peer.set_local_description(offer.clone()).await?;
        self.state = NegotiationState::HaveLocalOffer;
        tracing::debug!(role = %self.role, "Local offer committed");
        self.transmit(SignalMessage::Description(offer))
    }

    /// Forward a locally gathered candidate; `None` ends gathering.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Control`] if the control channel failed.
    pub fn local_candidate(&mut self, candidate: Option<IceCandidate>) -> Result<(), NegotiationError> {
        let message = match candidate {
            Some(candidate) if !candidate.is_end_of_candidates() => SignalMessage::Candidate(candidate),
            _ => SignalMessage::EndOfCandidates,
        };
        self.transmit(message)
    }

    /// Flush buffered outbound messages in order.
    ///
    /// Readiness is re-checked before each message; flushing stops early if
    /// the channel stops being ready. Returns the number of messages sent.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Control`] if a send failed. The failed
    /// message stays at the head of the buffer.
    pub fn control_opened(&mut self) -> Result<usize, NegotiationError> {
        let mut sent = 0;
        while let Some(message) = self.outbox.front() {
            if !self.sink.is_open() {
                break;
            }
            self.sink.send(message).map_err(NegotiationError::Control)?;
            self.outbox.pop_front();
            sent += 1;
        }
        if sent > 0 {
            tracing::debug!(role = %self.role, sent, "Flushed buffered signaling");
        }
        Ok(sent)
    }

    fn transmit(&mut self, message: SignalMessage) -> Result<(), NegotiationError> {
        if !self.outbox.is_empty() || !self.sink.is_open() {
            self.outbox.push_back(message);
            return Ok(());
        }
        if let Err(e) = self.sink.send(&message) {
            self.outbox.push_front(message);
            return Err(NegotiationError::Control(e));
        }
        Ok(())
    }

    /// Handle one inbound signaling message.
    ///
    /// Never fails: errors are logged and reported as
    /// [`SignalOutcome::Failed`].
    pub async fn handle_signal(&mut self, message: SignalMessage) -> SignalOutcome {
        let kind = message.kind();
        let result = match message {
            SignalMessage::EndOfCandidates => Ok(SignalOutcome::EndOfCandidates),
            SignalMessage::Candidate(candidate) => self.remote_candidate(candidate).await,
            SignalMessage::Description(description) => self.remote_description(description).await,
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(role = %self.role, kind, "Failed to apply remote signaling: {}", e);
                SignalOutcome::Failed(e.to_string())
            }
        }
    }

    async fn remote_candidate(&mut self, candidate: IceCandidate) -> Result<SignalOutcome, NegotiationError> {
        if candidate.is_end_of_candidates() {
            return Ok(SignalOutcome::EndOfCandidates);
        }
        if self.ignore_offer {
            return Ok(SignalOutcome::Ignored);
        }
        if !self.has_remote_description {
            self.pending_candidates.push(candidate);
            return Ok(SignalOutcome::Queued);
        }
        self.peer.add_ice_candidate(candidate).await?;
        Ok(SignalOutcome::Applied)
    }

    async fn remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<SignalOutcome, NegotiationError> {
        let is_offer = description.is_offer();
        let signaling = self.peer.signaling_state();
        let collision = is_offer && (self.making_offer || signaling != SignalingState::Stable);

        self.ignore_offer = self.role == Role::Impolite && collision;
        if self.ignore_offer {
            tracing::debug!(role = %self.role, %signaling, "Ignoring colliding offer");
            return Ok(SignalOutcome::Ignored);
        }

        if collision && signaling == SignalingState::HaveLocalOffer {
            tracing::debug!(role = %self.role, "Rolling back local offer for colliding remote offer");
            self.peer
                .set_local_description(SessionDescription::rollback())
                .await?;
            self.making_offer = false;
            self.state = self.settled_state();
        }

        let sdp_type = description.sdp_type;
        self.peer.set_remote_description(description).await?;
        self.has_remote_description = true;
        self.flush_pending_candidates().await;

        if is_offer {
            self.state = NegotiationState::HaveRemoteOffer;
            let answer = self.peer.create_answer().await?;
            self.peer.set_local_description(answer.clone()).await?;
            self.complete_round();
            self.transmit(SignalMessage::Description(answer))?;
            return Ok(SignalOutcome::Answered);
        }

        if sdp_type == SdpType::Answer {
            self.complete_round();
        }
        Ok(SignalOutcome::Applied)
    }

    async fn flush_pending_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        for candidate in pending {
            if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                tracing::warn!(role = %self.role, "Failed to apply queued candidate: {}", e);
            }
        }
    }

    fn complete_round(&mut self) {
        self.completed_rounds += 1;
        self.state = NegotiationState::Stable;
        tracing::debug!(role = %self.role, rounds = self.completed_rounds, "Negotiation round complete");
    }

    fn settled_state(&self) -> NegotiationState {
        if self.completed_rounds > 0 {
            NegotiationState::Stable
        } else {
            NegotiationState::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::subscription::Subscription;
    use crate::transport::memory::{pair, MemoryPeer};
    use crate::transport::{ChannelEvent, DataChannel, PeerEvent};

    #[derive(Default)]
    struct RecordingSink {
        closed: AtomicBool,
        refuse: AtomicBool,
        sent: Mutex<Vec<SignalMessage>>,
    }

    impl RecordingSink {
        fn closed() -> Arc<Self> {
            let sink = Self::default();
            sink.closed.store(true, Ordering::SeqCst);
            Arc::new(sink)
        }

        fn take(&self) -> Vec<SignalMessage> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl SignalSink for RecordingSink {
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn send(&self, message: &SignalMessage) -> Result<(), TransportError> {
            if !self.is_open() || self.refuse.load(Ordering::SeqCst) {
                return Err(TransportError::ChannelNotOpen("control".into()));
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct Side {
        peer: Arc<MemoryPeer>,
        sink: Arc<RecordingSink>,
        negotiator: Negotiator,
        events: Subscription<PeerEvent>,
        channels: Vec<Arc<dyn DataChannel>>,
    }

    impl Side {
        fn new(peer: Arc<MemoryPeer>, role: Role) -> Self {
            let sink = Arc::new(RecordingSink::default());
            let events = peer.events();
            let negotiator = Negotiator::new(peer.clone(), sink.clone(), role);
            Self {
                peer,
                sink,
                negotiator,
                events,
                channels: Vec::new(),
            }
        }

        async fn drain_events(&mut self) -> bool {
            let mut progressed = false;
            while let Some(event) = self.events.try_recv() {
                progressed = true;
                match event {
                    PeerEvent::NegotiationNeeded => {
                        self.negotiator.negotiation_needed().await.unwrap();
                    }
                    PeerEvent::IceCandidate(c) => self.negotiator.local_candidate(c).unwrap(),
                    PeerEvent::DataChannel(ch) => self.channels.push(ch),
                    _ => {}
                }
            }
            progressed
        }
    }

    async fn deliver(from: &Side, to: &mut Side) -> bool {
        let messages = from.sink.take();
        let progressed = !messages.is_empty();
        for message in messages {
            let outcome = to.negotiator.handle_signal(message).await;
            assert!(!matches!(outcome, SignalOutcome::Failed(_)), "unexpected {outcome:?}");
        }
        progressed
    }

    async fn pump(a: &mut Side, b: &mut Side) {
        for _ in 0..64 {
            let mut progressed = a.drain_events().await;
            progressed |= b.drain_events().await;
            progressed |= deliver(a, b).await;
            progressed |= deliver(b, a).await;
            if !progressed {
                return;
            }
        }
        panic!("negotiation did not settle");
    }

    async fn converge_with(a_role: Role, b_role: Role) {
        let (pa, pb) = pair("a", "b");
        let mut a = Side::new(pa, a_role);
        let mut b = Side::new(pb, b_role);

        let channel = a.peer.create_data_channel("pointers").await.unwrap();
        pump(&mut a, &mut b).await;

        assert_eq!(a.negotiator.state(), NegotiationState::Stable);
        assert_eq!(b.negotiator.state(), NegotiationState::Stable);
        assert_eq!(a.peer.signaling_state(), SignalingState::Stable);
        assert_eq!(b.peer.signaling_state(), SignalingState::Stable);
        assert!(channel.is_open());
        assert_eq!(b.channels.len(), 1);
        assert_eq!(b.peer.applied_candidates().len(), 1);
        assert_eq!(a.peer.applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_converges_with_offerer_impolite() {
        converge_with(Role::Impolite, Role::Polite).await;
    }

    #[tokio::test]
    async fn test_converges_with_offerer_polite() {
        converge_with(Role::Polite, Role::Impolite).await;
    }

    #[tokio::test]
    async fn test_glare_converges_to_one_offer_answer_pair() {
        let (pa, pb) = pair("a", "b");
        let mut a = Side::new(pa, Role::Impolite);
        let mut b = Side::new(pb, Role::Polite);

        a.negotiator.negotiation_needed().await.unwrap();
        b.negotiator.negotiation_needed().await.unwrap();
        assert_eq!(a.negotiator.state(), NegotiationState::HaveLocalOffer);
        assert_eq!(b.negotiator.state(), NegotiationState::HaveLocalOffer);

        let from_a = a.sink.take();
        let from_b = b.sink.take();

        let mut a_outcomes = Vec::new();
        for message in from_b {
            a_outcomes.push(a.negotiator.handle_signal(message).await);
        }
        assert_eq!(a_outcomes, vec![SignalOutcome::Ignored]);

        let mut b_outcomes = Vec::new();
        for message in from_a {
            b_outcomes.push(b.negotiator.handle_signal(message).await);
        }
        assert_eq!(b_outcomes, vec![SignalOutcome::Answered]);

        pump(&mut a, &mut b).await;

        assert_eq!(a.negotiator.state(), NegotiationState::Stable);
        assert_eq!(b.negotiator.state(), NegotiationState::Stable);
        let a_local = a.peer.local_description().unwrap();
        let b_remote = b.peer.remote_description().unwrap();
        let b_local = b.peer.local_description().unwrap();
        let a_remote = a.peer.remote_description().unwrap();
        assert_eq!(a_local, b_remote);
        assert_eq!(b_local, a_remote);
        assert_eq!(a_local.sdp_type, SdpType::Offer);
        assert_eq!(b_local.sdp_type, SdpType::Answer);
    }

    #[tokio::test]
    async fn test_end_of_candidates_is_noop_in_every_state() {
        let (pa, pb) = pair("a", "b");
        let mut a = Side::new(pa, Role::Polite);
        let mut b = Side::new(pb, Role::Impolite);

        let sentinel = || SignalMessage::Candidate(IceCandidate::default());

        assert_eq!(a.negotiator.handle_signal(SignalMessage::EndOfCandidates).await, SignalOutcome::EndOfCandidates);
        assert_eq!(a.negotiator.handle_signal(sentinel()).await, SignalOutcome::EndOfCandidates);

        a.negotiator.negotiation_needed().await.unwrap();
        assert_eq!(a.negotiator.state(), NegotiationState::HaveLocalOffer);
        assert_eq!(a.negotiator.handle_signal(sentinel()).await, SignalOutcome::EndOfCandidates);

        deliver(&a, &mut b).await;
        assert_eq!(b.negotiator.handle_signal(SignalMessage::EndOfCandidates).await, SignalOutcome::EndOfCandidates);

        pump(&mut a, &mut b).await;
        assert_eq!(a.negotiator.state(), NegotiationState::Stable);
        assert_eq!(a.negotiator.handle_signal(sentinel()).await, SignalOutcome::EndOfCandidates);
        assert_eq!(a.negotiator.pending_candidates(), 0);
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let (pa, pb) = pair("a", "b");
        let mut a = Side::new(pa, Role::Impolite);
        let mut b = Side::new(pb, Role::Polite);

        a.negotiator.negotiation_needed().await.unwrap();
        a.drain_events().await;
        let mut messages = a.sink.take();
        let offer = messages.remove(0);
        assert!(matches!(offer, SignalMessage::Description(_)));

        for message in messages {
            let outcome = b.negotiator.handle_signal(message).await;
            assert!(matches!(outcome, SignalOutcome::Queued | SignalOutcome::EndOfCandidates));
        }
        assert_eq!(b.negotiator.pending_candidates(), 1);
        assert!(b.peer.applied_candidates().is_empty());

        assert_eq!(b.negotiator.handle_signal(offer).await, SignalOutcome::Answered);
        assert_eq!(b.negotiator.pending_candidates(), 0);
        assert_eq!(b.peer.applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_outbound_buffered_until_control_ready() {
        let peer = MemoryPeer::new("solo");
        let sink = RecordingSink::closed();
        let mut negotiator = Negotiator::new(peer.clone(), sink.clone(), Role::Polite);

        assert!(negotiator.negotiation_needed().await.unwrap());
        negotiator
            .local_candidate(Some(IceCandidate::new("candidate:1 1 udp 1 127.0.0.1 9 typ host")))
            .unwrap();
        negotiator.local_candidate(None).unwrap();
        assert_eq!(negotiator.buffered(), 3);
        assert!(sink.take().is_empty());

        assert_eq!(negotiator.control_opened().unwrap(), 0);

        sink.closed.store(false, Ordering::SeqCst);
        assert_eq!(negotiator.control_opened().unwrap(), 3);
        let sent = sink.take();
        assert!(matches!(sent[0], SignalMessage::Description(ref d) if d.is_offer()));
        assert!(matches!(sent[1], SignalMessage::Candidate(_)));
        assert_eq!(sent[2], SignalMessage::EndOfCandidates);
        assert_eq!(negotiator.buffered(), 0);
    }

    #[tokio::test]
    async fn test_failed_send_keeps_message_buffered() {
        let peer = MemoryPeer::new("solo");
        let sink = Arc::new(RecordingSink::default());
        sink.refuse.store(true, Ordering::SeqCst);
        let mut negotiator = Negotiator::new(peer.clone(), sink.clone(), Role::Impolite);

        let candidate = IceCandidate::new("candidate:1 1 udp 1 127.0.0.1 9 typ host");
        assert!(matches!(
            negotiator.local_candidate(Some(candidate.clone())),
            Err(NegotiationError::Control(_))
        ));
        assert_eq!(negotiator.buffered(), 1);

        // Later messages queue behind the unsent one.
        negotiator.local_candidate(None).unwrap();
        assert_eq!(negotiator.buffered(), 2);
        assert!(sink.take().is_empty());

        sink.refuse.store(false, Ordering::SeqCst);
        assert_eq!(negotiator.control_opened().unwrap(), 2);
        assert_eq!(
            sink.take(),
            vec![SignalMessage::Candidate(candidate), SignalMessage::EndOfCandidates]
        );
    }

    #[tokio::test]
    async fn test_failed_application_keeps_session_alive() {
        let (pa, pb) = pair("a", "b");
        let mut a = Side::new(pa, Role::Impolite);
        let mut b = Side::new(pb, Role::Polite);

        let stray_answer = SignalMessage::Description(SessionDescription::answer("v=0\r\n"));
        let outcome = a.negotiator.handle_signal(stray_answer).await;
        assert!(matches!(outcome, SignalOutcome::Failed(_)));
        assert_eq!(a.negotiator.state(), NegotiationState::Idle);

        let channel = a.peer.create_data_channel("pointers").await.unwrap();
        pump(&mut a, &mut b).await;
        assert!(channel.is_open());
        assert_eq!(a.negotiator.state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn test_rejected_candidate_is_logged_not_fatal() {
        let (pa, pb) = pair("a", "b");
        let mut a = Side::new(pa, Role::Impolite);
        let mut b = Side::new(pb, Role::Polite);
        let _channel = a.peer.create_data_channel("pointers").await.unwrap();
        pump(&mut a, &mut b).await;

        b.peer.reject_candidates(true);
        let outcome = b
            .negotiator
            .handle_signal(SignalMessage::Candidate(IceCandidate::new(
                "candidate:9 1 udp 1 10.0.0.9 9 typ host",
            )))
            .await;
        assert!(matches!(outcome, SignalOutcome::Failed(_)));
        assert_eq!(b.negotiator.state(), NegotiationState::Stable);

        let mut events = b.channels[0].events();
        assert_eq!(events.try_recv(), Some(ChannelEvent::Open));
    }
}
