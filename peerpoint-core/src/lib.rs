//! # Peerpoint Core
//!
//! Transport-agnostic logic for peer-to-peer pointer sharing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               peerpoint-core                │
//! ├─────────────────────────────────────────────┤
//! │  Signaling         │  State Sync            │
//! │  - ControlFrame    │  - SharedState         │
//! │  - Negotiator      │  - patch diff/apply    │
//! │  - candidate queue │  - Synchronizer        │
//! ├─────────────────────────────────────────────┤
//! │  Transport         │  Subscriptions         │
//! │  - PeerConnection  │  - EventHub            │
//! │  - DataChannel     │  - SubscriptionScope   │
//! │  - memory loopback │                        │
//! └─────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod negotiation;
pub mod patch;
pub mod signal;
pub mod state;
pub mod subscription;
pub mod sync;
pub mod transport;

pub use error::{PatchError, SignalError, TransportError};
pub use negotiation::{NegotiationError, NegotiationState, Negotiator, Role, SignalOutcome, SignalSink};
pub use patch::{Patch, PatchOp, PathSegment};
pub use signal::{ClientId, ControlFrame, IceCandidate, SdpType, SessionDescription, SignalEnvelope, SignalMessage};
pub use state::{ClientData, PointerSample, Pointers, SharedState};
pub use subscription::{EventHub, Subscription, SubscriptionScope};
pub use sync::{broadcast_text, ApplyOutcome, DataMessage, HueSource, Replica, Synchronizer};
pub use transport::{
    ChannelEvent, ConnectionState, DataChannel, PeerConnection, PeerConnectionFactory, PeerEvent,
    SignalingState,
};

/// Peerpoint core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
