//! Input validation for untrusted data.
//!
//! Every payload a client sends is checked here before it reaches a peer
//! connection or another client.

use peerpoint_core::{ClientId, SdpType, SignalMessage};
use thiserror::Error;

/// Maximum length for client ids.
pub const MAX_CLIENT_ID_LEN: usize = 64;
/// Maximum length for SDP offers/answers.
pub const MAX_SDP_LEN: usize = 65536; // 64KB should be plenty
/// Maximum length for ICE candidates.
pub const MAX_ICE_CANDIDATE_LEN: usize = 2048;
/// Maximum length for `sdpMid` and `usernameFragment`.
pub const MAX_ICE_FIELD_LEN: usize = 256;
/// Maximum control message size.
pub const MAX_WS_MESSAGE_SIZE: usize = 1_048_576; // 1MB
/// Maximum data-channel message size the relay will forward.
pub const MAX_DATA_MESSAGE_SIZE: usize = 262_144; // 256KB, the common SCTP max-message-size

/// Validation error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Client id exceeds maximum length.
    #[error("client_id too long (max {MAX_CLIENT_ID_LEN} chars)")]
    ClientIdTooLong,
    /// Client id is empty or contains invalid characters.
    #[error("client_id contains invalid characters")]
    ClientIdInvalidChars,
    /// SDP exceeds maximum length.
    #[error("SDP too long (max {MAX_SDP_LEN} bytes)")]
    SdpTooLong,
    /// An offer, answer or pranswer without a body.
    #[error("{0} without SDP")]
    SdpMissing(SdpType),
    /// ICE candidate exceeds maximum length.
    #[error("ICE candidate too long (max {MAX_ICE_CANDIDATE_LEN} bytes)")]
    IceCandidateTooLong,
    /// An auxiliary candidate field exceeds its maximum length.
    #[error("ICE candidate field `{0}` too long (max {MAX_ICE_FIELD_LEN} bytes)")]
    IceFieldTooLong(&'static str),
    /// Control message exceeds maximum size.
    #[error("message too large (max {MAX_WS_MESSAGE_SIZE} bytes)")]
    MessageTooLarge,
    /// Data-channel message exceeds maximum size.
    #[error("data message too large (max {MAX_DATA_MESSAGE_SIZE} bytes)")]
    DataMessageTooLarge,
}

impl ValidationError {
    /// Label used for the validation-failure metric.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientIdTooLong | Self::ClientIdInvalidChars => "client_id",
            Self::SdpTooLong | Self::SdpMissing(_) => "sdp",
            Self::IceCandidateTooLong | Self::IceFieldTooLong(_) => "ice_candidate",
            Self::MessageTooLarge => "message_size",
            Self::DataMessageTooLarge => "data_message_size",
        }
    }
}

/// Check if a character is valid for ids (alphanumeric, hyphen, or underscore).
fn is_valid_id_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

/// Validate a client id used for addressing.
///
/// Valid ids are 1-64 characters of alphanumerics, hyphen and underscore;
/// server-issued UUIDs always pass.
///
/// # Errors
///
/// Returns [`ValidationError::ClientIdTooLong`] if the id exceeds 64 characters.
/// Returns [`ValidationError::ClientIdInvalidChars`] if the id is empty or contains invalid characters.
pub fn validate_client_id(id: &ClientId) -> Result<(), ValidationError> {
    let id = id.as_str();
    if id.len() > MAX_CLIENT_ID_LEN {
        return Err(ValidationError::ClientIdTooLong);
    }
    if id.is_empty() || !id.chars().all(is_valid_id_char) {
        return Err(ValidationError::ClientIdInvalidChars);
    }
    Ok(())
}

/// Validate an SDP body.
///
/// Only the length is checked; full SDP parsing is left to the peer
/// connection.
///
/// # Errors
///
/// Returns [`ValidationError::SdpTooLong`] if the SDP exceeds 64KB.
pub fn validate_sdp(sdp: &str) -> Result<(), ValidationError> {
    if sdp.len() > MAX_SDP_LEN {
        return Err(ValidationError::SdpTooLong);
    }
    Ok(())
}

/// Validate an ICE candidate line.
///
/// # Errors
///
/// Returns [`ValidationError::IceCandidateTooLong`] if the candidate exceeds 2KB.
pub fn validate_ice_candidate(candidate: &str) -> Result<(), ValidationError> {
    if candidate.len() > MAX_ICE_CANDIDATE_LEN {
        return Err(ValidationError::IceCandidateTooLong);
    }
    Ok(())
}

/// Validate control message size.
///
/// # Errors
///
/// Returns [`ValidationError::MessageTooLarge`] if the message exceeds 1MB.
pub fn validate_message_size(size: usize) -> Result<(), ValidationError> {
    if size > MAX_WS_MESSAGE_SIZE {
        return Err(ValidationError::MessageTooLarge);
    }
    Ok(())
}

/// Validate data-channel message size.
///
/// # Errors
///
/// Returns [`ValidationError::DataMessageTooLarge`] if the message exceeds 256KB.
pub fn validate_data_message_size(size: usize) -> Result<(), ValidationError> {
    if size > MAX_DATA_MESSAGE_SIZE {
        return Err(ValidationError::DataMessageTooLarge);
    }
    Ok(())
}

/// Validate a decoded signaling payload.
///
/// # Errors
///
/// Returns the first [`ValidationError`] the payload trips.
pub fn validate_signal(message: &SignalMessage) -> Result<(), ValidationError> {
    match message {
        SignalMessage::EndOfCandidates => Ok(()),
        SignalMessage::Candidate(candidate) => {
            validate_ice_candidate(&candidate.candidate)?;
            if candidate.sdp_mid.as_ref().is_some_and(|mid| mid.len() > MAX_ICE_FIELD_LEN) {
                return Err(ValidationError::IceFieldTooLong("sdpMid"));
            }
            if candidate
                .username_fragment
                .as_ref()
                .is_some_and(|ufrag| ufrag.len() > MAX_ICE_FIELD_LEN)
            {
                return Err(ValidationError::IceFieldTooLong("usernameFragment"));
            }
            Ok(())
        }
        SignalMessage::Description(description) => {
            validate_sdp(&description.sdp)?;
            if description.sdp_type != SdpType::Rollback && description.sdp.trim().is_empty() {
                return Err(ValidationError::SdpMissing(description.sdp_type));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use peerpoint_core::{IceCandidate, SessionDescription};
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_valid_client_ids() {
        assert!(validate_client_id(&ClientId::new("peer-abc123")).is_ok());
        assert!(validate_client_id(&ClientId::new("user_42")).is_ok());
        assert!(validate_client_id(&ClientId::generate()).is_ok());
    }

    #[test]
    fn test_invalid_client_ids() {
        assert!(validate_client_id(&ClientId::new("")).is_err());
        assert!(validate_client_id(&ClientId::new("peer with space")).is_err());
        assert!(validate_client_id(&ClientId::new("../../etc/passwd")).is_err());
        assert_eq!(
            validate_client_id(&ClientId::new("x".repeat(MAX_CLIENT_ID_LEN + 1))),
            Err(ValidationError::ClientIdTooLong)
        );
    }

    #[test]
    fn test_sdp_length() {
        assert!(validate_sdp("v=0\r\n").is_ok());
        assert!(validate_sdp(&"x".repeat(MAX_SDP_LEN)).is_ok());
        assert!(validate_sdp(&"x".repeat(MAX_SDP_LEN + 1)).is_err());
    }

    #[test]
    fn test_ice_candidate_length() {
        assert!(validate_ice_candidate("candidate:1 1 UDP 2130706431").is_ok());
        assert!(validate_ice_candidate(&"x".repeat(MAX_ICE_CANDIDATE_LEN)).is_ok());
        assert!(validate_ice_candidate(&"x".repeat(MAX_ICE_CANDIDATE_LEN + 1)).is_err());
    }

    #[test]
    fn test_message_sizes() {
        assert!(validate_message_size(1000).is_ok());
        assert!(validate_message_size(MAX_WS_MESSAGE_SIZE).is_ok());
        assert!(validate_message_size(MAX_WS_MESSAGE_SIZE + 1).is_err());
        assert!(validate_data_message_size(MAX_DATA_MESSAGE_SIZE).is_ok());
        assert!(validate_data_message_size(MAX_DATA_MESSAGE_SIZE + 1).is_err());
    }

    #[test]
    fn test_signal_descriptions() {
        assert!(validate_signal(&SignalMessage::Description(SessionDescription::offer("v=0"))).is_ok());
        assert!(validate_signal(&SignalMessage::Description(SessionDescription::rollback())).is_ok());
        assert_eq!(
            validate_signal(&SignalMessage::Description(SessionDescription::answer("  "))),
            Err(ValidationError::SdpMissing(SdpType::Answer))
        );
    }

    #[test]
    fn test_signal_candidates() {
        assert!(validate_signal(&SignalMessage::EndOfCandidates).is_ok());
        assert!(validate_signal(&SignalMessage::Candidate(IceCandidate::new("candidate:1 1 udp 1 h 1 typ host"))).is_ok());

        let mut long_mid = IceCandidate::new("candidate:1");
        long_mid.sdp_mid = Some("m".repeat(MAX_ICE_FIELD_LEN + 1));
        let err = validate_signal(&SignalMessage::Candidate(long_mid)).expect_err("should fail");
        assert_eq!(err, ValidationError::IceFieldTooLong("sdpMid"));
        assert_eq!(err.kind(), "ice_candidate");
    }

    #[test]
    fn test_error_messages() {
        assert!(ValidationError::ClientIdTooLong.to_string().contains("64"));
        assert!(ValidationError::SdpTooLong.to_string().contains("65536"));
        assert!(ValidationError::MessageTooLarge.to_string().contains("1048576"));
        assert_eq!(ValidationError::SdpMissing(SdpType::Offer).to_string(), "offer without SDP");
    }

    proptest! {
        #[test]
        fn prop_client_id_charset(id in "[A-Za-z0-9_-]{1,64}") {
            prop_assert!(validate_client_id(&ClientId::new(id)).is_ok());
        }

        #[test]
        fn prop_client_id_rejects_separators(prefix in "[a-z]{0,10}", sep in "[ /.:<>]", suffix in "[a-z]{0,10}") {
            let id = format!("{prefix}{sep}{suffix}");
            prop_assert!(validate_client_id(&ClientId::new(id)).is_err());
        }
    }
}
