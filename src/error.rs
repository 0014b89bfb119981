//! Error taxonomy for the speaker core (spec.md §7).
//!
//! `DecodeError`/`ProtocolError` classify malformed or disallowed wire input
//! into the NOTIFICATION sub-codes a session needs to report back to its
//! peer. `SessionError` is what a running session propagates up to the
//! `SessionManager`; `ConfigError` is raised by the configuration ingestion
//! adapter (`config::file`).

use std::fmt;
use std::io;

/// NOTIFICATION major error codes (RFC 4271 §4.5).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    MessageHeader = 1,
    OpenMessage = 2,
    UpdateMessage = 3,
    HoldTimerExpired = 4,
    FiniteStateMachine = 5,
    Cease = 6,
}

/// Malformed wire message, classified by NOTIFICATION sub-code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    // MsgHdrErr
    ConnNotSynchronized,
    BadMsgLength(u16),
    BadMsgType(u8),
    // OpenMsgErr
    UnsupportedVersion(u8),
    BadPeerAs { received: u32, expected: u32 },
    BadBgpId,
    UnsupportedOptionalParam,
    UnacceptableHoldTime(u16),
    UnsupportedCapability,
    // UpdateMsgErr
    MalformedAttributeList,
    UnrecognizedWellKnownAttrib(u8),
    MissingWellKnownAttrib(u8),
    AttribFlagsError,
    AttribLengthError,
    InvalidOrigin,
    InvalidNextHop,
    OptionalAttribError,
    InvalidNetworkField,
    MalformedAsPath,
}

impl DecodeError {
    pub fn notification_codes(&self) -> (u8, u8) {
        use DecodeError::*;
        match self {
            ConnNotSynchronized => (1, 1),
            BadMsgLength(_) => (1, 2),
            BadMsgType(_) => (1, 3),
            UnsupportedVersion(_) => (2, 1),
            BadPeerAs { .. } => (2, 2),
            BadBgpId => (2, 3),
            UnsupportedOptionalParam => (2, 4),
            UnacceptableHoldTime(_) => (2, 6),
            UnsupportedCapability => (2, 7),
            MalformedAttributeList => (3, 1),
            UnrecognizedWellKnownAttrib(_) => (3, 2),
            MissingWellKnownAttrib(_) => (3, 3),
            AttribFlagsError => (3, 4),
            AttribLengthError => (3, 5),
            InvalidOrigin => (3, 6),
            InvalidNextHop => (3, 8),
            OptionalAttribError => (3, 9),
            InvalidNetworkField => (3, 10),
            MalformedAsPath => (3, 11),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DecodeError: {:?}", self)
    }
}

impl std::error::Error for DecodeError {}

/// Semantically well-formed but disallowed: e.g. duplicate router-id
/// collision outcome, or an address family the peer didn't negotiate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    DuplicateIdentifier,
    UnsupportedFamily,
    CollisionLoser,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtocolError: {:?}", self)
    }
}

impl std::error::Error for ProtocolError {}

/// Top level error a `Session`/`PeerFsm` raises. Every variant maps to a
/// propagation rule in spec.md §7: Decode/Protocol/Timeout/Transport close
/// the session (via NOTIFICATION if the transport still works) and re-enter
/// IDLE; `Internal` additionally surfaces to the supervisor.
#[derive(Debug)]
pub enum SessionError {
    /// Peer was de-configured while a session was active.
    Deconfigured,
    Decode(DecodeError),
    Protocol(ProtocolError),
    /// Hold timer expired. [interval]
    HoldTimeExpired(u16),
    /// Transport-layer failure: connect refused, TCP reset, write failure.
    Transport(String),
    /// Invariant violation; terminates only the offending session.
    Internal(String),
    Other(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SessionError::*;
        match self {
            Deconfigured => write!(f, "peer de-configured"),
            Decode(err) => write!(f, "decode error: {}", err),
            Protocol(err) => write!(f, "protocol error: {}", err),
            HoldTimeExpired(h) => write!(f, "hold time expired after {} seconds", h),
            Transport(reason) => write!(f, "transport error: {}", reason),
            Internal(reason) => write!(f, "internal error: {}", reason),
            Other(reason) => write!(f, "{}", reason),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<io::Error> for SessionError {
    fn from(error: io::Error) -> Self {
        SessionError::Transport(error.to_string())
    }
}

impl From<DecodeError> for SessionError {
    fn from(error: DecodeError) -> Self {
        SessionError::Decode(error)
    }
}

impl From<ProtocolError> for SessionError {
    fn from(error: ProtocolError) -> Self {
        SessionError::Protocol(error)
    }
}

impl SessionError {
    /// The NOTIFICATION (major, minor) this error should be reported with,
    /// if the transport is still usable. `None` for errors that never
    /// surface at the session/wire level (policy is never session-scoped).
    pub fn notification_codes(&self) -> Option<(u8, u8)> {
        use SessionError::*;
        match self {
            Deconfigured => Some((6, 3)), // Cease / Administrative Shutdown
            Decode(err) => Some(err.notification_codes()),
            Protocol(ProtocolError::DuplicateIdentifier) => Some((6, 7)), // Cease / Connection Collision
            Protocol(ProtocolError::CollisionLoser) => Some((6, 7)),
            Protocol(ProtocolError::UnsupportedFamily) => Some((2, 7)),
            HoldTimeExpired(_) => Some((4, 0)),
            Internal(_) => Some((6, 6)), // Cease / Out of Resources
            Transport(_) | Other(_) => None,
        }
    }
}

/// Error raised while turning configuration input into `ConfigEvent`s.
#[derive(Debug)]
pub struct ConfigError {
    pub reason: String,
}

impl ConfigError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigError: {}", self.reason)
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(error: io::Error) -> Self {
        ConfigError::new(error.to_string())
    }
}
