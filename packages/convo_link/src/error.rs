//! Error taxonomy for the connection core.
//!
//! Every failure path in the crate ends in one of these variants, either
//! returned from a public operation or carried on the event stream. The enum
//! is `Clone` so errors can ride the broadcast channel to multiple consumers.

pub type Result<T> = std::result::Result<T, LinkError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// The signaling channel failed to open or dropped.
    #[error("transport error: {0}")]
    Transport(String),

    /// A bounded wait expired (channel open, session identifier, ...).
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// An operation was attempted without the required prior state.
    #[error("precondition not met: {0}")]
    Precondition(&'static str),

    /// Local media capture device unavailable or permission denied.
    #[error("media device unavailable: {0}")]
    Device(String),

    /// Malformed or unparseable inbound frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Explicit error frame from the backend.
    #[error("server error: {0}")]
    Server(String),
}

impl LinkError {
    /// Stable machine-readable code for each variant.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Precondition(_) => "precondition",
            Self::Device(_) => "device",
            Self::Protocol(_) => "protocol",
            Self::Server(_) => "server",
        }
    }

    /// Whether automatic reconnection is an appropriate response.
    ///
    /// Only unexpected transport loss qualifies; server and protocol errors
    /// are the backend's (or caller's) responsibility to resolve.
    pub fn is_reconnectable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}
