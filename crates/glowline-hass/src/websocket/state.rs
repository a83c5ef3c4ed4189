//! Connection state of a protocol session.

/// Where a session is in its lifecycle.
///
/// ```text
/// Disconnected -> AwaitingAuthRequired -> Authenticating -> Ready -> Closed
/// ```
///
/// Any state may move straight to `Closed` on a transport error. `Closed` is
/// terminal; reconnecting always uses a new session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport has been opened yet.
    #[default]
    Disconnected,
    /// Transport is open, waiting for the server hello.
    AwaitingAuthRequired,
    /// Credentials sent, waiting for the server verdict.
    Authenticating,
    /// Authenticated; application commands may be sent.
    Ready,
    /// Transport closed. Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether application commands may be sent in this state.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Whether a transport is open in this state.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            Self::AwaitingAuthRequired | Self::Authenticating | Self::Ready
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::AwaitingAuthRequired => write!(f, "AwaitingAuthRequired"),
            Self::Authenticating => write!(f, "Authenticating"),
            Self::Ready => write!(f, "Ready"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}
