use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum RoomcastError {
    // Connection errors
    TransportClosed,
    TransportError(String),

    // Handshake errors
    AuthenticationRejected(String),
    UnknownNamespace(String),

    // Packet errors
    MalformedPacket(String),

    // Membership errors
    ConnectionNotFound(String),

    // Cluster errors
    StateStoreUnavailable(String),
    BrokerUnavailable(String),

    // Client errors
    TokenAcquisitionFailed(String),

    // Configuration errors
    ConfigError(String),
}

impl fmt::Display for RoomcastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportClosed => write!(f, "Transport closed"),
            Self::TransportError(msg) => write!(f, "Transport error: {}", msg),
            Self::AuthenticationRejected(msg) => write!(f, "Authentication rejected: {}", msg),
            Self::UnknownNamespace(path) => write!(f, "Unknown namespace: {}", path),
            Self::MalformedPacket(msg) => write!(f, "Malformed packet: {}", msg),
            Self::ConnectionNotFound(id) => write!(f, "Connection not found: {}", id),
            Self::StateStoreUnavailable(msg) => write!(f, "State store unavailable: {}", msg),
            Self::BrokerUnavailable(msg) => write!(f, "Broker unavailable: {}", msg),
            Self::TokenAcquisitionFailed(msg) => write!(f, "Token acquisition failed: {}", msg),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for RoomcastError {}

impl RoomcastError {
    /// Whether the caller may retry the failed operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StateStoreUnavailable(_) | Self::BrokerUnavailable(_)
        )
    }
}

// Generic result type for roomcast
pub type Result<T> = std::result::Result<T, RoomcastError>;
