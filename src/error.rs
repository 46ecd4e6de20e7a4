/// Errors returned by the charger protocol library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An argument is outside of the range the protocol can encode.
    #[error("Value out of range")]
    RangeError,
    /// Real-time data can only be decoded once the charger model (one or three phase) is known.
    #[error("get_model() has to be called at least once before")]
    ChargerModeUnknown,
    /// No matching response arrived within the configured timeout.
    #[error("No response within {0:?}")]
    Timeout(std::time::Duration),
    /// The session was dropped while a request was still waiting for its response.
    #[error("Connection closed before a response arrived")]
    ConnectionClosed,
    /// Socket bind or send failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
