//! Error types for Peertun.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TunnelError>;

/// Failure taxonomy for the tunneling engine.
///
/// `Signaling` and `Negotiation` are fatal to the whole session attempt;
/// the remaining variants are fatal to a single exchange only.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Control connection to the signaling rendezvous failed or rejected us.
    #[error("signaling: {0}")]
    Signaling(String),

    /// Offer/answer negotiation failed: malformed description, candidate
    /// gathering never completed, or the transport reported failure.
    #[error("negotiation: {0}")]
    Negotiation(String),

    /// Transport-level send/receive failure on one tunnel channel.
    #[error("channel: {0}")]
    Channel(String),

    /// The channel closed before the response header boundary was found.
    #[error("connection closed before response headers received")]
    ClosedBeforeHeaders,

    /// Malformed tunnel frame.
    #[error("protocol: {0}")]
    Protocol(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Status code a gateway uses when synthesizing a response for this
    /// failure: 503 when the session never came up, 502 otherwise.
    pub fn http_status(&self) -> u16 {
        match self {
            TunnelError::Signaling(_) | TunnelError::Negotiation(_) => 503,
            TunnelError::Timeout("negotiation") => 503,
            _ => 502,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_failures_map_to_503() {
        assert_eq!(TunnelError::Signaling("refused".into()).http_status(), 503);
        assert_eq!(TunnelError::Negotiation("no answer".into()).http_status(), 503);
        assert_eq!(TunnelError::Timeout("negotiation").http_status(), 503);
    }

    #[test]
    fn exchange_failures_map_to_502() {
        assert_eq!(TunnelError::Channel("send failed".into()).http_status(), 502);
        assert_eq!(TunnelError::ClosedBeforeHeaders.http_status(), 502);
        assert_eq!(TunnelError::Timeout("exchange").http_status(), 502);
    }
}
