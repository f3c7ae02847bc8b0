//! Error types and result definitions for the tuyazig crate.
//! Framing problems are deliberately NOT errors: the decoder degrades to
//! "stop early" and reports what it already recovered.

use thiserror::Error;

/// Represents all possible errors that can occur while driving a Tuya
/// Zigbee device session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TuyaZigError {
    /// Encode was asked to serialize a data-point type it does not know
    #[error("Unsupported data-point type: 0x{0:02X}")]
    UnsupportedType(u8),

    /// The radio stack rejected or failed an outbound send
    #[error("Transport send failed: {0}")]
    Transport(String),

    /// A delivery channel could not be registered
    #[error("Channel '{0}' registration failed: {1}")]
    ChannelRegistration(&'static str, String),

    /// Waiting on the device took longer than allowed
    #[error("Timeout waiting for device")]
    Timeout,

    /// A discharge curve failed its load-time validation
    #[error("Invalid discharge curve for {0}: {1}")]
    InvalidCurve(&'static str, String),

    /// The session has already been torn down
    #[error("Session closed")]
    SessionClosed,
}

/// A specialized Result type for engine operations.
pub type Result<T> = std::result::Result<T, TuyaZigError>;

impl TuyaZigError {
    /// True for outcomes that degrade service but must not tear the
    /// session down (log-and-continue contract).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TuyaZigError::SessionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_closed_is_not_recoverable() {
        assert!(!TuyaZigError::SessionClosed.is_recoverable());
        assert!(TuyaZigError::Timeout.is_recoverable());
        assert!(TuyaZigError::Transport("radio busy".into()).is_recoverable());
    }

    #[test]
    fn display_carries_context() {
        let e = TuyaZigError::UnsupportedType(0x17);
        assert!(e.to_string().contains("0x17"));
        let e = TuyaZigError::ChannelRegistration("bound_cluster", "no endpoint".into());
        assert!(e.to_string().contains("bound_cluster"));
    }
}
