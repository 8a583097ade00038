//! Error types for Parley
//!
//! Each failure class of the voice pipeline has its own enum so callers can
//! match on what went wrong; [`ParleyError`] wraps them for code that only
//! needs to report.

use std::time::Duration;
use thiserror::Error;

/// Failure to establish (or keep) a voice connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The gateway refused or failed the join request
    #[error("Join request for channel {channel_id} failed: {reason}")]
    Gateway {
        /// Channel that was requested
        channel_id: u64,
        /// Underlying transport message
        reason: String,
    },

    /// The connection did not become ready in time
    #[error("Voice connection to channel {channel_id} not ready after {timeout:?}")]
    Timeout {
        /// Channel that was requested
        channel_id: u64,
        /// How long we waited
        timeout: Duration,
    },

    /// The transport dropped the connection before it became ready
    #[error("Voice connection to channel {channel_id} dropped before becoming ready")]
    Dropped {
        /// Channel that was requested
        channel_id: u64,
    },

    /// A newer join or a leave replaced this attempt while it was pending
    #[error("Join attempt for channel {channel_id} was superseded")]
    Superseded {
        /// Channel that was requested
        channel_id: u64,
    },
}

/// Failure of the text-to-speech provider
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    /// No credentials configured
    #[error("Speech synthesis is not configured: {0}")]
    NotConfigured(String),

    /// API authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Text too long
    #[error("Text exceeds maximum length: {length} > {max}")]
    TextTooLong {
        /// Actual text length
        length: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Provider returned an error status
    #[error("Provider error ({status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body
        message: String,
    },
}

/// Failure to start playback on the voice transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    /// No ready voice connection
    #[error("Not connected to a voice channel")]
    NotConnected,

    /// Another playback has not confirmed start yet
    #[error("Another playback is still starting")]
    Busy,

    /// Transport refused the audio resource
    #[error("Transport rejected playback: {0}")]
    Rejected(String),

    /// Transport never reported that playback started
    #[error("Playback did not start within {0:?}")]
    StartTimeout(Duration),
}

/// Failure while turning compressed audio into transport frames
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscodeError {
    /// Container or codec not recognised
    #[error("Unsupported audio input: {0}")]
    Unsupported(String),

    /// Malformed packet
    #[error("Audio decode failed: {0}")]
    Decode(String),

    /// Sample-rate conversion failed
    #[error("Resampling failed: {0}")]
    Resample(String),

    /// The upstream byte stream failed
    #[error("Audio input failed: {0}")]
    Input(String),
}

/// Main error type for Parley operations
#[derive(Debug, Error)]
pub enum ParleyError {
    /// Voice connection error
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Text-to-speech error
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    /// Playback error
    #[error(transparent)]
    Playback(#[from] PlaybackError),

    /// Transcoding error
    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    /// Speech requested while no conversation is active
    #[error("Conversation is not active")]
    ConversationInactive,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Chat gateway error
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Convenient Result type using ParleyError
pub type Result<T> = std::result::Result<T, ParleyError>;

impl ParleyError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        ParleyError::Config(msg.into())
    }

    /// Create a gateway error
    pub fn gateway(msg: impl Into<String>) -> Self {
        ParleyError::Gateway(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        ParleyError::Other(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ParleyError::config("missing token");
        assert_eq!(err.to_string(), "Configuration error: missing token");

        let err: ParleyError = PlaybackError::NotConnected.into();
        assert_eq!(err.to_string(), "Not connected to a voice channel");
    }

    #[test]
    fn test_connect_error_carries_channel() {
        let err = ConnectError::Timeout {
            channel_id: 42,
            timeout: Duration::from_secs(30),
        };
        assert!(err.to_string().contains("42"));
        assert!(err.to_string().contains("30s"));
    }

    #[test]
    fn test_result_type() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }

        assert_eq!(returns_result().unwrap(), 42);
    }
}
