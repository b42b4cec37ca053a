//! Protocol error types

use std::fmt;
use thiserror::Error;

/// Which part of a frame was being read when the stream ran dry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStage {
    Header,
    Payload,
}

impl fmt::Display for FrameStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameStage::Header => f.write_str("header"),
            FrameStage::Payload => f.write_str("payload"),
        }
    }
}

/// Framing errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Stream ended before a whole header or payload was read
    #[error("Incomplete frame {stage}: expected {expected} bytes, got {actual}")]
    IncompleteFrame {
        stage: FrameStage,
        expected: usize,
        actual: usize,
    },

    /// Declared payload length exceeds maximum allowed size
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Payload length disagrees with the header's data length
    #[error("Payload length mismatch: header declares {declared} bytes, payload has {actual}")]
    PayloadLengthMismatch { declared: usize, actual: usize },

    /// I/O error during frame operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the peer closed the stream cleanly between two frames
    pub fn is_clean_eof(&self) -> bool {
        matches!(
            self,
            ProtocolError::IncompleteFrame {
                stage: FrameStage::Header,
                actual: 0,
                ..
            }
        )
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::IncompleteFrame {
            stage: FrameStage::Payload,
            expected: 10,
            actual: 4,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Incomplete frame payload"));
        assert!(msg.contains("10"));
        assert!(msg.contains("4"));
    }

    #[test]
    fn test_clean_eof() {
        let eof = ProtocolError::IncompleteFrame {
            stage: FrameStage::Header,
            expected: 24,
            actual: 0,
        };
        assert!(eof.is_clean_eof());

        let truncated_header = ProtocolError::IncompleteFrame {
            stage: FrameStage::Header,
            expected: 24,
            actual: 7,
        };
        assert!(!truncated_header.is_clean_eof());

        let truncated_payload = ProtocolError::IncompleteFrame {
            stage: FrameStage::Payload,
            expected: 24,
            actual: 0,
        };
        assert!(!truncated_payload.is_clean_eof());
    }

    #[test]
    fn test_frame_too_large_error() {
        let err = ProtocolError::FrameTooLarge {
            size: 20_000_000,
            max: 16_777_216,
        };
        assert!(format!("{}", err).contains("Frame too large"));
    }
}
