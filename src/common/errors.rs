use thiserror::Error;

/// Failures reported by the packet ring.
///
/// `Corrupted` is recoverable: the ring has already reset itself to an empty
/// state by the time the caller sees it, and `lost_packets` says how much
/// pending data went with it.
#[derive(Debug, Error)]
pub enum RingError {
    #[error("invalid frame: skip {skip} exceeds total length {total_len}")]
    InvalidFrame { total_len: u32, skip: u32 },

    #[error("ring is empty")]
    Empty,

    #[error("ring corrupted ({reason}), {lost_packets} pending packets discarded")]
    Corrupted {
        reason: &'static str,
        lost_packets: u32,
    },

    #[error("packet writer failed: {0}")]
    Writer(#[from] std::io::Error),
}

/// Failures raised by a decoder implementation.
#[derive(Debug, Error)]
pub enum DecoderError {
    /// No usable decoder could be created or configured.
    #[error("decoder unavailable: {0}")]
    Unavailable(String),

    #[error("input slot {slot} rejected: {reason}")]
    Rejected { slot: u32, reason: String },

    #[error("codec error (recoverable: {recoverable}, transient: {transient}): {message}")]
    Codec {
        recoverable: bool,
        transient: bool,
        message: String,
    },

    #[error("decoder already released")]
    Released,
}

impl DecoderError {
    /// Neither recoverable nor transient: the feeder must stop until reset.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Codec {
                recoverable,
                transient,
                ..
            } => !recoverable && !transient,
            Self::Released => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_error_fatality() {
        let fatal = DecoderError::Codec {
            recoverable: false,
            transient: false,
            message: "hw fault".into(),
        };
        let transient = DecoderError::Codec {
            recoverable: false,
            transient: true,
            message: "busy".into(),
        };
        assert!(fatal.is_fatal());
        assert!(!transient.is_fatal());
        assert!(!DecoderError::Unavailable("none".into()).is_fatal());
    }

    #[test]
    fn ring_error_messages() {
        let err = RingError::InvalidFrame {
            total_len: 4,
            skip: 9,
        };
        assert_eq!(
            err.to_string(),
            "invalid frame: skip 9 exceeds total length 4"
        );
    }
}
