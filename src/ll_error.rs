//! Error types for the lower layer simulation.

use thiserror::Error;

use crate::ll_interface::Name;

/// Coarse classification used to decide how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Busy medium or exhausted reservations; handled locally by queuing or refusing.
    Capacity,
    /// The link itself is unusable; surfaced to the caller, ends construction processes.
    Transport,
    /// Unexpected or mismatched signaling; logged and the message dropped.
    Protocol,
    /// No collision-free attachment name; fails the attach attempt.
    Generation,
    /// Rejected settings; nothing was started.
    Configuration,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LinkError {
    #[error("medium is busy")]
    MediumBusy,

    #[error("insufficient bandwidth: requested {requested} kbit/s, available {available} kbit/s")]
    InsufficientBandwidth { requested: u64, available: u64 },

    #[error("delay requirement of {required} ms can not be met (medium delay {offered} ms)")]
    DelayUnsupported { required: u64, offered: u64 },

    #[error("invalid binding name")]
    InvalidName,

    #[error("name '{0}' is already bound")]
    NameInUse(Name),

    #[error("name '{0}' not known")]
    NameUnknown(Name),

    #[error("endpoint is not connected")]
    NotConnected,

    #[error("connection already closed")]
    ConnectionClosed,

    #[error("medium is broken")]
    MediumBroken,

    #[error("medium had been deleted")]
    MediumDeleted,

    #[error("no response from peer")]
    Timeout,

    #[error("peer rejected the link: {0}")]
    PeerRejected(String),

    #[error("not attached to lower layer")]
    NotAttached,

    #[error("gate construction failed: {0}")]
    GateConstruction(String),

    #[error("unexpected signaling message: {0}")]
    UnexpectedMessage(String),

    #[error("binding name mismatch: expected '{expected}', got '{actual}'")]
    BindingMismatch { expected: Name, actual: Name },

    #[error("malformed signaling message: {0}")]
    Malformed(String),

    #[error("can not generate a unique attachment name after {0} attempts")]
    NameGeneration(u32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LinkError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LinkError::MediumBusy
            | LinkError::InsufficientBandwidth { .. }
            | LinkError::DelayUnsupported { .. } => ErrorClass::Capacity,

            LinkError::UnexpectedMessage(_)
            | LinkError::BindingMismatch { .. }
            | LinkError::Malformed(_) => ErrorClass::Protocol,

            LinkError::NameGeneration(_) => ErrorClass::Generation,

            LinkError::InvalidConfig(_) => ErrorClass::Configuration,

            _ => ErrorClass::Transport,
        }
    }

    /// Capacity and protocol errors never end a link on their own.
    pub fn is_fatal_for_process(&self) -> bool {
        self.class() == ErrorClass::Transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(LinkError::MediumBusy.class(), ErrorClass::Capacity);
        assert_eq!(
            LinkError::InsufficientBandwidth {
                requested: 10,
                available: 5
            }
            .class(),
            ErrorClass::Capacity
        );
        assert_eq!(LinkError::NotConnected.class(), ErrorClass::Transport);
        assert_eq!(
            LinkError::NameUnknown("x".into()).class(),
            ErrorClass::Transport
        );
        assert_eq!(LinkError::MediumBroken.class(), ErrorClass::Transport);
        assert_eq!(
            LinkError::UnexpectedMessage("response".into()).class(),
            ErrorClass::Protocol
        );
        assert_eq!(LinkError::NameGeneration(10).class(), ErrorClass::Generation);
        assert_eq!(
            LinkError::InvalidConfig("retries".into()).class(),
            ErrorClass::Configuration
        );
    }

    #[test]
    fn test_fatal_for_process() {
        assert!(LinkError::ConnectionClosed.is_fatal_for_process());
        assert!(!LinkError::Malformed("x".into()).is_fatal_for_process());
        assert!(!LinkError::MediumBusy.is_fatal_for_process());
        assert!(!LinkError::InvalidConfig("x".into()).is_fatal_for_process());
    }

    #[test]
    fn test_display() {
        let err = LinkError::NameUnknown("bob_1".into());
        assert_eq!(err.to_string(), "name 'bob_1' not known");
    }
}
