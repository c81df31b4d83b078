//! Dispatcher Error Types
//!
//! Errors surfaced at the public boundary plus classification helpers used
//! to pick a recovery strategy.

use thiserror::Error;

use crate::transport::{ChannelId, TransportError};

/// Result type for dispatcher operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Dispatcher error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// Key action outside DOWN/UP
    #[error("Invalid key action: {0}")]
    InvalidKeyAction(i32),

    /// Unknown motion action or secondary pointer index out of range
    #[error("Invalid motion action: 0x{0:04x}")]
    InvalidMotionAction(i32),

    /// Pointer count outside 1..=16
    #[error("Invalid pointer count: {0}")]
    InvalidPointerCount(usize),

    /// Pointer id outside 0..=31
    #[error("Invalid pointer id: {0}")]
    InvalidPointerId(i32),

    /// Same pointer id used twice
    #[error("Duplicate pointer id: {0}")]
    DuplicatePointerId(i32),

    /// Channel registered twice
    #[error("Input channel {0} is already registered")]
    ChannelAlreadyRegistered(ChannelId),

    /// Unknown channel
    #[error("Input channel {0} is not registered")]
    ChannelNotRegistered(ChannelId),

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Error classification for recovery strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// Event rejected at the producer boundary
    MalformedInput,
    /// Channel registration bookkeeping
    Registration,
    /// Channel I/O
    Transport,
    /// Internal state
    State,
}

/// Classify error for recovery strategy selection
pub fn classify_error(error: &DispatchError) -> ErrorType {
    match error {
        DispatchError::InvalidKeyAction(_)
        | DispatchError::InvalidMotionAction(_)
        | DispatchError::InvalidPointerCount(_)
        | DispatchError::InvalidPointerId(_)
        | DispatchError::DuplicatePointerId(_) => ErrorType::MalformedInput,

        DispatchError::ChannelAlreadyRegistered(_) | DispatchError::ChannelNotRegistered(_) => {
            ErrorType::Registration
        }

        DispatchError::Transport(_) => ErrorType::Transport,

        DispatchError::InvalidState(_) => ErrorType::State,
    }
}

/// What the caller should do about an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Drop the event and tell the producer
    Reject,
    /// Nothing to undo
    Ignore,
    /// Tear the channel down
    Unregister,
    /// Reset dispatch state
    ResetState,
}

/// Get recovery action for error
pub fn recovery_action(error: &DispatchError) -> RecoveryAction {
    match classify_error(error) {
        ErrorType::MalformedInput => RecoveryAction::Reject,
        ErrorType::Registration => RecoveryAction::Ignore,
        ErrorType::Transport => match error {
            DispatchError::Transport(TransportError::WouldBlock) => RecoveryAction::Ignore,
            _ => RecoveryAction::Unregister,
        },
        ErrorType::State => RecoveryAction::ResetState,
    }
}
