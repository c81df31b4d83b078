//! Channel transport
//!
//! Each registered target owns one duplex channel. The dispatcher publishes
//! one message at a time, may append further motion samples until the
//! consumer takes the message, signals readiness, and later reads back a
//! finished signal before resetting for the next message.

pub mod memory;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

use crate::clock::Nsecs;
use crate::event::{
    DeviceId, KeyAction, KeyFlags, MotionAction, MotionFlags, PointerCoords, PointerProperties, PolicyFlags,
    Source,
};

pub use memory::{MemoryChannel, MemoryChannelClient};

static NEXT_CHANNEL_ID: AtomicU32 = AtomicU32::new(1);

/// Identity of a registered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(u32);

impl ChannelId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw id.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw id.
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No room for another sample
    #[error("Channel buffer full")]
    Full,

    /// The consumer already took the message being appended to
    #[error("Message already consumed")]
    Stale,

    /// Nothing to read yet
    #[error("Operation would block")]
    WouldBlock,

    /// Peer closed the channel
    #[error("Channel closed")]
    Closed,

    /// Calls made out of order
    #[error("Protocol violation: {0}")]
    Protocol(String),
}

/// Key message as seen by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyMessage {
    /// Device id
    pub device_id: DeviceId,
    /// Source
    pub source: Source,
    /// Resolved action
    pub action: KeyAction,
    /// Resolved flags
    pub flags: KeyFlags,
    /// Key code
    pub key_code: i32,
    /// Scan code
    pub scan_code: i32,
    /// Meta state
    pub meta_state: i32,
    /// Repeat count
    pub repeat_count: i32,
    /// Time of the initial DOWN
    pub down_time: Nsecs,
    /// Event time
    pub event_time: Nsecs,
    /// Policy flags
    pub policy_flags: PolicyFlags,
}

/// One sample of a published motion.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSample {
    /// Sample time
    pub event_time: Nsecs,
    /// Coordinates, parallel to the message's pointer properties
    pub coords: Vec<PointerCoords>,
}

/// Motion message as seen by the consumer. Coordinates are in display
/// space; the consumer adds the offsets to get window space.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionMessage {
    /// Device id
    pub device_id: DeviceId,
    /// Source
    pub source: Source,
    /// Resolved action
    pub action: MotionAction,
    /// Resolved flags
    pub flags: MotionFlags,
    /// Edge flags
    pub edge_flags: i32,
    /// Meta state
    pub meta_state: i32,
    /// X offset into window space
    pub x_offset: f32,
    /// Y offset into window space
    pub y_offset: f32,
    /// X precision
    pub x_precision: f32,
    /// Y precision
    pub y_precision: f32,
    /// Time of the gesture's DOWN
    pub down_time: Nsecs,
    /// Policy flags
    pub policy_flags: PolicyFlags,
    /// Pointer properties
    pub pointer_properties: Vec<PointerProperties>,
    /// Samples, oldest first (at least one)
    pub samples: Vec<MessageSample>,
}

impl MotionMessage {
    /// Window-space position of pointer `index` in the latest sample.
    pub fn window_position(&self, index: usize) -> Option<(f32, f32)> {
        let sample = self.samples.last()?;
        let coords = sample.coords.get(index)?;
        Some((coords.x + self.x_offset, coords.y + self.y_offset))
    }

    /// Pointer ids in order.
    pub fn pointer_ids(&self) -> Vec<i32> {
        self.pointer_properties.iter().map(|p| p.id).collect()
    }
}

/// Message published to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum InputMessage {
    /// Key
    Key(KeyMessage),
    /// Motion
    Motion(MotionMessage),
}

impl InputMessage {
    /// Key payload.
    pub fn as_key(&self) -> Option<&KeyMessage> {
        match self {
            Self::Key(key) => Some(key),
            Self::Motion(_) => None,
        }
    }

    /// Motion payload.
    pub fn as_motion(&self) -> Option<&MotionMessage> {
        match self {
            Self::Motion(motion) => Some(motion),
            Self::Key(_) => None,
        }
    }
}

/// Dispatcher side of a channel.
pub trait InputChannel: Send {
    /// Channel identity.
    fn id(&self) -> ChannelId;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Publish a message. Fails unless the channel was reset since the last one.
    fn publish(&mut self, message: &InputMessage) -> Result<(), TransportError>;

    /// Append a sample to the published motion.
    fn append_sample(&mut self, event_time: Nsecs, coords: &[PointerCoords]) -> Result<(), TransportError>;

    /// Tell the consumer a message is ready.
    fn send_ready(&mut self) -> Result<(), TransportError>;

    /// Read the consumer's finished signal; `Ok(handled)` on success.
    fn receive_finished(&mut self) -> Result<bool, TransportError>;

    /// Forget the current message so a new one may be published.
    fn reset(&mut self) -> Result<(), TransportError>;
}
