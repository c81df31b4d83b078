//! Connections and dispatch entries
//!
//! A [`Connection`] is the dispatcher-side end of one registered channel:
//! its outbound queue of [`DispatchEntry`] records, the consistency tracker
//! for what the consumer has seen, and a status that only ever moves from
//! normal to broken to zombie.

use std::collections::VecDeque;
use std::fmt;

use super::input_state::InputState;
use super::pool::EventId;
use super::target::{TargetFlag, TargetFlags};
use crate::clock::Nsecs;
use crate::event::{KeyAction, KeyFlags, MotionAction, MotionFlags};
use crate::transport::{ChannelId, InputChannel};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Deliveries proceed
    Normal,
    /// A transport error occurred; deliveries are skipped
    Broken,
    /// Unregistered; kept only until the last reference is gone
    Zombie,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Normal => "NORMAL",
            Self::Broken => "BROKEN",
            Self::Zombie => "ZOMBIE",
        };
        f.write_str(label)
    }
}

/// Action and flags a target actually receives, after dispatch-mode rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolvedAction {
    Key { action: KeyAction, flags: KeyFlags },
    Motion { action: MotionAction, flags: MotionFlags },
}

/// One event queued for delivery on one connection.
#[derive(Debug, Clone)]
pub(crate) struct DispatchEntry {
    pub(crate) event: EventId,
    pub(crate) target_flags: TargetFlags,
    pub(crate) x_offset: f32,
    pub(crate) y_offset: f32,
    /// Published and waiting for the finished signal
    pub(crate) in_progress: bool,
    pub(crate) resolved: ResolvedAction,
    /// First sample to publish
    pub(crate) head_sample: usize,
    /// First sample that did not fit; publish it in a follow-up cycle
    pub(crate) tail_sample: Option<usize>,
}

impl DispatchEntry {
    pub(crate) fn has_foreground_target(&self) -> bool {
        self.target_flags.contains(TargetFlag::Foreground)
    }

    pub(crate) fn is_split(&self) -> bool {
        self.target_flags.contains(TargetFlag::Split)
    }
}

/// Dispatcher-side state of a registered channel.
pub(crate) struct Connection {
    pub(crate) channel: Box<dyn InputChannel>,
    pub(crate) is_monitor: bool,
    pub(crate) status: ConnectionStatus,
    pub(crate) input_state: InputState,
    pub(crate) outbound_queue: VecDeque<DispatchEntry>,
    /// Event time of the last published event
    pub(crate) last_event_time: Nsecs,
    /// When the last event was published
    pub(crate) last_dispatch_time: Nsecs,
}

impl Connection {
    pub(crate) fn new(channel: Box<dyn InputChannel>, is_monitor: bool) -> Self {
        Self {
            channel,
            is_monitor,
            status: ConnectionStatus::Normal,
            input_state: InputState::new(),
            outbound_queue: VecDeque::new(),
            last_event_time: i64::MAX,
            last_dispatch_time: i64::MAX,
        }
    }

    /// Channel identity.
    pub(crate) fn id(&self) -> ChannelId {
        self.channel.id()
    }

    /// Channel name.
    pub(crate) fn name(&self) -> &str {
        self.channel.name()
    }

    /// Current status.
    pub(crate) fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub(crate) fn is_normal(&self) -> bool {
        self.status == ConnectionStatus::Normal
    }

    /// Entry being delivered, if the head has been published.
    pub(crate) fn in_progress_head(&self) -> Option<&DispatchEntry> {
        self.outbound_queue.front().filter(|entry| entry.in_progress)
    }

    /// Last queued entry for `event`, searching from the tail.
    pub(crate) fn find_queued_entry(&self, event: EventId) -> Option<usize> {
        self.outbound_queue.iter().rposition(|entry| entry.event == event)
    }

    /// Age of the in-flight event, for diagnostics.
    pub(crate) fn event_latency(&self, now: Nsecs) -> Nsecs {
        if self.last_event_time == i64::MAX {
            0
        } else {
            now - self.last_event_time
        }
    }

    /// Time since the in-flight event was published, for diagnostics.
    pub(crate) fn dispatch_latency(&self, now: Nsecs) -> Nsecs {
        if self.last_dispatch_time == i64::MAX {
            0
        } else {
            now - self.last_dispatch_time
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("channel", &self.channel.id())
            .field("name", &self.channel.name())
            .field("is_monitor", &self.is_monitor)
            .field("status", &self.status)
            .field("outbound", &self.outbound_queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::looper::ChannelLooper;
    use crate::transport::MemoryChannel;
    use slotmap::KeyData;

    fn entry(event: EventId, in_progress: bool) -> DispatchEntry {
        DispatchEntry {
            event,
            target_flags: TargetFlag::Foreground | TargetFlag::DispatchAsIs,
            x_offset: 0.0,
            y_offset: 0.0,
            in_progress,
            resolved: ResolvedAction::Motion {
                action: MotionAction::Move,
                flags: MotionFlags::empty(),
            },
            head_sample: 0,
            tail_sample: None,
        }
    }

    #[test]
    fn test_connection_queue_lookup() {
        let looper = ChannelLooper::new();
        let (server, _client) = MemoryChannel::pair("w", looper.handle(), 4);
        let mut connection = Connection::new(Box::new(server), false);
        assert!(connection.is_normal());
        assert!(connection.in_progress_head().is_none());

        let a = EventId::from(KeyData::from_ffi(1));
        let b = EventId::from(KeyData::from_ffi(2));
        connection.outbound_queue.push_back(entry(a, true));
        connection.outbound_queue.push_back(entry(b, false));
        connection.outbound_queue.push_back(entry(a, false));

        assert_eq!(connection.find_queued_entry(a), Some(2));
        assert_eq!(connection.find_queued_entry(b), Some(1));
        assert!(connection.in_progress_head().is_some_and(|e| e.has_foreground_target()));
        assert_eq!(connection.event_latency(10), 0);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::Broken.to_string(), "BROKEN");
    }
}
