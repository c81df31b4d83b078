//! Event loop seam
//!
//! The dispatcher thread sleeps in [`Looper::poll_once`] until a channel
//! signals readiness, someone calls [`Looper::wake`], or the next deadline
//! expires. [`ChannelLooper`] is the in-process implementation backed by a
//! crossbeam channel; transports signal it through a [`LooperHandle`].

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use enumflags2::{bitflags, BitFlags};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use tracing::trace;

use crate::transport::ChannelId;

/// Readiness reported for a channel.
#[bitflags]
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// A finished signal can be read
    Input = 0x1,
    /// Peer reported an error
    Error = 0x4,
    /// Peer went away
    Hangup = 0x8,
}

/// Set of [`Readiness`] bits.
pub type ReadinessFlags = BitFlags<Readiness>;

/// Poller used by the dispatcher thread.
pub trait Looper: Send + Sync {
    /// Start reporting readiness for `channel`.
    fn add_channel(&self, channel: ChannelId);

    /// Stop reporting readiness for `channel`.
    fn remove_channel(&self, channel: ChannelId);

    /// Interrupt a blocked [`Looper::poll_once`].
    fn wake(&self);

    /// Wait up to `timeout` (forever when `None`) and return the channels
    /// that became ready, in signal order.
    fn poll_once(&self, timeout: Option<Duration>) -> Vec<(ChannelId, ReadinessFlags)>;
}

#[derive(Debug, Clone, Copy)]
enum LooperEvent {
    Wake,
    Ready(ChannelId, ReadinessFlags),
}

/// Signalling side of a [`ChannelLooper`], cloned into transports.
#[derive(Debug, Clone)]
pub struct LooperHandle {
    tx: Sender<LooperEvent>,
}

impl LooperHandle {
    /// Report readiness for a channel.
    pub fn notify(&self, channel: ChannelId, readiness: impl Into<ReadinessFlags>) {
        // The receiver lives as long as the looper; a send error means it is gone.
        let _ = self.tx.send(LooperEvent::Ready(channel, readiness.into()));
    }

    /// Wake the poller without readiness.
    pub fn wake(&self) {
        let _ = self.tx.send(LooperEvent::Wake);
    }
}

/// In-process looper.
#[derive(Debug)]
pub struct ChannelLooper {
    tx: Sender<LooperEvent>,
    rx: Receiver<LooperEvent>,
    registered: Mutex<HashSet<ChannelId>>,
}

impl ChannelLooper {
    /// New looper with no channels.
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            registered: Mutex::new(HashSet::new()),
        }
    }

    /// Handle for transports to signal readiness.
    pub fn handle(&self) -> LooperHandle {
        LooperHandle { tx: self.tx.clone() }
    }

    fn accept(&self, event: LooperEvent, out: &mut Vec<(ChannelId, ReadinessFlags)>) {
        match event {
            LooperEvent::Wake => trace!("Looper woken"),
            LooperEvent::Ready(channel, readiness) => {
                if self.registered.lock().contains(&channel) {
                    out.push((channel, readiness));
                } else {
                    trace!("Dropping readiness for unregistered channel {}", channel);
                }
            }
        }
    }
}

impl Default for ChannelLooper {
    fn default() -> Self {
        Self::new()
    }
}

impl Looper for ChannelLooper {
    fn add_channel(&self, channel: ChannelId) {
        self.registered.lock().insert(channel);
    }

    fn remove_channel(&self, channel: ChannelId) {
        self.registered.lock().remove(&channel);
    }

    fn wake(&self) {
        let _ = self.tx.send(LooperEvent::Wake);
    }

    fn poll_once(&self, timeout: Option<Duration>) -> Vec<(ChannelId, ReadinessFlags)> {
        let mut ready = Vec::new();

        let first = match timeout {
            None => self.rx.recv().ok(),
            Some(t) if t.is_zero() => match self.rx.try_recv() {
                Ok(event) => Some(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
            },
            Some(t) => match self.rx.recv_timeout(t) {
                Ok(event) => Some(event),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            },
        };

        if let Some(event) = first {
            self.accept(event, &mut ready);
            while let Ok(event) = self.rx.try_recv() {
                self.accept(event, &mut ready);
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_filters_unregistered_channels() {
        let looper = ChannelLooper::new();
        let handle = looper.handle();
        let a = ChannelId::from_raw(1);
        let b = ChannelId::from_raw(2);
        looper.add_channel(a);

        handle.notify(a, Readiness::Input);
        handle.notify(b, Readiness::Input);
        let ready = looper.poll_once(Some(Duration::ZERO));
        assert_eq!(ready, vec![(a, ReadinessFlags::from(Readiness::Input))]);
    }

    #[test]
    fn test_poll_times_out_without_events() {
        let looper = ChannelLooper::new();
        assert!(looper.poll_once(Some(Duration::from_millis(1))).is_empty());
    }

    #[test]
    fn test_wake_interrupts_blocking_poll() {
        let looper = std::sync::Arc::new(ChannelLooper::new());
        let waker = looper.clone();
        let t = std::thread::spawn(move || waker.wake());
        assert!(looper.poll_once(None).is_empty());
        t.join().expect("join");
    }
}
