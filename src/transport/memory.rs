//! In-process channel pair
//!
//! [`MemoryChannel`] is the dispatcher end and [`MemoryChannelClient`] the
//! consumer end. Readiness on the dispatcher side is reported through a
//! [`LooperHandle`], the consumer blocks on a condition variable.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use super::{ChannelId, InputChannel, InputMessage, MessageSample, TransportError};
use crate::clock::Nsecs;
use crate::event::PointerCoords;
use crate::looper::{LooperHandle, Readiness};

/// Default number of motion samples a single message can hold.
pub const DEFAULT_SAMPLE_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct Shared {
    message: Option<InputMessage>,
    ready: bool,
    consumed: bool,
    acknowledged: bool,
    finished: VecDeque<bool>,
    client_closed: bool,
    server_closed: bool,
}

#[derive(Debug)]
struct Pipe {
    state: Mutex<Shared>,
    signal: Condvar,
    sample_capacity: usize,
}

/// Dispatcher end.
#[derive(Debug)]
pub struct MemoryChannel {
    id: ChannelId,
    name: String,
    pipe: Arc<Pipe>,
}

/// Consumer end.
#[derive(Debug)]
pub struct MemoryChannelClient {
    id: ChannelId,
    name: String,
    pipe: Arc<Pipe>,
    looper: LooperHandle,
    closed: bool,
}

impl MemoryChannel {
    /// Create a connected pair with a fresh [`ChannelId`].
    pub fn pair(
        name: impl Into<String>,
        looper: LooperHandle,
        sample_capacity: usize,
    ) -> (MemoryChannel, MemoryChannelClient) {
        let name = name.into();
        let id = ChannelId::next();
        let pipe = Arc::new(Pipe {
            state: Mutex::new(Shared::default()),
            signal: Condvar::new(),
            sample_capacity: sample_capacity.max(1),
        });
        (
            MemoryChannel {
                id,
                name: name.clone(),
                pipe: pipe.clone(),
            },
            MemoryChannelClient {
                id,
                name,
                pipe,
                looper,
                closed: false,
            },
        )
    }
}

impl InputChannel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&mut self, message: &InputMessage) -> Result<(), TransportError> {
        let mut state = self.pipe.state.lock();
        if state.client_closed {
            return Err(TransportError::Closed);
        }
        if state.message.is_some() {
            return Err(TransportError::Protocol("publish without reset".into()));
        }
        state.message = Some(message.clone());
        state.ready = false;
        state.consumed = false;
        state.acknowledged = false;
        Ok(())
    }

    fn append_sample(&mut self, event_time: Nsecs, coords: &[PointerCoords]) -> Result<(), TransportError> {
        let mut state = self.pipe.state.lock();
        if state.client_closed {
            return Err(TransportError::Closed);
        }
        if state.consumed {
            return Err(TransportError::Stale);
        }
        let capacity = self.pipe.sample_capacity;
        let Some(InputMessage::Motion(motion)) = state.message.as_mut() else {
            return Err(TransportError::Protocol("no motion published".into()));
        };
        if motion.samples.len() >= capacity {
            return Err(TransportError::Full);
        }
        motion.samples.push(MessageSample {
            event_time,
            coords: coords.to_vec(),
        });
        trace!("{}: appended sample, {} total", self.name, motion.samples.len());
        Ok(())
    }

    fn send_ready(&mut self) -> Result<(), TransportError> {
        let mut state = self.pipe.state.lock();
        if state.client_closed {
            return Err(TransportError::Closed);
        }
        if state.message.is_none() {
            return Err(TransportError::Protocol("nothing published".into()));
        }
        state.ready = true;
        self.pipe.signal.notify_all();
        Ok(())
    }

    fn receive_finished(&mut self) -> Result<bool, TransportError> {
        let mut state = self.pipe.state.lock();
        match state.finished.pop_front() {
            Some(handled) => Ok(handled),
            None if state.client_closed => Err(TransportError::Closed),
            None => Err(TransportError::WouldBlock),
        }
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        let mut state = self.pipe.state.lock();
        if state.client_closed {
            return Err(TransportError::Closed);
        }
        state.message = None;
        state.ready = false;
        state.consumed = false;
        state.acknowledged = false;
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        let mut state = self.pipe.state.lock();
        state.server_closed = true;
        self.pipe.signal.notify_all();
    }
}

impl MemoryChannelClient {
    /// Channel identity.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the ready message, if any.
    pub fn try_receive(&mut self) -> Option<InputMessage> {
        let mut state = self.pipe.state.lock();
        Self::take(&mut state)
    }

    /// Wait up to `timeout` for a ready message.
    pub fn receive_timeout(&mut self, timeout: Duration) -> Option<InputMessage> {
        let deadline = Instant::now() + timeout;
        let mut state = self.pipe.state.lock();
        loop {
            if let Some(message) = Self::take(&mut state) {
                return Some(message);
            }
            if state.server_closed {
                return None;
            }
            if self.pipe.signal.wait_until(&mut state, deadline).timed_out() {
                return Self::take(&mut state);
            }
        }
    }

    fn take(state: &mut Shared) -> Option<InputMessage> {
        if !state.ready || state.consumed {
            return None;
        }
        state.consumed = true;
        state.message.clone()
    }

    /// Report the taken message as finished.
    pub fn finish(&mut self, handled: bool) -> Result<(), TransportError> {
        {
            let mut state = self.pipe.state.lock();
            if state.server_closed {
                return Err(TransportError::Closed);
            }
            if !state.consumed || state.acknowledged {
                return Err(TransportError::Protocol("finish without receive".into()));
            }
            state.acknowledged = true;
            state.finished.push_back(handled);
        }
        self.looper.notify(self.id, Readiness::Input);
        Ok(())
    }

    /// True once the dispatcher end is gone.
    pub fn is_closed(&self) -> bool {
        self.pipe.state.lock().server_closed
    }

    /// Close the consumer end; the dispatcher sees a hangup.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pipe.state.lock().client_closed = true;
        self.looper.notify(self.id, Readiness::Hangup);
    }
}

impl Drop for MemoryChannelClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MotionAction, MotionFlags, PointerProperties, PolicyFlags, Source};
    use crate::looper::{ChannelLooper, Looper};
    use crate::transport::MotionMessage;

    fn motion() -> InputMessage {
        InputMessage::Motion(MotionMessage {
            device_id: 1,
            source: Source::TOUCHSCREEN,
            action: MotionAction::Move,
            flags: MotionFlags::empty(),
            edge_flags: 0,
            meta_state: 0,
            x_offset: 0.0,
            y_offset: 0.0,
            x_precision: 1.0,
            y_precision: 1.0,
            down_time: 0,
            policy_flags: PolicyFlags::empty(),
            pointer_properties: vec![PointerProperties::finger(0)],
            samples: vec![MessageSample {
                event_time: 0,
                coords: vec![PointerCoords::at(1.0, 1.0)],
            }],
        })
    }

    #[test]
    fn test_publish_requires_reset() {
        let looper = ChannelLooper::new();
        let (mut server, _client) = MemoryChannel::pair("w", looper.handle(), 4);
        server.publish(&motion()).expect("publish");
        assert!(matches!(server.publish(&motion()), Err(TransportError::Protocol(_))));
        server.reset().expect("reset");
        server.publish(&motion()).expect("publish after reset");
    }

    #[test]
    fn test_append_until_full_then_stale() {
        let looper = ChannelLooper::new();
        let (mut server, mut client) = MemoryChannel::pair("w", looper.handle(), 2);
        server.publish(&motion()).expect("publish");
        server.append_sample(1, &[PointerCoords::at(2.0, 2.0)]).expect("append");
        assert_eq!(
            server.append_sample(2, &[PointerCoords::at(3.0, 3.0)]),
            Err(TransportError::Full)
        );
        server.send_ready().expect("ready");
        let message = client.try_receive().expect("message");
        assert_eq!(message.as_motion().map(|m| m.samples.len()), Some(2));
        server.reset().expect("reset");
        server.publish(&motion()).expect("publish");
        server.send_ready().expect("ready");
        client.try_receive().expect("message");
        assert_eq!(
            server.append_sample(3, &[PointerCoords::at(3.0, 3.0)]),
            Err(TransportError::Stale)
        );
    }

    #[test]
    fn test_finish_signals_looper() {
        let looper = ChannelLooper::new();
        let (mut server, mut client) = MemoryChannel::pair("w", looper.handle(), 4);
        looper.add_channel(server.id());

        assert_eq!(server.receive_finished(), Err(TransportError::WouldBlock));
        server.publish(&motion()).expect("publish");
        server.send_ready().expect("ready");
        assert!(client.try_receive().is_some());
        assert!(client.try_receive().is_none());
        client.finish(true).expect("finish");

        let ready = looper.poll_once(Some(Duration::ZERO));
        assert_eq!(ready.len(), 1);
        assert_eq!(server.receive_finished(), Ok(true));
    }

    #[test]
    fn test_client_close_reports_hangup() {
        let looper = ChannelLooper::new();
        let (mut server, client) = MemoryChannel::pair("w", looper.handle(), 4);
        looper.add_channel(server.id());
        drop(client);
        let ready = looper.poll_once(Some(Duration::ZERO));
        assert!(ready[0].1.contains(Readiness::Hangup));
        assert_eq!(server.publish(&motion()), Err(TransportError::Closed));
    }
}
