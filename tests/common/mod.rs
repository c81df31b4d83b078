//! Shared fixtures for dispatcher integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use lamco_input_dispatcher::clock::{millis, ManualClock, Nsecs};
use lamco_input_dispatcher::config::DispatcherConfig;
use lamco_input_dispatcher::event::{InputEvent, KeyEvent, PolicyFlag, PolicyFlags};
use lamco_input_dispatcher::looper::ChannelLooper;
use lamco_input_dispatcher::policy::{DispatcherPolicy, UserActivityKind};
use lamco_input_dispatcher::transport::memory::DEFAULT_SAMPLE_CAPACITY;
use lamco_input_dispatcher::transport::{ChannelId, InputMessage, MemoryChannel, MemoryChannelClient};
use lamco_input_dispatcher::window::{ApplicationInfo, Rect, WindowInfo};
use lamco_input_dispatcher::InputDispatcher;

/// Policy that passes everything and records what it was told.
#[derive(Debug)]
pub struct RecordingPolicy {
    pub anr_extension: AtomicI64,
    pub intercept_delay: AtomicI64,
    pub allow_injection: AtomicBool,
    pub anrs: Mutex<Vec<Option<String>>>,
    pub broken: Mutex<Vec<(ChannelId, String)>>,
    pub activity: Mutex<Vec<UserActivityKind>>,
    pub configuration_changes: Mutex<Vec<Nsecs>>,
    /// Original key code to the fallback key code the policy answers with
    pub fallbacks: Mutex<Vec<(i32, i32)>>,
    pub unhandled_keys: Mutex<Vec<KeyEvent>>,
    /// Filter answer; false consumes every event
    pub filter_passes: AtomicBool,
    pub filtered: Mutex<Vec<InputEvent>>,
    pub switches: Mutex<Vec<(Nsecs, i32, i32, PolicyFlags)>>,
}

impl Default for RecordingPolicy {
    fn default() -> Self {
        Self {
            anr_extension: AtomicI64::new(0),
            intercept_delay: AtomicI64::new(0),
            allow_injection: AtomicBool::new(true),
            anrs: Mutex::new(Vec::new()),
            broken: Mutex::new(Vec::new()),
            activity: Mutex::new(Vec::new()),
            configuration_changes: Mutex::new(Vec::new()),
            fallbacks: Mutex::new(Vec::new()),
            unhandled_keys: Mutex::new(Vec::new()),
            filter_passes: AtomicBool::new(true),
            filtered: Mutex::new(Vec::new()),
            switches: Mutex::new(Vec::new()),
        }
    }
}

impl DispatcherPolicy for RecordingPolicy {
    fn notify_configuration_changed(&self, when: Nsecs) {
        self.configuration_changes.lock().push(when);
    }

    fn notify_anr(&self, _application: Option<ApplicationInfo>, window: Option<Arc<WindowInfo>>) -> Nsecs {
        self.anrs.lock().push(window.map(|w| w.name.clone()));
        self.anr_extension.load(Ordering::SeqCst)
    }

    fn notify_input_channel_broken(&self, channel: ChannelId, name: &str) {
        self.broken.lock().push((channel, name.to_string()));
    }

    fn intercept_key_before_queueing(&self, _event: &KeyEvent, policy_flags: PolicyFlags) -> PolicyFlags {
        policy_flags | PolicyFlag::PassToUser
    }

    fn intercept_motion_before_queueing(&self, _when: Nsecs, policy_flags: PolicyFlags) -> PolicyFlags {
        policy_flags | PolicyFlag::PassToUser
    }

    fn intercept_key_before_dispatching(
        &self,
        _window: Option<Arc<WindowInfo>>,
        _event: &KeyEvent,
        _policy_flags: PolicyFlags,
    ) -> Nsecs {
        self.intercept_delay.load(Ordering::SeqCst)
    }

    fn dispatch_unhandled_key(
        &self,
        _window: Option<Arc<WindowInfo>>,
        event: &KeyEvent,
        _policy_flags: PolicyFlags,
    ) -> Option<KeyEvent> {
        self.unhandled_keys.lock().push(event.clone());
        let fallback = self
            .fallbacks
            .lock()
            .iter()
            .find(|(original, _)| *original == event.key_code)
            .map(|&(_, fallback)| fallback)?;
        Some(KeyEvent {
            key_code: fallback,
            ..event.clone()
        })
    }

    fn filter_input_event(&self, event: &InputEvent, _policy_flags: PolicyFlags) -> bool {
        self.filtered.lock().push(event.clone());
        self.filter_passes.load(Ordering::SeqCst)
    }

    fn notify_switch(&self, when: Nsecs, switch_code: i32, switch_value: i32, policy_flags: PolicyFlags) {
        self.switches.lock().push((when, switch_code, switch_value, policy_flags));
    }

    fn poke_user_activity(&self, _event_time: Nsecs, kind: UserActivityKind) {
        self.activity.lock().push(kind);
    }

    fn check_inject_events_permission(&self, _injector_pid: i32, _injector_uid: i32) -> bool {
        self.allow_injection.load(Ordering::SeqCst)
    }

    fn is_key_repeat_enabled(&self) -> bool {
        true
    }
}

/// Dispatcher on a manual clock with in-memory channels.
pub struct Harness {
    pub dispatcher: Arc<InputDispatcher>,
    pub clock: ManualClock,
    pub looper: Arc<ChannelLooper>,
    pub policy: Arc<RecordingPolicy>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(DispatcherConfig::default())
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        let clock = ManualClock::new(millis(1000));
        let looper = Arc::new(ChannelLooper::new());
        let policy = Arc::new(RecordingPolicy::default());
        let dispatcher = Arc::new(InputDispatcher::new(
            config,
            policy.clone(),
            looper.clone(),
            Arc::new(clock.clone()),
        ));
        Self {
            dispatcher,
            clock,
            looper,
            policy,
        }
    }

    /// Register a channel and return a window bound to it.
    pub fn window(&self, name: &str, frame: Rect) -> (WindowInfo, MemoryChannelClient) {
        let (channel, client) = MemoryChannel::pair(name, self.looper.handle(), DEFAULT_SAMPLE_CAPACITY);
        let id = client.id();
        self.dispatcher
            .register_channel(Box::new(channel), false)
            .expect("register channel");
        (WindowInfo::new(name, id, frame), client)
    }

    pub fn monitor(&self, name: &str) -> MemoryChannelClient {
        let (channel, client) = MemoryChannel::pair(name, self.looper.handle(), DEFAULT_SAMPLE_CAPACITY);
        self.dispatcher
            .register_channel(Box::new(channel), true)
            .expect("register monitor");
        client
    }

    pub fn now(&self) -> Nsecs {
        use lamco_input_dispatcher::clock::Clock;
        self.clock.now()
    }

    /// Run everything due now; returns the next wakeup.
    pub fn pump(&self) -> Nsecs {
        self.dispatcher.dispatch_pending()
    }

    /// Move the clock forward and run everything due.
    pub fn advance_ms(&self, ms: i64) -> Nsecs {
        self.clock.advance_ms(ms);
        self.pump()
    }
}

/// Receive a message and report it handled.
pub fn receive_and_finish(client: &mut MemoryChannelClient) -> Option<InputMessage> {
    let message = client.try_receive()?;
    client.finish(true).expect("finish");
    Some(message)
}

pub fn full_screen() -> Rect {
    Rect::new(0, 0, 480, 800)
}
