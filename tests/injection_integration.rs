mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{full_screen, Harness, RecordingPolicy};
use lamco_input_dispatcher::clock::{Clock, MonotonicClock, Nsecs};
use lamco_input_dispatcher::config::DispatcherConfig;
use lamco_input_dispatcher::event::{
    keycode, InjectionResult, InputEvent, KeyAction, KeyEvent, KeyFlags, MotionAction, MotionEvent, PointerProperties,
    PolicyFlag, Source, SyncMode,
};
use lamco_input_dispatcher::looper::ChannelLooper;
use lamco_input_dispatcher::transport::memory::DEFAULT_SAMPLE_CAPACITY;
use lamco_input_dispatcher::transport::MemoryChannel;
use lamco_input_dispatcher::window::WindowInfo;
use lamco_input_dispatcher::{InputDispatcher, InputDispatcherThread};

fn key(action: KeyAction, now: Nsecs) -> InputEvent {
    InputEvent::Key(KeyEvent {
        device_id: 3,
        source: Source::KEYBOARD,
        action,
        flags: KeyFlags::empty(),
        key_code: keycode::A,
        scan_code: 0,
        meta_state: 0,
        repeat_count: 0,
        down_time: now,
        event_time: now,
    })
}

#[test]
fn test_sync_injection_waits_for_consumer() {
    let clock = Arc::new(MonotonicClock::new());
    let looper = Arc::new(ChannelLooper::new());
    let policy = Arc::new(RecordingPolicy::default());
    let dispatcher = Arc::new(InputDispatcher::new(
        DispatcherConfig {
            key_repeat_enabled: false,
            ..DispatcherConfig::default()
        },
        policy,
        looper.clone(),
        clock.clone(),
    ));

    let (channel, mut client) = MemoryChannel::pair("target", looper.handle(), DEFAULT_SAMPLE_CAPACITY);
    let window = WindowInfo::new("target", client.id(), full_screen()).focused();
    dispatcher.register_channel(Box::new(channel), false).unwrap();
    dispatcher.set_input_windows(vec![window]);

    let _thread = InputDispatcherThread::start(dispatcher.clone()).unwrap();
    let consumer = std::thread::spawn(move || {
        let message = client.receive_timeout(Duration::from_secs(5));
        if message.is_some() {
            client.finish(true).unwrap();
        }
        message
    });

    let result = dispatcher.inject_event(&key(KeyAction::Down, clock.now()), 42, 0, SyncMode::WaitForFinished, 5000);
    assert_eq!(result, InjectionResult::Succeeded);

    let message = consumer.join().unwrap().expect("consumer saw the event");
    let delivered = message.as_key().unwrap();
    assert!(delivered.policy_flags.contains(PolicyFlag::Injected));
    assert!(delivered.policy_flags.contains(PolicyFlag::Trusted));
}

#[test]
fn test_injection_without_focus_fails() {
    let h = Harness::new();
    let _thread = InputDispatcherThread::start(h.dispatcher.clone()).unwrap();

    let result = h
        .dispatcher
        .inject_event(&key(KeyAction::Down, h.now()), 42, 0, SyncMode::WaitForResult, 2000);
    assert_eq!(result, InjectionResult::Failed);
}

#[test]
fn test_injection_into_foreign_window_denied() {
    let h = Harness::new();
    h.policy.allow_injection.store(false, Ordering::SeqCst);
    let (window, _client) = h.window("banking", full_screen());
    h.dispatcher
        .set_input_windows(vec![window.focused().with_owner(100, 1000)]);
    let _thread = InputDispatcherThread::start(h.dispatcher.clone()).unwrap();

    let result = h
        .dispatcher
        .inject_event(&key(KeyAction::Down, h.now()), 7, 2000, SyncMode::WaitForResult, 2000);
    assert_eq!(result, InjectionResult::PermissionDenied);
}

#[test]
fn test_injection_into_own_window_allowed() {
    let h = Harness::new();
    h.policy.allow_injection.store(false, Ordering::SeqCst);
    let (window, _client) = h.window("notes", full_screen());
    h.dispatcher
        .set_input_windows(vec![window.focused().with_owner(100, 1000)]);
    let _thread = InputDispatcherThread::start(h.dispatcher.clone()).unwrap();

    let result = h
        .dispatcher
        .inject_event(&key(KeyAction::Down, h.now()), 100, 1000, SyncMode::WaitForResult, 2000);
    assert_eq!(result, InjectionResult::Succeeded);
}

#[test]
fn test_async_injection_returns_immediately() {
    let h = Harness::new();
    let result = h
        .dispatcher
        .inject_event(&key(KeyAction::Down, h.now()), 1, 0, SyncMode::None, 0);
    assert_eq!(result, InjectionResult::Succeeded);
    assert_eq!(h.dispatcher.stats().events_received, 1);
}

#[test]
fn test_malformed_injection_fails_without_queueing() {
    let h = Harness::new();

    let multiple = h
        .dispatcher
        .inject_event(&key(KeyAction::Multiple, h.now()), 1, 0, SyncMode::None, 0);
    assert_eq!(multiple, InjectionResult::Failed);

    let empty_motion = InputEvent::Motion(MotionEvent {
        device_id: 1,
        source: Source::TOUCHSCREEN,
        action: MotionAction::Down,
        flags: Default::default(),
        meta_state: 0,
        edge_flags: 0,
        x_precision: 1.0,
        y_precision: 1.0,
        down_time: h.now(),
        pointer_properties: vec![PointerProperties::finger(0)],
        samples: Vec::new(),
    });
    let result = h.dispatcher.inject_event(&empty_motion, 1, 0, SyncMode::None, 0);
    assert_eq!(result, InjectionResult::Failed);

    assert_eq!(h.dispatcher.stats().events_received, 0);
}
