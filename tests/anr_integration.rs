mod common;

use std::sync::atomic::Ordering;

use common::{full_screen, receive_and_finish, Harness};
use lamco_input_dispatcher::clock::millis;
use lamco_input_dispatcher::config::DispatcherConfig;
use lamco_input_dispatcher::event::{keycode, KeyAction, KeyFlag, MotionAction, NotifyKeyArgs, NotifyMotionArgs};
use lamco_input_dispatcher::transport::MemoryChannelClient;
use lamco_input_dispatcher::window::{ApplicationInfo, Rect, WindowFlag};

fn without_repeat() -> Harness {
    Harness::with_config(DispatcherConfig {
        key_repeat_enabled: false,
        ..DispatcherConfig::default()
    })
}

/// Deliver a DOWN the consumer never finishes, then queue the UP behind it.
fn stall_on_key(h: &Harness, client: &mut MemoryChannelClient) -> i64 {
    let down_time = h.now();
    h.dispatcher
        .notify_key(&NotifyKeyArgs::new(down_time, 1, KeyAction::Down, keycode::A))
        .unwrap();
    h.pump();
    assert!(client.try_receive().is_some());

    h.clock.advance_ms(10);
    let up = NotifyKeyArgs {
        down_time,
        ..NotifyKeyArgs::new(h.now(), 1, KeyAction::Up, keycode::A)
    };
    h.dispatcher.notify_key(&up).unwrap();
    h.pump()
}

#[test]
fn test_unresponsive_window_gets_anr_and_cancel() {
    let h = without_repeat();
    let (window, mut client) = h.window("slow", full_screen());
    h.dispatcher.set_input_windows(vec![window.focused().with_timeout_ms(500)]);

    let wakeup = stall_on_key(&h, &mut client);
    assert_eq!(wakeup, h.now() + millis(500));
    assert!(h.policy.anrs.lock().is_empty());

    h.clock.set(wakeup);
    h.pump();
    assert_eq!(*h.policy.anrs.lock(), vec![Some("slow".to_string())]);
    assert_eq!(h.dispatcher.stats().anrs, 1);

    // The consumer wakes up: it sees a cancel instead of the real UP.
    client.finish(true).unwrap();
    h.pump();
    let cancel = receive_and_finish(&mut client).expect("cancel after giving up");
    let key = cancel.as_key().unwrap();
    assert_eq!(key.action, KeyAction::Up);
    assert!(key.flags.contains(KeyFlag::Canceled));

    h.pump();
    assert!(client.try_receive().is_none());
}

#[test]
fn test_anr_extension_keeps_waiting() {
    let h = without_repeat();
    h.policy.anr_extension.store(millis(1000), Ordering::SeqCst);
    let (window, mut client) = h.window("slow", full_screen());
    h.dispatcher.set_input_windows(vec![window.focused().with_timeout_ms(500)]);

    let wakeup = stall_on_key(&h, &mut client);
    h.clock.set(wakeup);
    let extended = h.pump();
    assert_eq!(h.policy.anrs.lock().len(), 1);
    assert_eq!(extended, h.now() + millis(1000));

    client.finish(true).unwrap();
    h.pump();
    let up = receive_and_finish(&mut client).expect("real key up");
    let key = up.as_key().unwrap();
    assert_eq!(key.action, KeyAction::Up);
    assert!(!key.flags.contains(KeyFlag::Canceled));
    h.pump();
    assert_eq!(h.policy.anrs.lock().len(), 1);
}

#[test]
fn test_application_timeout_used_when_window_has_none() {
    let h = without_repeat();
    let (window, mut client) = h.window("slow", full_screen());
    let app = ApplicationInfo::new("mail").with_timeout_ms(2000);
    h.dispatcher.set_focused_application(Some(app.clone()));
    h.dispatcher.set_input_windows(vec![window.focused().with_application(app)]);

    let wakeup = stall_on_key(&h, &mut client);
    assert_eq!(wakeup, h.now() + millis(2000));
}

#[test]
fn test_touch_on_other_application_unblocks_queue() {
    let h = without_repeat();
    let (slow, mut slow_client) = h.window("slow", Rect::new(0, 0, 240, 800));
    let (other, mut other_client) = h.window("other", Rect::new(240, 0, 480, 800));
    h.dispatcher.set_input_windows(vec![
        slow.focused()
            .with_flags(WindowFlag::NotTouchModal)
            .with_application(ApplicationInfo::new("stuck")),
        other
            .with_flags(WindowFlag::NotTouchModal)
            .with_application(ApplicationInfo::new("fresh")),
    ]);

    stall_on_key(&h, &mut slow_client);

    h.clock.advance_ms(50);
    let now = h.now();
    let touch = NotifyMotionArgs::touch(now, 2, MotionAction::Down, now, &[(0, 300.0, 100.0)]);
    h.dispatcher.notify_motion(&touch).unwrap();
    h.pump();

    let delivered = receive_and_finish(&mut other_client).expect("touch reaches the responsive app");
    assert_eq!(delivered.as_motion().unwrap().action, MotionAction::Down);
    assert_eq!(h.dispatcher.stats().dropped_blocked, 1);
    assert!(h.policy.anrs.lock().is_empty());
}
