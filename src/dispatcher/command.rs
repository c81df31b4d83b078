//! Post-unlock command queue
//!
//! Locked passes never call out to the policy directly. They post a
//! [`Command`] instead; the queue is drained right after the pass with the
//! dispatcher lock temporarily released around each policy call, so the
//! policy may re-enter the dispatcher.
//!
//! A finished key the consumer did not handle is offered back to the policy
//! here, which may answer with a fallback key to deliver in its place.

use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::{debug, trace};

use super::connection::ResolvedAction;
use super::input_state::{CancelationMode, CancelationOptions};
use super::pool::EventId;
use super::state::DispatcherState;
use crate::clock::{as_millis_f64, Nsecs};
use crate::event::{keycode, InterceptKeyResult, KeyAction, KeyFlag};
use crate::policy::UserActivityKind;
use crate::transport::ChannelId;
use crate::window::{ApplicationInfo, WindowInfo};

/// Deferred work posted by a locked pass.
#[derive(Debug, Clone)]
pub(crate) enum Command {
    NotifyConfigurationChanged {
        event_time: Nsecs,
    },
    NotifyInputChannelBroken {
        channel: ChannelId,
        name: String,
    },
    NotifyAnr {
        application: Option<ApplicationInfo>,
        window: Option<Arc<WindowInfo>>,
    },
    /// Holds one reference on `event`, released when the command has run
    InterceptKeyBeforeDispatching {
        event: EventId,
        window: Option<Arc<WindowInfo>>,
    },
    PokeUserActivity {
        event_time: Nsecs,
        kind: UserActivityKind,
    },
    DispatchCycleFinished {
        channel: ChannelId,
        handled: bool,
    },
}

/// Run queued commands until none are left. Returns true if any ran.
pub(crate) fn run_commands(state: &mut MutexGuard<'_, DispatcherState>) -> bool {
    let mut ran = false;
    while let Some(command) = state.commands.pop_front() {
        ran = true;
        run_command(state, command);
    }
    ran
}

fn run_command(state: &mut MutexGuard<'_, DispatcherState>, command: Command) {
    let policy = state.policy.clone();
    match command {
        Command::NotifyConfigurationChanged { event_time } => {
            MutexGuard::unlocked(state, || policy.notify_configuration_changed(event_time));
        }

        Command::NotifyInputChannelBroken { channel, name } => {
            MutexGuard::unlocked(state, || policy.notify_input_channel_broken(channel, &name));
        }

        Command::NotifyAnr { application, window } => {
            let channel = window.as_ref().and_then(|w| w.channel);
            let new_timeout = MutexGuard::unlocked(state, || policy.notify_anr(application, window));
            debug!("ANR response: new timeout {:.1}ms", as_millis_f64(new_timeout));
            state.resume_after_targets_not_ready_timeout(new_timeout, channel);
        }

        Command::InterceptKeyBeforeDispatching { event, window } => {
            let snapshot = state.pool.get(event).and_then(|entry| {
                entry
                    .key()
                    .map(|key| (key.to_event(entry.event_time), entry.policy_flags))
            });
            if let Some((key_event, policy_flags)) = snapshot {
                let delay = MutexGuard::unlocked(state, || {
                    policy.intercept_key_before_dispatching(window, &key_event, policy_flags)
                });
                let now = state.now();
                if let Some(key) = state.pool.get_mut(event).and_then(|entry| entry.key_mut()) {
                    if delay < 0 {
                        key.intercept_result = InterceptKeyResult::Skip;
                    } else if delay == 0 {
                        key.intercept_result = InterceptKeyResult::Continue;
                    } else {
                        key.intercept_result = InterceptKeyResult::TryAgainLater;
                        key.intercept_wakeup_time = now.saturating_add(delay);
                    }
                    trace!("Key intercepted: {:?}", key.intercept_result);
                }
            }
            state.release_event(event);
        }

        Command::PokeUserActivity { event_time, kind } => {
            MutexGuard::unlocked(state, || policy.poke_user_activity(event_time, kind));
        }

        Command::DispatchCycleFinished { channel, handled } => {
            trace!("Channel {} finished (handled: {})", channel, handled);
            if !state.connections.contains_key(&channel) || after_key_event(state, channel, handled) {
                return;
            }
            let now = state.now();
            state.start_next_dispatch_cycle(now, channel);
        }
    }
}

/// Unhandled key processing for the head that just finished on `channel`.
///
/// A fallback code is latched on the initial DOWN and holds until the UP.
/// Returns true if the head went out again as its fallback key, or the
/// connection broke while the policy was asked; the next cycle must not
/// start in either case.
fn after_key_event(state: &mut MutexGuard<'_, DispatcherState>, channel: ChannelId, handled: bool) -> bool {
    let Some((event, foreground)) = state
        .connections
        .get(&channel)
        .and_then(|connection| connection.in_progress_head())
        .map(|head| (head.event, head.has_foreground_target()))
    else {
        return false;
    };
    let Some((key, event_time, policy_flags)) = state
        .pool
        .get(event)
        .and_then(|entry| entry.key().map(|key| (key.clone(), entry.event_time, entry.policy_flags)))
    else {
        return false;
    };
    if key.flags.contains(KeyFlag::Fallback) {
        return false;
    }

    let original = key.key_code;
    let Some(connection) = state.connections.get_mut(&channel) else {
        return false;
    };
    let latched = connection.input_state.fallback_key(original);
    if key.action == KeyAction::Up {
        connection.input_state.remove_fallback_key(original);
    }

    if handled || !foreground {
        if let Some(code) = latched {
            if code != keycode::UNKNOWN {
                let options = CancelationOptions::new(
                    CancelationMode::Fallback,
                    "original key was handled or left the foreground, canceling its fallback",
                )
                .for_key_code(code);
                state.synthesize_cancelation_events_for_channel(channel, &options);
            }
            if let Some(connection) = state.connections.get_mut(&channel) {
                connection.input_state.remove_fallback_key(original);
            }
        }
        return false;
    }

    let initial_down = key.action == KeyAction::Down && key.repeat_count == 0;
    if latched.is_none() && !initial_down {
        trace!("Unhandled key {} is not an initial down, no fallback", original);
        return false;
    }

    debug!(
        "Unhandled key: asking policy for a fallback (key_code={} action={:?} repeat={})",
        original, key.action, key.repeat_count
    );
    let window = state.window_for_channel(channel);
    let key_event = key.to_event(event_time);
    let policy = state.policy.clone();
    let mut reply = MutexGuard::unlocked(state, || policy.dispatch_unhandled_key(window, &key_event, policy_flags));

    let Some(connection) = state.connections.get_mut(&channel) else {
        return true;
    };
    if !connection.is_normal() {
        connection.input_state.remove_fallback_key(original);
        return true;
    }

    let mut fallback_code = latched.unwrap_or(keycode::UNKNOWN);
    if initial_down {
        fallback_code = reply.as_ref().map_or(keycode::UNKNOWN, |event| event.key_code);
        connection.input_state.set_fallback_key(original, fallback_code);
    }

    if fallback_code != keycode::UNKNOWN && !reply.as_ref().is_some_and(|event| event.key_code == fallback_code) {
        debug!(
            "Policy no longer wants fallback {} for key {}, canceling it",
            fallback_code, original
        );
        let options = CancelationOptions::new(CancelationMode::Fallback, "policy no longer desires the fallback key")
            .for_key_code(fallback_code);
        state.synthesize_cancelation_events_for_channel(channel, &options);
        reply = None;
        fallback_code = keycode::UNKNOWN;
        if key.action != KeyAction::Up {
            if let Some(connection) = state.connections.get_mut(&channel) {
                connection.input_state.set_fallback_key(original, fallback_code);
            }
        }
    }

    let Some(fallback) = reply.filter(|_| fallback_code != keycode::UNKNOWN) else {
        trace!("No fallback for unhandled key {}", original);
        return false;
    };

    debug!(
        "Dispatching fallback key {} for unhandled key {} (meta=0x{:x})",
        fallback_code, original, fallback.meta_state
    );
    let Some(entry) = state.pool.get_mut(event) else {
        return false;
    };
    entry.event_time = fallback.event_time;
    let Some(rewritten) = entry.key_mut() else {
        return false;
    };
    rewritten.device_id = fallback.device_id;
    rewritten.source = fallback.source;
    rewritten.flags = fallback.flags | KeyFlag::Fallback;
    rewritten.key_code = fallback_code;
    rewritten.scan_code = fallback.scan_code;
    rewritten.meta_state = fallback.meta_state;
    rewritten.repeat_count = fallback.repeat_count;
    rewritten.down_time = fallback.down_time;
    rewritten.synthetic_repeat = false;
    let rewritten = rewritten.clone();

    let Some(connection) = state.connections.get_mut(&channel) else {
        return true;
    };
    connection.input_state.track_key(&rewritten, rewritten.action, rewritten.flags);
    if let Some(head) = connection.outbound_queue.front_mut() {
        head.in_progress = false;
        head.resolved = ResolvedAction::Key {
            action: rewritten.action,
            flags: rewritten.flags,
        };
    }
    let now = state.now();
    state.start_dispatch_cycle(now, channel);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DispatcherConfig;
    use crate::dispatcher::state::InjectionSignals;
    use crate::event::{EventEntry, KeyAction, KeyFlags, NotifyKeyArgs, PolicyFlag, PolicyFlags};
    use crate::policy::MockDispatcherPolicy;
    use parking_lot::Mutex;

    fn state_with(policy: MockDispatcherPolicy, clock: Arc<ManualClock>) -> Mutex<DispatcherState> {
        Mutex::new(DispatcherState::new(
            DispatcherConfig::default(),
            Arc::new(policy),
            clock,
            Arc::new(InjectionSignals::default()),
        ))
    }

    #[test]
    fn test_intercept_delay_maps_to_try_again_later() {
        let mut policy = MockDispatcherPolicy::new();
        policy
            .expect_intercept_key_before_dispatching()
            .times(1)
            .returning(|_, _, _| 7_000_000);
        let clock = Arc::new(ManualClock::new(1_000));
        let state = state_with(policy, clock);
        let mut guard = state.lock();

        let args = NotifyKeyArgs::new(0, 1, KeyAction::Down, 29);
        let id = guard.pool.insert(EventEntry::from_key_args(
            &args,
            PolicyFlag::PassToUser.into(),
            KeyFlags::empty(),
            0,
        ));
        guard.pool.retain(id);
        guard.post_command(Command::InterceptKeyBeforeDispatching { event: id, window: None });

        assert!(run_commands(&mut guard));
        let key = guard.pool.get(id).and_then(|e| e.key()).cloned().expect("key");
        assert_eq!(key.intercept_result, InterceptKeyResult::TryAgainLater);
        assert_eq!(key.intercept_wakeup_time, 7_001_000);
        assert_eq!(guard.pool.ref_count(id), 1);
    }

    #[test]
    fn test_negative_intercept_skips() {
        let mut policy = MockDispatcherPolicy::new();
        policy.expect_intercept_key_before_dispatching().returning(|_, _, _| -1);
        let state = state_with(policy, Arc::new(ManualClock::new(0)));
        let mut guard = state.lock();

        let args = NotifyKeyArgs::new(0, 1, KeyAction::Down, 29);
        let id = guard
            .pool
            .insert(EventEntry::from_key_args(&args, PolicyFlags::empty(), KeyFlags::empty(), 0));
        guard.pool.retain(id);
        guard.post_command(Command::InterceptKeyBeforeDispatching { event: id, window: None });
        run_commands(&mut guard);

        let result = guard.pool.get(id).and_then(|e| e.key()).map(|k| k.intercept_result);
        assert_eq!(result, Some(InterceptKeyResult::Skip));
    }

    #[test]
    fn test_empty_queue_runs_nothing() {
        let state = state_with(MockDispatcherPolicy::new(), Arc::new(ManualClock::new(0)));
        let mut guard = state.lock();
        assert!(!run_commands(&mut guard));
    }

    #[test]
    fn test_user_activity_reaches_policy() {
        let mut policy = MockDispatcherPolicy::new();
        policy
            .expect_poke_user_activity()
            .withf(|t, kind| *t == 42 && *kind == UserActivityKind::Button)
            .times(1)
            .return_const(());
        let state = state_with(policy, Arc::new(ManualClock::new(0)));
        let mut guard = state.lock();
        guard.post_command(Command::PokeUserActivity {
            event_time: 42,
            kind: UserActivityKind::Button,
        });
        assert!(run_commands(&mut guard));
    }
}
