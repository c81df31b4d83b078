//! Input Dispatcher
//!
//! The dispatcher takes key and motion events from producers (and from
//! injectors), decides which windows should receive them, and delivers them
//! through per-window input channels while keeping every consumer's view of
//! which keys and pointers are down consistent.
//!
//! # Architecture
//!
//! ```text
//! producers ──notify_*──┐                ┌── Connection ── InputChannel ── consumer
//! injectors ──inject────┤                │        ▲                           │
//!                       ▼                │        │ finished                  │
//!                 inbound queue ─► dispatch loop ─┤◄───────── Looper ◄────────┘
//!                       │          (state machine)│
//!                       │                ▼        └── Connection ── ...
//!                  batching        target resolution
//!                                  (focus / touch)
//! ```
//!
//! All state lives in one [`DispatcherState`] behind a single mutex. A pass
//! of the state machine runs entirely under the lock; anything that calls
//! out to the policy is posted as a command and run with the lock released.
//!
//! # Threading
//!
//! One thread drives [`InputDispatcher::dispatch_once`], usually through
//! [`InputDispatcherThread`]. Producers and injectors call in from their own
//! threads; injectors block on condition variables paired with the
//! dispatcher mutex until their ticket resolves.

pub mod error;
pub mod input_state;
pub mod pool;
pub mod stats;
pub mod target;
pub mod thread;
pub mod touch;

mod anr;
mod command;
mod connection;
mod delivery;
mod dispatch;
mod dump;
mod inbound;
mod state;

pub use connection::ConnectionStatus;
pub use dispatch::DropReason;
pub use error::{classify_error, recovery_action, DispatchError, ErrorType, RecoveryAction, Result};
pub use stats::DispatcherStats;
pub use thread::InputDispatcherThread;

use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use self::command::run_commands;
use self::connection::Connection;
use self::inbound::MotionIntake;
use self::input_state::{CancelationMode, CancelationOptions};
use self::state::{DispatcherState, InjectionSignals};
use self::target::TargetFlag;
use crate::clock::{poll_timeout, Clock, Nsecs, NSECS_MAX, NSECS_MIN};
use crate::config::DispatcherConfig;
use crate::event::validate::{validate_key_event, validate_motion_event};
use crate::event::{
    meta, DeviceId, EventEntry, EventKind, InjectionResult, InjectionState, InputEvent, KeyEvent, KeyFlag, NotifyKeyArgs,
    NotifyMotionArgs, PolicyFlag, PolicyFlags, SyncMode,
};
use crate::looper::{Looper, Readiness, ReadinessFlags};
use crate::policy::DispatcherPolicy;
use crate::transport::{ChannelId, InputChannel, TransportError};
use crate::window::{ApplicationInfo, WindowInfo};

/// Upper bound on passes run by [`InputDispatcher::dispatch_pending`].
const MAX_PENDING_PASSES: usize = 10_000;

/// The input dispatcher.
pub struct InputDispatcher {
    state: Mutex<DispatcherState>,
    policy: Arc<dyn DispatcherPolicy>,
    looper: Arc<dyn Looper>,
    clock: Arc<dyn Clock>,
    signals: Arc<InjectionSignals>,
}

impl InputDispatcher {
    /// Create a dispatcher.
    pub fn new(
        config: DispatcherConfig,
        policy: Arc<dyn DispatcherPolicy>,
        looper: Arc<dyn Looper>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            "Input dispatcher created (max {} events/s, key repeat {}ms/{}ms)",
            config.max_events_per_second, config.key_repeat_timeout_ms, config.key_repeat_delay_ms
        );
        let signals = Arc::new(InjectionSignals::default());
        let state = DispatcherState::new(config, policy.clone(), clock.clone(), signals.clone());
        Self {
            state: Mutex::new(state),
            policy,
            looper,
            clock,
            signals,
        }
    }

    /// Run one pass of the dispatch loop, then block in the looper until the
    /// next deadline, a wake, or channel readiness, and handle what arrived.
    pub fn dispatch_once(&self) {
        let next_wakeup = self.run_pass();
        let timeout = poll_timeout(self.clock.now(), next_wakeup);
        let ready = self.looper.poll_once(timeout);
        self.handle_ready(ready);
    }

    /// Run passes without blocking until nothing is due now. Returns the
    /// next wakeup time ([`NSECS_MAX`] when idle).
    ///
    /// Used by the replay driver and by tests that drive a [`crate::clock::ManualClock`].
    pub fn dispatch_pending(&self) -> Nsecs {
        for _ in 0..MAX_PENDING_PASSES {
            let next_wakeup = self.run_pass();
            let ready = self.looper.poll_once(Some(Duration::ZERO));
            let progressed = !ready.is_empty();
            self.handle_ready(ready);
            if !progressed && next_wakeup > self.clock.now() {
                return next_wakeup;
            }
        }
        warn!("Dispatch did not settle after {} passes", MAX_PENDING_PASSES);
        NSECS_MIN
    }

    fn run_pass(&self) -> Nsecs {
        let mut next_wakeup = NSECS_MAX;
        let mut state = self.state.lock();
        state.dispatch_once_inner(&mut next_wakeup);
        if run_commands(&mut state) {
            next_wakeup = NSECS_MIN;
        }
        next_wakeup
    }

    fn handle_ready(&self, ready: Vec<(ChannelId, ReadinessFlags)>) {
        if ready.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for (channel, readiness) in ready {
            self.handle_receive(&mut state, channel, readiness);
        }
    }

    /// A channel signalled readiness.
    fn handle_receive(&self, state: &mut MutexGuard<'_, DispatcherState>, channel: ChannelId, readiness: ReadinessFlags) {
        let now = state.now();
        let Some(connection) = state.connections.get_mut(&channel) else {
            error!(
                "Received spurious receive callback for unknown input channel {}.  events={:?}",
                channel, readiness
            );
            self.looper.remove_channel(channel);
            return;
        };

        if readiness.intersects(Readiness::Error | Readiness::Hangup) {
            error!(
                "Channel '{}' closed by consumer or failed: {:?}",
                connection.name(),
                readiness
            );
            state.abort_broken_dispatch_cycle(channel, true);
            self.looper.remove_channel(channel);
            run_commands(state);
            return;
        }

        if !readiness.contains(Readiness::Input) {
            warn!(
                "Channel '{}' signalled unexpected readiness: {:?}",
                connection.name(),
                readiness
            );
            return;
        }

        match connection.channel.receive_finished() {
            Ok(handled) => state.finish_dispatch_cycle(now, channel, handled),
            Err(TransportError::WouldBlock) => {
                trace!("Channel '{}' has no finished signal yet", connection.name());
            }
            Err(err) => {
                error!(
                    "Channel '{}' failed to read finished signal: {}",
                    connection.name(),
                    err
                );
                state.abort_broken_dispatch_cycle(channel, true);
                self.looper.remove_channel(channel);
            }
        }
        run_commands(state);
    }

    /// Input configuration changed.
    pub fn notify_configuration_changed(&self, event_time: Nsecs) {
        debug!("Configuration changed at {}", event_time);
        self.enqueue(EventEntry::new(event_time, PolicyFlag::PassToUser.into(), EventKind::ConfigurationChanged));
    }

    /// A device was reset; cancel whatever it still holds down.
    pub fn notify_device_reset(&self, event_time: Nsecs, device_id: DeviceId) {
        debug!("Device reset at {} (device {})", event_time, device_id);
        self.enqueue(EventEntry::new(
            event_time,
            PolicyFlag::PassToUser.into(),
            EventKind::DeviceReset { device_id },
        ));
    }

    /// Key from a trusted producer.
    pub fn notify_key(&self, args: &NotifyKeyArgs) -> Result<()> {
        debug!(
            "Key in: time={} device={} source={:?} policy={:?} action={:?} flags={:?} key_code={} scan_code={} meta=0x{:x} down_time={}",
            args.event_time,
            args.device_id,
            args.source,
            args.policy_flags,
            args.action,
            args.flags,
            args.key_code,
            args.scan_code,
            args.meta_state,
            args.down_time
        );
        validate_key_event(args.action)?;

        let mut policy_flags = args.policy_flags;
        let mut flags = args.flags;
        let mut meta_state = args.meta_state;
        if policy_flags.contains(PolicyFlag::Virtual) || flags.contains(KeyFlag::VirtualHardKey) {
            policy_flags |= PolicyFlag::Virtual;
            flags |= KeyFlag::VirtualHardKey;
        }
        if policy_flags.contains(PolicyFlag::Alt) {
            meta_state |= meta::ALT_ON | meta::ALT_LEFT_ON;
        }
        if policy_flags.contains(PolicyFlag::AltGr) {
            meta_state |= meta::ALT_ON | meta::ALT_RIGHT_ON;
        }
        if policy_flags.contains(PolicyFlag::Shift) {
            meta_state |= meta::SHIFT_ON | meta::SHIFT_LEFT_ON;
        }
        if policy_flags.contains(PolicyFlag::CapsLock) {
            meta_state |= meta::CAPS_LOCK_ON;
        }
        if policy_flags.contains(PolicyFlag::Function) {
            meta_state |= meta::FUNCTION_ON;
        }
        policy_flags |= PolicyFlag::Trusted;

        let event = KeyEvent {
            device_id: args.device_id,
            source: args.source,
            action: args.action,
            flags,
            key_code: args.key_code,
            scan_code: args.scan_code,
            meta_state,
            repeat_count: 0,
            down_time: args.down_time,
            event_time: args.event_time,
        };
        let mut policy_flags = self.policy.intercept_key_before_queueing(&event, policy_flags);

        if self.input_filter_enabled() {
            policy_flags |= PolicyFlag::Filtered;
            if !self.policy.filter_input_event(&InputEvent::Key(event), policy_flags) {
                trace!("Input filter consumed key {}", args.key_code);
                return Ok(());
            }
        }

        self.enqueue(EventEntry::from_key_args(args, policy_flags, flags, meta_state));
        Ok(())
    }

    /// Motion from a trusted producer. MOVE samples may be folded into an
    /// earlier record or streamed into a delivery in progress.
    pub fn notify_motion(&self, args: &NotifyMotionArgs) -> Result<()> {
        debug!(
            "Motion in: time={} device={} source={:?} policy={:?} action={:?} flags={:?} pointers={} down_time={}",
            args.event_time,
            args.device_id,
            args.source,
            args.policy_flags,
            args.action,
            args.flags,
            args.pointer_properties.len(),
            args.down_time
        );
        validate_motion_event(args.action, &args.pointer_properties, Some(&args.pointer_coords))?;

        let policy_flags = args.policy_flags | PolicyFlag::Trusted;
        let mut policy_flags = self.policy.intercept_motion_before_queueing(args.event_time, policy_flags);

        if self.input_filter_enabled() {
            policy_flags |= PolicyFlag::Filtered;
            if !self.policy.filter_input_event(&InputEvent::Motion(args.to_event()), policy_flags) {
                trace!("Input filter consumed motion {:?}", args.action);
                return Ok(());
            }
        }

        let need_wake = {
            let mut state = self.state.lock();
            let now = state.now();
            match state.batch_or_stream_motion(now, args) {
                MotionIntake::Batched => return Ok(()),
                MotionIntake::Streamed => {
                    run_commands(&mut state);
                    return Ok(());
                }
                MotionIntake::Enqueue => {}
            }
            let id = state.pool.insert(EventEntry::from_motion_args(args, policy_flags));
            state.enqueue_inbound_event(id)
        };

        if need_wake {
            self.looper.wake();
        }
        Ok(())
    }

    /// A switch changed state. Switches go straight to the policy and are
    /// never queued for windows.
    pub fn notify_switch(&self, when: Nsecs, switch_code: i32, switch_value: i32, policy_flags: PolicyFlags) {
        debug!(
            "Switch in: time={} code={} value={} policy={:?}",
            when, switch_code, switch_value, policy_flags
        );
        let policy_flags = policy_flags | PolicyFlag::Trusted;
        self.policy.notify_switch(when, switch_code, switch_value, policy_flags);
    }

    fn input_filter_enabled(&self) -> bool {
        self.state.lock().input_filter_enabled
    }

    /// Send producer events through the policy's input filter, or stop.
    ///
    /// Changing the setting cancels everything delivered and drops
    /// everything queued, so no gesture straddles the switch.
    pub fn set_input_filter_enabled(&self, enabled: bool) {
        debug!("Input filter enabled: {}", enabled);
        {
            let mut state = self.state.lock();
            if state.input_filter_enabled == enabled {
                return;
            }
            state.input_filter_enabled = enabled;
            state.reset_and_drop_everything("input filter is being enabled or disabled");
            run_commands(&mut state);
        }
        self.looper.wake();
    }

    fn enqueue(&self, entry: EventEntry) {
        let need_wake = {
            let mut state = self.state.lock();
            let id = state.pool.insert(entry);
            state.enqueue_inbound_event(id)
        };
        if need_wake {
            self.looper.wake();
        }
    }

    /// Inject an event on behalf of `injector_pid`/`injector_uid`.
    ///
    /// With [`SyncMode::None`] this returns [`InjectionResult::Succeeded`] as
    /// soon as the event is queued. Otherwise it blocks until the event is
    /// dispatched (and, for [`SyncMode::WaitForFinished`], until every
    /// foreground target finished it), or until `timeout_ms` elapses.
    pub fn inject_event(
        &self,
        event: &InputEvent,
        injector_pid: i32,
        injector_uid: i32,
        sync_mode: SyncMode,
        timeout_ms: u64,
    ) -> InjectionResult {
        self.inject_event_with_policy_flags(
            event,
            injector_pid,
            injector_uid,
            sync_mode,
            timeout_ms,
            PolicyFlags::empty(),
        )
    }

    /// [`InputDispatcher::inject_event`] with extra policy flags.
    ///
    /// The input filter re-injects the events it lets through with
    /// [`PolicyFlag::Filtered`] set; those already passed the policy's
    /// queueing interception and are not intercepted again.
    pub fn inject_event_with_policy_flags(
        &self,
        event: &InputEvent,
        injector_pid: i32,
        injector_uid: i32,
        sync_mode: SyncMode,
        timeout_ms: u64,
        policy_flags: PolicyFlags,
    ) -> InjectionResult {
        debug!(
            "Injection from pid={} uid={} (sync {:?}, timeout {}ms, policy {:?})",
            injector_pid, injector_uid, sync_mode, timeout_ms, policy_flags
        );
        let end_time = Instant::now() + Duration::from_millis(timeout_ms);

        // Asked once, before the lock is taken; routing reads the answer off the ticket.
        let has_permission = self.has_injection_permission(injector_pid, injector_uid);
        let mut policy_flags = policy_flags | PolicyFlag::Injected;
        let intercept = !policy_flags.contains(PolicyFlag::Filtered);
        if has_permission {
            policy_flags |= PolicyFlag::Trusted;
        }

        let mut entry = match event {
            InputEvent::Key(key) => {
                if let Err(err) = validate_key_event(key.action) {
                    warn!("Rejecting injected key: {}", err);
                    return InjectionResult::Failed;
                }
                let mut flags = key.flags;
                if flags.contains(KeyFlag::VirtualHardKey) {
                    policy_flags |= PolicyFlag::Virtual;
                }
                if intercept {
                    policy_flags = self.policy.intercept_key_before_queueing(key, policy_flags);
                }
                if policy_flags.contains(PolicyFlag::WokeHere) {
                    flags |= KeyFlag::WokeHere;
                }
                EventEntry::from_key_event(key, policy_flags, flags)
            }
            InputEvent::Motion(motion) => {
                let first = motion.samples.first().map(|sample| sample.coords.as_slice());
                let valid = validate_motion_event(motion.action, &motion.pointer_properties, first).and_then(|()| {
                    match motion
                        .samples
                        .iter()
                        .find(|sample| sample.coords.len() != motion.pointer_properties.len())
                    {
                        Some(bad) => Err(DispatchError::InvalidPointerCount(bad.coords.len())),
                        None => Ok(()),
                    }
                });
                if let Err(err) = valid {
                    warn!("Rejecting injected motion: {}", err);
                    return InjectionResult::Failed;
                }
                let event_time = motion.samples.first().map_or(0, |sample| sample.event_time);
                if intercept {
                    policy_flags = self.policy.intercept_motion_before_queueing(event_time, policy_flags);
                }
                match EventEntry::from_motion_event(motion, policy_flags) {
                    Some(entry) => entry,
                    None => {
                        warn!("Rejecting injected motion without samples");
                        return InjectionResult::Failed;
                    }
                }
            }
        };

        let ticket = Arc::new(
            InjectionState::new(injector_pid, injector_uid, sync_mode == SyncMode::None).with_permission(has_permission),
        );
        entry.injection = Some(ticket.clone());

        let mut state = self.state.lock();
        let id = state.pool.insert(entry);
        if state.enqueue_inbound_event(id) {
            self.looper.wake();
        }

        if sync_mode == SyncMode::None {
            return InjectionResult::Succeeded;
        }

        let mut result = loop {
            let result = ticket.result();
            if result != InjectionResult::Pending {
                break result;
            }
            if Instant::now() >= end_time {
                debug!("Injection timed out waiting for a result");
                break InjectionResult::TimedOut;
            }
            self.signals.result_available.wait_until(&mut state, end_time);
        };

        if result == InjectionResult::Succeeded && sync_mode == SyncMode::WaitForFinished {
            while ticket.pending_foreground_dispatches() != 0 {
                if Instant::now() >= end_time {
                    debug!(
                        "Injection timed out with {} foreground deliveries unfinished",
                        ticket.pending_foreground_dispatches()
                    );
                    result = InjectionResult::TimedOut;
                    break;
                }
                self.signals.sync_finished.wait_until(&mut state, end_time);
            }
        }

        debug!("Injection finished: {:?}", result);
        result
    }

    /// Root may always inject; everyone else asks the policy.
    fn has_injection_permission(&self, injector_pid: i32, injector_uid: i32) -> bool {
        injector_uid == 0 || self.policy.check_inject_events_permission(injector_pid, injector_uid)
    }

    /// Register a channel. Monitor channels receive a copy of every
    /// dispatched event.
    pub fn register_channel(&self, channel: Box<dyn InputChannel>, is_monitor: bool) -> Result<()> {
        let id = channel.id();
        {
            let mut state = self.state.lock();
            if state.connections.contains_key(&id) {
                warn!("Channel '{}' is already registered", channel.name());
                return Err(DispatchError::ChannelAlreadyRegistered(id));
            }
            info!("Registered channel '{}' (monitor: {})", channel.name(), is_monitor);

            state.connections.insert(id, Connection::new(channel, is_monitor));
            if is_monitor {
                state.monitoring_channels.push(id);
            }
            self.looper.add_channel(id);
            run_commands(&mut state);
        }
        self.looper.wake();
        Ok(())
    }

    /// Unregister a channel. Anything still queued for it is discarded and the
    /// channel never becomes a target again.
    pub fn unregister_channel(&self, channel: ChannelId) -> Result<()> {
        {
            let mut state = self.state.lock();
            let Some(connection) = state.unregister_connection(channel, false) else {
                warn!("Channel {} is not registered", channel);
                return Err(DispatchError::ChannelNotRegistered(channel));
            };
            info!("Unregistered channel '{}'", connection.name());

            if state.touch_state.remove_by_channel(channel).is_some() {
                debug!("Channel '{}' removed from touch state", connection.name());
            }
            self.looper.remove_channel(channel);
            run_commands(&mut state);
        }
        self.looper.wake();
        Ok(())
    }

    /// Replace the window list (front to back). Windows without a channel are
    /// ignored.
    pub fn set_input_windows(&self, windows: Vec<WindowInfo>) {
        debug!("Window list updated: {} windows", windows.len());
        {
            let mut state = self.state.lock();
            state.windows = windows
                .into_iter()
                .filter(|window| window.channel.is_some())
                .map(Arc::new)
                .collect();

            let new_focus = state.windows.iter().find(|window| window.has_focus).cloned();
            let focus_changed = match (&state.focused_window, &new_focus) {
                (Some(old), Some(new)) => !touch::same_window(old, new),
                (None, None) => false,
                _ => true,
            };
            if focus_changed {
                if let Some(channel) = state.focused_window.as_ref().and_then(|w| w.channel) {
                    let options = CancelationOptions::new(CancelationMode::NonPointer, "focus left window");
                    state.synthesize_cancelation_events_for_channel(channel, &options);
                }
                debug!(
                    "Focus changed to {}",
                    new_focus.as_ref().map_or("<null>", |w| w.name.as_str())
                );
            }
            state.focused_window = new_focus;

            let touched = std::mem::take(&mut state.touch_state.windows);
            let mut kept = Vec::with_capacity(touched.len());
            for mut touched_window in touched {
                let current = state
                    .windows
                    .iter()
                    .find(|w| touch::same_window(w, &touched_window.window))
                    .cloned();
                match current {
                    Some(window) => {
                        touched_window.window = window;
                        kept.push(touched_window);
                    }
                    None => {
                        if let Some(channel) = touched_window.window.channel {
                            let options = CancelationOptions::new(CancelationMode::Pointer, "touched window was removed");
                            state.synthesize_cancelation_events_for_channel(channel, &options);
                        }
                    }
                }
            }
            state.touch_state.windows = kept;

            if let Some(hovered) = state.last_hover_window.take() {
                let current = state.windows.iter().find(|w| touch::same_window(w, &hovered)).cloned();
                if current.is_none() {
                    debug!("Hovered window '{}' was removed", hovered.name);
                }
                state.last_hover_window = current;
            }
            run_commands(&mut state);
        }
        self.looper.wake();
    }

    /// Set or clear the focused application.
    pub fn set_focused_application(&self, application: Option<ApplicationInfo>) {
        debug!(
            "Focused application: {}",
            application.as_ref().map_or("<null>", |a| a.name.as_str())
        );
        {
            let mut state = self.state.lock();
            if state.focused_application != application {
                if state.focused_application.is_some() {
                    state.reset_targets();
                }
                state.focused_application = application;
            }
        }
        self.looper.wake();
    }

    /// Enable or disable dispatch, and freeze or thaw it.
    ///
    /// Disabling cancels everything delivered and drops everything queued.
    pub fn set_dispatch_mode(&self, enabled: bool, frozen: bool) {
        debug!("Dispatch mode: enabled={} frozen={}", enabled, frozen);
        let changed = {
            let mut state = self.state.lock();
            if state.dispatch_enabled != enabled || state.dispatch_frozen != frozen {
                if state.dispatch_frozen && !frozen {
                    state.reset_anr_timeouts();
                }
                if state.dispatch_enabled && !enabled {
                    state.reset_and_drop_everything("dispatcher is being disabled");
                }
                state.dispatch_enabled = enabled;
                state.dispatch_frozen = frozen;
                run_commands(&mut state);
                true
            } else {
                false
            }
        };
        if changed {
            self.looper.wake();
        }
    }

    /// Move the gesture in progress from one window to another. Returns false
    /// if either window is unknown or `from` is not part of the gesture.
    pub fn transfer_touch_focus(&self, from: ChannelId, to: ChannelId) -> bool {
        debug!("Transferring touch from {} to {}", from, to);
        {
            let mut state = self.state.lock();
            let (Some(from_window), Some(to_window)) = (state.window_for_channel(from), state.window_for_channel(to))
            else {
                debug!("Touch transfer skipped: window not found");
                return false;
            };
            if touch::same_window(&from_window, &to_window) {
                debug!("Touch transfer to the same window, nothing to do");
                return true;
            }

            let Some(touched) = state.touch_state.remove_by_channel(from) else {
                debug!("Touch transfer skipped: source window holds no touch");
                return false;
            };
            let flags = touched.target_flags
                & (TargetFlag::Foreground | TargetFlag::Split | TargetFlag::DispatchAsIs);
            state
                .touch_state
                .add_or_update_window(&to_window, flags, touched.pointer_ids);

            let pointer_state = state.connections.get(&from).map(|c| c.input_state.clone());
            if let Some(pointer_state) = pointer_state {
                if let Some(to_connection) = state.connections.get_mut(&to) {
                    pointer_state.copy_pointer_state_to(&mut to_connection.input_state);
                    let options = CancelationOptions::new(
                        CancelationMode::Pointer,
                        "touch transferred to another window",
                    );
                    state.synthesize_cancelation_events_for_channel(from, &options);
                }
            }
            run_commands(&mut state);
        }
        self.looper.wake();
        true
    }

    /// Human-readable description of the dispatcher state.
    pub fn dump_state(&self) -> String {
        let mut out = String::from("Input Dispatcher State:\n");
        self.state.lock().dump(&mut out);
        out
    }

    /// Acquire and release the dispatcher lock; hangs if the dispatcher is
    /// deadlocked.
    pub fn monitor(&self) {
        drop(self.state.lock());
    }

    /// Interrupt a blocked [`InputDispatcher::dispatch_once`].
    pub fn wake(&self) {
        self.looper.wake();
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> DispatcherStats {
        self.state.lock().stats.clone()
    }

    /// Status of a registered channel.
    pub fn connection_status(&self, channel: ChannelId) -> Option<ConnectionStatus> {
        self.state.lock().connections.get(&channel).map(|c| c.status())
    }
}

impl std::fmt::Debug for InputDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputDispatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{millis, ManualClock};
    use crate::event::{KeyAction, MotionAction};
    use crate::looper::ChannelLooper;
    use std::sync::{OnceLock, Weak};
    use crate::policy::MockDispatcherPolicy;
    use crate::transport::{InputMessage, MemoryChannel, MemoryChannelClient};
    use crate::window::Rect;

    fn permissive_policy() -> MockDispatcherPolicy {
        let mut policy = policy_without_permission();
        policy.expect_check_inject_events_permission().return_const(false);
        policy
    }

    fn policy_without_permission() -> MockDispatcherPolicy {
        let mut policy = MockDispatcherPolicy::new();
        policy
            .expect_intercept_key_before_queueing()
            .returning(|_, flags| flags | PolicyFlag::PassToUser);
        policy
            .expect_intercept_motion_before_queueing()
            .returning(|_, flags| flags | PolicyFlag::PassToUser);
        policy.expect_intercept_key_before_dispatching().returning(|_, _, _| 0);
        policy.expect_poke_user_activity().return_const(());
        policy.expect_is_key_repeat_enabled().return_const(true);
        policy.expect_dispatch_unhandled_key().returning(|_, _, _| None);
        policy.expect_filter_input_event().return_const(true);
        policy
    }

    fn fixture(policy: MockDispatcherPolicy) -> (InputDispatcher, Arc<ManualClock>, Arc<ChannelLooper>) {
        let clock = Arc::new(ManualClock::new(millis(1_000)));
        let looper = Arc::new(ChannelLooper::new());
        let dispatcher = InputDispatcher::new(
            DispatcherConfig::default(),
            Arc::new(policy),
            looper.clone(),
            clock.clone(),
        );
        (dispatcher, clock, looper)
    }

    fn focused_window(dispatcher: &InputDispatcher, looper: &ChannelLooper, name: &str) -> MemoryChannelClient {
        let (server, client) = MemoryChannel::pair(name, looper.handle(), 16);
        let id = server.id();
        dispatcher.register_channel(Box::new(server), false).expect("register");
        dispatcher.set_input_windows(vec![WindowInfo::new(name, id, Rect::new(0, 0, 100, 100)).focused()]);
        dispatcher.set_focused_application(Some(ApplicationInfo::new("app")));
        client
    }

    #[test]
    fn test_key_reaches_focused_window() {
        let (dispatcher, clock, looper) = fixture(permissive_policy());
        let mut client = focused_window(&dispatcher, &looper, "focus");

        let args = NotifyKeyArgs::new(clock.now(), 1, KeyAction::Down, crate::event::keycode::A);
        dispatcher.notify_key(&args).expect("valid key");
        dispatcher.dispatch_pending();

        let message = client.try_receive().expect("published");
        let key = message.as_key().expect("key message");
        assert_eq!(key.key_code, crate::event::keycode::A);
        assert!(key.policy_flags.contains(PolicyFlag::Trusted));
    }

    #[test]
    fn test_register_twice_rejected() {
        let (dispatcher, _clock, looper) = fixture(permissive_policy());
        let (server, _client) = MemoryChannel::pair("dup", looper.handle(), 4);
        let id = server.id();
        dispatcher.register_channel(Box::new(server), false).expect("first");

        struct Alias(ChannelId);
        impl InputChannel for Alias {
            fn id(&self) -> ChannelId {
                self.0
            }
            fn name(&self) -> &str {
                "alias"
            }
            fn publish(&mut self, _: &InputMessage) -> std::result::Result<(), TransportError> {
                Ok(())
            }
            fn append_sample(
                &mut self,
                _: Nsecs,
                _: &[crate::event::PointerCoords],
            ) -> std::result::Result<(), TransportError> {
                Ok(())
            }
            fn send_ready(&mut self) -> std::result::Result<(), TransportError> {
                Ok(())
            }
            fn receive_finished(&mut self) -> std::result::Result<bool, TransportError> {
                Err(TransportError::WouldBlock)
            }
            fn reset(&mut self) -> std::result::Result<(), TransportError> {
                Ok(())
            }
        }

        let err = dispatcher.register_channel(Box::new(Alias(id)), false).unwrap_err();
        assert_eq!(err, DispatchError::ChannelAlreadyRegistered(id));
        let unknown = ChannelId::next();
        assert_eq!(
            dispatcher.unregister_channel(unknown).unwrap_err(),
            DispatchError::ChannelNotRegistered(unknown)
        );
    }

    #[test]
    fn test_invalid_motion_rejected_at_boundary() {
        let (dispatcher, clock, _looper) = fixture(permissive_policy());
        let args = NotifyMotionArgs::touch(clock.now(), 1, MotionAction::PointerDown(3), clock.now(), &[(0, 1.0, 1.0)]);
        assert!(matches!(
            dispatcher.notify_motion(&args),
            Err(DispatchError::InvalidMotionAction(_))
        ));
        assert_eq!(dispatcher.stats().events_received, 0);
    }

    #[test]
    fn test_dispatch_mode_disable_drops_queue() {
        let (dispatcher, clock, looper) = fixture(permissive_policy());
        let mut client = focused_window(&dispatcher, &looper, "focus");

        dispatcher.set_dispatch_mode(true, true);
        let args = NotifyKeyArgs::new(clock.now(), 1, KeyAction::Down, crate::event::keycode::B);
        dispatcher.notify_key(&args).expect("valid key");
        dispatcher.dispatch_pending();
        assert!(client.try_receive().is_none(), "frozen dispatcher must not deliver");

        dispatcher.set_dispatch_mode(false, false);
        dispatcher.dispatch_pending();
        assert!(client.try_receive().is_none());
        assert!(dispatcher.dump_state().contains("InboundQueue: length=0"));
    }

    #[test]
    fn test_injection_permission_asked_once_outside_lock() {
        let slot: Arc<OnceLock<Weak<InputDispatcher>>> = Arc::new(OnceLock::new());
        let seen = slot.clone();
        let mut policy = policy_without_permission();
        policy
            .expect_check_inject_events_permission()
            .times(1)
            .returning(move |_, _| {
                let unlocked = seen
                    .get()
                    .and_then(Weak::upgrade)
                    .is_some_and(|dispatcher| dispatcher.state.try_lock().is_some());
                assert!(unlocked, "dispatcher lock held while asking for injection permission");
                true
            });
        let (dispatcher, clock, looper) = fixture(policy);
        let dispatcher = Arc::new(dispatcher);
        let _ = slot.set(Arc::downgrade(&dispatcher));

        let (server, mut client) = MemoryChannel::pair("other", looper.handle(), 16);
        let id = server.id();
        dispatcher.register_channel(Box::new(server), false).expect("register");
        dispatcher.set_input_windows(vec![
            WindowInfo::new("other", id, Rect::new(0, 0, 100, 100)).with_owner(77, 10_077)
        ]);

        let now = clock.now();
        let down = NotifyMotionArgs::touch(now, 1, MotionAction::Down, now, &[(0, 10.0, 10.0)]);
        let result = dispatcher.inject_event(&InputEvent::Motion(down.to_event()), 55, 10_055, SyncMode::None, 0);
        assert_eq!(result, InjectionResult::Succeeded);
        dispatcher.dispatch_pending();

        let message = client.try_receive().expect("touch delivered to a foreign window");
        assert_eq!(message.as_motion().map(|m| m.action), Some(MotionAction::Down));
    }

    #[test]
    fn test_filter_enabled_marks_and_consumes() {
        let mut policy = MockDispatcherPolicy::new();
        policy
            .expect_intercept_key_before_queueing()
            .returning(|_, flags| flags | PolicyFlag::PassToUser);
        policy.expect_intercept_key_before_dispatching().returning(|_, _, _| 0);
        policy.expect_poke_user_activity().return_const(());
        policy.expect_is_key_repeat_enabled().return_const(false);
        policy
            .expect_filter_input_event()
            .withf(|event, flags| matches!(event, InputEvent::Key(_)) && flags.contains(PolicyFlag::Filtered))
            .times(1)
            .return_const(false);
        let (dispatcher, clock, looper) = fixture(policy);
        let mut client = focused_window(&dispatcher, &looper, "focus");

        dispatcher.set_input_filter_enabled(true);
        let args = NotifyKeyArgs::new(clock.now(), 1, KeyAction::Down, crate::event::keycode::A);
        dispatcher.notify_key(&args).expect("valid key");
        dispatcher.dispatch_pending();

        assert!(client.try_receive().is_none(), "filter consumed the key");
        assert_eq!(dispatcher.stats().events_received, 0);
        assert!(dispatcher.dump_state().contains("InputFilterEnabled: true"));
    }

    #[test]
    fn test_monitor_returns() {
        let (dispatcher, _clock, _looper) = fixture(permissive_policy());
        dispatcher.monitor();
        dispatcher.wake();
    }
}
