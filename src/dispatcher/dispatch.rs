//! Dispatch loop
//!
//! One pass picks the pending event (synthesizing a key repeat or dequeuing
//! the inbound head), decides whether it must be dropped, and drives it as
//! far as it can go. A pass that cannot finish the event leaves it pending
//! and lowers the wakeup deadline to when it should be retried.

use serde::Serialize;
use std::fmt;
use tracing::{debug, info, trace, warn};

use super::command::Command;
use super::inbound::is_app_switch_key;
use super::input_state::{CancelationMode, CancelationOptions};
use super::pool::EventId;
use super::state::DispatcherState;
use super::target::{InputTarget, Resolution, TouchResolution};
use crate::clock::{Nsecs, NSECS_MAX, NSECS_MIN};
use crate::event::{
    EventEntry, EventKind, InjectionResult, InterceptKeyResult, KeyAction, KeyEntry, KeyFlag, MotionAction,
    MotionEntry, PolicyFlag, RAW_POLICY_FLAGS,
};
use crate::policy::UserActivityKind;

/// Why an inbound event was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The policy did not pass the event to the user
    Policy,
    /// Dispatch is disabled
    Disabled,
    /// An app switch is overdue
    AppSwitch,
    /// A newer touch on another application unblocks the queue
    Blocked,
    /// Too old to be useful
    Stale,
}

impl DropReason {
    /// Log and cancellation reason.
    pub fn message(self) -> &'static str {
        match self {
            Self::Policy => "consumed by policy",
            Self::Disabled => "dispatch disabled",
            Self::AppSwitch => "overdue app switch",
            Self::Blocked => "user moved on from a not responding application",
            Self::Stale => "stale event",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl DispatcherState {
    /// One pass of the dispatch state machine.
    pub(crate) fn dispatch_once_inner(&mut self, next_wakeup: &mut Nsecs) {
        let now = self.now();

        if !self.config.key_repeat_enabled || !self.policy.is_key_repeat_enabled() {
            self.reset_key_repeat();
        }

        if self.dispatch_frozen {
            trace!("Dispatch frozen, waiting");
            return;
        }

        let is_app_switch_due = self.app_switch_due_time <= now;
        if self.app_switch_due_time < *next_wakeup {
            *next_wakeup = self.app_switch_due_time;
        }

        let id = match self.pending_event {
            Some(id) => id,
            None => match self.next_pending_event(now, is_app_switch_due, next_wakeup) {
                Some(id) => id,
                None => return,
            },
        };

        let Some(entry) = self.pool.get(id) else {
            warn!("Pending event has no record, discarding");
            self.pending_event = None;
            return;
        };
        let policy_flags = entry.policy_flags;

        let mut drop_reason = if !policy_flags.contains(PolicyFlag::PassToUser) {
            Some(DropReason::Policy)
        } else if !self.dispatch_enabled {
            Some(DropReason::Disabled)
        } else {
            None
        };

        if self.next_unblocked_event == Some(id) {
            self.next_unblocked_event = None;
        }

        let is_stale = now - entry.event_time >= self.config.stale_event_timeout();
        let done = match &entry.kind {
            EventKind::ConfigurationChanged => {
                let event_time = entry.event_time;
                drop_reason = None;
                self.dispatch_configuration_changed(event_time)
            }
            EventKind::DeviceReset { device_id } => {
                let device_id = *device_id;
                drop_reason = None;
                self.dispatch_device_reset(device_id)
            }
            EventKind::Key(_) => {
                if is_app_switch_due {
                    if is_app_switch_key(entry) {
                        self.reset_pending_app_switch(true);
                    } else if drop_reason.is_none() {
                        drop_reason = Some(DropReason::AppSwitch);
                    }
                }
                if drop_reason.is_none() && is_stale {
                    drop_reason = Some(DropReason::Stale);
                }
                if drop_reason.is_none() && self.next_unblocked_event.is_some() {
                    drop_reason = Some(DropReason::Blocked);
                }
                self.dispatch_key(now, id, &mut drop_reason, next_wakeup)
            }
            EventKind::Motion(_) => {
                if drop_reason.is_none() && is_app_switch_due {
                    drop_reason = Some(DropReason::AppSwitch);
                }
                if drop_reason.is_none() && is_stale {
                    drop_reason = Some(DropReason::Stale);
                }
                if drop_reason.is_none() && self.next_unblocked_event.is_some() {
                    drop_reason = Some(DropReason::Blocked);
                }
                self.dispatch_motion(now, id, &mut drop_reason, next_wakeup)
            }
        };

        if done {
            if let Some(reason) = drop_reason {
                self.drop_inbound_event(id, reason);
            }
            self.release_pending_event();
            *next_wakeup = NSECS_MIN;
        }
    }

    /// Pick the next event when nothing is pending: a due key repeat when the
    /// inbound queue is empty, otherwise the inbound head unless throttled.
    fn next_pending_event(&mut self, now: Nsecs, is_app_switch_due: bool, next_wakeup: &mut Nsecs) -> Option<EventId> {
        if self.inbound.is_empty() {
            if is_app_switch_due {
                // The app switch key never arrived.
                self.reset_pending_app_switch(false);
            }

            if self.key_repeat.last_key.is_some() {
                if now >= self.key_repeat.next_repeat_time {
                    self.pending_event = self.synthesize_key_repeat(now);
                } else if self.key_repeat.next_repeat_time < *next_wakeup {
                    *next_wakeup = self.key_repeat.next_repeat_time;
                }
            }

            if self.pending_event.is_none() {
                if self.active_connections.is_empty() {
                    self.dispatch_idle();
                }
                return None;
            }
        } else {
            let head = self.inbound.front().copied()?;
            if self.throttle_head(now, head, is_app_switch_due, next_wakeup) {
                return None;
            }
            self.inbound.pop_front();
            self.pending_event = Some(head);
        }

        let id = self.pending_event?;
        let passes_to_user = self
            .pool
            .get(id)
            .is_some_and(|entry| entry.policy_flags.contains(PolicyFlag::PassToUser));
        if passes_to_user {
            self.poke_user_activity(id);
        }
        Some(id)
    }

    /// True if a solitary MOVE or HOVER_MOVE at the inbound head must wait for the
    /// throttle interval. Updates the throttle record when it passes.
    fn throttle_head(&mut self, now: Nsecs, head: EventId, is_app_switch_due: bool, next_wakeup: &mut Nsecs) -> bool {
        let Some(entry) = self.pool.get(head) else {
            return false;
        };
        let Some(motion) = entry.motion() else {
            return false;
        };
        if is_app_switch_due
            || !self.dispatch_enabled
            || !entry.policy_flags.contains(PolicyFlag::PassToUser)
            || entry.is_injected()
        {
            return false;
        }

        let is_move = motion.action.is_batchable();
        let throttle = &mut self.throttle;
        if self.inbound.len() == 1
            && is_move
            && throttle.last_was_move
            && throttle.last_device_id == Some(motion.device_id)
            && throttle.last_source == motion.source
        {
            let next_time = throttle
                .last_event_time
                .saturating_add(self.config.min_time_between_events());
            if now < next_time {
                trace!("Throttling MOVE until {}", next_time);
                self.stats.throttled += 1;
                if next_time < *next_wakeup {
                    *next_wakeup = next_time;
                }
                return true;
            }
        }

        throttle.last_event_time = now;
        throttle.last_device_id = Some(motion.device_id);
        throttle.last_source = motion.source;
        throttle.last_was_move = is_move;
        false
    }

    fn poke_user_activity(&mut self, id: EventId) {
        let Some(entry) = self.pool.get(id) else {
            return;
        };
        let kind = match &entry.kind {
            EventKind::Motion(motion) => {
                if motion.action == MotionAction::Cancel {
                    return;
                }
                if motion.source.is_touch() {
                    UserActivityKind::Touch
                } else {
                    UserActivityKind::Other
                }
            }
            EventKind::Key(key) => {
                if key.flags.contains(KeyFlag::Canceled) {
                    return;
                }
                UserActivityKind::Button
            }
            EventKind::ConfigurationChanged | EventKind::DeviceReset { .. } => UserActivityKind::Other,
        };
        let event_time = entry.event_time;
        self.post_command(Command::PokeUserActivity { event_time, kind });
    }

    fn dispatch_idle(&mut self) {
        trace!("Dispatcher idle");
        // Nothing can be waiting on targets while idle.
        self.reset_targets();
    }

    fn dispatch_configuration_changed(&mut self, event_time: Nsecs) -> bool {
        debug!("Dispatching configuration change at {}", event_time);
        self.reset_key_repeat();
        self.post_command(Command::NotifyConfigurationChanged { event_time });
        true
    }

    fn dispatch_device_reset(&mut self, device_id: i32) -> bool {
        debug!("Dispatching reset of device {}", device_id);
        let options = CancelationOptions::new(CancelationMode::All, "device was reset").for_device(device_id);
        self.synthesize_cancelation_events_for_all_connections(&options);
        true
    }

    fn dispatch_key(
        &mut self,
        now: Nsecs,
        id: EventId,
        drop_reason: &mut Option<DropReason>,
        next_wakeup: &mut Nsecs,
    ) -> bool {
        let Some(entry) = self.pool.get(id) else {
            return true;
        };
        let in_progress = entry.dispatch_in_progress;
        let passes_to_user = entry.policy_flags.contains(PolicyFlag::PassToUser);
        if !in_progress {
            self.preprocess_key(id);
        }

        let Some(key) = self.pool.get_mut(id).and_then(EventEntry::key_mut) else {
            return true;
        };

        if key.intercept_result == InterceptKeyResult::TryAgainLater {
            if now < key.intercept_wakeup_time {
                if key.intercept_wakeup_time < *next_wakeup {
                    *next_wakeup = key.intercept_wakeup_time;
                }
                return false;
            }
            key.reset_intercept();
        }

        match key.intercept_result {
            InterceptKeyResult::Unknown if passes_to_user => {
                let window = self.focused_window.clone();
                self.pool.retain(id);
                self.post_command(Command::InterceptKeyBeforeDispatching { event: id, window });
                return false;
            }
            InterceptKeyResult::Unknown => key.intercept_result = InterceptKeyResult::Continue,
            InterceptKeyResult::Skip => {
                if drop_reason.is_none() {
                    *drop_reason = Some(DropReason::Policy);
                }
            }
            InterceptKeyResult::Continue | InterceptKeyResult::TryAgainLater => {}
        }

        if let Some(reason) = *drop_reason {
            self.reset_targets();
            self.set_injection_result(id, injection_result_for_drop(reason));
            return true;
        }

        if !self.targets_valid {
            match self.find_focused_window_targets(now, id, next_wakeup) {
                Resolution::Pending => return false,
                Resolution::Failed(result) => {
                    self.set_injection_result(id, result);
                    return true;
                }
                Resolution::Ready(targets) => self.commit_ready_targets(id, targets),
            }
        }

        self.dispatch_event_to_current_targets(now, id, false);
        true
    }

    /// Key repeat bookkeeping and LONG_PRESS, done once per key.
    fn preprocess_key(&mut self, id: EventId) {
        let Some(entry) = self.pool.get(id) else {
            return;
        };
        let Some(key) = entry.key() else {
            return;
        };

        let starts_repeat = key.repeat_count == 0
            && key.action == KeyAction::Down
            && entry.policy_flags.contains(PolicyFlag::Trusted)
            && !entry.policy_flags.contains(PolicyFlag::DisableKeyRepeat);
        let synthetic = key.synthetic_repeat;
        let key_code = key.key_code;
        let event_time = entry.event_time;

        let mut repeat_count = key.repeat_count;
        if starts_repeat {
            let previous = self
                .key_repeat
                .last_key
                .and_then(|last| self.pool.get(last))
                .and_then(EventEntry::key)
                .filter(|last| last.key_code == key_code)
                .map(|last| last.repeat_count);
            if let Some(previous_count) = previous {
                // Two identical DOWNs in a row: the device repeats on its own.
                repeat_count = previous_count + 1;
                self.reset_key_repeat();
                self.key_repeat.next_repeat_time = NSECS_MAX;
            } else {
                self.reset_key_repeat();
                self.key_repeat.next_repeat_time = event_time.saturating_add(self.config.key_repeat_timeout());
            }
            self.key_repeat.last_key = Some(id);
            self.pool.retain(id);
        } else if !synthetic {
            self.reset_key_repeat();
        }

        if let Some(entry) = self.pool.get_mut(id) {
            entry.dispatch_in_progress = true;
            if let Some(key) = entry.key_mut() {
                key.repeat_count = repeat_count;
                if repeat_count == 1 {
                    key.flags |= KeyFlag::LongPress;
                } else {
                    key.flags.remove(KeyFlag::LongPress);
                }
            }
        }
        self.reset_targets();

        if let Some(entry) = self.pool.get(id) {
            debug!("Dispatching {}", entry);
        }
    }

    fn dispatch_motion(
        &mut self,
        now: Nsecs,
        id: EventId,
        drop_reason: &mut Option<DropReason>,
        next_wakeup: &mut Nsecs,
    ) -> bool {
        let Some(entry) = self.pool.get_mut(id) else {
            return true;
        };
        if !entry.dispatch_in_progress {
            entry.dispatch_in_progress = true;
            debug!("Dispatching {}", entry);
            self.reset_targets();
        }

        if let Some(reason) = *drop_reason {
            self.reset_targets();
            self.set_injection_result(id, injection_result_for_drop(reason));
            return true;
        }

        if !self.targets_valid {
            let is_pointer = self
                .pool
                .get(id)
                .and_then(EventEntry::motion)
                .is_some_and(|motion| motion.source.is_pointer());
            let touch = if is_pointer {
                self.find_touched_window_targets(now, id, next_wakeup)
            } else {
                TouchResolution::from(self.find_focused_window_targets(now, id, next_wakeup))
            };

            match touch.resolution {
                Resolution::Pending => return false,
                Resolution::Failed(result) => {
                    self.set_injection_result(id, result);
                    return true;
                }
                Resolution::Ready(targets) => self.commit_ready_targets(id, targets),
            }

            if touch.conflicting {
                let options = CancelationOptions::new(CancelationMode::Pointer, "conflicting pointer actions");
                self.synthesize_cancelation_events_for_all_connections(&options);
            }
            if let Some(after) = touch.split_batch_after {
                self.split_motion_batch(id, after);
            }
        }

        self.dispatch_event_to_current_targets(now, id, false);
        true
    }

    /// Keep samples up to `after` in `id` and requeue the rest at the head
    /// of the inbound queue as a record of their own.
    fn split_motion_batch(&mut self, id: EventId, after: usize) {
        let Some(entry) = self.pool.get_mut(id) else {
            return;
        };
        let policy_flags = entry.policy_flags;
        let injection = entry.injection.clone();
        let Some(motion) = entry.motion_mut() else {
            return;
        };
        if after + 1 >= motion.samples.len() {
            return;
        }

        let rest = motion.samples.split_off(after + 1);
        let Some(event_time) = rest.first().map(|sample| sample.event_time) else {
            return;
        };
        debug!(
            "Split batch of {} samples after sample {}",
            motion.samples.len() + rest.len(),
            after
        );
        let next = MotionEntry {
            samples: rest,
            ..motion.clone()
        };

        let mut next_entry = EventEntry::new(event_time, policy_flags, EventKind::Motion(next));
        next_entry.injection = injection;
        let next_id = self.pool.insert(next_entry);
        self.inbound.push_front(next_id);
    }

    fn commit_ready_targets(&mut self, id: EventId, mut targets: Vec<InputTarget>) {
        self.set_injection_result(id, InjectionResult::Succeeded);
        self.add_monitoring_targets(&mut targets);
        self.commit_targets(targets);
    }

    fn drop_inbound_event(&mut self, id: EventId, reason: DropReason) {
        let Some(entry) = self.pool.get(id) else {
            return;
        };
        match reason {
            DropReason::Policy => debug!("Policy consumed {}", entry),
            _ => info!("Dropped event: {} ({})", entry, reason),
        }
        self.stats.record_drop(reason);

        let mode = match &entry.kind {
            EventKind::Key(_) => Some(CancelationMode::NonPointer),
            EventKind::Motion(motion) if motion.source.is_pointer() => Some(CancelationMode::Pointer),
            EventKind::Motion(_) => Some(CancelationMode::NonPointer),
            EventKind::ConfigurationChanged | EventKind::DeviceReset { .. } => None,
        };
        if let Some(mode) = mode {
            let options = CancelationOptions::new(mode, reason.message());
            self.synthesize_cancelation_events_for_all_connections(&options);
        }
    }

    /// Cancel everything delivered so far and discard everything not yet delivered.
    pub(crate) fn reset_and_drop_everything(&mut self, reason: &'static str) {
        debug!("Dropping all queued events ({})", reason);
        let options = CancelationOptions::new(CancelationMode::All, reason);
        self.synthesize_cancelation_events_for_all_connections(&options);

        self.reset_key_repeat();
        self.release_pending_event();
        self.drain_inbound_queue();
        self.reset_targets();
        self.touch_state.reset();
        self.last_hover_window = None;
    }

    /// Forget the remembered key DOWN.
    pub(crate) fn reset_key_repeat(&mut self) {
        if let Some(last) = self.key_repeat.last_key.take() {
            self.release_event(last);
        }
    }

    /// Next repeat of the remembered key. The returned id carries the
    /// reference owned by the pending slot.
    fn synthesize_key_repeat(&mut self, now: Nsecs) -> Option<EventId> {
        let last = self.key_repeat.last_key?;
        let entry = self.pool.get(last)?;
        let policy_flags = (entry.policy_flags & RAW_POLICY_FLAGS) | PolicyFlag::PassToUser | PolicyFlag::Trusted;

        let id = if self.pool.ref_count(last) == 1 {
            // Only the repeat slot holds it; reuse the record.
            let entry = self.pool.get_mut(last)?;
            entry.event_time = now;
            entry.policy_flags = policy_flags;
            entry.dispatch_in_progress = false;
            entry.injection = None;
            let key = entry.key_mut()?;
            key.reset_intercept();
            key.repeat_count += 1;
            key.synthetic_repeat = true;
            last
        } else {
            let key = entry.key()?;
            let repeat = KeyEntry {
                repeat_count: key.repeat_count + 1,
                synthetic_repeat: true,
                intercept_result: InterceptKeyResult::Unknown,
                intercept_wakeup_time: 0,
                ..key.clone()
            };
            let id = self.pool.insert(EventEntry::new(now, policy_flags, EventKind::Key(repeat)));
            self.key_repeat.last_key = Some(id);
            self.release_event(last);
            id
        };

        // One reference for the repeat slot, one for the pending slot.
        self.pool.retain(id);
        self.key_repeat.next_repeat_time = now.saturating_add(self.config.key_repeat_delay());
        self.stats.key_repeats += 1;
        trace!("Synthesized key repeat");
        Some(id)
    }
}

/// Injectors see a policy drop as success and every other drop as failure.
fn injection_result_for_drop(reason: DropReason) -> InjectionResult {
    if reason == DropReason::Policy {
        InjectionResult::Succeeded
    } else {
        InjectionResult::Failed
    }
}
