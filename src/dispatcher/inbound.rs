//! Inbound queue
//!
//! Producer events wait here until the dispatch loop picks them up. Two
//! latency optimizations watch the queue as events arrive: an app-switch key
//! starts a deadline after which everything ahead of it is dropped, and a
//! touch on another application while waiting on an unresponsive one marks
//! the touch as the next event to unblock.
//!
//! MOVE and HOVER_MOVE samples are folded into a queued or pending record
//! for the same device when possible, or streamed straight into a delivery
//! in progress. Injected records are never folded into.

use std::sync::Arc;
use tracing::{debug, trace};

use super::anr::WaitCause;
use super::pool::EventId;
use super::state::DispatcherState;
use super::target::TargetFlag;
use crate::clock::{as_millis_f64, Nsecs, NSECS_MAX};
use crate::event::{keycode, EventEntry, EventKind, KeyAction, KeyFlag, MotionAction, NotifyMotionArgs, PolicyFlag};
use crate::window::WindowInfo;

/// What happened to an incoming MOVE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MotionIntake {
    /// Folded into a record in the inbound queue or the pending slot
    Batched,
    /// Appended to a delivery in progress; commands may be queued
    Streamed,
    /// Needs a record of its own
    Enqueue,
}

impl DispatcherState {
    /// Append a record to the inbound queue. Returns true if the dispatch
    /// loop must be woken.
    pub(crate) fn enqueue_inbound_event(&mut self, id: EventId) -> bool {
        let mut need_wake = self.inbound.is_empty();
        self.inbound.push_back(id);
        self.stats.events_received += 1;

        let Some(entry) = self.pool.get(id) else {
            return need_wake;
        };

        match &entry.kind {
            EventKind::Key(key) if is_app_switch_key(entry) => match key.action {
                KeyAction::Down => self.app_switch_saw_key_down = true,
                KeyAction::Up if self.app_switch_saw_key_down => {
                    self.app_switch_due_time = entry.event_time.saturating_add(self.config.app_switch_timeout());
                    self.app_switch_saw_key_down = false;
                    need_wake = true;
                }
                _ => {}
            },

            EventKind::Motion(motion)
                if motion.action == MotionAction::Down
                    && motion.source.is_pointer()
                    && self.anr.cause == WaitCause::ApplicationNotReady
                    && self.anr.waiting_application.is_some() =>
            {
                let point = motion.first_sample().coords.first().map(|c| (c.x as i32, c.y as i32));
                if let Some((x, y)) = point {
                    let elsewhere = self
                        .find_touched_window_at(x, y)
                        .is_some_and(|window| !window.same_application(self.anr.waiting_application.as_ref()));
                    if elsewhere {
                        debug!("Touch landed on another application while waiting, unblocking");
                        self.next_unblocked_event = Some(id);
                        need_wake = true;
                    }
                }
            }

            _ => {}
        }

        need_wake
    }

    pub(crate) fn is_app_switch_pending(&self) -> bool {
        self.app_switch_due_time != NSECS_MAX
    }

    pub(crate) fn reset_pending_app_switch(&mut self, handled: bool) {
        self.app_switch_due_time = NSECS_MAX;
        if handled {
            debug!("App switch handled");
        } else {
            debug!("App switch abandoned");
        }
    }

    /// Topmost window that would take a touch at the point.
    pub(crate) fn find_touched_window_at(&self, x: i32, y: i32) -> Option<Arc<WindowInfo>> {
        for window in &self.windows {
            if window.visible
                && window.is_touchable()
                && (window.is_touch_modal() || window.touchable_area_contains(x, y))
            {
                return Some(window.clone());
            }
            if window.is_system_error() {
                // Error window on top but not visible: the touch goes nowhere.
                return None;
            }
        }
        None
    }

    /// Fold a MOVE sample into the motion record `id`.
    fn batch_motion(&mut self, id: EventId, args: &NotifyMotionArgs, description: &str) {
        let coalesce_interval = self.config.motion_sample_coalesce_interval();
        let Some(motion) = self.pool.get_mut(id).and_then(EventEntry::motion_mut) else {
            return;
        };
        motion.meta_state |= args.meta_state;
        self.stats.events_received += 1;

        if let Some(last) = motion.samples.last_mut() {
            let interval = args.event_time - last.event_time_before_coalescing;
            if interval <= coalesce_interval {
                for (slot, coords) in last.coords.iter_mut().zip(&args.pointer_coords) {
                    *slot = *coords;
                }
                last.event_time = args.event_time;
                self.stats.samples_coalesced += 1;
                trace!(
                    "Coalesced MOVE into {} ({:.3}ms apart)",
                    description,
                    as_millis_f64(interval)
                );
                return;
            }
            trace!(
                "Batched MOVE into {} ({:.3}ms apart)",
                description,
                as_millis_f64(interval)
            );
        }

        motion.append_sample(args.event_time, &args.pointer_coords);
        self.stats.samples_batched += 1;
    }

    /// Try to absorb a MOVE or HOVER_MOVE without queueing a new record.
    pub(crate) fn batch_or_stream_motion(&mut self, now: Nsecs, args: &NotifyMotionArgs) -> MotionIntake {
        if !args.action.is_batchable() {
            return MotionIntake::Enqueue;
        }

        // Most recent motion for this device and source still in the inbound queue.
        let queued = self.inbound.iter().rev().find_map(|&id| {
            let entry = self.pool.get(id)?;
            let motion = entry.motion()?;
            (motion.device_id == args.device_id && motion.source == args.source)
                .then(|| (id, entry.can_append_samples(args.action, &args.pointer_properties)))
        });
        if let Some((id, compatible)) = queued {
            if !compatible {
                return MotionIntake::Enqueue;
            }
            self.batch_motion(id, args, "queued motion");
            return MotionIntake::Batched;
        }

        // Pending event whose targets are not locked in yet.
        if let Some(pending) = self.pending_event {
            let candidate = self.pool.get(pending).and_then(|entry| {
                let motion = entry.motion()?;
                let open = !entry.dispatch_in_progress || !self.targets_valid;
                (open && motion.device_id == args.device_id && motion.source == args.source)
                    .then(|| entry.can_append_samples(args.action, &args.pointer_properties))
            });
            match candidate {
                Some(false) => return MotionIntake::Enqueue,
                Some(true) => {
                    self.batch_motion(pending, args, "pending motion");
                    return MotionIntake::Batched;
                }
                None => {}
            }
        }

        if !self.targets_valid {
            return MotionIntake::Enqueue;
        }

        // Hover only streams while the pointer stays over the same window.
        if args.action == MotionAction::HoverMove {
            let Some(last_hover) = self.last_hover_window.clone() else {
                return MotionIntake::Enqueue;
            };
            let point = args.pointer_coords.first().map(|c| (c.x as i32, c.y as i32));
            let under = point.and_then(|(x, y)| self.find_touched_window_at(x, y));
            if !under.is_some_and(|window| super::touch::same_window(&window, &last_hover)) {
                return MotionIntake::Enqueue;
            }
        }

        // Streaming onto a delivery still in progress on a foreground target.
        let mut stream_target = None;
        for target in self.targets.iter().filter(|t| t.flags.contains(TargetFlag::Foreground)) {
            let Some(head) = self
                .connections
                .get(&target.channel)
                .and_then(|connection| connection.outbound_queue.front())
            else {
                continue;
            };
            if !head.in_progress || head.is_split() {
                continue;
            }
            let Some(entry) = self.pool.get(head.event) else {
                continue;
            };
            let Some(motion) = entry.motion() else {
                continue;
            };
            if motion.action != args.action
                || motion.device_id != args.device_id
                || motion.source != args.source
                || motion.pointer_count() != args.pointer_properties.len()
                || entry.is_injected()
            {
                continue;
            }
            stream_target = Some(head.event);
            break;
        }

        let Some(id) = stream_target else {
            return MotionIntake::Enqueue;
        };
        if let Some(motion) = self.pool.get_mut(id).and_then(EventEntry::motion_mut) {
            motion.append_sample(args.event_time, &args.pointer_coords);
        }
        self.stats.events_received += 1;
        trace!("Streaming MOVE sample into delivery in progress");
        self.dispatch_event_to_current_targets(now, id, true);
        MotionIntake::Streamed
    }

    /// Release everything still waiting in the inbound queue.
    pub(crate) fn drain_inbound_queue(&mut self) {
        while let Some(id) = self.inbound.pop_front() {
            self.release_inbound_event(id);
        }
    }

    /// Release the pending event and forget its targets.
    pub(crate) fn release_pending_event(&mut self) {
        if let Some(id) = self.pending_event.take() {
            // Targets outlive the event so later samples can stream into its delivery.
            self.reset_anr_timeouts();
            self.release_inbound_event(id);
        }
    }
}

/// HOME and ENDCALL from a trusted source, not canceled, bound for the user.
pub(crate) fn is_app_switch_key(entry: &EventEntry) -> bool {
    let Some(key) = entry.key() else {
        return false;
    };
    !key.flags.contains(KeyFlag::Canceled)
        && matches!(key.key_code, keycode::HOME | keycode::ENDCALL)
        && entry.policy_flags.contains(PolicyFlag::Trusted)
        && entry.policy_flags.contains(PolicyFlag::PassToUser)
}
