//! Target resolution
//!
//! Picks the channels that receive the pending event. Non-pointer events go
//! to the focused window; pointer events are routed by the touch state,
//! which is only committed once the injector is known to be allowed to
//! touch every foreground window involved. Hovering pointers are followed
//! from window to window with synthesized enter and exit deliveries.

use enumflags2::{bitflags, make_bitflags, BitFlags};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::pool::EventId;
use super::state::DispatcherState;
use super::touch::TouchState;
use crate::clock::Nsecs;
use crate::event::{DeviceId, InjectionResult, MotionAction, PointerIdBits, Source};
use crate::transport::ChannelId;
use crate::window::{WindowInfo, WindowType};

/// Per-target delivery flags.
#[bitflags]
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TargetFlag {
    /// Target counts toward the injector's pending foreground dispatches
    Foreground = 0x0001,
    /// Another window covers the touch point
    WindowIsObscured = 0x0002,
    /// Only the target's pointer ids are delivered
    Split = 0x0004,
    /// Coordinates are hidden from the target
    ZeroCoords = 0x0008,
    /// Deliver the event unchanged
    DispatchAsIs = 0x0100,
    /// Deliver the event as OUTSIDE
    DispatchAsOutside = 0x0200,
    /// Deliver the event as HOVER_ENTER
    DispatchAsHoverEnter = 0x0400,
    /// Deliver the event as HOVER_EXIT
    DispatchAsHoverExit = 0x0800,
    /// Deliver the event as CANCEL; the touch slid out of the window
    DispatchAsSlipperyExit = 0x1000,
    /// Deliver the event as DOWN; the touch slid into the window
    DispatchAsSlipperyEnter = 0x2000,
}

/// Set of [`TargetFlag`]s.
pub type TargetFlags = BitFlags<TargetFlag>;

/// Flags that select a dispatch mode.
pub const DISPATCH_MASK: TargetFlags = make_bitflags!(TargetFlag::{
    DispatchAsIs | DispatchAsOutside | DispatchAsHoverEnter | DispatchAsHoverExit | DispatchAsSlipperyExit | DispatchAsSlipperyEnter
});

/// Dispatch modes in the order their entries are queued on a connection.
pub(crate) const DISPATCH_MODES: [TargetFlag; 6] = [
    TargetFlag::DispatchAsHoverExit,
    TargetFlag::DispatchAsOutside,
    TargetFlag::DispatchAsHoverEnter,
    TargetFlag::DispatchAsIs,
    TargetFlag::DispatchAsSlipperyExit,
    TargetFlag::DispatchAsSlipperyEnter,
];

/// One recipient of the pending event.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTarget {
    /// Receiving channel
    pub channel: ChannelId,
    /// Delivery flags
    pub flags: TargetFlags,
    /// Added by the consumer to display X to get window X
    pub x_offset: f32,
    /// Added by the consumer to display Y to get window Y
    pub y_offset: f32,
    /// Pointer ids owned by the target (split gestures)
    pub pointer_ids: PointerIdBits,
}

/// Outcome of target resolution.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resolution {
    /// Targets chosen; deliver now
    Ready(Vec<InputTarget>),
    /// Targets not ready; retry at the next wakeup
    Pending,
    /// Give up on the event with this injection result
    Failed(InjectionResult),
}

/// Touch resolution plus what the caller must do around delivery.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TouchResolution {
    pub(crate) resolution: Resolution,
    /// Pointer state must be cancelled everywhere before delivery
    pub(crate) conflicting: bool,
    /// Deliver samples up to this index now; the rest become a new event
    pub(crate) split_batch_after: Option<usize>,
}

impl From<Resolution> for TouchResolution {
    fn from(resolution: Resolution) -> Self {
        Self {
            resolution,
            conflicting: false,
            split_batch_after: None,
        }
    }
}

/// How the touch scan ended; only settled scans commit touch state.
enum TouchExit {
    Settled(Resolution),
    Unresponsive(Resolution),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permission {
    Unknown,
    Granted,
    Denied,
}

/// The parts of the pending motion that routing looks at.
struct TouchProbe {
    action: MotionAction,
    device_id: DeviceId,
    source: Source,
    x: i32,
    y: i32,
    pointer_id: i32,
    pointer_count: usize,
}

/// Working state of one touch scan.
struct TouchScan {
    temp: TouchState,
    is_split: bool,
    permission: Permission,
    new_hover: Option<Arc<WindowInfo>>,
    split_batch_after: Option<usize>,
}

impl DispatcherState {
    /// Resolve the focused window for a key or non-pointer motion.
    pub(crate) fn find_focused_window_targets(
        &mut self,
        now: Nsecs,
        id: EventId,
        next_wakeup: &mut Nsecs,
    ) -> Resolution {
        let Some(window) = self.focused_window.clone() else {
            if let Some(application) = self.focused_application.clone() {
                debug!(
                    "No focused window yet, waiting on focused application '{}'",
                    application.name
                );
                return self.handle_targets_not_ready(now, id, Some(&application), None, next_wakeup);
            }
            info!("No focused window or application, dropping event");
            return Resolution::Failed(InjectionResult::Failed);
        };

        if !self.check_injection_permission(Some(&window), id) {
            return Resolution::Failed(InjectionResult::PermissionDenied);
        }

        let application = self.focused_application.clone();
        if window.paused {
            debug!("Focused window '{}' is paused, waiting", window.name);
            return self.handle_targets_not_ready(now, id, application.as_ref(), Some(&window), next_wakeup);
        }

        if !self.is_window_finished_with_previous_input(&window) {
            debug!("Focused window '{}' still busy, waiting", window.name);
            return self.handle_targets_not_ready(now, id, application.as_ref(), Some(&window), next_wakeup);
        }

        let mut targets = Vec::with_capacity(1 + self.monitoring_channels.len());
        add_window_target(
            &window,
            TargetFlag::Foreground | TargetFlag::DispatchAsIs,
            PointerIdBits::empty(),
            &mut targets,
        );
        Resolution::Ready(targets)
    }

    /// Resolve touched windows for a pointer motion.
    ///
    /// Besides touches this routes hover and scroll actions, moves a
    /// single-pointer drag across slippery windows, and tells the previously
    /// hovered window when the pointer left it. The touch state is only
    /// updated once injection permission is known to be granted.
    pub(crate) fn find_touched_window_targets(
        &mut self,
        now: Nsecs,
        id: EventId,
        next_wakeup: &mut Nsecs,
    ) -> TouchResolution {
        let Some(probe) = self.touch_probe(id) else {
            error!("Touch resolution requested for a non-motion event");
            return TouchResolution::from(Resolution::Failed(InjectionResult::Failed));
        };

        let switched_device = self
            .touch_state
            .device_id
            .is_some_and(|device| device != probe.device_id || self.touch_state.source != probe.source);
        let is_hover = probe.action.is_hover();
        let new_gesture = is_hover || matches!(probe.action, MotionAction::Down | MotionAction::Scroll);

        let mut scan = TouchScan {
            temp: self.touch_state.clone(),
            is_split: self.touch_state.split,
            permission: Permission::Unknown,
            new_hover: None,
            split_batch_after: None,
        };
        if new_gesture {
            let down = probe.action == MotionAction::Down;
            if switched_device && self.touch_state.down && !down {
                debug!("A pointer of another device is already down, dropping event");
                return TouchResolution::from(Resolution::Failed(InjectionResult::Failed));
            }
            scan.is_split = false;
            scan.temp = TouchState {
                down,
                device_id: Some(probe.device_id),
                source: probe.source,
                ..TouchState::default()
            };
        }

        let resolution = match self.scan_touch(now, id, &probe, new_gesture, &mut scan, next_wakeup) {
            TouchExit::Unresponsive(resolution) => return TouchResolution::from(resolution),
            TouchExit::Settled(resolution) => resolution,
        };

        if scan.permission == Permission::Unknown {
            scan.permission = if self.check_injection_permission(None, id) {
                Permission::Granted
            } else {
                Permission::Denied
            };
        }

        let mut conflicting = false;
        if scan.permission == Permission::Granted {
            if switched_device {
                debug!("Touch switched to a different device");
                conflicting = true;
            }
            let mut temp = scan.temp;
            if is_hover {
                if self.touch_state.down {
                    debug!("Hover received while a pointer is down");
                    conflicting = true;
                }
                self.touch_state.reset();
                if matches!(probe.action, MotionAction::HoverEnter | MotionAction::HoverMove) {
                    self.touch_state.device_id = Some(probe.device_id);
                    self.touch_state.source = probe.source;
                }
            } else {
                match probe.action {
                    MotionAction::Up | MotionAction::Cancel => self.touch_state.reset(),
                    MotionAction::Down => {
                        if self.touch_state.down {
                            debug!("Touch down while already down");
                            conflicting = true;
                        }
                        self.touch_state = temp;
                    }
                    MotionAction::PointerUp(_) => {
                        if scan.is_split {
                            temp.windows.retain_mut(|touched| {
                                if touched.target_flags.contains(TargetFlag::Split) {
                                    touched.pointer_ids.clear(probe.pointer_id);
                                    return !touched.pointer_ids.is_empty();
                                }
                                true
                            });
                        }
                        self.touch_state = temp;
                    }
                    // Scroll targets only hold for the one event.
                    MotionAction::Scroll => {}
                    _ => self.touch_state = temp,
                }
            }
            self.last_hover_window = scan.new_hover;
        } else {
            debug!("Injection denied, touch state unchanged");
        }

        TouchResolution {
            resolution,
            conflicting,
            split_batch_after: scan.split_batch_after,
        }
    }

    fn scan_touch(
        &mut self,
        now: Nsecs,
        id: EventId,
        probe: &TouchProbe,
        new_gesture: bool,
        scan: &mut TouchScan,
        next_wakeup: &mut Nsecs,
    ) -> TouchExit {
        let is_down = probe.action == MotionAction::Down;
        let splittable_pointer_down = scan.is_split && matches!(probe.action, MotionAction::PointerDown(_));
        let (x, y) = (probe.x, probe.y);

        if new_gesture || splittable_pointer_down {
            let mut new_touched: Option<Arc<WindowInfo>> = None;
            let mut top_error: Option<Arc<WindowInfo>> = None;
            let mut touched_is_modal = false;

            for window in &self.windows {
                if window.is_system_error() && top_error.is_none() {
                    top_error = Some(window.clone());
                }
                if !window.visible {
                    continue;
                }
                if window.is_touchable() {
                    touched_is_modal = window.is_touch_modal();
                    if touched_is_modal || window.touchable_area_contains(x, y) {
                        // The screen-off gate never fires: touches are never marked
                        // as having woken the device.
                        new_touched = Some(window.clone());
                        break;
                    }
                }
                if is_down && window.watches_outside_touch() {
                    let mut flags = TargetFlags::from(TargetFlag::DispatchAsOutside);
                    if self.is_window_obscured_at_point(window, x, y) {
                        flags |= TargetFlag::WindowIsObscured;
                    }
                    scan.temp.add_or_update_window(window, flags, PointerIdBits::empty());
                }
            }

            if let Some(error_window) = &top_error {
                let error_is_touched = new_touched
                    .as_ref()
                    .is_some_and(|w| super::touch::same_window(w, error_window));
                if !error_is_touched {
                    debug!("System error window '{}' has not taken the touch, waiting", error_window.name);
                    let resolution = self.handle_targets_not_ready(now, id, None, None, next_wakeup);
                    return TouchExit::Unresponsive(resolution);
                }
            }

            if new_touched.as_ref().is_some_and(|w| w.supports_split_touch()) {
                scan.is_split = true;
            } else if scan.is_split {
                new_touched = scan.temp.first_foreground_window();
            }

            let Some(touched) = new_touched else {
                if let Some(application) = self.focused_application.clone() {
                    debug!(
                        "No touchable window yet, waiting on focused application '{}'",
                        application.name
                    );
                    let resolution = self.handle_targets_not_ready(now, id, Some(&application), None, next_wakeup);
                    return TouchExit::Unresponsive(resolution);
                }
                info!("No touched window or focused application, dropping event");
                return TouchExit::Settled(Resolution::Failed(InjectionResult::Failed));
            };

            let mut flags = TargetFlag::Foreground | TargetFlag::DispatchAsIs;
            if scan.is_split {
                flags |= TargetFlag::Split;
            }
            if self.is_window_obscured_at_point(&touched, x, y) {
                flags |= TargetFlag::WindowIsObscured;
            }

            if probe.action.is_hover() {
                if !touched_is_modal {
                    // Samples that wander off the window go out as a separate event.
                    scan.split_batch_after = self.first_sample_leaving(id, &touched);
                }
                scan.new_hover = Some(touched.clone());
            } else if probe.action == MotionAction::Scroll {
                scan.new_hover = self.last_hover_window.clone();
            }

            let mut pointer_ids = PointerIdBits::empty();
            if scan.is_split {
                pointer_ids.mark(probe.pointer_id);
            }
            scan.temp.add_or_update_window(&touched, flags, pointer_ids);
        } else {
            if !scan.temp.down {
                debug!("Pointer is not down, dropping event");
                return TouchExit::Settled(Resolution::Failed(InjectionResult::Failed));
            }

            if probe.action == MotionAction::Move && probe.pointer_count == 1 && scan.temp.is_slippery() {
                let old_touched = scan.temp.first_foreground_window();
                let new_touched = self.find_touched_window_at(x, y);
                if let (Some(old_touched), Some(new_touched)) = (old_touched, new_touched) {
                    if !super::touch::same_window(&old_touched, &new_touched) {
                        debug!(
                            "Touch is slipping out of '{}' into '{}'",
                            old_touched.name, new_touched.name
                        );
                        scan.temp.add_or_update_window(
                            &old_touched,
                            TargetFlag::DispatchAsSlipperyExit.into(),
                            PointerIdBits::empty(),
                        );

                        if new_touched.supports_split_touch() {
                            scan.is_split = true;
                        }
                        let mut flags = TargetFlag::Foreground | TargetFlag::DispatchAsSlipperyEnter;
                        if scan.is_split {
                            flags |= TargetFlag::Split;
                        }
                        if self.is_window_obscured_at_point(&new_touched, x, y) {
                            flags |= TargetFlag::WindowIsObscured;
                        }
                        let mut pointer_ids = PointerIdBits::empty();
                        if scan.is_split {
                            pointer_ids.mark(probe.pointer_id);
                        }
                        scan.temp.add_or_update_window(&new_touched, flags, pointer_ids);

                        // Exactly one sample crosses the boundary.
                        scan.split_batch_after = Some(0);
                    }
                }
            }
        }

        let hover_changed = match (&scan.new_hover, &self.last_hover_window) {
            (Some(new), Some(last)) => !super::touch::same_window(new, last),
            (None, None) => false,
            _ => true,
        };
        if hover_changed {
            // ENTER and EXIT each carry exactly one sample.
            scan.split_batch_after = Some(0);
            if let Some(last) = &self.last_hover_window {
                debug!("Sending hover exit to '{}'", last.name);
                scan.temp
                    .add_or_update_window(last, TargetFlag::DispatchAsHoverExit.into(), PointerIdBits::empty());
            }
            if let Some(new) = &scan.new_hover {
                debug!("Sending hover enter to '{}'", new.name);
                scan.temp
                    .add_or_update_window(new, TargetFlag::DispatchAsHoverEnter.into(), PointerIdBits::empty());
            }
        }

        let temp = &mut scan.temp;
        let foreground: Vec<Arc<WindowInfo>> = temp
            .windows
            .iter()
            .filter(|t| t.target_flags.contains(TargetFlag::Foreground))
            .map(|t| t.window.clone())
            .collect();
        for window in &foreground {
            if !self.check_injection_permission(Some(window), id) {
                scan.permission = Permission::Denied;
                return TouchExit::Settled(Resolution::Failed(InjectionResult::PermissionDenied));
            }
        }
        let Some(first_foreground) = foreground.first().cloned() else {
            debug!("No foreground window holds the touch, dropping event");
            return TouchExit::Settled(Resolution::Failed(InjectionResult::Failed));
        };
        scan.permission = Permission::Granted;

        if is_down {
            let outsiders: Vec<Arc<WindowInfo>> = temp
                .windows
                .iter()
                .filter(|t| {
                    t.target_flags.contains(TargetFlag::DispatchAsOutside)
                        && t.window.owner_uid != first_foreground.owner_uid
                })
                .map(|t| t.window.clone())
                .collect();
            for window in &outsiders {
                temp.add_or_update_window(window, TargetFlag::ZeroCoords.into(), PointerIdBits::empty());
            }
        }

        for window in &foreground {
            if window.paused {
                debug!("Touched window '{}' is paused, waiting", window.name);
                let resolution = self.handle_targets_not_ready(now, id, None, Some(window), next_wakeup);
                return TouchExit::Unresponsive(resolution);
            }
            if !self.is_window_finished_with_previous_input(window) {
                debug!("Touched window '{}' still busy, waiting", window.name);
                let resolution = self.handle_targets_not_ready(now, id, None, Some(window), next_wakeup);
                return TouchExit::Unresponsive(resolution);
            }
        }

        // Wallpapers only take part in touch gestures, never hover or scroll.
        if is_down && first_foreground.has_wallpaper {
            for window in self.windows.iter().filter(|w| w.window_type == WindowType::Wallpaper) {
                temp.add_or_update_window(
                    window,
                    TargetFlag::WindowIsObscured | TargetFlag::DispatchAsIs,
                    PointerIdBits::empty(),
                );
            }
        }

        let mut targets = Vec::with_capacity(temp.windows.len() + self.monitoring_channels.len());
        for touched in &temp.windows {
            add_window_target(&touched.window, touched.target_flags, touched.pointer_ids, &mut targets);
        }
        temp.filter_non_as_is_touch_windows();

        TouchExit::Settled(Resolution::Ready(targets))
    }

    /// Index of the last hover sample before the pointer leaves `window`.
    fn first_sample_leaving(&self, id: EventId, window: &WindowInfo) -> Option<usize> {
        let motion = self.pool.get(id)?.motion()?;
        motion.samples.iter().skip(1).position(|sample| {
            sample
                .coords
                .first()
                .is_some_and(|c| !window.touchable_area_contains(c.x as i32, c.y as i32))
        })
    }

    fn touch_probe(&self, id: EventId) -> Option<TouchProbe> {
        let motion = self.pool.get(id)?.motion()?;
        let index = motion.action.pointer_index();
        let coords = motion.first_sample().coords.get(index)?;
        Some(TouchProbe {
            action: motion.action,
            device_id: motion.device_id,
            source: motion.source,
            x: coords.x as i32,
            y: coords.y as i32,
            pointer_id: motion.pointer_properties.get(index)?.id,
            pointer_count: motion.pointer_count(),
        })
    }

    /// Injection permission for delivering `id` to `window` (or to nothing in particular).
    pub(crate) fn check_injection_permission(&self, window: Option<&WindowInfo>, id: EventId) -> bool {
        let Some(ticket) = self.pool.get(id).and_then(|entry| entry.injection.clone()) else {
            return true;
        };
        let foreign = window.map_or(true, |w| w.owner_uid != ticket.injector_uid);
        if foreign && !ticket.has_permission {
            match window {
                Some(w) => warn!(
                    "Permission denied: injecting event from pid {} uid {} to window {} owned by uid {}",
                    ticket.injector_pid, ticket.injector_uid, w.name, w.owner_uid
                ),
                None => warn!(
                    "Permission denied: injecting event from pid {} uid {}",
                    ticket.injector_pid, ticket.injector_uid
                ),
            }
            return false;
        }
        true
    }

    /// A visible, untrusted window in front of `window` covers the point.
    pub(crate) fn is_window_obscured_at_point(&self, window: &WindowInfo, x: i32, y: i32) -> bool {
        for other in &self.windows {
            if super::touch::same_window(other, window) {
                break;
            }
            if other.visible && !other.is_trusted_overlay() && other.frame_contains(x, y) {
                return true;
            }
        }
        false
    }

    /// No connection, or nothing left in its outbound queue.
    pub(crate) fn is_window_finished_with_previous_input(&self, window: &WindowInfo) -> bool {
        window
            .channel
            .and_then(|channel| self.connections.get(&channel))
            .map_or(true, |connection| connection.outbound_queue.is_empty())
    }

    /// Monitors receive everything unchanged in display coordinates.
    pub(crate) fn add_monitoring_targets(&self, targets: &mut Vec<InputTarget>) {
        targets.extend(self.monitoring_channels.iter().map(|&channel| InputTarget {
            channel,
            flags: TargetFlag::DispatchAsIs.into(),
            x_offset: 0.0,
            y_offset: 0.0,
            pointer_ids: PointerIdBits::empty(),
        }));
    }
}

fn add_window_target(window: &WindowInfo, flags: TargetFlags, pointer_ids: PointerIdBits, out: &mut Vec<InputTarget>) {
    let Some(channel) = window.channel else {
        return;
    };
    out.push(InputTarget {
        channel,
        flags,
        x_offset: -(window.frame.left as f32),
        y_offset: -(window.frame.top as f32),
        pointer_ids,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::Rect;

    #[test]
    fn test_window_target_offsets() {
        let window = WindowInfo::new("w", ChannelId::from_raw(3), Rect::new(10, 20, 110, 220));
        let mut targets = Vec::new();
        add_window_target(&window, TargetFlag::DispatchAsIs.into(), PointerIdBits::empty(), &mut targets);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].x_offset, -10.0);
        assert_eq!(targets[0].y_offset, -20.0);
    }

    #[test]
    fn test_window_without_channel_is_not_a_target() {
        let mut window = WindowInfo::new("w", ChannelId::from_raw(3), Rect::new(0, 0, 1, 1));
        window.channel = None;
        let mut targets = Vec::new();
        add_window_target(&window, TargetFlag::DispatchAsIs.into(), PointerIdBits::empty(), &mut targets);
        assert!(targets.is_empty());
    }

    #[test]
    fn test_dispatch_mask() {
        let flags = TargetFlag::Foreground | TargetFlag::DispatchAsOutside | TargetFlag::Split;
        assert_eq!(flags & DISPATCH_MASK, TargetFlags::from(TargetFlag::DispatchAsOutside));
        assert_eq!(
            (flags & !DISPATCH_MASK) | TargetFlag::DispatchAsIs,
            TargetFlag::Foreground | TargetFlag::Split | TargetFlag::DispatchAsIs
        );
    }
}
