//! Touch state
//!
//! Windows participating in the current pointer gesture, with the pointer
//! ids each one owns when the gesture is split.

use std::sync::Arc;

use super::target::{TargetFlag, TargetFlags, DISPATCH_MASK};
use crate::event::{DeviceId, PointerIdBits, Source};
use crate::transport::ChannelId;
use crate::window::WindowInfo;

/// One window taking part in a gesture.
#[derive(Debug, Clone)]
pub struct TouchedWindow {
    /// Window snapshot
    pub window: Arc<WindowInfo>,
    /// Target flags accumulated during the gesture
    pub target_flags: TargetFlags,
    /// Pointer ids routed to this window (split gestures)
    pub pointer_ids: PointerIdBits,
}

impl TouchedWindow {
    /// Channel of the window.
    pub fn channel(&self) -> Option<ChannelId> {
        self.window.channel
    }
}

/// Gesture bookkeeping for touch routing.
#[derive(Debug, Clone, Default)]
pub struct TouchState {
    /// A pointer is down
    pub down: bool,
    /// Pointers are split across windows
    pub split: bool,
    /// Device of the gesture
    pub device_id: Option<DeviceId>,
    /// Source of the gesture
    pub source: Source,
    /// Participating windows, at most one entry per window
    pub windows: Vec<TouchedWindow>,
}

impl TouchState {
    /// Back to no gesture.
    pub fn reset(&mut self) {
        self.down = false;
        self.split = false;
        self.device_id = None;
        self.source = Source::UNKNOWN;
        self.windows.clear();
    }

    /// Add a window or merge flags and pointer ids into its entry.
    pub fn add_or_update_window(&mut self, window: &Arc<WindowInfo>, target_flags: TargetFlags, pointer_ids: PointerIdBits) {
        if target_flags.contains(TargetFlag::Split) {
            self.split = true;
        }
        if let Some(existing) = self.windows.iter_mut().find(|t| same_window(&t.window, window)) {
            existing.target_flags |= target_flags;
            if target_flags.contains(TargetFlag::DispatchAsSlipperyExit) {
                existing.target_flags.remove(TargetFlag::DispatchAsIs);
            }
            existing.pointer_ids = existing.pointer_ids.union(pointer_ids);
            return;
        }
        self.windows.push(TouchedWindow {
            window: window.clone(),
            target_flags,
            pointer_ids,
        });
    }

    /// Keep only windows that stay in the gesture, reduced to as-is delivery.
    ///
    /// Outside and hover windows only cared about the current event, and a
    /// window the touch slid out of has already been sent its CANCEL.
    pub fn filter_non_as_is_touch_windows(&mut self) {
        self.windows.retain_mut(|touched| {
            let flags = touched.target_flags;
            let keep = flags.intersects(TargetFlag::DispatchAsIs | TargetFlag::DispatchAsSlipperyEnter)
                && !flags.contains(TargetFlag::DispatchAsSlipperyExit);
            if keep {
                touched.target_flags = (flags & !DISPATCH_MASK) | TargetFlag::DispatchAsIs;
            }
            keep
        });
    }

    /// Exactly one foreground window, and it is slippery.
    pub fn is_slippery(&self) -> bool {
        let mut foreground = self
            .windows
            .iter()
            .filter(|t| t.target_flags.contains(TargetFlag::Foreground));
        match (foreground.next(), foreground.next()) {
            (Some(only), None) => only.window.is_slippery(),
            _ => false,
        }
    }

    /// First foreground window of the gesture.
    pub fn first_foreground_window(&self) -> Option<Arc<WindowInfo>> {
        self.windows
            .iter()
            .find(|t| t.target_flags.contains(TargetFlag::Foreground))
            .map(|t| t.window.clone())
    }

    /// Entry for the window bound to `channel`.
    pub fn find_by_channel(&self, channel: ChannelId) -> Option<usize> {
        self.windows.iter().position(|t| t.channel() == Some(channel))
    }

    /// Drop the window bound to `channel`; returns the removed entry.
    pub fn remove_by_channel(&mut self, channel: ChannelId) -> Option<TouchedWindow> {
        let index = self.find_by_channel(channel)?;
        Some(self.windows.remove(index))
    }
}

/// Windows are identified by their channel, falling back to name.
pub(crate) fn same_window(a: &WindowInfo, b: &WindowInfo) -> bool {
    match (a.channel, b.channel) {
        (Some(x), Some(y)) => x == y,
        _ => a.name == b.name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::Rect;

    fn window(id: u32) -> Arc<WindowInfo> {
        Arc::new(WindowInfo::new(
            format!("w{}", id),
            ChannelId::from_raw(id),
            Rect::new(0, 0, 10, 10),
        ))
    }

    #[test]
    fn test_add_or_update_merges_entries() {
        let mut state = TouchState::default();
        let a = window(1);
        state.add_or_update_window(&a, TargetFlag::Foreground | TargetFlag::DispatchAsIs, PointerIdBits::with(0));
        state.add_or_update_window(&a, TargetFlag::Split.into(), PointerIdBits::with(2));
        assert_eq!(state.windows.len(), 1);
        assert!(state.split);
        assert_eq!(state.windows[0].pointer_ids.count(), 2);
        assert!(state.windows[0].target_flags.contains(TargetFlag::Split));
    }

    #[test]
    fn test_filter_drops_outside_only_windows() {
        let mut state = TouchState::default();
        state.add_or_update_window(&window(1), TargetFlag::DispatchAsOutside.into(), PointerIdBits::empty());
        state.add_or_update_window(
            &window(2),
            TargetFlag::Foreground | TargetFlag::DispatchAsIs | TargetFlag::DispatchAsOutside,
            PointerIdBits::empty(),
        );
        state.filter_non_as_is_touch_windows();
        assert_eq!(state.windows.len(), 1);
        assert!(!state.windows[0].target_flags.contains(TargetFlag::DispatchAsOutside));
        assert_eq!(state.first_foreground_window().map(|w| w.name.clone()), Some("w2".to_string()));
    }

    #[test]
    fn test_slippery_exit_leaves_gesture() {
        let mut state = TouchState::default();
        let slippery = Arc::new(
            WindowInfo::new("s", ChannelId::from_raw(1), Rect::new(0, 0, 10, 10))
                .with_flags(crate::window::WindowFlag::Slippery),
        );
        state.add_or_update_window(&slippery, TargetFlag::Foreground | TargetFlag::DispatchAsIs, PointerIdBits::empty());
        assert!(state.is_slippery());

        state.add_or_update_window(&slippery, TargetFlag::DispatchAsSlipperyExit.into(), PointerIdBits::empty());
        // Only the CANCEL goes out; the crossing MOVE is not delivered as is.
        assert_eq!(
            state.windows[0].target_flags,
            TargetFlag::Foreground | TargetFlag::DispatchAsSlipperyExit
        );
        state.add_or_update_window(
            &window(2),
            TargetFlag::Foreground | TargetFlag::DispatchAsSlipperyEnter,
            PointerIdBits::empty(),
        );
        assert!(!state.is_slippery());

        state.filter_non_as_is_touch_windows();
        assert_eq!(state.windows.len(), 1);
        assert_eq!(state.windows[0].window.name, "w2");
        assert_eq!(
            state.windows[0].target_flags,
            TargetFlag::Foreground | TargetFlag::DispatchAsIs
        );
    }

    #[test]
    fn test_reset_clears_gesture() {
        let mut state = TouchState {
            down: true,
            split: true,
            device_id: Some(3),
            source: Source::TOUCHSCREEN,
            windows: Vec::new(),
        };
        state.add_or_update_window(&window(1), TargetFlag::Foreground.into(), PointerIdBits::empty());
        state.reset();
        assert!(!state.down && !state.split);
        assert!(state.device_id.is_none());
        assert!(state.windows.is_empty());
    }
}
