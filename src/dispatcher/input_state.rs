//! Per-connection consistency tracker
//!
//! Remembers which keys and pointers a target currently believes are down
//! (or hovering), so that the dispatcher can judge incoming events and
//! synthesize UP, CANCEL or HOVER_EXIT records when the target has to be
//! brought back to neutral. Also remembers which fallback key stands in for
//! each unhandled key the policy substituted.

use std::collections::BTreeMap;
use tracing::debug;

use crate::clock::Nsecs;
use crate::event::{
    DeviceId, EventEntry, EventKind, InterceptKeyResult, KeyAction, KeyEntry, KeyFlag, KeyFlags, MotionAction,
    MotionEntry, MotionFlags, MotionSample, PointerCoords, PointerProperties, PointerVec, PolicyFlags, Source,
};

/// Verdict of feeding an event through the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// State updated normally
    Consistent,
    /// Odd but deliverable (duplicate DOWN, unmatched key UP)
    Tolerable,
    /// Contradicts what the target has seen; do not deliver
    Broken,
}

impl Consistency {
    /// True unless the event must be discarded.
    pub fn is_deliverable(self) -> bool {
        self != Self::Broken
    }
}

/// Which tracked state to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelationMode {
    /// Everything
    All,
    /// Pointer-class motions only
    Pointer,
    /// Keys and non-pointer motions
    NonPointer,
    /// Fallback keys only
    Fallback,
}

/// Filter for cancellation synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelationOptions {
    /// What to cancel
    pub mode: CancelationMode,
    /// Logged with every synthesized record
    pub reason: &'static str,
    /// Only this device
    pub device_id: Option<DeviceId>,
    /// Only this key code
    pub key_code: Option<i32>,
}

impl CancelationOptions {
    /// Options for `mode`.
    pub fn new(mode: CancelationMode, reason: &'static str) -> Self {
        Self {
            mode,
            reason,
            device_id: None,
            key_code: None,
        }
    }

    /// Restrict to one device.
    pub fn for_device(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    /// Restrict to one key code.
    pub fn for_key_code(mut self, key_code: i32) -> Self {
        self.key_code = Some(key_code);
        self
    }

    fn matches_key(&self, memento: &KeyMemento) -> bool {
        if self.key_code.is_some_and(|code| code != memento.key_code) {
            return false;
        }
        if self.device_id.is_some_and(|device| device != memento.device_id) {
            return false;
        }
        match self.mode {
            CancelationMode::All | CancelationMode::NonPointer => true,
            CancelationMode::Fallback => memento.flags.contains(KeyFlag::Fallback),
            CancelationMode::Pointer => false,
        }
    }

    fn matches_motion(&self, memento: &MotionMemento) -> bool {
        if self.device_id.is_some_and(|device| device != memento.device_id) {
            return false;
        }
        match self.mode {
            CancelationMode::All => true,
            CancelationMode::Pointer => memento.source.is_pointer(),
            CancelationMode::NonPointer => !memento.source.is_pointer(),
            CancelationMode::Fallback => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct KeyMemento {
    device_id: DeviceId,
    source: Source,
    key_code: i32,
    scan_code: i32,
    flags: KeyFlags,
    down_time: Nsecs,
}

#[derive(Debug, Clone, PartialEq)]
struct MotionMemento {
    device_id: DeviceId,
    source: Source,
    x_precision: f32,
    y_precision: f32,
    down_time: Nsecs,
    pointer_properties: PointerVec<PointerProperties>,
    pointer_coords: PointerVec<PointerCoords>,
    hovering: bool,
}

impl MotionMemento {
    fn from_entry(entry: &MotionEntry, hovering: bool) -> Self {
        let mut memento = Self {
            device_id: entry.device_id,
            source: entry.source,
            x_precision: entry.x_precision,
            y_precision: entry.y_precision,
            down_time: entry.down_time,
            pointer_properties: PointerVec::new(),
            pointer_coords: PointerVec::new(),
            hovering,
        };
        memento.set_pointers(entry);
        memento
    }

    fn set_pointers(&mut self, entry: &MotionEntry) {
        self.pointer_properties = entry.pointer_properties.clone();
        self.pointer_coords = entry.last_sample().coords.clone();
    }

    fn remove_pointer(&mut self, index: usize) {
        if index < self.pointer_properties.len() {
            self.pointer_properties.remove(index);
        }
        if index < self.pointer_coords.len() {
            self.pointer_coords.remove(index);
        }
    }
}

/// Consistency tracker for one connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputState {
    keys: Vec<KeyMemento>,
    motions: Vec<MotionMemento>,
    /// Original key code to the fallback key code delivered in its place
    fallback_keys: BTreeMap<i32, i32>,
}

impl InputState {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Nothing is down.
    pub fn is_neutral(&self) -> bool {
        self.keys.is_empty() && self.motions.is_empty()
    }

    /// Keys currently down.
    pub fn down_key_count(&self) -> usize {
        self.keys.len()
    }

    /// Pointer gestures currently down.
    pub fn down_motion_count(&self) -> usize {
        self.motions.len()
    }

    /// A hovering pointer of this device and source is inside the target.
    pub fn is_hovering(&self, device_id: DeviceId, source: Source) -> bool {
        self.motions
            .iter()
            .any(|m| m.device_id == device_id && m.source == source && m.hovering)
    }

    /// Forget everything, fallback keys included.
    pub fn clear(&mut self) {
        self.keys.clear();
        self.motions.clear();
        self.fallback_keys.clear();
    }

    /// Fallback key standing in for `original_key_code`. [`crate::event::keycode::UNKNOWN`]
    /// means the policy declined to substitute one.
    pub fn fallback_key(&self, original_key_code: i32) -> Option<i32> {
        self.fallback_keys.get(&original_key_code).copied()
    }

    /// Record the fallback for `original_key_code`.
    pub fn set_fallback_key(&mut self, original_key_code: i32, fallback_key_code: i32) {
        self.fallback_keys.insert(original_key_code, fallback_key_code);
    }

    /// Forget the fallback for `original_key_code`.
    pub fn remove_fallback_key(&mut self, original_key_code: i32) {
        self.fallback_keys.remove(&original_key_code);
    }

    fn find_key(&self, entry: &KeyEntry) -> Option<usize> {
        self.keys.iter().position(|m| {
            m.device_id == entry.device_id
                && m.source == entry.source
                && m.key_code == entry.key_code
                && m.scan_code == entry.scan_code
        })
    }

    fn find_motion(&self, entry: &MotionEntry, hovering: bool) -> Option<usize> {
        self.motions
            .iter()
            .position(|m| m.device_id == entry.device_id && m.source == entry.source && m.hovering == hovering)
    }

    /// Feed a key about to be delivered with `action` and `flags`.
    pub fn track_key(&mut self, entry: &KeyEntry, action: KeyAction, flags: KeyFlags) -> Consistency {
        match action {
            KeyAction::Up => {
                if entry.flags.contains(KeyFlag::Fallback) {
                    self.fallback_keys.retain(|_, fallback| *fallback != entry.key_code);
                }
                self.track_key_up(entry)
            }
            KeyAction::Down => {
                let verdict = match self.find_key(entry) {
                    Some(index) => {
                        self.keys.remove(index);
                        Consistency::Tolerable
                    }
                    None => Consistency::Consistent,
                };
                self.keys.push(KeyMemento {
                    device_id: entry.device_id,
                    source: entry.source,
                    key_code: entry.key_code,
                    scan_code: entry.scan_code,
                    flags,
                    down_time: entry.down_time,
                });
                verdict
            }
            KeyAction::Multiple => Consistency::Consistent,
        }
    }

    fn track_key_up(&mut self, entry: &KeyEntry) -> Consistency {
        match self.find_key(entry) {
            Some(index) => {
                self.keys.remove(index);
                Consistency::Consistent
            }
            None => Consistency::Tolerable,
        }
    }

    /// Feed a motion about to be delivered with `action`.
    pub fn track_motion(&mut self, entry: &MotionEntry, action: MotionAction) -> Consistency {
        let existing = self.find_motion(entry, false);
        match action {
            MotionAction::Up | MotionAction::Cancel => match existing {
                Some(index) => {
                    self.motions.remove(index);
                    Consistency::Consistent
                }
                None => Consistency::Broken,
            },
            MotionAction::Down => {
                let verdict = match existing {
                    Some(index) => {
                        self.motions.remove(index);
                        Consistency::Tolerable
                    }
                    None => Consistency::Consistent,
                };
                self.motions.push(MotionMemento::from_entry(entry, false));
                verdict
            }
            MotionAction::PointerUp(index) => match existing {
                Some(position) => {
                    let memento = &mut self.motions[position];
                    if memento.pointer_properties.len() != entry.pointer_count() {
                        return Consistency::Broken;
                    }
                    memento.set_pointers(entry);
                    memento.remove_pointer(index);
                    Consistency::Consistent
                }
                None => Consistency::Broken,
            },
            MotionAction::PointerDown(_) | MotionAction::Move => match existing {
                Some(position) => {
                    self.motions[position].set_pointers(entry);
                    Consistency::Consistent
                }
                None if action == MotionAction::Move
                    && (entry.source.has_class(Source::CLASS_JOYSTICK)
                        || entry.source.has_class(Source::CLASS_NAVIGATION)) =>
                {
                    // Joysticks and trackballs move without a preceding DOWN.
                    Consistency::Consistent
                }
                None => Consistency::Broken,
            },
            MotionAction::Outside | MotionAction::Scroll => Consistency::Consistent,
            MotionAction::HoverMove | MotionAction::HoverEnter | MotionAction::HoverExit => {
                self.track_hover(entry, action)
            }
        }
    }

    fn track_hover(&mut self, entry: &MotionEntry, action: MotionAction) -> Consistency {
        let existing = self.find_motion(entry, true);
        if action == MotionAction::HoverExit {
            return match existing {
                Some(index) => {
                    self.motions.remove(index);
                    Consistency::Consistent
                }
                None => Consistency::Broken,
            };
        }
        if let Some(index) = existing {
            self.motions.remove(index);
        }
        self.motions.push(MotionMemento::from_entry(entry, true));
        Consistency::Consistent
    }

    /// Build UP/CANCEL records for every tracked key or gesture matching
    /// `options`. Tracked state is cleared as the records are delivered.
    pub fn synthesize_cancelation_events(&self, now: Nsecs, options: &CancelationOptions) -> Vec<EventEntry> {
        let mut events = Vec::new();

        for memento in self.keys.iter().filter(|m| options.matches_key(m)) {
            debug!(
                "Synthesizing key up: key_code={} device={} ({})",
                memento.key_code, memento.device_id, options.reason
            );
            events.push(EventEntry::new(
                now,
                PolicyFlags::empty(),
                EventKind::Key(KeyEntry {
                    device_id: memento.device_id,
                    source: memento.source,
                    action: KeyAction::Up,
                    flags: memento.flags | KeyFlag::Canceled,
                    key_code: memento.key_code,
                    scan_code: memento.scan_code,
                    meta_state: 0,
                    repeat_count: 0,
                    down_time: memento.down_time,
                    synthetic_repeat: false,
                    intercept_result: InterceptKeyResult::Unknown,
                    intercept_wakeup_time: 0,
                }),
            ));
        }

        for memento in self.motions.iter().filter(|m| options.matches_motion(m)) {
            let action = if memento.hovering {
                MotionAction::HoverExit
            } else {
                MotionAction::Cancel
            };
            debug!(
                "Synthesizing motion {:?}: device={} pointers={} ({})",
                action,
                memento.device_id,
                memento.pointer_properties.len(),
                options.reason
            );
            events.push(EventEntry::new(
                now,
                PolicyFlags::empty(),
                EventKind::Motion(MotionEntry {
                    device_id: memento.device_id,
                    source: memento.source,
                    action,
                    flags: MotionFlags::empty(),
                    meta_state: 0,
                    edge_flags: 0,
                    x_precision: memento.x_precision,
                    y_precision: memento.y_precision,
                    down_time: memento.down_time,
                    pointer_properties: memento.pointer_properties.clone(),
                    samples: vec![MotionSample::new(now, &memento.pointer_coords)],
                }),
            ));
        }

        events
    }

    /// Replace `other`'s pointer gestures with the ones tracked here,
    /// device by device.
    pub fn copy_pointer_state_to(&self, other: &mut InputState) {
        for memento in self.motions.iter().filter(|m| m.source.is_pointer()) {
            other
                .motions
                .retain(|o| !(o.device_id == memento.device_id && o.source == memento.source));
            other.motions.push(memento.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{keycode, NotifyKeyArgs, NotifyMotionArgs};
    use proptest::prelude::*;

    fn key(action: KeyAction, code: i32) -> KeyEntry {
        let args = NotifyKeyArgs::new(0, 1, action, code);
        let entry = EventEntry::from_key_args(&args, PolicyFlags::empty(), KeyFlags::empty(), 0);
        entry.key().cloned().expect("key")
    }

    fn motion(action: MotionAction, pointers: &[(i32, f32, f32)]) -> MotionEntry {
        let args = NotifyMotionArgs::touch(0, 1, action, 0, pointers);
        let entry = EventEntry::from_motion_args(&args, PolicyFlags::empty());
        entry.motion().cloned().expect("motion")
    }

    #[test]
    fn test_key_down_up_returns_to_neutral() {
        let mut state = InputState::new();
        let down = key(KeyAction::Down, keycode::A);
        assert_eq!(state.track_key(&down, KeyAction::Down, KeyFlags::empty()), Consistency::Consistent);
        assert!(!state.is_neutral());
        assert_eq!(state.track_key(&down, KeyAction::Down, KeyFlags::empty()), Consistency::Tolerable);
        assert_eq!(state.down_key_count(), 1);
        let up = key(KeyAction::Up, keycode::A);
        assert_eq!(state.track_key(&up, KeyAction::Up, KeyFlags::empty()), Consistency::Consistent);
        assert!(state.is_neutral());
    }

    #[test]
    fn test_unmatched_key_up_is_tolerated() {
        let mut state = InputState::new();
        let up = key(KeyAction::Up, keycode::B);
        assert_eq!(state.track_key(&up, KeyAction::Up, KeyFlags::empty()), Consistency::Tolerable);
    }

    #[test]
    fn test_motion_without_down_is_broken() {
        let mut state = InputState::new();
        let mv = motion(MotionAction::Move, &[(0, 1.0, 1.0)]);
        assert_eq!(state.track_motion(&mv, MotionAction::Move), Consistency::Broken);
        let up = motion(MotionAction::Up, &[(0, 1.0, 1.0)]);
        assert_eq!(state.track_motion(&up, MotionAction::Up), Consistency::Broken);
    }

    #[test]
    fn test_trackball_move_without_down_is_consistent() {
        let mut state = InputState::new();
        let mut mv = motion(MotionAction::Move, &[(0, 1.0, 1.0)]);
        mv.source = Source::TRACKBALL;
        assert_eq!(state.track_motion(&mv, MotionAction::Move), Consistency::Consistent);
        assert!(state.is_neutral());
    }

    #[test]
    fn test_pointer_up_count_mismatch_is_broken() {
        let mut state = InputState::new();
        let down = motion(MotionAction::Down, &[(0, 1.0, 1.0)]);
        state.track_motion(&down, MotionAction::Down);
        let pointer_up = motion(MotionAction::PointerUp(1), &[(0, 1.0, 1.0), (1, 2.0, 2.0)]);
        assert_eq!(
            state.track_motion(&pointer_up, MotionAction::PointerUp(1)),
            Consistency::Broken
        );
    }

    #[test]
    fn test_cancel_synthesis_uses_last_coords() {
        let mut state = InputState::new();
        let down = motion(MotionAction::Down, &[(0, 1.0, 1.0)]);
        state.track_motion(&down, MotionAction::Down);
        let second = motion(MotionAction::PointerDown(1), &[(0, 5.0, 5.0), (1, 9.0, 9.0)]);
        state.track_motion(&second, MotionAction::PointerDown(1));
        let k = key(KeyAction::Down, keycode::A);
        state.track_key(&k, KeyAction::Down, KeyFlags::empty());

        let pointer_only = state
            .synthesize_cancelation_events(100, &CancelationOptions::new(CancelationMode::Pointer, "test"));
        assert_eq!(pointer_only.len(), 1);
        let cancel = pointer_only[0].motion().expect("motion");
        assert_eq!(cancel.action, MotionAction::Cancel);
        assert_eq!(cancel.pointer_count(), 2);
        assert_eq!(cancel.first_sample().coords[1].x, 9.0);

        let all = state.synthesize_cancelation_events(100, &CancelationOptions::new(CancelationMode::All, "test"));
        assert_eq!(all.len(), 2);
        let up = all[0].key().expect("key");
        assert_eq!(up.action, KeyAction::Up);
        assert!(up.flags.contains(KeyFlag::Canceled));
    }

    #[test]
    fn test_cancel_options_filter_device_and_key() {
        let mut state = InputState::new();
        state.track_key(&key(KeyAction::Down, keycode::A), KeyAction::Down, KeyFlags::empty());
        state.track_key(&key(KeyAction::Down, keycode::B), KeyAction::Down, KeyFlags::empty());
        let options = CancelationOptions::new(CancelationMode::NonPointer, "test").for_key_code(keycode::B);
        assert_eq!(state.synthesize_cancelation_events(0, &options).len(), 1);
        let options = CancelationOptions::new(CancelationMode::All, "test").for_device(9);
        assert!(state.synthesize_cancelation_events(0, &options).is_empty());
    }

    #[test]
    fn test_copy_pointer_state_replaces_same_device() {
        let mut from = InputState::new();
        from.track_motion(&motion(MotionAction::Down, &[(0, 1.0, 1.0)]), MotionAction::Down);
        let mut to = InputState::new();
        to.track_motion(&motion(MotionAction::Down, &[(3, 7.0, 7.0)]), MotionAction::Down);
        from.copy_pointer_state_to(&mut to);
        assert_eq!(to.down_motion_count(), 1);
        let events = to.synthesize_cancelation_events(0, &CancelationOptions::new(CancelationMode::All, "t"));
        assert_eq!(events[0].motion().map(|m| m.pointer_properties[0].id), Some(0));
    }

    #[test]
    fn test_hover_tracked_apart_from_touch() {
        let mut state = InputState::new();
        let hover = motion(MotionAction::HoverMove, &[(0, 4.0, 4.0)]);
        assert!(!state.is_hovering(1, Source::TOUCHSCREEN));
        assert_eq!(state.track_motion(&hover, MotionAction::HoverEnter), Consistency::Consistent);
        assert!(state.is_hovering(1, Source::TOUCHSCREEN));

        // A touch DOWN from the same device does not disturb the hover memento.
        let down = motion(MotionAction::Down, &[(0, 4.0, 4.0)]);
        assert_eq!(state.track_motion(&down, MotionAction::Down), Consistency::Consistent);
        assert_eq!(state.down_motion_count(), 2);

        let events = state.synthesize_cancelation_events(7, &CancelationOptions::new(CancelationMode::All, "t"));
        let actions: Vec<MotionAction> = events.iter().filter_map(|e| e.motion().map(|m| m.action)).collect();
        assert_eq!(actions, vec![MotionAction::HoverExit, MotionAction::Cancel]);

        assert_eq!(state.track_motion(&hover, MotionAction::HoverExit), Consistency::Consistent);
        assert_eq!(state.track_motion(&hover, MotionAction::HoverExit), Consistency::Broken);
        assert!(!state.is_hovering(1, Source::TOUCHSCREEN));
    }

    #[test]
    fn test_scroll_needs_no_memento() {
        let mut state = InputState::new();
        let scroll = motion(MotionAction::Scroll, &[(0, 1.0, 1.0)]);
        assert_eq!(state.track_motion(&scroll, MotionAction::Scroll), Consistency::Consistent);
        assert!(state.is_neutral());
    }

    #[test]
    fn test_fallback_up_forgets_mapping() {
        let mut state = InputState::new();
        state.set_fallback_key(keycode::A, keycode::B);
        state.set_fallback_key(keycode::ENDCALL, keycode::B);
        assert_eq!(state.fallback_key(keycode::A), Some(keycode::B));

        let mut fallback_down = key(KeyAction::Down, keycode::B);
        fallback_down.flags |= KeyFlag::Fallback;
        state.track_key(&fallback_down, KeyAction::Down, fallback_down.flags);
        state.track_key(&key(KeyAction::Down, keycode::A), KeyAction::Down, KeyFlags::empty());

        let only_fallback = state.synthesize_cancelation_events(0, &CancelationOptions::new(CancelationMode::Fallback, "t"));
        assert_eq!(only_fallback.len(), 1);
        assert_eq!(only_fallback[0].key().map(|k| k.key_code), Some(keycode::B));

        let mut fallback_up = key(KeyAction::Up, keycode::B);
        fallback_up.flags |= KeyFlag::Fallback;
        assert_eq!(state.track_key(&fallback_up, KeyAction::Up, fallback_up.flags), Consistency::Consistent);
        assert_eq!(state.fallback_key(keycode::A), None);
        assert_eq!(state.fallback_key(keycode::ENDCALL), None);

        state.set_fallback_key(keycode::A, keycode::UNKNOWN);
        state.clear();
        assert_eq!(state.fallback_key(keycode::A), None);
    }

    proptest! {
        #[test]
        fn prop_key_down_up_sequences_end_neutral(codes in proptest::collection::vec(0i32..8, 1..20)) {
            let mut state = InputState::new();
            for code in codes {
                let down = key(KeyAction::Down, code);
                let verdict = state.track_key(&down, KeyAction::Down, KeyFlags::empty());
                prop_assert_eq!(verdict, Consistency::Consistent);
                let up = key(KeyAction::Up, code);
                let verdict = state.track_key(&up, KeyAction::Up, KeyFlags::empty());
                prop_assert_eq!(verdict, Consistency::Consistent);
                prop_assert!(state.is_neutral());
            }
        }

        #[test]
        fn prop_gesture_down_moves_up_never_broken(moves in 0usize..10) {
            let mut state = InputState::new();
            let down = motion(MotionAction::Down, &[(0, 0.0, 0.0)]);
            prop_assert_ne!(state.track_motion(&down, MotionAction::Down), Consistency::Broken);
            for i in 0..moves {
                let mv = motion(MotionAction::Move, &[(0, i as f32, 0.0)]);
                prop_assert_eq!(state.track_motion(&mv, MotionAction::Move), Consistency::Consistent);
            }
            let up = motion(MotionAction::Up, &[(0, 0.0, 0.0)]);
            prop_assert_eq!(state.track_motion(&up, MotionAction::Up), Consistency::Consistent);
            prop_assert!(state.is_neutral());
        }
    }
}
