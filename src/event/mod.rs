//! Input Event Model
//!
//! Records flowing through the dispatcher:
//! - Producer-facing arguments ([`NotifyKeyArgs`], [`NotifyMotionArgs`])
//! - Injectable events ([`KeyEvent`], [`MotionEvent`])
//! - Queued event records ([`EventEntry`]) with their motion sample chain
//!
//! Numeric codes for actions, sources and flags follow the platform input
//! ABI so producers can pass raw values straight through.

pub mod injection;
pub mod validate;

use enumflags2::{bitflags, make_bitflags, BitFlags};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

use crate::clock::Nsecs;

pub use injection::{InjectionResult, InjectionState, SyncMode};

/// Input device identifier.
pub type DeviceId = i32;

/// Inline storage for per-pointer data; most gestures use few pointers.
pub type PointerVec<T> = SmallVec<[T; 4]>;

/// Maximum number of pointers in one motion event
pub const MAX_POINTERS: usize = 16;

/// Largest valid pointer id
pub const MAX_POINTER_ID: i32 = 31;

/// Well-known key codes the dispatcher treats specially.
pub mod keycode {
    /// Unknown key
    pub const UNKNOWN: i32 = 0;
    /// Home key (app switch)
    pub const HOME: i32 = 3;
    /// Back key
    pub const BACK: i32 = 4;
    /// End call key (app switch)
    pub const ENDCALL: i32 = 6;
    /// Volume up
    pub const VOLUME_UP: i32 = 24;
    /// Volume down
    pub const VOLUME_DOWN: i32 = 25;
    /// Letter A
    pub const A: i32 = 29;
    /// Letter B
    pub const B: i32 = 30;
    /// Enter
    pub const ENTER: i32 = 66;
}

/// Meta state bits.
pub mod meta {
    /// Shift is pressed
    pub const SHIFT_ON: i32 = 0x01;
    /// Alt is pressed
    pub const ALT_ON: i32 = 0x02;
    /// Function modifier is pressed
    pub const FUNCTION_ON: i32 = 0x08;
    /// Left alt
    pub const ALT_LEFT_ON: i32 = 0x10;
    /// Right alt
    pub const ALT_RIGHT_ON: i32 = 0x20;
    /// Left shift
    pub const SHIFT_LEFT_ON: i32 = 0x40;
    /// Caps lock engaged
    pub const CAPS_LOCK_ON: i32 = 0x0010_0000;
}

/// Input source: a device class mask plus a specific source kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Source(pub u32);

impl Source {
    /// Button-like devices
    pub const CLASS_BUTTON: u32 = 0x0000_0001;
    /// Absolute pointing devices (routed by touch)
    pub const CLASS_POINTER: u32 = 0x0000_0002;
    /// Relative navigation devices
    pub const CLASS_NAVIGATION: u32 = 0x0000_0004;
    /// Absolute positioning without display association
    pub const CLASS_POSITION: u32 = 0x0000_0008;
    /// Joysticks
    pub const CLASS_JOYSTICK: u32 = 0x0000_0010;

    /// Unknown source
    pub const UNKNOWN: Source = Source(0);
    /// Keyboard
    pub const KEYBOARD: Source = Source(0x0000_0100 | Self::CLASS_BUTTON);
    /// Directional pad
    pub const DPAD: Source = Source(0x0000_0200 | Self::CLASS_BUTTON);
    /// Touch screen
    pub const TOUCHSCREEN: Source = Source(0x0000_1000 | Self::CLASS_POINTER);
    /// Mouse
    pub const MOUSE: Source = Source(0x0000_2000 | Self::CLASS_POINTER);
    /// Trackball
    pub const TRACKBALL: Source = Source(0x0001_0000 | Self::CLASS_NAVIGATION);
    /// Touch pad
    pub const TOUCHPAD: Source = Source(0x0010_0000 | Self::CLASS_POSITION);
    /// Joystick
    pub const JOYSTICK: Source = Source(0x0100_0000 | Self::CLASS_JOYSTICK);

    /// True if the source belongs to `class`.
    pub fn has_class(self, class: u32) -> bool {
        self.0 & class != 0
    }

    /// Pointer sources are routed by touch, everything else by focus.
    pub fn is_pointer(self) -> bool {
        self.has_class(Self::CLASS_POINTER)
    }

    /// Touch screen source (user-activity classification).
    pub fn is_touch(self) -> bool {
        self.0 & Self::TOUCHSCREEN.0 == Self::TOUCHSCREEN.0
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Flags attached by the producer and the policy.
#[bitflags]
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyFlag {
    /// Device wants to wake the screen
    Wake = 0x0000_0001,
    /// Shift key is down
    Shift = 0x0000_0004,
    /// Caps lock is on
    CapsLock = 0x0000_0008,
    /// Alt key is down
    Alt = 0x0000_0010,
    /// Right alt (AltGr) is down
    AltGr = 0x0000_0020,
    /// Virtual (soft) hard key
    Virtual = 0x0000_0100,
    /// Function modifier is down
    Function = 0x0000_0200,
    /// Event already passed through the input filter
    Filtered = 0x0400_0000,
    /// Event was injected
    Injected = 0x0100_0000,
    /// Event came from a trusted source
    Trusted = 0x0200_0000,
    /// Suppress synthetic key repeat
    DisableKeyRepeat = 0x0800_0000,
    /// Event woke the device
    WokeHere = 0x1000_0000,
    /// Policy allows the event to reach applications
    PassToUser = 0x4000_0000,
}

/// Set of [`PolicyFlag`]s.
pub type PolicyFlags = BitFlags<PolicyFlag>;

/// Flags that originate at the device; preserved across synthetic repeats.
pub const RAW_POLICY_FLAGS: PolicyFlags = make_bitflags!(PolicyFlag::{
    Wake | Shift | CapsLock | Alt | AltGr | Virtual | Function
});

/// Key event flags.
#[bitflags]
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyFlag {
    /// Key press woke the device
    WokeHere = 0x0001,
    /// Originates from the system rather than an application
    FromSystem = 0x0008,
    /// Key was canceled; the UP must not trigger an action
    Canceled = 0x0020,
    /// Generated by a virtual hard key
    VirtualHardKey = 0x0040,
    /// First repeat of a held key
    LongPress = 0x0080,
    /// Substitute key chosen by the policy for an unhandled key
    Fallback = 0x0400,
}

/// Set of [`KeyFlag`]s.
pub type KeyFlags = BitFlags<KeyFlag>;

/// Motion event flags.
#[bitflags]
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionFlag {
    /// The receiving window is partly covered by another window at the touch point
    WindowIsObscured = 0x0001,
}

/// Set of [`MotionFlag`]s.
pub type MotionFlags = BitFlags<MotionFlag>;

/// Key action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAction {
    /// Key pressed
    Down,
    /// Key released
    Up,
    /// Multiple duplicate keys; never accepted from producers
    Multiple,
}

impl KeyAction {
    /// Decode a raw action code.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Down),
            1 => Some(Self::Up),
            2 => Some(Self::Multiple),
            _ => None,
        }
    }

    /// Raw action code.
    pub fn to_raw(self) -> i32 {
        match self {
            Self::Down => 0,
            Self::Up => 1,
            Self::Multiple => 2,
        }
    }
}

const MOTION_ACTION_MASK: i32 = 0xff;
const MOTION_POINTER_INDEX_SHIFT: i32 = 8;

/// Motion action. Secondary pointer actions carry the index of the pointer
/// that went down or up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionAction {
    /// First pointer down
    Down,
    /// Last pointer up
    Up,
    /// Pointer movement
    Move,
    /// Gesture aborted
    Cancel,
    /// Touch happened outside the receiving window
    Outside,
    /// Additional pointer down at index
    PointerDown(usize),
    /// Non-last pointer up at index
    PointerUp(usize),
    /// Hovering pointer moved
    HoverMove,
    /// Scroll wheel or similar; no pointer goes down
    Scroll,
    /// Hovering pointer entered the window
    HoverEnter,
    /// Hovering pointer left the window
    HoverExit,
}

impl MotionAction {
    /// Decode a raw action code including the pointer index bits.
    pub fn from_raw(raw: i32) -> Option<Self> {
        let index = ((raw >> MOTION_POINTER_INDEX_SHIFT) & 0xff) as usize;
        match raw & MOTION_ACTION_MASK {
            0 => Some(Self::Down),
            1 => Some(Self::Up),
            2 => Some(Self::Move),
            3 => Some(Self::Cancel),
            4 => Some(Self::Outside),
            5 => Some(Self::PointerDown(index)),
            6 => Some(Self::PointerUp(index)),
            7 => Some(Self::HoverMove),
            8 => Some(Self::Scroll),
            9 => Some(Self::HoverEnter),
            10 => Some(Self::HoverExit),
            _ => None,
        }
    }

    /// Raw action code.
    pub fn to_raw(self) -> i32 {
        match self {
            Self::Down => 0,
            Self::Up => 1,
            Self::Move => 2,
            Self::Cancel => 3,
            Self::Outside => 4,
            Self::PointerDown(i) => 5 | ((i as i32) << MOTION_POINTER_INDEX_SHIFT),
            Self::PointerUp(i) => 6 | ((i as i32) << MOTION_POINTER_INDEX_SHIFT),
            Self::HoverMove => 7,
            Self::Scroll => 8,
            Self::HoverEnter => 9,
            Self::HoverExit => 10,
        }
    }

    /// Hover enter, move or exit.
    pub fn is_hover(self) -> bool {
        matches!(self, Self::HoverMove | Self::HoverEnter | Self::HoverExit)
    }

    /// MOVE or HOVER_MOVE; the actions whose samples may be batched.
    pub fn is_batchable(self) -> bool {
        matches!(self, Self::Move | Self::HoverMove)
    }

    /// Pointer index for secondary actions, 0 otherwise.
    pub fn pointer_index(self) -> usize {
        match self {
            Self::PointerDown(i) | Self::PointerUp(i) => i,
            _ => 0,
        }
    }
}

/// Tool used by a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    /// Unknown tool
    #[default]
    Unknown,
    /// Finger
    Finger,
    /// Stylus
    Stylus,
    /// Mouse
    Mouse,
    /// Eraser
    Eraser,
}

/// Static properties of one pointer in a gesture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PointerProperties {
    /// Pointer id, stable for the pointer's lifetime in the gesture
    pub id: i32,
    /// Tool type
    #[serde(default)]
    pub tool_type: ToolType,
}

impl PointerProperties {
    /// Finger pointer with the given id.
    pub fn finger(id: i32) -> Self {
        Self {
            id,
            tool_type: ToolType::Finger,
        }
    }
}

/// Per-sample coordinates of one pointer.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PointerCoords {
    /// X in display coordinates
    pub x: f32,
    /// Y in display coordinates
    pub y: f32,
    /// Pressure (0..1)
    pub pressure: f32,
    /// Normalized contact size
    pub size: f32,
    /// Major axis of the touch ellipse
    pub touch_major: f32,
    /// Minor axis of the touch ellipse
    pub touch_minor: f32,
    /// Major axis of the tool ellipse
    pub tool_major: f32,
    /// Minor axis of the tool ellipse
    pub tool_minor: f32,
    /// Orientation in radians
    pub orientation: f32,
}

impl PointerCoords {
    /// Coordinates at a point with unit pressure.
    pub fn at(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            pressure: 1.0,
            size: 1.0,
            ..Self::default()
        }
    }

    /// Zero every axis.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Small set of pointer ids (0..=31).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PointerIdBits(u32);

impl PointerIdBits {
    /// Empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Set containing a single id.
    pub fn with(id: i32) -> Self {
        let mut bits = Self::empty();
        bits.mark(id);
        bits
    }

    /// Raw bit value.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Add an id.
    pub fn mark(&mut self, id: i32) {
        if (0..=MAX_POINTER_ID).contains(&id) {
            self.0 |= 1 << id;
        }
    }

    /// Remove an id.
    pub fn clear(&mut self, id: i32) {
        if (0..=MAX_POINTER_ID).contains(&id) {
            self.0 &= !(1 << id);
        }
    }

    /// Membership test.
    pub fn has(self, id: i32) -> bool {
        (0..=MAX_POINTER_ID).contains(&id) && self.0 & (1 << id) != 0
    }

    /// Number of ids in the set.
    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// True if no id is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Union with another set.
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl fmt::Display for PointerIdBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Key event as delivered by an input device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyKeyArgs {
    /// Event time
    pub event_time: Nsecs,
    /// Device id
    pub device_id: DeviceId,
    /// Source
    pub source: Source,
    /// Policy flags from the device
    #[serde(default)]
    pub policy_flags: PolicyFlags,
    /// Action
    pub action: KeyAction,
    /// Key flags
    #[serde(default)]
    pub flags: KeyFlags,
    /// Key code
    pub key_code: i32,
    /// Scan code
    #[serde(default)]
    pub scan_code: i32,
    /// Meta state
    #[serde(default)]
    pub meta_state: i32,
    /// Time of the initial DOWN
    pub down_time: Nsecs,
}

impl NotifyKeyArgs {
    /// Keyboard key event with `down_time == event_time`.
    pub fn new(event_time: Nsecs, device_id: DeviceId, action: KeyAction, key_code: i32) -> Self {
        Self {
            event_time,
            device_id,
            source: Source::KEYBOARD,
            policy_flags: PolicyFlags::empty(),
            action,
            flags: KeyFlags::empty(),
            key_code,
            scan_code: 0,
            meta_state: 0,
            down_time: event_time,
        }
    }
}

/// Motion event as delivered by an input device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyMotionArgs {
    /// Event time
    pub event_time: Nsecs,
    /// Device id
    pub device_id: DeviceId,
    /// Source
    pub source: Source,
    /// Policy flags from the device
    #[serde(default)]
    pub policy_flags: PolicyFlags,
    /// Action
    pub action: MotionAction,
    /// Motion flags
    #[serde(default)]
    pub flags: MotionFlags,
    /// Meta state
    #[serde(default)]
    pub meta_state: i32,
    /// Screen edges touched
    #[serde(default)]
    pub edge_flags: i32,
    /// X precision
    #[serde(default)]
    pub x_precision: f32,
    /// Y precision
    #[serde(default)]
    pub y_precision: f32,
    /// Time of the gesture's DOWN
    pub down_time: Nsecs,
    /// Pointer properties
    pub pointer_properties: Vec<PointerProperties>,
    /// Pointer coordinates, parallel to `pointer_properties`
    pub pointer_coords: Vec<PointerCoords>,
}

impl NotifyMotionArgs {
    /// Single-sample motion event carrying the same data.
    pub fn to_event(&self) -> MotionEvent {
        MotionEvent {
            device_id: self.device_id,
            source: self.source,
            action: self.action,
            flags: self.flags,
            meta_state: self.meta_state,
            edge_flags: self.edge_flags,
            x_precision: self.x_precision,
            y_precision: self.y_precision,
            down_time: self.down_time,
            pointer_properties: self.pointer_properties.clone(),
            samples: vec![MotionEventSample {
                event_time: self.event_time,
                coords: self.pointer_coords.clone(),
            }],
        }
    }

    /// Touch screen event with finger pointers.
    pub fn touch(
        event_time: Nsecs,
        device_id: DeviceId,
        action: MotionAction,
        down_time: Nsecs,
        pointers: &[(i32, f32, f32)],
    ) -> Self {
        Self {
            event_time,
            device_id,
            source: Source::TOUCHSCREEN,
            policy_flags: PolicyFlags::empty(),
            action,
            flags: MotionFlags::empty(),
            meta_state: 0,
            edge_flags: 0,
            x_precision: 1.0,
            y_precision: 1.0,
            down_time,
            pointer_properties: pointers
                .iter()
                .map(|&(id, _, _)| PointerProperties::finger(id))
                .collect(),
            pointer_coords: pointers
                .iter()
                .map(|&(_, x, y)| PointerCoords::at(x, y))
                .collect(),
        }
    }
}

/// Key event submitted for injection or handed to the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEvent {
    /// Device id
    pub device_id: DeviceId,
    /// Source
    pub source: Source,
    /// Action
    pub action: KeyAction,
    /// Key flags
    #[serde(default)]
    pub flags: KeyFlags,
    /// Key code
    pub key_code: i32,
    /// Scan code
    #[serde(default)]
    pub scan_code: i32,
    /// Meta state
    #[serde(default)]
    pub meta_state: i32,
    /// Repeat count
    #[serde(default)]
    pub repeat_count: i32,
    /// Time of the initial DOWN
    pub down_time: Nsecs,
    /// Event time
    pub event_time: Nsecs,
}

/// One historical or current sample of an injected motion event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionEventSample {
    /// Sample time
    pub event_time: Nsecs,
    /// Coordinates, parallel to the event's pointer properties
    pub coords: Vec<PointerCoords>,
}

/// Motion event submitted for injection. Samples are ordered oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionEvent {
    /// Device id
    pub device_id: DeviceId,
    /// Source
    pub source: Source,
    /// Action
    pub action: MotionAction,
    /// Motion flags
    #[serde(default)]
    pub flags: MotionFlags,
    /// Meta state
    #[serde(default)]
    pub meta_state: i32,
    /// Edge flags
    #[serde(default)]
    pub edge_flags: i32,
    /// X precision
    #[serde(default)]
    pub x_precision: f32,
    /// Y precision
    #[serde(default)]
    pub y_precision: f32,
    /// Time of the gesture's DOWN
    pub down_time: Nsecs,
    /// Pointer properties
    pub pointer_properties: Vec<PointerProperties>,
    /// Samples, history first
    pub samples: Vec<MotionEventSample>,
}

/// Event handed to [`crate::InputDispatcher::inject_event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    /// Key event
    Key(KeyEvent),
    /// Motion event
    Motion(MotionEvent),
}

/// Outcome of the policy's pre-dispatch key interception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterceptKeyResult {
    /// Policy has not been asked yet
    #[default]
    Unknown,
    /// Policy consumed the key
    Skip,
    /// Deliver the key
    Continue,
    /// Ask again at the recorded wakeup time
    TryAgainLater,
}

/// Queued key record.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyEntry {
    /// Device id
    pub device_id: DeviceId,
    /// Source
    pub source: Source,
    /// Action
    pub action: KeyAction,
    /// Key flags
    pub flags: KeyFlags,
    /// Key code
    pub key_code: i32,
    /// Scan code
    pub scan_code: i32,
    /// Meta state
    pub meta_state: i32,
    /// Repeat count
    pub repeat_count: i32,
    /// Time of the initial DOWN
    pub down_time: Nsecs,
    /// Generated by the dispatcher's key repeat timer
    pub synthetic_repeat: bool,
    /// Pre-dispatch interception state
    pub intercept_result: InterceptKeyResult,
    /// When to retry interception after [`InterceptKeyResult::TryAgainLater`]
    pub intercept_wakeup_time: Nsecs,
}

impl KeyEntry {
    /// Snapshot as a policy-facing key event.
    pub fn to_event(&self, event_time: Nsecs) -> KeyEvent {
        KeyEvent {
            device_id: self.device_id,
            source: self.source,
            action: self.action,
            flags: self.flags,
            key_code: self.key_code,
            scan_code: self.scan_code,
            meta_state: self.meta_state,
            repeat_count: self.repeat_count,
            down_time: self.down_time,
            event_time,
        }
    }

    /// Clear interception progress for a fresh dispatch attempt.
    pub fn reset_intercept(&mut self) {
        self.intercept_result = InterceptKeyResult::Unknown;
        self.intercept_wakeup_time = 0;
    }
}

/// One batched motion sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionSample {
    /// Time reported for the sample (may be advanced by coalescing)
    pub event_time: Nsecs,
    /// Time of the first event folded into this sample
    pub event_time_before_coalescing: Nsecs,
    /// Coordinates, parallel to the entry's pointer properties
    pub coords: PointerVec<PointerCoords>,
}

impl MotionSample {
    /// New sample.
    pub fn new(event_time: Nsecs, coords: &[PointerCoords]) -> Self {
        Self {
            event_time,
            event_time_before_coalescing: event_time,
            coords: coords.iter().copied().collect(),
        }
    }
}

/// Queued motion record with its ordered sample chain (never empty).
#[derive(Debug, Clone, PartialEq)]
pub struct MotionEntry {
    /// Device id
    pub device_id: DeviceId,
    /// Source
    pub source: Source,
    /// Action
    pub action: MotionAction,
    /// Motion flags
    pub flags: MotionFlags,
    /// Meta state
    pub meta_state: i32,
    /// Edge flags
    pub edge_flags: i32,
    /// X precision
    pub x_precision: f32,
    /// Y precision
    pub y_precision: f32,
    /// Time of the gesture's DOWN
    pub down_time: Nsecs,
    /// Pointer properties
    pub pointer_properties: PointerVec<PointerProperties>,
    /// Samples, oldest first
    pub samples: Vec<MotionSample>,
}

impl MotionEntry {
    /// Number of pointers.
    pub fn pointer_count(&self) -> usize {
        self.pointer_properties.len()
    }

    /// Oldest sample.
    pub fn first_sample(&self) -> &MotionSample {
        &self.samples[0]
    }

    /// Most recent sample.
    pub fn last_sample(&self) -> &MotionSample {
        &self.samples[self.samples.len() - 1]
    }

    /// Append a sample to the chain.
    pub fn append_sample(&mut self, event_time: Nsecs, coords: &[PointerCoords]) {
        self.samples.push(MotionSample::new(event_time, coords));
    }

    /// True if a new MOVE with this shape may be folded into this record.
    pub fn can_append_samples(&self, action: MotionAction, properties: &[PointerProperties]) -> bool {
        self.action == action && self.pointer_properties.as_slice() == properties
    }

    /// Index of the pointer with `id`.
    pub fn pointer_index_of(&self, id: i32) -> Option<usize> {
        self.pointer_properties.iter().position(|p| p.id == id)
    }
}

/// Variant payload of an [`EventEntry`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Input configuration changed
    ConfigurationChanged,
    /// A device was reset; its keys and pointers are no longer down
    DeviceReset {
        /// Reset device
        device_id: DeviceId,
    },
    /// Key record
    Key(KeyEntry),
    /// Motion record
    Motion(MotionEntry),
}

/// Inbound event record shared by the inbound queue and dispatch entries.
#[derive(Debug, Clone)]
pub struct EventEntry {
    /// Event time
    pub event_time: Nsecs,
    /// Policy flags
    pub policy_flags: PolicyFlags,
    /// Targets have been chosen and delivery started
    pub dispatch_in_progress: bool,
    /// Injection ticket, when the event was injected
    pub injection: Option<Arc<InjectionState>>,
    /// Payload
    pub kind: EventKind,
}

impl EventEntry {
    /// New record without an injection ticket.
    pub fn new(event_time: Nsecs, policy_flags: PolicyFlags, kind: EventKind) -> Self {
        Self {
            event_time,
            policy_flags,
            dispatch_in_progress: false,
            injection: None,
            kind,
        }
    }

    /// Key record built from producer arguments.
    pub fn from_key_args(args: &NotifyKeyArgs, policy_flags: PolicyFlags, flags: KeyFlags, meta_state: i32) -> Self {
        Self::new(
            args.event_time,
            policy_flags,
            EventKind::Key(KeyEntry {
                device_id: args.device_id,
                source: args.source,
                action: args.action,
                flags,
                key_code: args.key_code,
                scan_code: args.scan_code,
                meta_state,
                repeat_count: 0,
                down_time: args.down_time,
                synthetic_repeat: false,
                intercept_result: InterceptKeyResult::Unknown,
                intercept_wakeup_time: 0,
            }),
        )
    }

    /// Motion record built from producer arguments.
    pub fn from_motion_args(args: &NotifyMotionArgs, policy_flags: PolicyFlags) -> Self {
        Self::new(
            args.event_time,
            policy_flags,
            EventKind::Motion(MotionEntry {
                device_id: args.device_id,
                source: args.source,
                action: args.action,
                flags: args.flags,
                meta_state: args.meta_state,
                edge_flags: args.edge_flags,
                x_precision: args.x_precision,
                y_precision: args.y_precision,
                down_time: args.down_time,
                pointer_properties: args.pointer_properties.iter().copied().collect(),
                samples: vec![MotionSample::new(args.event_time, &args.pointer_coords)],
            }),
        )
    }

    /// Key record for an injected key event; keeps its repeat count.
    pub fn from_key_event(event: &KeyEvent, policy_flags: PolicyFlags, flags: KeyFlags) -> Self {
        Self::new(
            event.event_time,
            policy_flags,
            EventKind::Key(KeyEntry {
                device_id: event.device_id,
                source: event.source,
                action: event.action,
                flags,
                key_code: event.key_code,
                scan_code: event.scan_code,
                meta_state: event.meta_state,
                repeat_count: event.repeat_count,
                down_time: event.down_time,
                synthetic_repeat: false,
                intercept_result: InterceptKeyResult::Unknown,
                intercept_wakeup_time: 0,
            }),
        )
    }

    /// Motion record for an injected motion event, history included.
    /// `None` if the event has no samples.
    pub fn from_motion_event(event: &MotionEvent, policy_flags: PolicyFlags) -> Option<Self> {
        let first = event.samples.first()?;
        let samples = event
            .samples
            .iter()
            .map(|sample| MotionSample::new(sample.event_time, &sample.coords))
            .collect();
        Some(Self::new(
            first.event_time,
            policy_flags,
            EventKind::Motion(MotionEntry {
                device_id: event.device_id,
                source: event.source,
                action: event.action,
                flags: event.flags,
                meta_state: event.meta_state,
                edge_flags: event.edge_flags,
                x_precision: event.x_precision,
                y_precision: event.y_precision,
                down_time: event.down_time,
                pointer_properties: event.pointer_properties.iter().copied().collect(),
                samples,
            }),
        ))
    }

    /// True if the event carries an injection ticket.
    pub fn is_injected(&self) -> bool {
        self.injection.is_some()
    }

    /// True if a producer MOVE with this shape may be folded into this
    /// record. Injected records never absorb producer samples.
    pub fn can_append_samples(&self, action: MotionAction, properties: &[PointerProperties]) -> bool {
        !self.is_injected()
            && self
                .motion()
                .is_some_and(|motion| motion.can_append_samples(action, properties))
    }

    /// Key payload.
    pub fn key(&self) -> Option<&KeyEntry> {
        match &self.kind {
            EventKind::Key(key) => Some(key),
            _ => None,
        }
    }

    /// Mutable key payload.
    pub fn key_mut(&mut self) -> Option<&mut KeyEntry> {
        match &mut self.kind {
            EventKind::Key(key) => Some(key),
            _ => None,
        }
    }

    /// Motion payload.
    pub fn motion(&self) -> Option<&MotionEntry> {
        match &self.kind {
            EventKind::Motion(motion) => Some(motion),
            _ => None,
        }
    }

    /// Mutable motion payload.
    pub fn motion_mut(&mut self) -> Option<&mut MotionEntry> {
        match &mut self.kind {
            EventKind::Motion(motion) => Some(motion),
            _ => None,
        }
    }

    /// Short label for logs and dumps.
    pub fn label(&self) -> &'static str {
        match self.kind {
            EventKind::ConfigurationChanged => "ConfigurationChanged",
            EventKind::DeviceReset { .. } => "DeviceReset",
            EventKind::Key(_) => "Key",
            EventKind::Motion(_) => "Motion",
        }
    }
}

impl fmt::Display for EventEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EventKind::ConfigurationChanged => write!(f, "ConfigurationChangedEvent()"),
            EventKind::DeviceReset { device_id } => write!(f, "DeviceReset(device={})", device_id),
            EventKind::Key(key) => write!(
                f,
                "Key(action={:?}, device={}, source={}, key_code={}, repeat={}, policy=0x{:08x})",
                key.action,
                key.device_id,
                key.source,
                key.key_code,
                key.repeat_count,
                self.policy_flags.bits()
            ),
            EventKind::Motion(motion) => write!(
                f,
                "Motion(action={:?}, device={}, source={}, pointers={}, samples={}, policy=0x{:08x})",
                motion.action,
                motion.device_id,
                motion.source,
                motion.pointer_count(),
                motion.samples.len(),
                self.policy_flags.bits()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_action_raw_round_trip_keeps_index() {
        let action = MotionAction::PointerDown(2);
        assert_eq!(action.to_raw(), 0x0205);
        assert_eq!(MotionAction::from_raw(0x0205), Some(action));
        assert_eq!(MotionAction::from_raw(9), None);
        assert_eq!(KeyAction::from_raw(7), None);
    }

    #[test]
    fn test_source_classes() {
        assert!(Source::TOUCHSCREEN.is_pointer());
        assert!(Source::MOUSE.is_pointer());
        assert!(!Source::KEYBOARD.is_pointer());
        assert!(Source::TRACKBALL.has_class(Source::CLASS_NAVIGATION));
        assert!(Source::TOUCHSCREEN.is_touch());
        assert!(!Source::MOUSE.is_touch());
    }

    #[test]
    fn test_pointer_id_bits() {
        let mut bits = PointerIdBits::with(3);
        bits.mark(7);
        bits.mark(40);
        assert_eq!(bits.count(), 2);
        assert!(bits.has(3));
        bits.clear(3);
        assert!(!bits.has(3));
        assert!(!bits.is_empty());
        bits.clear(7);
        assert!(bits.is_empty());
    }

    #[test]
    fn test_raw_policy_flags_mask() {
        let flags = PolicyFlag::Wake | PolicyFlag::Trusted | PolicyFlag::Shift;
        assert_eq!(flags & RAW_POLICY_FLAGS, PolicyFlag::Wake | PolicyFlag::Shift);
    }

    #[test]
    fn test_can_append_samples_requires_same_shape() {
        let args = NotifyMotionArgs::touch(0, 1, MotionAction::Move, 0, &[(0, 1.0, 1.0)]);
        let entry = EventEntry::from_motion_args(&args, PolicyFlags::empty());
        let motion = entry.motion().expect("motion");
        assert!(motion.can_append_samples(MotionAction::Move, &[PointerProperties::finger(0)]));
        assert!(!motion.can_append_samples(MotionAction::Move, &[PointerProperties::finger(1)]));
        assert!(!motion.can_append_samples(MotionAction::Down, &[PointerProperties::finger(0)]));
    }

    #[test]
    fn test_injected_record_takes_no_producer_samples() {
        let args = NotifyMotionArgs::touch(0, 1, MotionAction::Move, 0, &[(0, 1.0, 1.0)]);
        let mut entry = EventEntry::from_motion_args(&args, PolicyFlag::Injected.into());
        assert!(entry.can_append_samples(MotionAction::Move, &[PointerProperties::finger(0)]));
        entry.injection = Some(Arc::new(InjectionState::new(1, 0, true)));
        assert!(!entry.can_append_samples(MotionAction::Move, &[PointerProperties::finger(0)]));
    }
}
