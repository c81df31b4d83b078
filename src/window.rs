//! Window and application descriptors
//!
//! Supplied by the window registry through
//! [`crate::InputDispatcher::set_input_windows`] in front-to-back order.

use enumflags2::{bitflags, BitFlags};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::clock::{millis, Nsecs};
use crate::transport::ChannelId;

/// Window behaviour flags relevant to input routing.
#[bitflags]
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowFlag {
    /// Never receives key focus
    NotFocusable = 0x0000_0008,
    /// Never receives touches
    NotTouchable = 0x0000_0010,
    /// Touches outside the window go to windows behind it
    NotTouchModal = 0x0000_0020,
    /// May receive the touch that wakes the device
    TouchableWhenWaking = 0x0000_0040,
    /// Receives an OUTSIDE event for touches landing elsewhere
    WatchOutsideTouch = 0x0004_0000,
    /// Pointers may be split between this window and others
    SplitTouch = 0x0080_0000,
    /// A single-pointer drag may slide out into the window underneath
    Slippery = 0x2000_0000,
    /// System error dialog; gets first refusal on touches
    SystemError = 0x4000_0000,
}

/// Set of [`WindowFlag`]s.
pub type WindowFlags = BitFlags<WindowFlag>;

/// Window layer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    /// Ordinary application window
    #[default]
    Application,
    /// Wallpaper behind application windows
    Wallpaper,
    /// Input method window
    InputMethod,
    /// Input method dialog
    InputMethodDialog,
    /// System overlay trusted not to spoof input
    SecureSystemOverlay,
    /// Status bar and similar system windows
    System,
}

impl WindowType {
    /// Overlays of these types never obscure the windows below.
    pub fn is_trusted_overlay(self) -> bool {
        matches!(
            self,
            Self::InputMethod | Self::InputMethodDialog | Self::SecureSystemOverlay
        )
    }
}

/// Axis-aligned rectangle, right and bottom exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge
    pub left: i32,
    /// Top edge
    pub top: i32,
    /// Right edge (exclusive)
    pub right: i32,
    /// Bottom edge (exclusive)
    pub bottom: i32,
}

impl Rect {
    /// Rectangle from edges.
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Point containment.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}][{},{}]", self.left, self.top, self.right, self.bottom)
    }
}

/// Application owning windows; carries the ANR timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    /// Application name
    pub name: String,
    /// Dispatching timeout (nanoseconds); default timeout applies when unset
    #[serde(default)]
    pub dispatching_timeout: Option<Nsecs>,
}

impl ApplicationInfo {
    /// Application with the default timeout.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dispatching_timeout: None,
        }
    }

    /// Set the dispatching timeout in milliseconds.
    pub fn with_timeout_ms(mut self, ms: i64) -> Self {
        self.dispatching_timeout = Some(millis(ms));
        self
    }
}

/// Input-relevant snapshot of a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowInfo {
    /// Window name
    pub name: String,
    /// Registered input channel; windows without one are ignored
    #[serde(default)]
    pub channel: Option<ChannelId>,
    /// Owning application
    #[serde(default)]
    pub application: Option<ApplicationInfo>,
    /// Frame in display coordinates
    pub frame: Rect,
    /// Touchable area; an empty region means the frame
    #[serde(default)]
    pub touchable_region: Vec<Rect>,
    /// Behaviour flags
    #[serde(default)]
    pub flags: WindowFlags,
    /// Layer type
    #[serde(default)]
    pub window_type: WindowType,
    /// Visible on screen
    #[serde(default = "default_true")]
    pub visible: bool,
    /// May receive key events
    #[serde(default = "default_true")]
    pub can_receive_keys: bool,
    /// Currently has key focus
    #[serde(default)]
    pub has_focus: bool,
    /// Wallpaper windows receive this window's touches too
    #[serde(default)]
    pub has_wallpaper: bool,
    /// Dispatch to this window is paused
    #[serde(default)]
    pub paused: bool,
    /// Owner process id
    #[serde(default)]
    pub owner_pid: i32,
    /// Owner user id
    #[serde(default)]
    pub owner_uid: i32,
    /// Dispatching timeout (nanoseconds); falls back to the application's
    #[serde(default)]
    pub dispatching_timeout: Option<Nsecs>,
}

fn default_true() -> bool {
    true
}

impl WindowInfo {
    /// Visible, touchable application window bound to `channel`.
    pub fn new(name: impl Into<String>, channel: ChannelId, frame: Rect) -> Self {
        Self {
            name: name.into(),
            channel: Some(channel),
            application: None,
            frame,
            touchable_region: Vec::new(),
            flags: WindowFlags::empty(),
            window_type: WindowType::Application,
            visible: true,
            can_receive_keys: true,
            has_focus: false,
            has_wallpaper: false,
            paused: false,
            owner_pid: 0,
            owner_uid: 0,
            dispatching_timeout: None,
        }
    }

    /// Give the window key focus.
    pub fn focused(mut self) -> Self {
        self.has_focus = true;
        self
    }

    /// Add flags.
    pub fn with_flags(mut self, flags: impl Into<WindowFlags>) -> Self {
        self.flags |= flags.into();
        self
    }

    /// Set the owning application.
    pub fn with_application(mut self, application: ApplicationInfo) -> Self {
        self.application = Some(application);
        self
    }

    /// Set the owner process and user.
    pub fn with_owner(mut self, pid: i32, uid: i32) -> Self {
        self.owner_pid = pid;
        self.owner_uid = uid;
        self
    }

    /// Set the window type.
    pub fn with_type(mut self, window_type: WindowType) -> Self {
        self.window_type = window_type;
        self
    }

    /// Set the dispatching timeout in milliseconds.
    pub fn with_timeout_ms(mut self, ms: i64) -> Self {
        self.dispatching_timeout = Some(millis(ms));
        self
    }

    /// Declare a wallpaper behind the window.
    pub fn with_wallpaper(mut self) -> Self {
        self.has_wallpaper = true;
        self
    }

    /// Pause or resume dispatch to the window.
    pub fn set_paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    /// Restrict the touchable area.
    pub fn with_touchable_region(mut self, region: Vec<Rect>) -> Self {
        self.touchable_region = region;
        self
    }

    /// True if the window accepts touches at all.
    pub fn is_touchable(&self) -> bool {
        !self.flags.contains(WindowFlag::NotTouchable)
    }

    /// Touches anywhere on screen land in this window.
    pub fn is_touch_modal(&self) -> bool {
        !self
            .flags
            .intersects(WindowFlag::NotFocusable | WindowFlag::NotTouchModal)
    }

    /// Point lies inside the touchable area.
    pub fn touchable_area_contains(&self, x: i32, y: i32) -> bool {
        if self.touchable_region.is_empty() {
            return self.frame.contains(x, y);
        }
        self.touchable_region.iter().any(|r| r.contains(x, y))
    }

    /// Point lies inside the frame.
    pub fn frame_contains(&self, x: i32, y: i32) -> bool {
        self.frame.contains(x, y)
    }

    /// Supports split multi-touch.
    pub fn supports_split_touch(&self) -> bool {
        self.flags.contains(WindowFlag::SplitTouch)
    }

    /// Wants OUTSIDE events.
    pub fn watches_outside_touch(&self) -> bool {
        self.flags.contains(WindowFlag::WatchOutsideTouch)
    }

    /// Touches slide out of the window.
    pub fn is_slippery(&self) -> bool {
        self.flags.contains(WindowFlag::Slippery)
    }

    /// System error window.
    pub fn is_system_error(&self) -> bool {
        self.flags.contains(WindowFlag::SystemError)
    }

    /// Never counts as covering another window.
    pub fn is_trusted_overlay(&self) -> bool {
        self.window_type.is_trusted_overlay()
    }

    /// Same owning application.
    pub fn same_application(&self, application: Option<&ApplicationInfo>) -> bool {
        self.application.as_ref() == application
    }
}
