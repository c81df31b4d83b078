//! Scenario format
//!
//! A scenario describes a window layout and a timed list of steps. Files
//! ending in `.json` are parsed as JSON, everything else as TOML.
//!
//! ```toml
//! name = "tap"
//!
//! [[windows]]
//! name = "editor"
//! frame = { left = 0, top = 0, right = 480, bottom = 800 }
//! focused = true
//!
//! [[steps]]
//! op = "motion"
//! at_ms = 10
//! action = "down"
//! pointers = [{ id = 0, x = 100.0, y = 200.0 }]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::event::{DeviceId, InputEvent, KeyAction, MotionAction};
use crate::window::{ApplicationInfo, Rect, WindowFlags, WindowType};

/// Window layout plus steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scenario {
    /// Name used in logs and the report
    #[serde(default)]
    pub name: String,

    /// Focused application
    #[serde(default)]
    pub focused_application: Option<ApplicationInfo>,

    /// Windows, front to back
    #[serde(default)]
    pub windows: Vec<WindowSpec>,

    /// Names of monitor channels
    #[serde(default)]
    pub monitors: Vec<String>,

    /// Steps in order
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One window and the behaviour of its consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSpec {
    /// Window name, also the channel name
    pub name: String,
    /// Frame in screen coordinates
    pub frame: Rect,
    /// Has key focus
    #[serde(default)]
    pub focused: bool,
    /// Routing flags
    #[serde(default)]
    pub flags: WindowFlags,
    /// Layer type
    #[serde(default)]
    pub window_type: WindowType,
    /// Declares a wallpaper behind it
    #[serde(default)]
    pub has_wallpaper: bool,
    /// Owning application
    #[serde(default)]
    pub application: Option<ApplicationInfo>,
    /// Owner uid
    #[serde(default)]
    pub owner_uid: i32,
    /// Dispatching timeout override
    #[serde(default)]
    pub timeout_ms: Option<i64>,
    /// The consumer never reports events as finished
    #[serde(default)]
    pub unresponsive: bool,
}

/// A pointer in a motion step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PointerSpec {
    /// Pointer id
    pub id: i32,
    /// X coordinate
    pub x: f32,
    /// Y coordinate
    pub y: f32,
}

/// Scenario step. `at_ms` moves the clock forward to that time first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Producer key event
    Key {
        /// Step time
        #[serde(default)]
        at_ms: Option<i64>,
        /// Device
        #[serde(default)]
        device_id: DeviceId,
        /// DOWN or UP
        action: KeyAction,
        /// Key code
        key_code: i32,
    },
    /// Producer touch event
    Motion {
        /// Step time
        #[serde(default)]
        at_ms: Option<i64>,
        /// Device
        #[serde(default)]
        device_id: DeviceId,
        /// Action
        action: MotionAction,
        /// Pointers
        pointers: Vec<PointerSpec>,
    },
    /// Injected event; always asynchronous during replay
    Inject {
        /// Step time
        #[serde(default)]
        at_ms: Option<i64>,
        /// Event
        event: InputEvent,
        /// Injector pid
        #[serde(default)]
        pid: i32,
        /// Injector uid
        #[serde(default)]
        uid: i32,
    },
    /// Input configuration changed
    ConfigurationChanged {
        /// Step time
        #[serde(default)]
        at_ms: Option<i64>,
    },
    /// Device reset
    DeviceReset {
        /// Step time
        #[serde(default)]
        at_ms: Option<i64>,
        /// Device
        device_id: DeviceId,
    },
    /// Let time pass
    Advance {
        /// Milliseconds
        ms: i64,
    },
    /// Move key focus to a window
    Focus {
        /// Window name
        window: String,
    },
    /// Change dispatch mode
    SetDispatchMode {
        /// Dispatch enabled
        enabled: bool,
        /// Dispatch frozen
        #[serde(default)]
        frozen: bool,
    },
    /// Unregister a window's channel and remove the window
    Unregister {
        /// Window name
        window: String,
    },
    /// Move the gesture in progress to another window
    TransferTouch {
        /// Source window
        from: String,
        /// Destination window
        to: String,
    },
}

impl Step {
    /// Absolute time of the step, if it has one.
    pub fn at_ms(&self) -> Option<i64> {
        match self {
            Self::Key { at_ms, .. }
            | Self::Motion { at_ms, .. }
            | Self::Inject { at_ms, .. }
            | Self::ConfigurationChanged { at_ms }
            | Self::DeviceReset { at_ms, .. } => *at_ms,
            Self::Advance { .. }
            | Self::Focus { .. }
            | Self::SetDispatchMode { .. }
            | Self::Unregister { .. }
            | Self::TransferTouch { .. } => None,
        }
    }
}

impl Scenario {
    /// Load a scenario from a TOML or JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario file: {}", path.display()))?;

        let mut scenario: Scenario = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content).context("Failed to parse JSON scenario")?
        } else {
            toml::from_str(&content).context("Failed to parse TOML scenario")?
        };

        if scenario.name.is_empty() {
            scenario.name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        scenario.validate()?;
        Ok(scenario)
    }

    /// Check window references and time ordering.
    pub fn validate(&self) -> Result<()> {
        let known = |name: &str| self.windows.iter().any(|w| w.name == name);

        let mut last_at = i64::MIN;
        for (index, step) in self.steps.iter().enumerate() {
            if let Some(at) = step.at_ms() {
                if at < last_at {
                    anyhow::bail!("Step {} goes back in time ({}ms < {}ms)", index, at, last_at);
                }
                last_at = at;
            }
            match step {
                Step::Focus { window } | Step::Unregister { window } if !known(window) => {
                    anyhow::bail!("Step {} references unknown window '{}'", index, window);
                }
                Step::TransferTouch { from, to } if !known(from) || !known(to) => {
                    anyhow::bail!("Step {} references unknown window", index);
                }
                Step::Motion { pointers, .. } if pointers.is_empty() => {
                    anyhow::bail!("Step {} has no pointers", index);
                }
                Step::Advance { ms } if *ms < 0 => {
                    anyhow::bail!("Step {} advances by a negative amount", index);
                }
                _ => {}
            }
        }

        if self.windows.iter().filter(|w| w.focused).count() > 1 {
            anyhow::bail!("At most one window may be focused");
        }
        Ok(())
    }

    /// Built-in scenario: a key to the focused window and a two-finger
    /// gesture split across two windows.
    pub fn demo() -> Self {
        let toml = r#"
name = "demo"
focused_application = { name = "launcher" }

[[windows]]
name = "left"
frame = { left = 0, top = 0, right = 240, bottom = 800 }
focused = true
flags = 0x00800020

[[windows]]
name = "right"
frame = { left = 240, top = 0, right = 480, bottom = 800 }
flags = 0x00800020

[[steps]]
op = "key"
at_ms = 1
action = "down"
key_code = 29

[[steps]]
op = "key"
at_ms = 60
action = "up"
key_code = 29

[[steps]]
op = "motion"
at_ms = 100
action = "down"
pointers = [{ id = 0, x = 100.0, y = 300.0 }]

[[steps]]
op = "motion"
at_ms = 120
action = { pointer_down = 1 }
pointers = [{ id = 0, x = 100.0, y = 300.0 }, { id = 1, x = 300.0, y = 300.0 }]

[[steps]]
op = "motion"
at_ms = 140
action = "move"
pointers = [{ id = 0, x = 110.0, y = 310.0 }, { id = 1, x = 310.0, y = 310.0 }]

[[steps]]
op = "motion"
at_ms = 160
action = { pointer_up = 1 }
pointers = [{ id = 0, x = 110.0, y = 310.0 }, { id = 1, x = 310.0, y = 310.0 }]

[[steps]]
op = "motion"
at_ms = 180
action = "up"
pointers = [{ id = 0, x = 110.0, y = 310.0 }]
"#;
        toml::from_str(toml).unwrap_or_else(|err| {
            tracing::error!("Built-in demo scenario is invalid: {}", err);
            Scenario::default()
        })
    }
}
