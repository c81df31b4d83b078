//! # lamco-input-dispatcher
//!
//! Routes key and motion events from input devices (and from injecting
//! processes) to windows, one event at a time per window, over
//! flow-controlled channels.
//!
//! The crate provides:
//! - [`dispatcher`] - inbound queue, target resolution, per-channel delivery
//! - [`transport`] - channel abstraction and an in-memory implementation
//! - [`policy`] - the host's decisions (interception, ANR, permissions)
//! - [`replay`] - deterministic scenario driver used by the binary
//!
//! # Architecture
//!
//! ```text
//! lamco-input-dispatcher
//!   ├─> InputDispatcher (notify_*, inject_event, window/focus state)
//!   │     ├─> Inbound queue (batching, throttling, app switch)
//!   │     ├─> Target resolution (focus, touch split, ANR wait)
//!   │     └─> Connections (outbound queue, wait queue, cancellation)
//!   ├─> InputDispatcherThread (dispatch_once loop)
//!   ├─> Looper (channel readiness, timed wakeups)
//!   └─> DispatcherPolicy (host callbacks, run with the lock released)
//! ```
//!
//! # Data Flow
//!
//! **Device Path:** notify_key/notify_motion → policy → inbound queue → targets → channel
//!
//! **Injection Path:** inject_event → validation → inbound queue → result to injector
//!
//! **Completion Path:** consumer finish → looper → wait queue → next dispatch cycle

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Nanosecond clocks and poll timeouts
pub mod clock;

/// Dispatcher and logging configuration
pub mod config;

/// Event dispatcher core
pub mod dispatcher;

/// Event model, validation, and injection tickets
pub mod event;

/// Channel readiness polling
pub mod looper;

/// Host policy callbacks
pub mod policy;

/// Scenario replay
pub mod replay;

/// Input channels
pub mod transport;

/// Window and application descriptions
pub mod window;

pub use clock::{Clock, ManualClock, MonotonicClock, Nsecs};
pub use config::Config;
pub use dispatcher::{DispatchError, DispatcherStats, InputDispatcher, InputDispatcherThread};
pub use event::{InjectionResult, InputEvent, KeyEvent, MotionEvent, NotifyKeyArgs, NotifyMotionArgs, SyncMode};
pub use looper::{ChannelLooper, Looper};
pub use policy::{DispatcherPolicy, PassThroughPolicy};
pub use transport::{ChannelId, InputChannel, MemoryChannel, MemoryChannelClient};
pub use window::{ApplicationInfo, Rect, WindowInfo};
