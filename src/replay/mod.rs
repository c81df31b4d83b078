//! Scenario replay
//!
//! Drives an [`InputDispatcher`] from a [`Scenario`] on a [`ManualClock`].
//! Every window gets an in-memory channel whose consumer is serviced by the
//! runner, so a replay is deterministic and never sleeps.
//!
//! ```text
//! Scenario steps ──► notify_* / inject_event ──► InputDispatcher
//!                                                     │ publish
//!                                                     ▼
//!        ReplayReport ◄── Delivery ◄── MemoryChannelClient (finish)
//! ```

pub mod scenario;

pub use scenario::{PointerSpec, Scenario, Step, WindowSpec};

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::{as_millis_f64, millis, Clock, ManualClock, Nsecs};
use crate::config::DispatcherConfig;
use crate::dispatcher::{DispatcherStats, InputDispatcher};
use crate::event::{DeviceId, InjectionResult, KeyAction, MotionAction, NotifyKeyArgs, NotifyMotionArgs, SyncMode};
use crate::looper::ChannelLooper;
use crate::policy::PassThroughPolicy;
use crate::transport::memory::DEFAULT_SAMPLE_CAPACITY;
use crate::transport::{ChannelId, InputMessage, MemoryChannel, MemoryChannelClient};
use crate::window::WindowInfo;

/// Upper bound on wakeups serviced while moving the clock to one step.
const MAX_WAKEUPS_PER_ADVANCE: usize = 100_000;

/// One message observed by a consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivery {
    /// Receiving window or monitor
    pub window: String,
    /// Clock time of receipt
    pub at_ms: f64,
    /// "key" or "motion"
    pub kind: &'static str,
    /// Resolved action
    pub action: String,
    /// Key code for keys
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_code: Option<i32>,
    /// Repeat count for keys
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_count: Option<i32>,
    /// Pointer ids for motions
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pointer_ids: Vec<i32>,
    /// Samples carried by a motion
    pub samples: usize,
}

impl Delivery {
    fn from_message(window: &str, at: Nsecs, message: &InputMessage) -> Self {
        match message {
            InputMessage::Key(key) => Self {
                window: window.to_string(),
                at_ms: as_millis_f64(at),
                kind: "key",
                action: format!("{:?}", key.action),
                key_code: Some(key.key_code),
                repeat_count: Some(key.repeat_count),
                pointer_ids: Vec::new(),
                samples: 0,
            },
            InputMessage::Motion(motion) => Self {
                window: window.to_string(),
                at_ms: as_millis_f64(at),
                kind: "motion",
                action: format!("{:?}", motion.action),
                key_code: None,
                repeat_count: None,
                pointer_ids: motion.pointer_ids(),
                samples: motion.samples.len(),
            },
        }
    }
}

/// Outcome of an injection step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InjectionOutcome {
    /// Clock time of the step
    pub at_ms: f64,
    /// Result returned to the injector
    pub result: InjectionResult,
}

/// Result of replaying one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    /// Scenario name
    pub scenario: String,
    /// Wall-clock start, RFC 3339
    pub started_at: String,
    /// Scenario clock at the end
    pub duration_ms: f64,
    /// Everything the consumers saw, in order
    pub deliveries: Vec<Delivery>,
    /// Injection results
    pub injections: Vec<InjectionOutcome>,
    /// Producer events the dispatcher refused
    pub rejected: Vec<String>,
    /// Dispatcher counters
    pub stats: DispatcherStats,
    /// State dump after the last step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dump: Option<String>,
}

struct Consumer {
    name: String,
    client: Option<MemoryChannelClient>,
    responsive: bool,
}

/// Replays a scenario against a fresh dispatcher.
pub struct ScenarioRunner {
    name: String,
    dispatcher: InputDispatcher,
    clock: ManualClock,
    consumers: Vec<Consumer>,
    windows: Vec<WindowInfo>,
    channels: HashMap<String, ChannelId>,
    motion_down_times: HashMap<DeviceId, Nsecs>,
    key_down_times: HashMap<(DeviceId, i32), Nsecs>,
    deliveries: Vec<Delivery>,
    injections: Vec<InjectionOutcome>,
    rejected: Vec<String>,
}

impl ScenarioRunner {
    /// Build the dispatcher, register every window and monitor, and install
    /// the window layout. The clock starts at zero.
    pub fn new(scenario: &Scenario, config: DispatcherConfig) -> Result<Self> {
        let clock = ManualClock::new(0);
        let looper = Arc::new(ChannelLooper::new());
        let dispatcher = InputDispatcher::new(
            config,
            Arc::new(PassThroughPolicy::default()),
            looper.clone(),
            Arc::new(clock.clone()),
        );

        let mut consumers = Vec::new();
        let mut windows = Vec::new();
        let mut channels = HashMap::new();

        for spec in &scenario.windows {
            let (channel, client) = MemoryChannel::pair(spec.name.clone(), looper.handle(), DEFAULT_SAMPLE_CAPACITY);
            let id = client.id();
            dispatcher
                .register_channel(Box::new(channel), false)
                .with_context(|| format!("Failed to register window '{}'", spec.name))?;

            let mut window = WindowInfo::new(spec.name.clone(), id, spec.frame);
            window.flags = spec.flags;
            window.window_type = spec.window_type;
            window.has_wallpaper = spec.has_wallpaper;
            window.has_focus = spec.focused;
            window.application = spec.application.clone();
            window.owner_uid = spec.owner_uid;
            window.dispatching_timeout = spec.timeout_ms.map(millis);
            windows.push(window);

            channels.insert(spec.name.clone(), id);
            consumers.push(Consumer {
                name: spec.name.clone(),
                client: Some(client),
                responsive: !spec.unresponsive,
            });
        }

        for name in &scenario.monitors {
            let (channel, client) = MemoryChannel::pair(name.clone(), looper.handle(), DEFAULT_SAMPLE_CAPACITY);
            dispatcher
                .register_channel(Box::new(channel), true)
                .with_context(|| format!("Failed to register monitor '{}'", name))?;
            consumers.push(Consumer {
                name: name.clone(),
                client: Some(client),
                responsive: true,
            });
        }

        dispatcher.set_focused_application(scenario.focused_application.clone());
        dispatcher.set_input_windows(windows.clone());

        debug!(
            "Scenario '{}' ready: {} windows, {} monitors",
            scenario.name,
            scenario.windows.len(),
            scenario.monitors.len()
        );

        Ok(Self {
            name: scenario.name.clone(),
            dispatcher,
            clock,
            consumers,
            windows,
            channels,
            motion_down_times: HashMap::new(),
            key_down_times: HashMap::new(),
            deliveries: Vec::new(),
            injections: Vec::new(),
            rejected: Vec::new(),
        })
    }

    /// The dispatcher under test.
    pub fn dispatcher(&self) -> &InputDispatcher {
        &self.dispatcher
    }

    /// Current scenario time.
    pub fn now(&self) -> Nsecs {
        self.clock.now()
    }

    /// Deliveries observed so far.
    pub fn deliveries(&self) -> &[Delivery] {
        &self.deliveries
    }

    /// Run every step, settle, and build the report.
    pub fn run(mut self, steps: &[Step], include_dump: bool) -> ReplayReport {
        let started_at = chrono::Utc::now().to_rfc3339();
        for step in steps {
            self.apply(step);
        }
        self.settle();

        let report = ReplayReport {
            scenario: self.name.clone(),
            started_at,
            duration_ms: as_millis_f64(self.clock.now()),
            deliveries: std::mem::take(&mut self.deliveries),
            injections: std::mem::take(&mut self.injections),
            rejected: std::mem::take(&mut self.rejected),
            stats: self.dispatcher.stats(),
            dump: include_dump.then(|| self.dispatcher.dump_state()),
        };
        info!(
            "Scenario '{}' replayed: {} deliveries, {} injections, {} rejected",
            report.scenario,
            report.deliveries.len(),
            report.injections.len(),
            report.rejected.len()
        );
        report
    }

    /// Apply one step, moving the clock first when the step is timed.
    pub fn apply(&mut self, step: &Step) {
        if let Some(at) = step.at_ms() {
            self.advance_to(millis(at));
        }
        let now = self.clock.now();

        match step {
            Step::Key {
                device_id,
                action,
                key_code,
                ..
            } => {
                let mut args = NotifyKeyArgs::new(now, *device_id, *action, *key_code);
                match action {
                    KeyAction::Down => {
                        let down = *self.key_down_times.entry((*device_id, *key_code)).or_insert(now);
                        args.down_time = down;
                    }
                    KeyAction::Up => {
                        if let Some(down) = self.key_down_times.remove(&(*device_id, *key_code)) {
                            args.down_time = down;
                        }
                    }
                    _ => {}
                }
                if let Err(err) = self.dispatcher.notify_key(&args) {
                    self.reject(format!("key {}: {}", key_code, err));
                }
            }
            Step::Motion {
                device_id,
                action,
                pointers,
                ..
            } => {
                if *action == MotionAction::Down {
                    self.motion_down_times.insert(*device_id, now);
                }
                let down_time = self.motion_down_times.get(device_id).copied().unwrap_or(now);
                let pointers: Vec<(i32, f32, f32)> = pointers.iter().map(|p| (p.id, p.x, p.y)).collect();
                let args = NotifyMotionArgs::touch(now, *device_id, *action, down_time, &pointers);
                if let Err(err) = self.dispatcher.notify_motion(&args) {
                    self.reject(format!("motion {:?}: {}", action, err));
                }
                if matches!(action, MotionAction::Up | MotionAction::Cancel) {
                    self.motion_down_times.remove(device_id);
                }
            }
            Step::Inject { event, pid, uid, .. } => {
                let result = self.dispatcher.inject_event(event, *pid, *uid, SyncMode::None, 0);
                self.injections.push(InjectionOutcome {
                    at_ms: as_millis_f64(now),
                    result,
                });
            }
            Step::ConfigurationChanged { .. } => self.dispatcher.notify_configuration_changed(now),
            Step::DeviceReset { device_id, .. } => self.dispatcher.notify_device_reset(now, *device_id),
            Step::Advance { ms } => self.advance_to(now.saturating_add(millis(*ms))),
            Step::Focus { window } => {
                for info in &mut self.windows {
                    info.has_focus = info.name == *window;
                }
                self.dispatcher.set_input_windows(self.windows.clone());
            }
            Step::SetDispatchMode { enabled, frozen } => self.dispatcher.set_dispatch_mode(*enabled, *frozen),
            Step::Unregister { window } => self.unregister(window),
            Step::TransferTouch { from, to } => {
                let (Some(&from_id), Some(&to_id)) = (self.channels.get(from), self.channels.get(to)) else {
                    self.reject(format!("transfer {} -> {}: unknown window", from, to));
                    return;
                };
                if !self.dispatcher.transfer_touch_focus(from_id, to_id) {
                    debug!("Touch transfer {} -> {} had nothing to move", from, to);
                }
            }
        }
        self.settle();
    }

    fn unregister(&mut self, window: &str) {
        let Some(id) = self.channels.remove(window) else {
            self.reject(format!("unregister {}: unknown window", window));
            return;
        };
        if let Err(err) = self.dispatcher.unregister_channel(id) {
            self.reject(format!("unregister {}: {}", window, err));
        }
        self.windows.retain(|w| w.name != window);
        self.dispatcher.set_input_windows(self.windows.clone());
        if let Some(consumer) = self.consumers.iter_mut().find(|c| c.name == window) {
            consumer.client = None;
        }
    }

    fn reject(&mut self, message: String) {
        warn!("Scenario '{}': {}", self.name, message);
        self.rejected.push(message);
    }

    /// Dispatch and service consumers until nothing is due at the current
    /// time. Returns the dispatcher's next wakeup.
    pub fn settle(&mut self) -> Nsecs {
        loop {
            let wakeup = self.dispatcher.dispatch_pending();
            let now = self.clock.now();
            let mut progressed = false;
            for consumer in &mut self.consumers {
                let Some(client) = consumer.client.as_mut() else {
                    continue;
                };
                while let Some(message) = client.try_receive() {
                    self.deliveries.push(Delivery::from_message(&consumer.name, now, &message));
                    progressed = true;
                    if !consumer.responsive {
                        break;
                    }
                    if let Err(err) = client.finish(true) {
                        warn!("{}: failed to finish: {}", consumer.name, err);
                        break;
                    }
                }
            }
            if !progressed {
                return wakeup;
            }
        }
    }

    /// Move the clock to `target`, servicing every wakeup on the way.
    pub fn advance_to(&mut self, target: Nsecs) {
        for _ in 0..MAX_WAKEUPS_PER_ADVANCE {
            let now = self.clock.now();
            let wakeup = self.settle();
            if wakeup <= now || wakeup >= target {
                break;
            }
            self.clock.set(wakeup);
        }
        if target > self.clock.now() {
            self.clock.set(target);
        }
        self.settle();
    }
}

/// Replay a scenario on a fresh dispatcher.
pub fn replay(scenario: &Scenario, config: DispatcherConfig, include_dump: bool) -> Result<ReplayReport> {
    let runner = ScenarioRunner::new(scenario, config)?;
    Ok(runner.run(&scenario.steps, include_dump))
}
