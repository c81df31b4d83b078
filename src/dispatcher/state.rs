//! Lock-protected dispatcher state
//!
//! Everything the dispatch loop mutates lives in [`DispatcherState`], behind
//! the single dispatcher mutex. Behaviour is spread over the sibling modules
//! as `impl DispatcherState` blocks.

use parking_lot::Condvar;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

use super::anr::AnrState;
use super::command::Command;
use super::connection::Connection;
use super::pool::{EventId, EventPool};
use super::stats::DispatcherStats;
use super::target::InputTarget;
use super::touch::TouchState;
use crate::clock::{Clock, Nsecs, NSECS_MAX};
use crate::config::DispatcherConfig;
use crate::event::{DeviceId, InjectionResult, Source};
use crate::policy::DispatcherPolicy;
use crate::transport::ChannelId;
use crate::window::{ApplicationInfo, WindowInfo};

/// Condition variables injectors wait on, paired with the dispatcher mutex.
#[derive(Debug, Default)]
pub(crate) struct InjectionSignals {
    /// An injection ticket was resolved
    pub(crate) result_available: Condvar,
    /// A ticket's pending foreground dispatch count reached zero
    pub(crate) sync_finished: Condvar,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct KeyRepeatState {
    pub(crate) last_key: Option<EventId>,
    pub(crate) next_repeat_time: Nsecs,
}

impl Default for KeyRepeatState {
    fn default() -> Self {
        Self {
            last_key: None,
            next_repeat_time: NSECS_MAX,
        }
    }
}

/// Last motion that passed the throttle gate.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ThrottleState {
    pub(crate) last_event_time: Nsecs,
    pub(crate) last_device_id: Option<DeviceId>,
    pub(crate) last_source: Source,
    pub(crate) last_was_move: bool,
}

pub(crate) struct DispatcherState {
    pub(crate) config: DispatcherConfig,
    pub(crate) policy: Arc<dyn DispatcherPolicy>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) signals: Arc<InjectionSignals>,

    pub(crate) pool: EventPool,
    pub(crate) inbound: VecDeque<EventId>,
    pub(crate) pending_event: Option<EventId>,
    pub(crate) commands: VecDeque<Command>,

    pub(crate) connections: BTreeMap<ChannelId, Connection>,
    /// Connections with a non-empty outbound queue, in activation order
    pub(crate) active_connections: Vec<ChannelId>,
    pub(crate) monitoring_channels: Vec<ChannelId>,

    /// Front to back
    pub(crate) windows: Vec<Arc<WindowInfo>>,
    pub(crate) focused_window: Option<Arc<WindowInfo>>,
    pub(crate) focused_application: Option<ApplicationInfo>,
    pub(crate) touch_state: TouchState,
    /// Window the hovering pointer was last seen over
    pub(crate) last_hover_window: Option<Arc<WindowInfo>>,

    pub(crate) dispatch_enabled: bool,
    pub(crate) dispatch_frozen: bool,
    pub(crate) input_filter_enabled: bool,

    pub(crate) app_switch_saw_key_down: bool,
    pub(crate) app_switch_due_time: Nsecs,
    pub(crate) next_unblocked_event: Option<EventId>,

    pub(crate) key_repeat: KeyRepeatState,
    pub(crate) throttle: ThrottleState,

    pub(crate) targets: Vec<InputTarget>,
    pub(crate) targets_valid: bool,
    pub(crate) anr: AnrState,

    pub(crate) stats: DispatcherStats,
}

impl DispatcherState {
    pub(crate) fn new(
        config: DispatcherConfig,
        policy: Arc<dyn DispatcherPolicy>,
        clock: Arc<dyn Clock>,
        signals: Arc<InjectionSignals>,
    ) -> Self {
        Self {
            config,
            policy,
            clock,
            signals,
            pool: EventPool::new(),
            inbound: VecDeque::new(),
            pending_event: None,
            commands: VecDeque::new(),
            connections: BTreeMap::new(),
            active_connections: Vec::new(),
            monitoring_channels: Vec::new(),
            windows: Vec::new(),
            focused_window: None,
            focused_application: None,
            touch_state: TouchState::default(),
            last_hover_window: None,
            dispatch_enabled: true,
            dispatch_frozen: false,
            input_filter_enabled: false,
            app_switch_saw_key_down: false,
            app_switch_due_time: NSECS_MAX,
            next_unblocked_event: None,
            key_repeat: KeyRepeatState::default(),
            throttle: ThrottleState::default(),
            targets: Vec::new(),
            targets_valid: false,
            anr: AnrState::default(),
            stats: DispatcherStats::default(),
        }
    }

    pub(crate) fn now(&self) -> Nsecs {
        self.clock.now()
    }

    pub(crate) fn post_command(&mut self, command: Command) {
        self.commands.push_back(command);
    }

    /// Drop one reference to an event record.
    pub(crate) fn release_event(&mut self, id: EventId) {
        if let Some(freed) = self.pool.release(id) {
            if self.next_unblocked_event == Some(id) {
                self.next_unblocked_event = None;
            }
            if freed.injection.is_some() {
                // Freeing may have failed a pending ticket.
                self.signals.result_available.notify_all();
            }
        }
    }

    /// Release an event that is leaving the inbound side of the dispatcher.
    pub(crate) fn release_inbound_event(&mut self, id: EventId) {
        let pending_ticket = self
            .pool
            .get(id)
            .and_then(|entry| entry.injection.as_ref())
            .is_some_and(|ticket| ticket.result() == InjectionResult::Pending);
        if pending_ticket {
            debug!("Injected event dropped before dispatch");
            self.set_injection_result(id, InjectionResult::Failed);
        }
        if self.next_unblocked_event == Some(id) {
            self.next_unblocked_event = None;
        }
        self.release_event(id);
    }

    /// Resolve the injection ticket of `id`, if any, and wake waiting injectors.
    pub(crate) fn set_injection_result(&mut self, id: EventId, result: InjectionResult) {
        let Some(ticket) = self.pool.get(id).and_then(|entry| entry.injection.clone()) else {
            return;
        };
        if !ticket.resolve(result) {
            return;
        }
        if ticket.is_async {
            match result {
                InjectionResult::Succeeded => {}
                InjectionResult::Failed => warn!("Async injection failed"),
                InjectionResult::PermissionDenied => {
                    warn!("Async injection denied")
                }
                InjectionResult::TimedOut => warn!("Async injection timed out"),
                InjectionResult::Pending => {}
            }
        }
        self.signals.result_available.notify_all();
    }

    pub(crate) fn increment_pending_foreground(&self, id: EventId) {
        if let Some(ticket) = self.pool.get(id).and_then(|entry| entry.injection.as_ref()) {
            ticket.increment_pending_foreground();
        }
    }

    pub(crate) fn decrement_pending_foreground(&self, id: EventId) {
        if let Some(ticket) = self.pool.get(id).and_then(|entry| entry.injection.as_ref()) {
            if ticket.decrement_pending_foreground() == 0 {
                self.signals.sync_finished.notify_all();
            }
        }
    }

    /// Window whose channel is `channel`.
    pub(crate) fn window_for_channel(&self, channel: ChannelId) -> Option<Arc<WindowInfo>> {
        self.windows.iter().find(|w| w.channel == Some(channel)).cloned()
    }

    pub(crate) fn has_window(&self, window: &WindowInfo) -> bool {
        self.windows.iter().any(|w| super::touch::same_window(w, window))
    }

    pub(crate) fn activate_connection(&mut self, channel: ChannelId) {
        if !self.active_connections.contains(&channel) {
            self.active_connections.push(channel);
        }
    }

    pub(crate) fn deactivate_connection(&mut self, channel: ChannelId) {
        self.active_connections.retain(|&c| c != channel);
    }
}
