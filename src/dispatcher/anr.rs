//! Not-ready wait state machine
//!
//! While targets are not ready the pending event stays put and the loop
//! sleeps until the wait deadline. Past the deadline the policy is asked
//! whether to keep waiting; giving up fails the event and cancels whatever
//! the unresponsive channel believed was down.

use std::sync::Arc;
use tracing::{debug, info};

use super::command::Command;
use super::input_state::{CancelationMode, CancelationOptions};
use super::pool::EventId;
use super::state::DispatcherState;
use super::target::{InputTarget, Resolution};
use crate::clock::{as_millis_f64, Nsecs, NSECS_MAX, NSECS_MIN};
use crate::event::InjectionResult;
use crate::transport::ChannelId;
use crate::window::{ApplicationInfo, WindowInfo};

/// Why dispatch is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum WaitCause {
    /// Not waiting
    #[default]
    None,
    /// Waiting on a system window (no deadline)
    SystemNotReady,
    /// Waiting on an application
    ApplicationNotReady,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct AnrState {
    pub(crate) cause: WaitCause,
    pub(crate) start_time: Nsecs,
    pub(crate) deadline: Nsecs,
    pub(crate) timeout_expired: bool,
    pub(crate) waiting_application: Option<ApplicationInfo>,
}

impl DispatcherState {
    /// Enter or continue a not-ready wait for `id`.
    pub(crate) fn handle_targets_not_ready(
        &mut self,
        now: Nsecs,
        id: EventId,
        application: Option<&ApplicationInfo>,
        window: Option<&Arc<WindowInfo>>,
        next_wakeup: &mut Nsecs,
    ) -> Resolution {
        if application.is_none() && window.is_none() {
            if self.anr.cause != WaitCause::SystemNotReady {
                debug!("System not ready for input, waiting");
                self.anr = AnrState {
                    cause: WaitCause::SystemNotReady,
                    start_time: now,
                    deadline: NSECS_MAX,
                    timeout_expired: false,
                    waiting_application: None,
                };
            }
        } else if self.anr.cause != WaitCause::ApplicationNotReady {
            let timeout = window
                .and_then(|w| w.dispatching_timeout)
                .or_else(|| window.and_then(|w| w.application.as_ref()).and_then(|a| a.dispatching_timeout))
                .or_else(|| application.and_then(|a| a.dispatching_timeout))
                .unwrap_or_else(|| self.config.default_dispatching_timeout());
            let waiting_application = window
                .and_then(|w| w.application.clone())
                .or_else(|| application.cloned());

            debug!(
                "Waiting on {} (timeout {:.1}ms)",
                target_label(application, window),
                as_millis_f64(timeout)
            );
            self.anr = AnrState {
                cause: WaitCause::ApplicationNotReady,
                start_time: now,
                deadline: now.saturating_add(timeout),
                timeout_expired: false,
                waiting_application,
            };
        }

        if self.anr.timeout_expired {
            return Resolution::Failed(InjectionResult::TimedOut);
        }

        if now >= self.anr.deadline {
            self.on_anr(now, id, application, window);
            *next_wakeup = NSECS_MIN;
        } else if self.anr.deadline < *next_wakeup {
            *next_wakeup = self.anr.deadline;
        }
        Resolution::Pending
    }

    fn on_anr(&mut self, now: Nsecs, id: EventId, application: Option<&ApplicationInfo>, window: Option<&Arc<WindowInfo>>) {
        let event_time = self.pool.get(id).map_or(now, |entry| entry.event_time);
        info!(
            "Not responding: {} ({:.1}ms since event, {:.1}ms waiting)",
            target_label(application, window),
            as_millis_f64(now - event_time),
            as_millis_f64(self.time_spent_waiting_for_application(now))
        );
        self.stats.anrs += 1;
        self.post_command(Command::NotifyAnr {
            application: application.cloned(),
            window: window.cloned(),
        });
    }

    /// Apply the policy's answer to an ANR notification.
    pub(crate) fn resume_after_targets_not_ready_timeout(&mut self, new_timeout: Nsecs, channel: Option<ChannelId>) {
        if new_timeout > 0 {
            self.anr.deadline = self.now().saturating_add(new_timeout);
            return;
        }

        self.anr.timeout_expired = true;
        self.touch_state.reset();

        if let Some(channel) = channel {
            let normal = self.connections.get(&channel).is_some_and(|c| c.is_normal());
            if normal {
                let options = CancelationOptions::new(CancelationMode::All, "application not responding");
                self.synthesize_cancelation_events_for_channel(channel, &options);
            }
        }
    }

    /// Time spent in the current application wait.
    pub(crate) fn time_spent_waiting_for_application(&self, now: Nsecs) -> Nsecs {
        if self.anr.cause == WaitCause::ApplicationNotReady {
            now - self.anr.start_time
        } else {
            0
        }
    }

    pub(crate) fn reset_anr_timeouts(&mut self) {
        self.anr.cause = WaitCause::None;
        self.anr.waiting_application = None;
    }

    pub(crate) fn reset_targets(&mut self) {
        self.targets_valid = false;
        self.targets.clear();
        self.reset_anr_timeouts();
    }

    pub(crate) fn commit_targets(&mut self, targets: Vec<InputTarget>) {
        self.targets = targets;
        self.targets_valid = true;
    }
}

fn target_label(application: Option<&ApplicationInfo>, window: Option<&Arc<WindowInfo>>) -> String {
    match (application, window) {
        (_, Some(window)) => match &window.application {
            Some(app) => format!("{} - {}", app.name, window.name),
            None => window.name.clone(),
        },
        (Some(application), None) => application.name.clone(),
        (None, None) => "<unknown application or window>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::Rect;

    #[test]
    fn test_target_label() {
        let app = ApplicationInfo::new("mail");
        let window = Arc::new(
            WindowInfo::new("inbox", ChannelId::from_raw(1), Rect::new(0, 0, 1, 1)).with_application(app.clone()),
        );
        assert_eq!(target_label(Some(&app), None), "mail");
        assert_eq!(target_label(None, Some(&window)), "mail - inbox");
        assert_eq!(target_label(None, None), "<unknown application or window>");
    }
}
