//! Human-readable state dump

use std::fmt::{self, Write};

use super::state::DispatcherState;
use crate::clock::as_millis_f64;

impl DispatcherState {
    /// Append a description of the dispatcher state to `out`.
    pub(crate) fn dump(&self, out: &mut String) {
        // Writing into a String cannot fail.
        let _ = self.write_dump(out);
    }

    fn write_dump(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "  DispatchEnabled: {}", self.dispatch_enabled)?;
        writeln!(out, "  DispatchFrozen: {}", self.dispatch_frozen)?;
        writeln!(out, "  InputFilterEnabled: {}", self.input_filter_enabled)?;

        match &self.focused_application {
            Some(application) => writeln!(
                out,
                "  FocusedApplication: name='{}', timeout={:.3}ms",
                application.name,
                as_millis_f64(
                    application
                        .dispatching_timeout
                        .unwrap_or_else(|| self.config.default_dispatching_timeout())
                )
            )?,
            None => writeln!(out, "  FocusedApplication: <null>")?,
        }

        match &self.focused_window {
            Some(window) => writeln!(out, "  FocusedWindow: name='{}'", window.name)?,
            None => writeln!(out, "  FocusedWindow: name='<null>'")?,
        }

        match &self.last_hover_window {
            Some(window) => writeln!(out, "  LastHoverWindow: name='{}'", window.name)?,
            None => writeln!(out, "  LastHoverWindow: name='<null>'")?,
        }

        let touch = &self.touch_state;
        writeln!(out, "  TouchDown: {}", touch.down)?;
        writeln!(out, "  TouchSplit: {}", touch.split)?;
        match touch.device_id {
            Some(device_id) => writeln!(out, "  TouchDeviceId: {}", device_id)?,
            None => writeln!(out, "  TouchDeviceId: -1")?,
        }
        writeln!(out, "  TouchSource: 0x{:08x}", touch.source.0)?;
        if touch.windows.is_empty() {
            writeln!(out, "  TouchedWindows: <none>")?;
        } else {
            writeln!(out, "  TouchedWindows:")?;
            for (i, touched) in touch.windows.iter().enumerate() {
                writeln!(
                    out,
                    "    {}: name='{}', pointers={}, flags=0x{:x}",
                    i,
                    touched.window.name,
                    touched.pointer_ids,
                    touched.target_flags.bits()
                )?;
            }
        }

        if self.windows.is_empty() {
            writeln!(out, "  Windows: <none>")?;
        } else {
            writeln!(out, "  Windows:")?;
            for (i, window) in self.windows.iter().enumerate() {
                let frame = window.frame;
                writeln!(
                    out,
                    "    {}: name='{}', paused={}, focus={}, wallpaper={}, visible={}, keys={}, \
                     flags=0x{:08x}, type={:?}, frame=[{},{}][{},{}], pid={}, uid={}",
                    i,
                    window.name,
                    window.paused,
                    window.has_focus,
                    window.has_wallpaper,
                    window.visible,
                    window.can_receive_keys,
                    window.flags.bits(),
                    window.window_type,
                    frame.left,
                    frame.top,
                    frame.right,
                    frame.bottom,
                    window.owner_pid,
                    window.owner_uid
                )?;
            }
        }

        if self.monitoring_channels.is_empty() {
            writeln!(out, "  MonitoringChannels: <none>")?;
        } else {
            writeln!(out, "  MonitoringChannels:")?;
            for (i, channel) in self.monitoring_channels.iter().enumerate() {
                let name = self.connections.get(channel).map_or("?", |c| c.name());
                writeln!(out, "    {}: '{}'", i, name)?;
            }
        }

        writeln!(out, "  InboundQueue: length={}", self.inbound.len())?;

        if self.active_connections.is_empty() {
            writeln!(out, "  ActiveConnections: <none>")?;
        } else {
            writeln!(out, "  ActiveConnections:")?;
            for (i, channel) in self.active_connections.iter().enumerate() {
                if let Some(connection) = self.connections.get(channel) {
                    writeln!(
                        out,
                        "    {}: '{}', status={}, outbound={}, neutral={}",
                        i,
                        connection.name(),
                        connection.status(),
                        connection.outbound_queue.len(),
                        connection.input_state.is_neutral()
                    )?;
                }
            }
        }

        let waited = self.time_spent_waiting_for_application(self.now());
        if waited > 0 {
            writeln!(out, "  WaitingOnApplication: {:.1}ms", as_millis_f64(waited))?;
        }

        if self.is_app_switch_pending() {
            let remaining = self.app_switch_due_time - self.now();
            writeln!(out, "  AppSwitch: pending, due in {:.1}ms", as_millis_f64(remaining))?;
        } else {
            writeln!(out, "  AppSwitch: not pending")?;
        }

        writeln!(out, "  Configuration:")?;
        writeln!(
            out,
            "    MaxEventsPerSecond: {}",
            self.config.max_events_per_second
        )?;
        writeln!(
            out,
            "    KeyRepeatDelay: {:.1}ms",
            as_millis_f64(self.config.key_repeat_delay())
        )?;
        writeln!(
            out,
            "    KeyRepeatTimeout: {:.1}ms",
            as_millis_f64(self.config.key_repeat_timeout())
        )?;

        let stats = &self.stats;
        writeln!(out, "  Statistics:")?;
        writeln!(
            out,
            "    received={}, dispatched={}, dropped={}, throttled={}, batched={}, coalesced={}, streamed={}",
            stats.events_received,
            stats.events_dispatched,
            stats.total_dropped(),
            stats.throttled,
            stats.samples_batched,
            stats.samples_coalesced,
            stats.samples_streamed
        )?;
        writeln!(
            out,
            "    key_repeats={}, cancelations={}, anrs={}, broken={}",
            stats.key_repeats, stats.cancelations, stats.anrs, stats.broken_channels
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{millis, ManualClock};
    use crate::config::DispatcherConfig;
    use crate::dispatcher::anr::{AnrState, WaitCause};
    use crate::dispatcher::state::InjectionSignals;
    use crate::policy::PassThroughPolicy;
    use crate::transport::ChannelId;
    use crate::window::{ApplicationInfo, Rect, WindowInfo};
    use std::sync::Arc;

    #[test]
    fn test_dump_lists_focus_and_windows() {
        let mut state = DispatcherState::new(
            DispatcherConfig::default(),
            Arc::new(PassThroughPolicy::default()),
            Arc::new(ManualClock::new(0)),
            Arc::new(InjectionSignals::default()),
        );
        let window = Arc::new(WindowInfo::new("editor", ChannelId::next(), Rect::new(0, 0, 100, 100)).focused());
        state.windows.push(window.clone());
        state.focused_window = Some(window);
        state.focused_application = Some(ApplicationInfo::new("notes").with_timeout_ms(2_000));

        let mut out = String::new();
        state.dump(&mut out);

        assert!(out.contains("DispatchEnabled: true"));
        assert!(out.contains("FocusedApplication: name='notes', timeout=2000.000ms"));
        assert!(out.contains("FocusedWindow: name='editor'"));
        assert!(out.contains("0: name='editor'"));
        assert!(out.contains("TouchedWindows: <none>"));
        assert!(out.contains("AppSwitch: not pending"));
        assert!(out.contains("InputFilterEnabled: false"));
        assert!(out.contains("LastHoverWindow: name='<null>'"));
        assert!(!out.contains("WaitingOnApplication"));
    }

    #[test]
    fn test_dump_reports_application_wait() {
        let clock = ManualClock::new(millis(10));
        let mut state = DispatcherState::new(
            DispatcherConfig::default(),
            Arc::new(PassThroughPolicy::default()),
            Arc::new(clock.clone()),
            Arc::new(InjectionSignals::default()),
        );
        state.anr = AnrState {
            cause: WaitCause::ApplicationNotReady,
            start_time: millis(10),
            deadline: millis(5_010),
            timeout_expired: false,
            waiting_application: Some(ApplicationInfo::new("notes")),
        };
        clock.advance_ms(250);

        let mut out = String::new();
        state.dump(&mut out);
        assert!(out.contains("WaitingOnApplication: 250.0ms"), "{}", out);
    }
}
