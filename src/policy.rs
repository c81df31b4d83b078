//! Dispatcher policy seam
//!
//! The policy service decides what reaches applications. Methods marked
//! *locked* are called while the dispatcher lock is held and must not call
//! back into the dispatcher; the others run from the post-unlock command
//! queue and may re-enter it freely.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Nsecs;
use crate::event::{InputEvent, KeyEvent, PolicyFlag, PolicyFlags};
use crate::transport::ChannelId;
use crate::window::{ApplicationInfo, WindowInfo};

/// Kind of user activity reported to the power policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserActivityKind {
    /// Anything that is neither a button nor a touch
    Other,
    /// Key press
    Button,
    /// Touch screen contact
    Touch,
}

/// Policy service consulted by the dispatcher.
#[cfg_attr(test, mockall::automock)]
pub trait DispatcherPolicy: Send + Sync {
    /// Input configuration changed.
    fn notify_configuration_changed(&self, when: Nsecs);

    /// A target has not finished its events in time. Returns a new timeout to
    /// keep waiting, or zero (or less) to give up on the target.
    fn notify_anr(&self, application: Option<ApplicationInfo>, window: Option<Arc<WindowInfo>>) -> Nsecs;

    /// A channel failed and was removed from dispatch.
    fn notify_input_channel_broken(&self, channel: ChannelId, name: &str);

    /// Adjust policy flags of a key before it is queued. Runs on the producer thread.
    fn intercept_key_before_queueing(&self, event: &KeyEvent, policy_flags: PolicyFlags) -> PolicyFlags;

    /// Adjust policy flags of a motion before it is queued. Runs on the producer thread.
    fn intercept_motion_before_queueing(&self, when: Nsecs, policy_flags: PolicyFlags) -> PolicyFlags;

    /// Last look at a key before it is dispatched to the focused window.
    /// Negative consumes the key, zero continues, positive asks again after
    /// that many nanoseconds.
    fn intercept_key_before_dispatching(
        &self,
        window: Option<Arc<WindowInfo>>,
        event: &KeyEvent,
        policy_flags: PolicyFlags,
    ) -> Nsecs;

    /// The focused window did not handle `event`. Returns the key to deliver
    /// in its place, or `None` for no fallback.
    fn dispatch_unhandled_key(
        &self,
        window: Option<Arc<WindowInfo>>,
        event: &KeyEvent,
        policy_flags: PolicyFlags,
    ) -> Option<KeyEvent>;

    /// Offer a producer event to the input filter. Returns false if the
    /// filter consumed it; the filter re-injects whatever it wants delivered.
    fn filter_input_event(&self, event: &InputEvent, policy_flags: PolicyFlags) -> bool;

    /// A switch (lid, headphone jack) changed state. Switches are never
    /// dispatched to windows.
    fn notify_switch(&self, when: Nsecs, switch_code: i32, switch_value: i32, policy_flags: PolicyFlags);

    /// User activity occurred.
    fn poke_user_activity(&self, event_time: Nsecs, kind: UserActivityKind);

    /// May the injector target windows it does not own? Asked once per
    /// injection, before the event is queued.
    fn check_inject_events_permission(&self, injector_pid: i32, injector_uid: i32) -> bool;

    /// Synthetic key repeat allowed? (*locked*)
    fn is_key_repeat_enabled(&self) -> bool;
}

/// Policy that lets every event through and logs notifications.
///
/// Used by the replay binary and as a default for embedding.
#[derive(Debug, Clone)]
pub struct PassThroughPolicy {
    /// Timeout returned from ANR notifications (zero gives up)
    pub anr_extension: Nsecs,
    /// Answer to permission checks for non-root injectors
    pub allow_injection: bool,
    /// Answer to key repeat queries
    pub key_repeat_enabled: bool,
}

impl Default for PassThroughPolicy {
    fn default() -> Self {
        Self {
            anr_extension: 0,
            allow_injection: true,
            key_repeat_enabled: true,
        }
    }
}

impl DispatcherPolicy for PassThroughPolicy {
    fn notify_configuration_changed(&self, when: Nsecs) {
        debug!("Configuration changed at {}", when);
    }

    fn notify_anr(&self, application: Option<ApplicationInfo>, window: Option<Arc<WindowInfo>>) -> Nsecs {
        warn!(
            "Application not responding: app={} window={}",
            application.as_ref().map_or("<none>", |a| a.name.as_str()),
            window.as_ref().map_or("<none>", |w| w.name.as_str())
        );
        self.anr_extension
    }

    fn notify_input_channel_broken(&self, channel: ChannelId, name: &str) {
        warn!("Input channel {} '{}' broken", channel, name);
    }

    fn intercept_key_before_queueing(&self, _event: &KeyEvent, policy_flags: PolicyFlags) -> PolicyFlags {
        policy_flags | PolicyFlag::PassToUser
    }

    fn intercept_motion_before_queueing(&self, _when: Nsecs, policy_flags: PolicyFlags) -> PolicyFlags {
        policy_flags | PolicyFlag::PassToUser
    }

    fn intercept_key_before_dispatching(
        &self,
        _window: Option<Arc<WindowInfo>>,
        _event: &KeyEvent,
        _policy_flags: PolicyFlags,
    ) -> Nsecs {
        0
    }

    fn dispatch_unhandled_key(
        &self,
        _window: Option<Arc<WindowInfo>>,
        _event: &KeyEvent,
        _policy_flags: PolicyFlags,
    ) -> Option<KeyEvent> {
        None
    }

    fn filter_input_event(&self, _event: &InputEvent, _policy_flags: PolicyFlags) -> bool {
        true
    }

    fn notify_switch(&self, when: Nsecs, switch_code: i32, switch_value: i32, _policy_flags: PolicyFlags) {
        info!("Switch {} changed to {} at {}", switch_code, switch_value, when);
    }

    fn poke_user_activity(&self, _event_time: Nsecs, _kind: UserActivityKind) {}

    fn check_inject_events_permission(&self, injector_pid: i32, injector_uid: i32) -> bool {
        if !self.allow_injection {
            info!("Injection denied for pid={} uid={}", injector_pid, injector_uid);
        }
        self.allow_injection
    }

    fn is_key_repeat_enabled(&self) -> bool {
        self.key_repeat_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::KeyAction;

    #[test]
    fn test_pass_through_adds_pass_to_user() {
        let policy = PassThroughPolicy::default();
        let event = KeyEvent {
            device_id: 1,
            source: crate::event::Source::KEYBOARD,
            action: KeyAction::Down,
            flags: Default::default(),
            key_code: 29,
            scan_code: 0,
            meta_state: 0,
            repeat_count: 0,
            down_time: 0,
            event_time: 0,
        };
        let flags = policy.intercept_key_before_queueing(&event, PolicyFlag::Trusted.into());
        assert!(flags.contains(PolicyFlag::PassToUser));
        assert!(flags.contains(PolicyFlag::Trusted));
        assert_eq!(policy.notify_anr(None, None), 0);
        assert_eq!(policy.dispatch_unhandled_key(None, &event, flags), None);
        assert!(policy.filter_input_event(&InputEvent::Key(event), flags));
    }

    #[test]
    fn test_mock_policy_records_activity() {
        let mut policy = MockDispatcherPolicy::new();
        policy
            .expect_poke_user_activity()
            .withf(|_, kind| *kind == UserActivityKind::Touch)
            .times(1)
            .return_const(());
        policy.poke_user_activity(5, UserActivityKind::Touch);
    }
}
