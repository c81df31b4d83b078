//! Dispatcher statistics

use serde::Serialize;

use super::dispatch::DropReason;

/// Dispatcher counters, reset only when the dispatcher is rebuilt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatcherStats {
    /// Events accepted into the inbound queue (including batched MOVEs)
    pub events_received: u64,

    /// Events handed to at least one connection
    pub events_dispatched: u64,

    /// Dropped because the policy did not pass them to the user
    pub dropped_policy: u64,

    /// Dropped because dispatch was disabled
    pub dropped_disabled: u64,

    /// Dropped while an app switch was pending
    pub dropped_app_switch: u64,

    /// Dropped ahead of an event that unblocks an unresponsive wait
    pub dropped_blocked: u64,

    /// Dropped for being too old
    pub dropped_stale: u64,

    /// Dequeues deferred by MOVE throttling
    pub throttled: u64,

    /// MOVE samples appended to a queued record
    pub samples_batched: u64,

    /// MOVE samples that overwrote the last sample of a queued record
    pub samples_coalesced: u64,

    /// MOVE samples streamed into a delivery already in progress
    pub samples_streamed: u64,

    /// Synthetic key repeats generated
    pub key_repeats: u64,

    /// Cancellation records synthesized
    pub cancelations: u64,

    /// Application-not-responding notifications
    pub anrs: u64,

    /// Connections marked broken (transport errors and unregistrations)
    pub broken_channels: u64,
}

impl DispatcherStats {
    /// Count a drop.
    pub fn record_drop(&mut self, reason: DropReason) {
        match reason {
            DropReason::Policy => self.dropped_policy += 1,
            DropReason::Disabled => self.dropped_disabled += 1,
            DropReason::AppSwitch => self.dropped_app_switch += 1,
            DropReason::Blocked => self.dropped_blocked += 1,
            DropReason::Stale => self.dropped_stale += 1,
        }
    }

    /// Total dropped events.
    pub fn total_dropped(&self) -> u64 {
        self.dropped_policy + self.dropped_disabled + self.dropped_app_switch + self.dropped_blocked + self.dropped_stale
    }

    /// Get drop rate
    pub fn drop_rate(&self) -> f64 {
        if self.events_received == 0 {
            0.0
        } else {
            self.total_dropped() as f64 / self.events_received as f64
        }
    }

    /// Fraction of received MOVE samples folded into existing records
    pub fn batching_ratio(&self) -> f64 {
        if self.events_received == 0 {
            0.0
        } else {
            (self.samples_batched + self.samples_coalesced + self.samples_streamed) as f64
                / self.events_received as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatcher_stats() {
        let mut stats = DispatcherStats {
            events_received: 10,
            samples_batched: 2,
            samples_coalesced: 1,
            samples_streamed: 2,
            ..Default::default()
        };
        stats.record_drop(DropReason::Stale);
        stats.record_drop(DropReason::Policy);

        assert_eq!(stats.total_dropped(), 2);
        assert_eq!(stats.drop_rate(), 0.2);
        assert_eq!(stats.batching_ratio(), 0.5);
    }

    #[test]
    fn test_empty_stats_rates() {
        let stats = DispatcherStats::default();
        assert_eq!(stats.drop_rate(), 0.0);
        assert_eq!(stats.batching_ratio(), 0.0);
    }
}
