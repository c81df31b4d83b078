//! Per-connection delivery cycle
//!
//! Events reach a consumer one at a time: the head of a connection's
//! outbound queue is published, marked in progress, and stays there until
//! the consumer's finished signal arrives. Motion samples that arrive while
//! the head is still unread are appended to the live message; samples that
//! do not fit are carried over into a follow-up cycle for the same entry.
//!
//! # Cycle
//!
//! ```text
//! prepare ─► enqueue (tracker verdict) ─► start (publish + send ready)
//!                                            │
//!            finished signal ◄───────────────┘
//!                  │
//!                  ▼
//!   reset publisher ─► command: start next cycle ─► pop head, release
//! ```
//!
//! A transport error at any point drains the queue and marks the
//! connection broken; nothing is delivered to it again.

use tracing::{debug, error, trace, warn};

use super::command::Command;
use super::connection::{Connection, ConnectionStatus, DispatchEntry, ResolvedAction};
use super::input_state::CancelationOptions;
use super::pool::EventId;
use super::state::DispatcherState;
use super::target::{InputTarget, TargetFlag, TargetFlags, DISPATCH_MASK, DISPATCH_MODES};
use crate::clock::{as_millis_f64, Nsecs};
use crate::event::{
    EventEntry, EventKind, MotionAction, MotionEntry, MotionFlag, MotionSample, PointerCoords, PointerIdBits,
    PointerVec,
};
use crate::transport::{ChannelId, InputMessage, KeyMessage, MessageSample, MotionMessage, TransportError};

impl DispatcherState {
    /// Hand the pending event to every committed target.
    ///
    /// `resume` is set when a MOVE sample was just appended to an event that
    /// is already being delivered; connections then try to stream the new
    /// sample instead of queueing the event again.
    pub(crate) fn dispatch_event_to_current_targets(&mut self, now: Nsecs, id: EventId, resume: bool) {
        if !resume {
            self.stats.events_dispatched += 1;
        }
        if let Some(entry) = self.pool.get_mut(id) {
            entry.dispatch_in_progress = true;
        }

        let targets = self.targets.clone();
        for target in &targets {
            if self.connections.contains_key(&target.channel) {
                self.prepare_dispatch_cycle(now, target.channel, id, target, resume);
            } else {
                debug!(
                    "Channel {} is no longer registered, skipping target",
                    target.channel
                );
            }
        }
    }

    fn prepare_dispatch_cycle(
        &mut self,
        now: Nsecs,
        channel: ChannelId,
        id: EventId,
        target: &InputTarget,
        resume: bool,
    ) {
        let Some(connection) = self.connections.get(&channel) else {
            return;
        };
        trace!(
            "Preparing delivery to '{}': flags=0x{:08x} offset=({}, {}) pointers={} resume={}",
            connection.name(),
            target.flags.bits(),
            target.x_offset,
            target.y_offset,
            target.pointer_ids,
            resume
        );

        // Broken and zombie connections get nothing until re-registered.
        if !connection.is_normal() {
            debug!(
                "Dropping event for '{}': channel is {}",
                connection.name(),
                connection.status()
            );
            return;
        }

        if target.flags.contains(TargetFlag::Split) {
            let needs_split = self
                .pool
                .get(id)
                .and_then(EventEntry::motion)
                .is_some_and(|motion| motion.pointer_count() != target.pointer_ids.count());
            if needs_split {
                let Some(split) = self.pool.get(id).and_then(|entry| split_motion_event(entry, target.pointer_ids))
                else {
                    return;
                };
                let split_id = self.pool.insert(split);
                self.enqueue_dispatch_entries(now, channel, split_id, target, resume);
                self.release_event(split_id);
                return;
            }
        }

        self.enqueue_dispatch_entries(now, channel, id, target, resume);
    }

    fn enqueue_dispatch_entries(
        &mut self,
        now: Nsecs,
        channel: ChannelId,
        id: EventId,
        target: &InputTarget,
        resume: bool,
    ) {
        let Some(connection) = self.connections.get(&channel) else {
            return;
        };
        let was_empty = connection.outbound_queue.is_empty();

        if !was_empty && resume {
            if let Some(index) = connection.find_queued_entry(id) {
                let is_tail = index + 1 == connection.outbound_queue.len();
                let in_progress = connection.outbound_queue.get(index).is_some_and(|d| d.in_progress);
                if is_tail || !in_progress {
                    self.stream_appended_sample(channel, index, id);
                    return;
                }
                // Later deliveries are queued behind the one in flight; the
                // sample gets its own entry so it stays behind them.
            }
        }

        let head_sample = if resume {
            self.pool
                .get(id)
                .and_then(EventEntry::motion)
                .map_or(0, |motion| motion.samples.len().saturating_sub(1))
        } else {
            0
        };

        for mode in DISPATCH_MODES {
            self.enqueue_dispatch_entry(channel, id, target, head_sample, mode);
        }

        let now_non_empty = self
            .connections
            .get(&channel)
            .is_some_and(|c| !c.outbound_queue.is_empty());
        if was_empty && now_non_empty {
            self.activate_connection(channel);
            self.start_dispatch_cycle(now, channel);
        }
    }

    /// Push the newest sample of `id` into the entry already queued at `index`.
    fn stream_appended_sample(&mut self, channel: ChannelId, index: usize, id: EventId) {
        let Some(connection) = self.connections.get_mut(&channel) else {
            return;
        };
        let Some(motion) = self.pool.get(id).and_then(EventEntry::motion) else {
            return;
        };
        let Some(dispatch) = connection.outbound_queue.get_mut(index) else {
            return;
        };

        if !dispatch.in_progress {
            // Not published yet; the sample goes out with the rest of the chain.
            trace!("Channel {}: tail entry not in flight, not streaming", channel);
            return;
        }
        if dispatch.tail_sample.is_some() {
            trace!("Channel {}: tail already pending, not streaming", channel);
            return;
        }
        if dispatch.target_flags & DISPATCH_MASK != TargetFlags::from(TargetFlag::DispatchAsIs) {
            trace!("Channel {}: entry was not dispatched as is, not streaming", channel);
            return;
        }
        if !matches!(dispatch.resolved, ResolvedAction::Motion { action, .. } if action.is_batchable()) {
            trace!("Channel {}: entry went out as {:?}, not streaming", channel, dispatch.resolved);
            return;
        }

        let last_index = motion.samples.len() - 1;
        let sample = motion.last_sample();
        let coords = sample_coords(sample, dispatch.target_flags.contains(TargetFlag::ZeroCoords));
        match connection.channel.append_sample(sample.event_time, &coords) {
            Ok(()) => {
                trace!("Channel {}: streamed motion sample", channel);
                self.stats.samples_streamed += 1;
            }
            Err(TransportError::Full) => {
                debug!(
                    "Channel {}: sample buffer full, starting a new delivery",
                    channel
                );
                dispatch.tail_sample = Some(last_index);
            }
            Err(TransportError::Stale) => {
                debug!(
                    "Channel {}: event already consumed, cannot append sample",
                    channel
                );
                dispatch.tail_sample = Some(last_index);
            }
            Err(err) => {
                warn!(
                    "Channel {}: failed to append sample: {}",
                    channel, err
                );
                dispatch.tail_sample = Some(last_index);
            }
        }
    }

    /// Queue `id` on `channel` in one dispatch mode, if the target asked for it.
    ///
    /// The consistency tracker is fed here; entries it rejects are discarded.
    pub(crate) fn enqueue_dispatch_entry(
        &mut self,
        channel: ChannelId,
        id: EventId,
        target: &InputTarget,
        head_sample: usize,
        mode: TargetFlag,
    ) {
        if !target.flags.contains(mode) {
            return;
        }
        let flags = (target.flags & !DISPATCH_MASK) | mode;

        let Some(connection) = self.connections.get_mut(&channel) else {
            return;
        };
        let Some(entry) = self.pool.get(id) else {
            error!("Channel {}: event record vanished before it was queued", channel);
            return;
        };

        let resolved = match &entry.kind {
            EventKind::Key(key) => {
                let verdict = connection.input_state.track_key(key, key.action, key.flags);
                if !verdict.is_deliverable() {
                    debug!("Skipping inconsistent key event for '{}'", connection.name());
                    return;
                }
                ResolvedAction::Key {
                    action: key.action,
                    flags: key.flags,
                }
            }
            EventKind::Motion(motion) => {
                let action = match mode {
                    TargetFlag::DispatchAsOutside => MotionAction::Outside,
                    TargetFlag::DispatchAsHoverEnter => MotionAction::HoverEnter,
                    TargetFlag::DispatchAsHoverExit => MotionAction::HoverExit,
                    TargetFlag::DispatchAsSlipperyExit => MotionAction::Cancel,
                    TargetFlag::DispatchAsSlipperyEnter => MotionAction::Down,
                    _ if motion.action == MotionAction::HoverMove
                        && !connection.input_state.is_hovering(motion.device_id, motion.source) =>
                    {
                        debug!(
                            "Channel '{}' missed the hover enter, sending HOVER_MOVE as HOVER_ENTER",
                            connection.name()
                        );
                        MotionAction::HoverEnter
                    }
                    _ => motion.action,
                };
                let mut motion_flags = motion.flags;
                if flags.contains(TargetFlag::WindowIsObscured) {
                    motion_flags |= MotionFlag::WindowIsObscured;
                }
                let verdict = connection.input_state.track_motion(motion, action);
                if !verdict.is_deliverable() {
                    warn!(
                        "Skipping inconsistent motion event for '{}': {:?}",
                        connection.name(),
                        action
                    );
                    return;
                }
                ResolvedAction::Motion {
                    action,
                    flags: motion_flags,
                }
            }
            EventKind::ConfigurationChanged | EventKind::DeviceReset { .. } => {
                error!("Channel {}: {} events are never delivered to channels", channel, entry.label());
                return;
            }
        };

        connection.outbound_queue.push_back(DispatchEntry {
            event: id,
            target_flags: flags,
            x_offset: target.x_offset,
            y_offset: target.y_offset,
            in_progress: false,
            resolved,
            head_sample,
            tail_sample: None,
        });

        if flags.contains(TargetFlag::Foreground) {
            self.increment_pending_foreground(id);
        }
        self.pool.retain(id);
    }

    /// Publish the head of the outbound queue.
    pub(crate) fn start_dispatch_cycle(&mut self, now: Nsecs, channel: ChannelId) {
        if let Err(err) = self.publish_head(now, channel) {
            let name = self.connections.get(&channel).map(|c| c.name().to_string()).unwrap_or_default();
            error!("Failed to publish to '{}': {}", name, err);
            self.abort_broken_dispatch_cycle(channel, true);
        }
    }

    fn publish_head(&mut self, now: Nsecs, channel: ChannelId) -> Result<(), TransportError> {
        let Some(connection) = self.connections.get_mut(&channel) else {
            return Ok(());
        };
        let Connection {
            channel: transport,
            outbound_queue,
            last_event_time,
            last_dispatch_time,
            ..
        } = connection;
        let Some(dispatch) = outbound_queue.front_mut() else {
            return Ok(());
        };
        let Some(entry) = self.pool.get(dispatch.event) else {
            return Err(TransportError::Protocol("queued event record missing".into()));
        };
        trace!("Starting delivery on '{}'", transport.name());

        dispatch.in_progress = true;
        dispatch.tail_sample = None;

        match (&entry.kind, dispatch.resolved) {
            (EventKind::Key(key), ResolvedAction::Key { action, flags }) => {
                transport.publish(&InputMessage::Key(KeyMessage {
                    device_id: key.device_id,
                    source: key.source,
                    action,
                    flags,
                    key_code: key.key_code,
                    scan_code: key.scan_code,
                    meta_state: key.meta_state,
                    repeat_count: key.repeat_count,
                    down_time: key.down_time,
                    event_time: entry.event_time,
                    policy_flags: entry.policy_flags,
                }))?;
            }
            (EventKind::Motion(motion), ResolvedAction::Motion { action, flags }) => {
                let zero_coords = dispatch.target_flags.contains(TargetFlag::ZeroCoords);
                // Offsets only make sense for display-relative pointers.
                let (x_offset, y_offset) = if motion.source.is_pointer() && !zero_coords {
                    (dispatch.x_offset, dispatch.y_offset)
                } else {
                    (0.0, 0.0)
                };

                let head = dispatch.head_sample.min(motion.samples.len() - 1);
                let first = &motion.samples[head];
                transport.publish(&InputMessage::Motion(MotionMessage {
                    device_id: motion.device_id,
                    source: motion.source,
                    action,
                    flags,
                    edge_flags: motion.edge_flags,
                    meta_state: motion.meta_state,
                    x_offset,
                    y_offset,
                    x_precision: motion.x_precision,
                    y_precision: motion.y_precision,
                    down_time: motion.down_time,
                    policy_flags: entry.policy_flags,
                    pointer_properties: motion.pointer_properties.to_vec(),
                    samples: vec![MessageSample {
                        event_time: first.event_time,
                        coords: sample_coords(first, zero_coords),
                    }],
                }))?;

                // Only MOVE and HOVER_MOVE carry more than one sample.
                if action.is_batchable() {
                    for (index, sample) in motion.samples.iter().enumerate().skip(head + 1) {
                        match transport.append_sample(sample.event_time, &sample_coords(sample, zero_coords)) {
                            Ok(()) => {}
                            Err(TransportError::Full) => {
                                debug!(
                                    "Sample buffer for '{}' full after {} samples, rest follow next cycle",
                                    transport.name(),
                                    index - head
                                );
                                dispatch.tail_sample = Some(index);
                                break;
                            }
                            Err(err) => return Err(err),
                        }
                    }
                }
            }
            _ => {
                return Err(TransportError::Protocol(format!(
                    "dispatch entry does not match its {} event",
                    entry.label()
                )));
            }
        }

        transport.send_ready()?;
        *last_event_time = entry.event_time;
        *last_dispatch_time = now;
        Ok(())
    }

    /// The consumer finished the in-progress event.
    pub(crate) fn finish_dispatch_cycle(&mut self, now: Nsecs, channel: ChannelId, handled: bool) {
        let Some(connection) = self.connections.get_mut(&channel) else {
            return;
        };
        debug!(
            "Delivery to '{}' finished: {:.1}ms since event, {:.1}ms since dispatch, handled={}",
            connection.name(),
            as_millis_f64(connection.event_latency(now)),
            as_millis_f64(connection.dispatch_latency(now)),
            handled
        );

        if !connection.is_normal() {
            return;
        }

        if let Err(err) = connection.channel.reset() {
            error!("Failed to reset '{}': {}", connection.name(), err);
            self.abort_broken_dispatch_cycle(channel, true);
            return;
        }

        self.post_command(Command::DispatchCycleFinished { channel, handled });
    }

    /// Retire the finished head, then publish whatever comes next.
    pub(crate) fn start_next_dispatch_cycle(&mut self, now: Nsecs, channel: ChannelId) {
        loop {
            let Some(connection) = self.connections.get_mut(&channel) else {
                return;
            };
            let Some(head) = connection.outbound_queue.front_mut() else {
                break;
            };

            if !head.in_progress {
                // The in-progress entry was aborted; start the next one.
                self.start_dispatch_cycle(now, channel);
                return;
            }

            if let Some(tail) = head.tail_sample.take() {
                head.in_progress = false;
                head.head_sample = tail;
                self.start_dispatch_cycle(now, channel);
                return;
            }

            let Some(done) = connection.outbound_queue.pop_front() else {
                break;
            };
            if done.has_foreground_target() {
                self.decrement_pending_foreground(done.event);
            }
            self.release_event(done.event);
        }

        self.deactivate_connection(channel);
    }

    /// Drain the queue and mark the connection broken.
    pub(crate) fn abort_broken_dispatch_cycle(&mut self, channel: ChannelId, notify: bool) {
        self.drain_outbound_queue(channel);

        let Some(connection) = self.connections.get_mut(&channel) else {
            return;
        };
        if connection.status != ConnectionStatus::Normal {
            return;
        }
        connection.status = ConnectionStatus::Broken;
        self.stats.broken_channels += 1;

        if notify {
            let name = connection.name().to_string();
            error!("Channel '{}' is broken and will be disposed", name);
            self.post_command(Command::NotifyInputChannelBroken { channel, name });
        }
    }

    fn drain_outbound_queue(&mut self, channel: ChannelId) {
        let drained: Vec<DispatchEntry> = match self.connections.get_mut(&channel) {
            Some(connection) => connection.outbound_queue.drain(..).collect(),
            None => return,
        };
        for dispatch in drained {
            if dispatch.has_foreground_target() {
                self.decrement_pending_foreground(dispatch.event);
            }
            self.release_event(dispatch.event);
        }
        self.deactivate_connection(channel);
    }

    /// Remove a connection from dispatch. The queue is drained and the
    /// connection returned as a zombie; pending commands are left for the caller.
    pub(crate) fn unregister_connection(&mut self, channel: ChannelId, notify: bool) -> Option<Connection> {
        if !self.connections.contains_key(&channel) {
            return None;
        }
        self.abort_broken_dispatch_cycle(channel, notify);
        self.monitoring_channels.retain(|&c| c != channel);
        self.deactivate_connection(channel);

        let mut connection = self.connections.remove(&channel)?;
        connection.status = ConnectionStatus::Zombie;
        Some(connection)
    }

    /// Bring one channel back to neutral with synthesized UP and CANCEL records.
    ///
    /// The records queue behind whatever is already pending on the channel,
    /// so the consumer sees them after the events they cancel.
    pub(crate) fn synthesize_cancelation_events_for_channel(&mut self, channel: ChannelId, options: &CancelationOptions) {
        let now = self.now();
        let Some(connection) = self.connections.get(&channel) else {
            return;
        };
        if connection.status == ConnectionStatus::Broken {
            return;
        }

        let events = connection.input_state.synthesize_cancelation_events(now, options);
        if events.is_empty() {
            return;
        }
        debug!(
            "Synthesized {} cancelations for '{}' ({}, mode {:?})",
            events.len(),
            connection.name(),
            options.reason,
            options.mode
        );

        let (x_offset, y_offset) = self
            .window_for_channel(channel)
            .map_or((0.0, 0.0), |w| (-(w.frame.left as f32), -(w.frame.top as f32)));
        let target = InputTarget {
            channel,
            flags: TargetFlag::DispatchAsIs.into(),
            x_offset,
            y_offset,
            pointer_ids: PointerIdBits::empty(),
        };

        for event in events {
            self.stats.cancelations += 1;
            let id = self.pool.insert(event);
            self.enqueue_dispatch_entry(channel, id, &target, 0, TargetFlag::DispatchAsIs);
            self.release_event(id);
        }

        let idle_head = self
            .connections
            .get(&channel)
            .and_then(|c| c.outbound_queue.front())
            .is_some_and(|head| !head.in_progress);
        if idle_head {
            self.activate_connection(channel);
            self.start_dispatch_cycle(now, channel);
        }
    }

    /// Cancel matching state on every connection.
    pub(crate) fn synthesize_cancelation_events_for_all_connections(&mut self, options: &CancelationOptions) {
        let channels: Vec<ChannelId> = self.connections.keys().copied().collect();
        for channel in channels {
            self.synthesize_cancelation_events_for_channel(channel, options);
        }
    }
}

/// Copy of a motion restricted to the pointers in `pointer_ids`.
///
/// Secondary pointer actions are rewritten for the subset: the first
/// pointer of the subset to go down becomes DOWN, the last to go up becomes
/// UP, and actions of pointers outside the subset become MOVE.
pub(crate) fn split_motion_event(original: &EventEntry, pointer_ids: PointerIdBits) -> Option<EventEntry> {
    let motion = original.motion()?;

    let mut index_map: PointerVec<usize> = PointerVec::new();
    for (index, properties) in motion.pointer_properties.iter().enumerate() {
        if pointer_ids.has(properties.id) {
            index_map.push(index);
        }
    }

    if index_map.len() != pointer_ids.count() {
        // Pointer ids went missing or appeared without an action to say so.
        warn!(
            "Dropping split motion: found {} of {} expected pointers",
            index_map.len(),
            pointer_ids.count()
        );
        return None;
    }

    let pointer_properties: PointerVec<_> = index_map.iter().map(|&i| motion.pointer_properties[i]).collect();

    let action = match motion.action {
        MotionAction::PointerDown(index) | MotionAction::PointerUp(index) => {
            let is_down = matches!(motion.action, MotionAction::PointerDown(_));
            let changed_id = motion.pointer_properties.get(index)?.id;
            if pointer_ids.has(changed_id) {
                if index_map.len() == 1 {
                    if is_down {
                        MotionAction::Down
                    } else {
                        MotionAction::Up
                    }
                } else {
                    let split_index = pointer_properties.iter().position(|p| p.id == changed_id)?;
                    if is_down {
                        MotionAction::PointerDown(split_index)
                    } else {
                        MotionAction::PointerUp(split_index)
                    }
                }
            } else {
                MotionAction::Move
            }
        }
        other => other,
    };

    let samples = motion
        .samples
        .iter()
        .map(|sample| MotionSample {
            event_time: sample.event_time,
            event_time_before_coalescing: sample.event_time_before_coalescing,
            coords: index_map.iter().filter_map(|&i| sample.coords.get(i).copied()).collect(),
        })
        .collect();

    let mut split = EventEntry::new(
        original.event_time,
        original.policy_flags,
        EventKind::Motion(MotionEntry {
            action,
            pointer_properties,
            samples,
            ..motion.clone()
        }),
    );
    split.injection = original.injection.clone();
    Some(split)
}

fn sample_coords(sample: &MotionSample, zero: bool) -> Vec<PointerCoords> {
    if zero {
        vec![PointerCoords::default(); sample.coords.len()]
    } else {
        sample.coords.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{NotifyMotionArgs, PolicyFlags};

    fn two_finger(action: MotionAction) -> EventEntry {
        let args = NotifyMotionArgs::touch(10, 1, action, 0, &[(0, 10.0, 10.0), (1, 500.0, 20.0)]);
        EventEntry::from_motion_args(&args, PolicyFlags::empty())
    }

    #[test]
    fn test_split_second_pointer_down_becomes_down() {
        let entry = two_finger(MotionAction::PointerDown(1));
        let split = split_motion_event(&entry, PointerIdBits::with(1)).expect("split");
        let motion = split.motion().expect("motion");
        assert_eq!(motion.action, MotionAction::Down);
        assert_eq!(motion.pointer_count(), 1);
        assert_eq!(motion.pointer_properties[0].id, 1);
        assert_eq!(motion.first_sample().coords[0].x, 500.0);
    }

    #[test]
    fn test_split_foreign_pointer_action_becomes_move() {
        let entry = two_finger(MotionAction::PointerDown(1));
        let split = split_motion_event(&entry, PointerIdBits::with(0)).expect("split");
        assert_eq!(split.motion().map(|m| m.action), Some(MotionAction::Move));
    }

    #[test]
    fn test_split_keeps_index_within_subset() {
        let args = NotifyMotionArgs::touch(
            10,
            1,
            MotionAction::PointerUp(2),
            0,
            &[(0, 1.0, 1.0), (4, 2.0, 2.0), (7, 3.0, 3.0)],
        );
        let entry = EventEntry::from_motion_args(&args, PolicyFlags::empty());
        let mut ids = PointerIdBits::with(4);
        ids.mark(7);
        let split = split_motion_event(&entry, ids).expect("split");
        let motion = split.motion().expect("motion");
        assert_eq!(motion.action, MotionAction::PointerUp(1));
        assert_eq!(motion.pointer_count(), 2);
    }

    #[test]
    fn test_split_with_missing_pointer_is_dropped() {
        let entry = two_finger(MotionAction::Move);
        let mut ids = PointerIdBits::with(0);
        ids.mark(5);
        assert!(split_motion_event(&entry, ids).is_none());
    }

    #[test]
    fn test_zero_coords_hides_position() {
        let sample = MotionSample::new(0, &[PointerCoords::at(3.0, 4.0)]);
        assert_eq!(sample_coords(&sample, true), vec![PointerCoords::default()]);
        assert_eq!(sample_coords(&sample, false)[0].x, 3.0);
    }
}
