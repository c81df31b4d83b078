//! Dispatch Throughput Benchmarks
//!
//! Measures the full notify → dispatch → publish → finish cycle on a manual
//! clock with in-memory channels, for keys, touch gestures over growing
//! window stacks, MOVE batching, and scenario replay.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use lamco_input_dispatcher::clock::{Clock, ManualClock};
use lamco_input_dispatcher::config::DispatcherConfig;
use lamco_input_dispatcher::event::{keycode, KeyAction, MotionAction, NotifyKeyArgs, NotifyMotionArgs};
use lamco_input_dispatcher::looper::ChannelLooper;
use lamco_input_dispatcher::policy::PassThroughPolicy;
use lamco_input_dispatcher::replay::{replay, Scenario};
use lamco_input_dispatcher::transport::memory::DEFAULT_SAMPLE_CAPACITY;
use lamco_input_dispatcher::transport::{MemoryChannel, MemoryChannelClient};
use lamco_input_dispatcher::window::{Rect, WindowFlag, WindowInfo};
use lamco_input_dispatcher::InputDispatcher;

struct Bench {
    dispatcher: InputDispatcher,
    clock: ManualClock,
    clients: Vec<MemoryChannelClient>,
}

impl Bench {
    /// `count` side-by-side 10px columns; the first one is focused.
    fn new(count: usize) -> Self {
        let clock = ManualClock::new(0);
        let looper = Arc::new(ChannelLooper::new());
        let dispatcher = InputDispatcher::new(
            DispatcherConfig {
                key_repeat_enabled: false,
                ..DispatcherConfig::default()
            },
            Arc::new(PassThroughPolicy::default()),
            looper.clone(),
            Arc::new(clock.clone()),
        );

        let mut windows = Vec::with_capacity(count);
        let mut clients = Vec::with_capacity(count);
        for i in 0..count {
            let (channel, client) = MemoryChannel::pair(format!("w{}", i), looper.handle(), DEFAULT_SAMPLE_CAPACITY);
            let left = (i * 10) as i32;
            let mut window = WindowInfo::new(format!("w{}", i), client.id(), Rect::new(left, 0, left + 10, 1000))
                .with_flags(WindowFlag::SplitTouch | WindowFlag::NotTouchModal);
            window.has_focus = i == 0;
            dispatcher
                .register_channel(Box::new(channel), false)
                .expect("register");
            windows.push(window);
            clients.push(client);
        }
        dispatcher.set_input_windows(windows);

        Self {
            dispatcher,
            clock,
            clients,
        }
    }

    /// Dispatch, then finish everything the consumers received.
    fn drain(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            self.dispatcher.dispatch_pending();
            let mut progressed = false;
            for client in &mut self.clients {
                while client.try_receive().is_some() {
                    let _ = client.finish(true);
                    delivered += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return delivered;
            }
        }
    }

    fn tick(&self, ms: i64) -> i64 {
        self.clock.advance_ms(ms);
        self.clock.now()
    }
}

/// Benchmark a key press and release to the focused window
fn bench_key_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_round_trip");
    group.throughput(Throughput::Elements(2));

    for count in [1usize, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let mut bench = Bench::new(count);
            b.iter(|| {
                let down_time = bench.tick(1);
                let down = NotifyKeyArgs::new(down_time, 1, KeyAction::Down, keycode::A);
                bench.dispatcher.notify_key(&down).expect("down");
                let up = NotifyKeyArgs {
                    down_time,
                    ..NotifyKeyArgs::new(bench.tick(1), 1, KeyAction::Up, keycode::A)
                };
                bench.dispatcher.notify_key(&up).expect("up");
                black_box(bench.drain())
            });
        });
    }

    group.finish();
}

/// Benchmark a one-finger gesture landing on the last window of the stack
fn bench_touch_gesture(c: &mut Criterion) {
    let mut group = c.benchmark_group("touch_gesture");
    const MOVES: usize = 8;
    group.throughput(Throughput::Elements((MOVES + 2) as u64));

    for count in [4usize, 32, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let mut bench = Bench::new(count);
            let x = (count * 10 - 5) as f32;
            b.iter(|| {
                let down_time = bench.tick(20);
                let down = NotifyMotionArgs::touch(down_time, 1, MotionAction::Down, down_time, &[(0, x, 50.0)]);
                bench.dispatcher.notify_motion(&down).expect("down");
                bench.drain();
                for i in 0..MOVES {
                    let at = bench.tick(20);
                    let y = 50.0 + i as f32;
                    let motion = NotifyMotionArgs::touch(at, 1, MotionAction::Move, down_time, &[(0, x, y)]);
                    bench.dispatcher.notify_motion(&motion).expect("move");
                    bench.drain();
                }
                let at = bench.tick(20);
                let up = NotifyMotionArgs::touch(at, 1, MotionAction::Up, down_time, &[(0, x, 60.0)]);
                bench.dispatcher.notify_motion(&up).expect("up");
                black_box(bench.drain())
            });
        });
    }

    group.finish();
}

/// Benchmark folding a burst of MOVE samples into one queued record
fn bench_move_batching(c: &mut Criterion) {
    let mut group = c.benchmark_group("move_batching");

    for burst in [8usize, 32, 60] {
        group.throughput(Throughput::Elements(burst as u64));
        group.bench_with_input(BenchmarkId::from_parameter(burst), &burst, |b, &burst| {
            let mut bench = Bench::new(1);
            b.iter(|| {
                let down_time = bench.tick(20);
                let down = NotifyMotionArgs::touch(down_time, 1, MotionAction::Down, down_time, &[(0, 5.0, 5.0)]);
                bench.dispatcher.notify_motion(&down).expect("down");
                for i in 0..burst {
                    let at = bench.tick(5);
                    let motion =
                        NotifyMotionArgs::touch(at, 1, MotionAction::Move, down_time, &[(0, 5.0, 5.0 + i as f32)]);
                    bench.dispatcher.notify_motion(&motion).expect("move");
                }
                let at = bench.tick(20);
                let up = NotifyMotionArgs::touch(at, 1, MotionAction::Up, down_time, &[(0, 5.0, 5.0)]);
                bench.dispatcher.notify_motion(&up).expect("up");
                black_box(bench.drain())
            });
        });
    }

    group.finish();
}

/// Benchmark replaying the built-in demo scenario end to end
fn bench_replay_demo(c: &mut Criterion) {
    let scenario = Scenario::demo();
    c.bench_function("replay_demo", |b| {
        b.iter(|| black_box(replay(&scenario, DispatcherConfig::default(), false).expect("replay")))
    });
}

criterion_group!(
    benches,
    bench_key_round_trip,
    bench_touch_gesture,
    bench_move_batching,
    bench_replay_demo
);

criterion_main!(benches);
