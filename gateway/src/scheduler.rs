//! Fair, rate-limited request scheduler.
//!
//! Every broker call passes through [`Scheduler::enqueue`]. A single
//! dispatcher task hands out start permits so that:
//!
//! - at most `max_concurrent` calls run at once, across all channels;
//! - any two starts are at least `global_min_interval` apart;
//! - two starts on the same channel are at least that channel's interval apart.
//!
//! A task on channel `C` is reserved the start
//! `max(now, next_global_start, next_channel_start[C])`; the pending head with
//! the soonest reserved start goes next, FIFO within a channel. Both trackers
//! advance on every dispatch, whatever the call's outcome.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, trace};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::error::GatewayError;

/// Logical lane a request is paced on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Quote,
    Historical,
    OptionChain,
    Positions,
    Account,
    Order,
    Scanner,
    Connectivity,
}

impl Channel {
    pub const COUNT: usize = 8;

    pub const ALL: [Channel; Channel::COUNT] = [
        Channel::Quote,
        Channel::Historical,
        Channel::OptionChain,
        Channel::Positions,
        Channel::Account,
        Channel::Order,
        Channel::Scanner,
        Channel::Connectivity,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            Channel::Quote => "quote",
            Channel::Historical => "historical",
            Channel::OptionChain => "option_chain",
            Channel::Positions => "positions",
            Channel::Account => "account",
            Channel::Order => "order",
            Channel::Scanner => "scanner",
            Channel::Connectivity => "connectivity",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Pacing limits, resolved from [`SchedulerConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub max_concurrent: usize,
    pub global_min_interval: Duration,
    pub channel_intervals: [Duration; Channel::COUNT],
    pub queue_max: usize,
}

impl SchedulerSettings {
    pub fn with_channel_interval(mut self, channel: Channel, interval: Duration) -> Self {
        self.channel_intervals[channel.index()] = interval;
        self
    }
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        let mut channel_intervals = [Duration::ZERO; Channel::COUNT];
        for (channel, ms) in &config.channel_intervals_ms {
            channel_intervals[channel.index()] = Duration::from_millis(*ms);
        }
        Self {
            max_concurrent: config.max_concurrent_workers.max(1),
            global_min_interval: Duration::from_millis(config.global_min_interval_ms),
            channel_intervals,
            queue_max: config.queue_max_size,
        }
    }
}

struct Pending {
    id: u64,
    operation: &'static str,
    enqueued_at: Instant,
    start: oneshot::Sender<ActiveGuard>,
}

struct State {
    settings: SchedulerSettings,
    queues: [VecDeque<Pending>; Channel::COUNT],
    depth: usize,
    active: usize,
    next_global: Option<Instant>,
    next_channel: [Option<Instant>; Channel::COUNT],
    closed: bool,
}

impl State {
    /// Drop heads whose caller stopped waiting. They never consume a start.
    fn skip_abandoned(&mut self) {
        for queue in &mut self.queues {
            while queue.front().is_some_and(|p| p.start.is_closed()) {
                if let Some(p) = queue.pop_front() {
                    trace!("skipping abandoned task {} ({})", p.id, p.operation);
                }
                self.depth -= 1;
            }
        }
    }

    /// The channel whose head can start soonest, with its reserved start.
    fn soonest(&self, now: Instant) -> Option<(Instant, usize)> {
        let mut best: Option<(Instant, u64, usize)> = None;
        for (idx, queue) in self.queues.iter().enumerate() {
            let Some(head) = queue.front() else { continue };
            let mut start = now;
            if let Some(global) = self.next_global {
                start = start.max(global);
            }
            if let Some(channel) = self.next_channel[idx] {
                start = start.max(channel);
            }
            let candidate = (start, head.id, idx);
            if best.is_none_or(|b| (candidate.0, candidate.1) < (b.0, b.1)) {
                best = Some(candidate);
            }
        }
        best.map(|(start, _, idx)| (start, idx))
    }
}

struct Shared {
    state: Mutex<State>,
    wake: Notify,
    next_id: AtomicU64,
}

enum Step {
    Idle,
    Until(Instant),
    Closed,
}

impl Shared {
    /// Start every task that may start now. Returns when the dispatcher
    /// should look again.
    fn dispatch_ready(self: &Arc<Self>) -> Step {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Step::Closed;
            }
            state.skip_abandoned();
            if state.active >= state.settings.max_concurrent {
                return Step::Idle;
            }
            let now = Instant::now();
            let Some((start, idx)) = state.soonest(now) else {
                return Step::Idle;
            };
            if start > now {
                return Step::Until(start);
            }
            let Some(pending) = state.queues[idx].pop_front() else {
                return Step::Idle;
            };
            state.depth -= 1;

            let previous = (state.next_global, state.next_channel[idx]);
            state.active += 1;
            state.next_global = Some(now + state.settings.global_min_interval);
            state.next_channel[idx] = Some(now + state.settings.channel_intervals[idx]);

            let guard = ActiveGuard {
                shared: Some(Arc::clone(self)),
            };
            match pending.start.send(guard) {
                Ok(()) => debug!(
                    "dispatched {} on {} after {}ms (active={}, depth={})",
                    pending.operation,
                    Channel::ALL[idx],
                    now.duration_since(pending.enqueued_at).as_millis(),
                    state.active,
                    state.depth
                ),
                Err(mut guard) => {
                    // Caller left between the check and the send: undo.
                    guard.shared = None;
                    state.active -= 1;
                    state.next_global = previous.0;
                    state.next_channel[idx] = previous.1;
                }
            }
        }
    }
}

/// Held by a running task. Dropping it frees the worker slot.
pub struct ActiveGuard {
    shared: Option<Arc<Shared>>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.state.lock().active -= 1;
            shared.wake.notify_one();
        }
    }
}

/// Paces calls to the broker session. Must be created inside a tokio runtime.
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                settings,
                queues: Default::default(),
                depth: 0,
                active: 0,
                next_global: None,
                next_channel: [None; Channel::COUNT],
                closed: false,
            }),
            wake: Notify::new(),
            next_id: AtomicU64::new(1),
        });
        tokio::spawn(dispatch_loop(Arc::clone(&shared)));
        Self { shared }
    }

    /// Queue `run` on `channel` and wait for it to be started and finish.
    ///
    /// Rejects immediately with [`GatewayError::QueueOverloaded`] when the
    /// queue is full, and with [`GatewayError::QueueCleared`] if the queue is
    /// cleared before the task starts. Dropping the returned future before
    /// the task starts abandons it without consuming a start slot.
    pub async fn enqueue<F, Fut>(
        &self,
        channel: Channel,
        operation: &'static str,
        run: F,
    ) -> Result<Fut::Output, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let started = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(GatewayError::SchedulerClosed);
            }
            if state.depth >= state.settings.queue_max {
                return Err(GatewayError::QueueOverloaded { depth: state.depth });
            }
            let (tx, rx) = oneshot::channel();
            let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
            state.queues[channel.index()].push_back(Pending {
                id,
                operation,
                enqueued_at: Instant::now(),
                start: tx,
            });
            state.depth += 1;
            rx
        };
        self.shared.wake.notify_one();

        let guard = started.await.map_err(|_| GatewayError::QueueCleared)?;
        let output = run().await;
        drop(guard);
        Ok(output)
    }

    /// Reject every pending task with "queue cleared" and reset pacing.
    /// Running tasks are left alone.
    pub fn clear(&self) -> usize {
        let mut state = self.shared.state.lock();
        let dropped = state.depth;
        for queue in &mut state.queues {
            queue.clear();
        }
        state.depth = 0;
        state.next_global = None;
        state.next_channel = [None; Channel::COUNT];
        drop(state);
        if dropped > 0 {
            debug!("cleared {dropped} pending broker requests");
        }
        self.shared.wake.notify_one();
        dropped
    }

    /// Apply new limits. Pending tasks keep their place.
    pub fn reconfigure(&self, settings: SchedulerSettings) {
        self.shared.state.lock().settings = settings;
        self.shared.wake.notify_one();
    }

    /// Pending (not yet started) tasks.
    pub fn depth(&self) -> usize {
        self.shared.state.lock().depth
    }

    /// Tasks currently running.
    pub fn active(&self) -> usize {
        self.shared.state.lock().active
    }

    pub fn is_backlogged(&self, threshold: usize) -> bool {
        let state = self.shared.state.lock();
        state.depth + state.active >= threshold
    }

    /// Stop dispatching and reject everything still queued.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.clear();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close();
    }
}

async fn dispatch_loop(shared: Arc<Shared>) {
    loop {
        match shared.dispatch_ready() {
            Step::Closed => return,
            Step::Idle => shared.wake.notified().await,
            Step::Until(deadline) => {
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
        }
    }
}
