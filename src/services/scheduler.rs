//! Timeout scheduler
//!
//! All hold deadlines live in one min-heap driven by a single task. Each
//! reservation has at most one live timer; arming again bumps its generation
//! and leaves the old heap entry to be skipped when it surfaces. A fired timer
//! is handed out over a channel, so the scheduler never calls the ledger.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identifies one arming of a reservation's timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    pub reservation_id: Uuid,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyFired,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    deadline: Instant,
    generation: u64,
    reservation_id: Uuid,
}

#[derive(Default)]
struct Timers {
    heap: BinaryHeap<Reverse<Entry>>,
    live: HashMap<Uuid, u64>,
    next_generation: u64,
}

impl Timers {
    fn is_live(&self, entry: &Entry) -> bool {
        self.live.get(&entry.reservation_id) == Some(&entry.generation)
    }

    /// Drop dead entries once they dominate the heap
    fn compact(&mut self) {
        if self.heap.len() > 64 && self.heap.len() > self.live.len() * 2 {
            let live = std::mem::take(&mut self.live);
            self.heap.retain(|Reverse(e)| live.get(&e.reservation_id) == Some(&e.generation));
            self.live = live;
        }
    }
}

pub struct Scheduler {
    timers: Mutex<Timers>,
    wake: Notify,
    fired: mpsc::UnboundedSender<TimerHandle>,
}

impl Scheduler {
    /// Create the scheduler and the receiving end of its firings
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TimerHandle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            timers: Mutex::new(Timers::default()),
            wake: Notify::new(),
            fired: tx,
        });
        (scheduler, rx)
    }

    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm (or re-arm) the timer for `reservation_id` at wall-clock `fire_at`.
    /// A deadline in the past fires on the next turn of the driver.
    pub fn arm(&self, reservation_id: Uuid, fire_at: DateTime<Utc>) -> TimerHandle {
        let delay = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.arm_after(reservation_id, delay)
    }

    pub fn arm_after(&self, reservation_id: Uuid, delay: Duration) -> TimerHandle {
        let handle = {
            let mut timers = self.timers();
            timers.next_generation += 1;
            let generation = timers.next_generation;
            timers.live.insert(reservation_id, generation);
            timers.heap.push(Reverse(Entry {
                deadline: Instant::now() + delay,
                generation,
                reservation_id,
            }));
            TimerHandle {
                reservation_id,
                generation,
            }
        };
        self.wake.notify_one();
        handle
    }

    /// Cancel exactly the arming named by `handle`
    pub fn cancel(&self, handle: &TimerHandle) -> CancelOutcome {
        let mut timers = self.timers();
        if timers.live.get(&handle.reservation_id) != Some(&handle.generation) {
            return CancelOutcome::AlreadyFired;
        }
        timers.live.remove(&handle.reservation_id);
        timers.compact();
        CancelOutcome::Cancelled
    }

    /// Number of live timers
    pub fn armed(&self) -> usize {
        self.timers().live.len()
    }

    /// Pop everything due; return the next live deadline, if any
    fn take_due(&self, now: Instant) -> (Vec<TimerHandle>, Option<Instant>) {
        let mut timers = self.timers();
        let mut due = Vec::new();
        while let Some(Reverse(top)) = timers.heap.peek() {
            if !timers.is_live(top) {
                timers.heap.pop();
                continue;
            }
            if top.deadline > now {
                return (due, Some(top.deadline));
            }
            let Some(Reverse(entry)) = timers.heap.pop() else {
                break;
            };
            timers.live.remove(&entry.reservation_id);
            due.push(TimerHandle {
                reservation_id: entry.reservation_id,
                generation: entry.generation,
            });
        }
        (due, None)
    }

    /// Driver loop. Runs until `shutdown` fires or the receiver is dropped.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!("Timeout scheduler started");
        loop {
            let (due, next) = self.take_due(Instant::now());
            for handle in due {
                tracing::debug!("Timer fired for reservation {}", handle.reservation_id);
                if self.fired.send(handle).is_err() {
                    tracing::warn!("Expiry receiver dropped, stopping scheduler");
                    return;
                }
            }

            match next {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.wake.notified() => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }
        tracing::info!("Timeout scheduler stopped");
    }
}
