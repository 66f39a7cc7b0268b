//! Hashed timing wheel.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Identifies one scheduled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    id: u64,
    wheel: usize,
    slot: usize,
}

struct Entry {
    id: u64,
    rounds: u64,
    task: Task,
}

struct SubWheel {
    slots: Vec<Mutex<Vec<Entry>>>,
}

/// A set of sub-wheels sharing one cursor and one driver task.
pub struct TimingWheel {
    tick: Duration,
    slot_count: usize,
    wheels: Vec<SubWheel>,
    cursor: AtomicUsize,
    next_id: AtomicU64,
    stopped: AtomicBool,
}

impl std::fmt::Debug for TimingWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimingWheel")
            .field("tick", &self.tick)
            .field("slots", &self.slot_count)
            .field("wheels", &self.wheels.len())
            .field("pending", &self.pending())
            .finish()
    }
}

impl TimingWheel {
    pub fn new(tick: Duration, slot_count: usize, wheel_count: usize) -> Arc<Self> {
        let slot_count = slot_count.max(1);
        let wheels = (0..wheel_count.max(1))
            .map(|_| SubWheel {
                slots: (0..slot_count).map(|_| Mutex::new(Vec::new())).collect(),
            })
            .collect();

        Arc::new(Self {
            tick: tick.max(Duration::from_millis(1)),
            slot_count,
            wheels,
            cursor: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Run `task` once after at least `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let wheel = (id as usize) % self.wheels.len();

        // One extra tick: the next driver tick may be closer than a full tick away.
        let ticks = delay.as_nanos().div_ceil(self.tick.as_nanos()) as u64 + 1;
        let cursor = self.cursor.load(Ordering::Acquire);
        let slot = (cursor + (ticks % self.slot_count as u64) as usize) % self.slot_count;
        let rounds = (ticks - 1) / self.slot_count as u64;

        self.wheels[wheel].slots[slot].lock().push(Entry {
            id,
            rounds,
            task: Box::new(task),
        });

        TimerHandle { id, wheel, slot }
    }

    /// Remove a pending entry. Returns false when it already fired.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut slot = self.wheels[handle.wheel].slots[handle.slot].lock();
        let before = slot.len();
        slot.retain(|e| e.id != handle.id);
        slot.len() != before
    }

    /// Run `task` every `period` until the returned handle is cancelled.
    pub fn schedule_periodic<F>(self: &Arc<Self>, period: Duration, task: F) -> PeriodicHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let handle = PeriodicHandle {
            state: Arc::new(PeriodicState {
                cancelled: AtomicBool::new(false),
                current: Mutex::new(None),
                wheel: Arc::downgrade(self),
            }),
        };
        arm_periodic(self, period, Arc::new(task), handle.state.clone());
        handle
    }

    /// Number of entries still waiting.
    pub fn pending(&self) -> usize {
        self.wheels
            .iter()
            .flat_map(|w| w.slots.iter())
            .map(|s| s.lock().len())
            .sum()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Spawn the driver task.
    pub fn start(self: &Arc<Self>, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let wheel = self.clone();
        tokio::spawn(async move { wheel.run(shutdown).await })
    }

    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::debug!(tick = ?self.tick, slots = self.slot_count, "Timing wheel started");

        let mut ticker = time::interval(self.tick);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.advance(),
                _ = shutdown.recv() => break,
            }
        }

        self.stopped.store(true, Ordering::Release);
        for wheel in &self.wheels {
            for slot in &wheel.slots {
                slot.lock().clear();
            }
        }
        tracing::debug!("Timing wheel stopped");
    }

    fn advance(&self) {
        let next = (self.cursor.load(Ordering::Acquire) + 1) % self.slot_count;
        self.cursor.store(next, Ordering::Release);

        let mut due = Vec::new();
        for wheel in &self.wheels {
            let mut slot = wheel.slots[next].lock();
            let mut i = 0;
            while i < slot.len() {
                if slot[i].rounds == 0 {
                    due.push(slot.swap_remove(i));
                } else {
                    slot[i].rounds -= 1;
                    i += 1;
                }
            }
        }

        for entry in due {
            (entry.task)();
        }
    }
}

struct PeriodicState {
    cancelled: AtomicBool,
    current: Mutex<Option<TimerHandle>>,
    wheel: Weak<TimingWheel>,
}

/// Cancels a periodic timer. Dropping it does not.
#[derive(Clone)]
pub struct PeriodicHandle {
    state: Arc<PeriodicState>,
}

impl std::fmt::Debug for PeriodicHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl PeriodicHandle {
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        if let (Some(handle), Some(wheel)) =
            (self.state.current.lock().take(), self.state.wheel.upgrade())
        {
            wheel.cancel(handle);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }
}

fn arm_periodic(
    wheel: &Arc<TimingWheel>,
    period: Duration,
    task: Arc<dyn Fn() + Send + Sync>,
    state: Arc<PeriodicState>,
) {
    let weak = Arc::downgrade(wheel);
    let next_state = state.clone();
    let handle = wheel.schedule(period, move || {
        if next_state.cancelled.load(Ordering::Acquire) {
            return;
        }
        task();
        if let Some(wheel) = weak.upgrade() {
            arm_periodic(&wheel, period, task, next_state);
        }
    });

    let mut current = state.current.lock();
    if state.cancelled.load(Ordering::Acquire) {
        wheel.cancel(handle);
    } else {
        *current = Some(handle);
    }
}
