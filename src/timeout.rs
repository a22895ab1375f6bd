//! Cancellable, extendable deadline for one unit of work.
//!
//! The controller state and a generation counter live in a single atomic word so the timer
//! callback, which fires on a runtime worker, can race any caller-issued operation safely.
//! Every transition bumps the generation; a timer only fires if the generation it was armed
//! with is still current, which makes cancelled or superseded timers harmless no-ops.
//!
//! ```text
//! INIT ──schedule/reset(t>0)──▶ SCHEDULED ──fire/timeout_now──▶ TIMED_OUT
//!   │                             │   ▲
//!   │ extend (fails)              │   │ schedule/reset(t>0)
//!   ▼                             ▼   │
//! INACTIVE ◀──cancel/reset(0)── SCHEDULED
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::util::lock_unpoisoned;

const STATE_BITS: u32 = 2;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutState {
    /// Never scheduled.
    Init,
    /// A deadline callback is pending.
    Scheduled,
    /// Explicitly disabled.
    Inactive,
    /// Terminal.
    TimedOut,
}

impl TimeoutState {
    const fn bits(self) -> u64 {
        match self {
            Self::Init => 0,
            Self::Scheduled => 1,
            Self::Inactive => 2,
            Self::TimedOut => 3,
        }
    }

    const fn from_bits(bits: u64) -> Self {
        match bits & STATE_MASK {
            0 => Self::Init,
            1 => Self::Scheduled,
            2 => Self::Inactive,
            _ => Self::TimedOut,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Packed(u64);

impl Packed {
    const fn new(state: TimeoutState, generation: u64) -> Self {
        Self((generation << STATE_BITS) | state.bits())
    }

    const fn state(self) -> TimeoutState {
        TimeoutState::from_bits(self.0)
    }

    const fn generation(self) -> u64 {
        self.0 >> STATE_BITS
    }

    const fn next(self, state: TimeoutState) -> Self {
        Self::new(state, self.generation().wrapping_add(1))
    }
}

/// Work run when a deadline expires.
pub trait TimeoutTask: Send + Sync + 'static {
    /// Checked before every scheduling attempt. Returning `false` disables the controller.
    fn can_schedule(&self) -> bool;

    fn run(&self);
}

pub struct DeadlineController {
    inner: Arc<Inner>,
}

struct Inner {
    state: AtomicU64,
    task: Box<dyn TimeoutTask>,
    timer: Handle,
    slot: Mutex<TimerSlot>,
}

#[derive(Default)]
struct TimerSlot {
    start: Option<Instant>,
    timeout_nanos: u64,
    pending: Option<JoinHandle<()>>,
}

impl TimerSlot {
    fn disarm(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}

impl DeadlineController {
    /// Creates a controller whose callbacks fire on `timer`.
    pub fn new(task: impl TimeoutTask, timer: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU64::new(Packed::new(TimeoutState::Init, 0).0),
                task: Box::new(task),
                timer,
                slot: Mutex::new(TimerSlot::default()),
            }),
        }
    }

    /// Schedules the deadline `timeout_nanos` from now. Only valid from `Init` or `Inactive`.
    pub fn schedule_timeout_nanos(&self, timeout_nanos: u64) -> bool {
        let inner = &self.inner;
        if !inner.task.can_schedule() {
            return false;
        }
        let mut slot = lock_unpoisoned(&inner.slot);
        let current = inner.load();
        if !matches!(
            current.state(),
            TimeoutState::Init | TimeoutState::Inactive
        ) {
            return false;
        }
        let next = current.next(TimeoutState::Scheduled);
        if !inner.compare_and_set(current, next) {
            return false;
        }
        Inner::arm(inner, &mut slot, next.generation(), Instant::now(), timeout_nanos);
        true
    }

    /// Moves a scheduled deadline by `delta_nanos`. Only valid from `Scheduled`.
    ///
    /// Calling this on a controller that was never scheduled disables it (`Inactive`) until an
    /// explicit schedule or reset.
    pub fn extend_timeout_nanos(&self, delta_nanos: i64) -> bool {
        let inner = &self.inner;
        if !inner.task.can_schedule() {
            return false;
        }
        let mut slot = lock_unpoisoned(&inner.slot);
        let current = inner.load();
        match current.state() {
            TimeoutState::Scheduled => {}
            TimeoutState::Init => {
                inner.compare_and_set(current, current.next(TimeoutState::Inactive));
                return false;
            }
            TimeoutState::Inactive | TimeoutState::TimedOut => return false,
        }

        let now = Instant::now();
        let elapsed = slot
            .start
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default();
        let elapsed = i128::try_from(elapsed.as_nanos()).unwrap_or(i128::MAX);
        let remaining = i128::from(slot.timeout_nanos) + i128::from(delta_nanos) - elapsed;
        if remaining <= 0 {
            if !inner.compare_and_set(current, current.next(TimeoutState::TimedOut)) {
                return false;
            }
            slot.disarm();
            slot.timeout_nanos = 0;
            drop(slot);
            inner.task.run();
            return true;
        }

        let next = current.next(TimeoutState::Scheduled);
        if !inner.compare_and_set(current, next) {
            return false;
        }
        let remaining = u64::try_from(remaining).unwrap_or(u64::MAX);
        Inner::arm(inner, &mut slot, next.generation(), now, remaining);
        true
    }

    /// Replaces the deadline with `timeout_nanos` from now; zero disables it.
    pub fn reset_timeout_nanos(&self, timeout_nanos: u64) -> bool {
        let inner = &self.inner;
        if !inner.task.can_schedule() {
            return false;
        }
        let mut slot = lock_unpoisoned(&inner.slot);
        let current = inner.load();
        if current.state() == TimeoutState::TimedOut {
            return false;
        }

        if timeout_nanos == 0 {
            if !inner.compare_and_set(current, current.next(TimeoutState::Inactive)) {
                return false;
            }
            slot.disarm();
            slot.timeout_nanos = 0;
            return true;
        }

        let next = current.next(TimeoutState::Scheduled);
        if !inner.compare_and_set(current, next) {
            return false;
        }
        Inner::arm(inner, &mut slot, next.generation(), Instant::now(), timeout_nanos);
        true
    }

    pub fn cancel_timeout(&self) -> bool {
        let inner = &self.inner;
        let mut slot = lock_unpoisoned(&inner.slot);
        let current = inner.load();
        if current.state() != TimeoutState::Scheduled {
            return false;
        }
        if !inner.compare_and_set(current, current.next(TimeoutState::Inactive)) {
            return false;
        }
        slot.disarm();
        true
    }

    /// Expires the deadline immediately, running the task on the calling thread.
    pub fn timeout_now(&self) -> bool {
        let inner = &self.inner;
        if !inner.task.can_schedule() {
            return false;
        }
        let mut slot = lock_unpoisoned(&inner.slot);
        let current = inner.load();
        if current.state() == TimeoutState::TimedOut {
            return false;
        }
        if !inner.compare_and_set(current, current.next(TimeoutState::TimedOut)) {
            return false;
        }
        slot.disarm();
        drop(slot);
        inner.task.run();
        true
    }

    /// Remaining timeout measured from [`start_time`](Self::start_time).
    pub fn timeout_nanos(&self) -> u64 {
        lock_unpoisoned(&self.inner.slot).timeout_nanos
    }

    pub fn start_time(&self) -> Option<Instant> {
        lock_unpoisoned(&self.inner.slot).start
    }

    pub fn state(&self) -> TimeoutState {
        self.inner.load().state()
    }

    pub fn is_timed_out(&self) -> bool {
        self.state() == TimeoutState::TimedOut
    }
}

impl std::fmt::Debug for DeadlineController {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("DeadlineController")
            .field("state", &self.state())
            .field("timeout_nanos", &self.timeout_nanos())
            .finish()
    }
}

impl Inner {
    fn load(&self) -> Packed {
        Packed(self.state.load(Ordering::Acquire))
    }

    fn compare_and_set(&self, current: Packed, next: Packed) -> bool {
        self.state
            .compare_exchange(current.0, next.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn arm(
        this: &Arc<Self>,
        slot: &mut TimerSlot,
        generation: u64,
        start: Instant,
        timeout_nanos: u64,
    ) {
        slot.disarm();
        slot.start = Some(start);
        slot.timeout_nanos = timeout_nanos;

        let deadline = start
            .checked_add(Duration::from_nanos(timeout_nanos))
            .unwrap_or_else(|| start + FAR_FUTURE);
        let weak: Weak<Self> = Arc::downgrade(this);
        slot.pending = Some(this.timer.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(generation);
            }
        }));
    }

    fn fire(&self, generation: u64) {
        let current = self.load();
        if current.state() != TimeoutState::Scheduled || current.generation() != generation {
            return;
        }
        if !self.compare_and_set(current, current.next(TimeoutState::TimedOut)) {
            return;
        }
        if self.task.can_schedule() {
            self.task.run();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slot = match self.slot.get_mut() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.disarm();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use super::*;

    #[derive(Clone, Default)]
    struct CountingTask {
        runs: Arc<AtomicUsize>,
        disabled: Arc<AtomicBool>,
    }

    impl CountingTask {
        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    impl TimeoutTask for CountingTask {
        fn can_schedule(&self) -> bool {
            !self.disabled.load(Ordering::SeqCst)
        }

        fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn controller() -> (DeadlineController, CountingTask) {
        let task = CountingTask::default();
        let controller = DeadlineController::new(task.clone(), Handle::current());
        (controller, task)
    }

    fn millis(value: u64) -> u64 {
        Duration::from_millis(value).as_nanos() as u64
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_from_init_succeeds_once() {
        let (controller, _) = controller();
        assert!(controller.schedule_timeout_nanos(millis(1000)));
        assert_eq!(controller.state(), TimeoutState::Scheduled);
        assert!(!controller.schedule_timeout_nanos(millis(1000)));
        assert_eq!(controller.state(), TimeoutState::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_deadline_fires_once_at_expiry() {
        let (controller, task) = controller();
        controller.schedule_timeout_nanos(millis(1000));

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(task.runs(), 0);
        assert_eq!(controller.state(), TimeoutState::Scheduled);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(task.runs(), 1);
        assert!(controller.is_timed_out());
        assert!(!controller.cancel_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_to_zero_is_idempotent() {
        let (controller, _) = controller();
        controller.schedule_timeout_nanos(millis(1000));
        assert!(controller.reset_timeout_nanos(0));
        assert!(controller.reset_timeout_nanos(0));
        assert_eq!(controller.state(), TimeoutState::Inactive);
        assert_eq!(controller.timeout_nanos(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_replaces_the_timeout() {
        let (controller, task) = controller();
        controller.schedule_timeout_nanos(millis(1000));
        assert!(controller.reset_timeout_nanos(millis(500)));
        assert_eq!(controller.timeout_nanos(), millis(500));

        tokio::time::sleep(Duration::from_millis(501)).await;
        assert_eq!(task.runs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_without_schedule_arms_the_deadline() {
        let (controller, _) = controller();
        assert!(controller.reset_timeout_nanos(millis(500)));
        assert_eq!(controller.state(), TimeoutState::Scheduled);
        assert!(!controller.schedule_timeout_nanos(1));
    }

    #[tokio::test(start_paused = true)]
    async fn every_operation_fails_after_timeout_now() {
        let (controller, task) = controller();
        assert!(controller.timeout_now());
        assert_eq!(task.runs(), 1);

        assert!(!controller.schedule_timeout_nanos(millis(1000)));
        assert!(!controller.extend_timeout_nanos(1000));
        assert!(!controller.reset_timeout_nanos(millis(1000)));
        assert!(!controller.cancel_timeout());
        assert!(!controller.timeout_now());
        assert_eq!(controller.state(), TimeoutState::TimedOut);
        assert_eq!(task.runs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn extend_without_schedule_disables_until_reset() {
        let (controller, _) = controller();
        assert!(!controller.extend_timeout_nanos(millis(1000) as i64));
        assert_eq!(controller.state(), TimeoutState::Inactive);

        assert!(!controller.extend_timeout_nanos(millis(1000) as i64));
        assert_eq!(controller.state(), TimeoutState::Inactive);

        assert!(controller.reset_timeout_nanos(millis(1000)));
        assert_eq!(controller.state(), TimeoutState::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn extend_moves_the_deadline_relative_to_the_original_start() {
        let (controller, task) = controller();
        controller.schedule_timeout_nanos(millis(1000));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(controller.extend_timeout_nanos(millis(200) as i64));
        assert_eq!(controller.timeout_nanos(), millis(1100));

        assert!(controller.extend_timeout_nanos(-(millis(200) as i64)));
        assert_eq!(controller.timeout_nanos(), millis(900));

        tokio::time::sleep(Duration::from_millis(899)).await;
        assert_eq!(task.runs(), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(task.runs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn extend_past_the_deadline_expires_immediately() {
        let (controller, task) = controller();
        controller.schedule_timeout_nanos(millis(1000));
        assert!(controller.extend_timeout_nanos(-(millis(1000) as i64)));
        assert!(controller.is_timed_out());
        assert_eq!(task.runs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_deadline_prevents_the_callback() {
        let (controller, task) = controller();
        controller.schedule_timeout_nanos(millis(1000));
        assert!(controller.cancel_timeout());
        assert_eq!(controller.state(), TimeoutState::Inactive);
        assert!(!controller.cancel_timeout());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(task.runs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_does_not_fire_after_reschedule() {
        let (controller, task) = controller();
        controller.schedule_timeout_nanos(millis(100));
        controller.cancel_timeout();
        controller.schedule_timeout_nanos(millis(1000));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(task.runs(), 0);
        assert_eq!(controller.state(), TimeoutState::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_task_rejects_every_operation() {
        let task = CountingTask::default();
        task.disabled.store(true, Ordering::SeqCst);
        let controller = DeadlineController::new(task.clone(), Handle::current());

        assert!(!controller.schedule_timeout_nanos(1000));
        assert!(!controller.extend_timeout_nanos(2000));
        assert!(!controller.reset_timeout_nanos(3000));
        assert!(!controller.timeout_now());
        assert!(!controller.cancel_timeout());
        assert_eq!(controller.state(), TimeoutState::Init);
        assert_eq!(task.runs(), 0);
    }
}
