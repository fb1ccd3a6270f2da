use std::{
    fmt,
    future::Future,
    mem,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio::{
    runtime::Handle,
    sync::watch,
    task::AbortHandle,
    time::{sleep, sleep_until, timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{AcquireError, Balance, ConfigError, GateBuilder, SENTINEL};

pub(crate) type PauseFn = Box<dyn Fn(i32, Duration) + Send + Sync>;
pub(crate) type ResumeFn = Box<dyn Fn() + Send + Sync>;

/// Limits the number of concurrent calls to a rate-limited upstream, pausing all admissions
/// when the upstream reports that its point balance is running low.
///
/// Acquire a [Token] before each call, then [release](Gate::release) it with the points
/// remaining reported by the call's response. When the balance falls to or below the
/// threshold, the gate pauses for the estimated refill time plus a buffer, then resumes on its
/// own.
///
/// Cloning is cheap; clones share the same slots and balance.
#[derive(Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

struct GateInner {
    balance: Balance,

    capacity: u32,
    in_flight: AtomicU32,

    acquire_buffer: Duration,
    pause_buffer: Duration,

    // Only written while `pause` is locked.
    paused: watch::Sender<bool>,
    pause: Mutex<PauseState>,

    on_pause: PauseFn,
    on_resume: ResumeFn,
}

#[derive(Debug, Default)]
struct PauseState {
    paused_at: Option<Instant>,
    // Identifies the active pause, so a timer from an older one never resumes a newer one.
    generation: u64,
    resume: Option<AbortHandle>,
}

/// A concurrency slot, required to make a call.
///
/// Give it back with [Gate::release]. Dropping it instead frees the slot without recording a
/// new balance, same as releasing with [SENTINEL].
#[derive(Debug)]
#[must_use = "dropping a token immediately frees its slot"]
pub struct Token<'t> {
    inner: &'t Arc<GateInner>,
}

/// A snapshot of the state of the [Gate].
///
/// Not guaranteed to be consistent under high concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateState {
    capacity: u32,
    in_flight: u32,
    paused: bool,
    remaining: i32,
}

impl Gate {
    /// Create a gate with the default buffers and no callbacks.
    pub fn new(capacity: u32, balance: Balance) -> Result<Self, ConfigError> {
        GateBuilder::new(capacity, balance).build()
    }

    pub fn builder(capacity: u32, balance: Balance) -> GateBuilder {
        GateBuilder::new(capacity, balance)
    }

    pub(crate) fn from_builder(builder: GateBuilder) -> Result<Self, ConfigError> {
        if builder.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }

        let (paused, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(GateInner {
                balance: builder.balance,
                capacity: builder.capacity,
                in_flight: AtomicU32::new(0),
                acquire_buffer: builder.acquire_buffer,
                pause_buffer: builder.pause_buffer,
                paused,
                pause: Mutex::new(PauseState::default()),
                on_pause: builder.on_pause.unwrap_or_else(|| Box::new(|_, _| {})),
                on_resume: builder.on_resume.unwrap_or_else(|| Box::new(|| {})),
            }),
        })
    }

    /// Try to immediately acquire a [Token].
    ///
    /// Returns `None` if the gate is paused or all slots are taken.
    pub fn try_acquire(&self) -> Option<Token<'_>> {
        if self.is_paused() || !self.inner.try_take_slot() {
            return None;
        }
        Some(Token::new(&self.inner))
    }

    /// Acquire a [Token], waiting as long as it takes.
    pub async fn acquire(&self) -> Token<'_> {
        let mut paused = self.inner.paused.subscribe();
        loop {
            // The sender lives in `self`, so this can't fail.
            let _ = paused.wait_for(|paused| !paused).await;

            if self.inner.try_take_slot() {
                return Token::new(&self.inner);
            }
            sleep(self.inner.acquire_buffer).await;
        }
    }

    /// Acquire a [Token], giving up once `cancel` completes.
    ///
    /// A slot is never held on behalf of a cancelled caller.
    pub async fn acquire_with<F: Future>(&self, cancel: F) -> Result<Token<'_>, AcquireError> {
        tokio::select! {
            biased;
            token = self.acquire() => Ok(token),
            _ = cancel => Err(AcquireError::Cancelled),
        }
    }

    /// Acquire a [Token], waiting at most `duration`.
    pub async fn acquire_timeout(&self, duration: Duration) -> Result<Token<'_>, AcquireError> {
        timeout(duration, self.acquire())
            .await
            .map_err(|_| AcquireError::Timeout(duration))
    }

    /// Return the [Token], along with the points remaining reported by the upstream.
    ///
    /// Pass [SENTINEL] if the call failed without reporting a balance.
    ///
    /// May start a pause, which is lifted by a task spawned on the current Tokio runtime. Never
    /// waits for the pause itself.
    pub fn release(&self, token: Token<'_>, points: i32) {
        debug_assert!(
            Arc::ptr_eq(&self.inner, token.inner),
            "token released to a different gate"
        );
        let inner = token.inner;
        mem::forget(token);
        inner.release(points);
    }

    /// Whether admissions are currently paused.
    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    pub fn balance(&self) -> &Balance {
        &self.inner.balance
    }

    /// The current state of the gate.
    pub fn state(&self) -> GateState {
        GateState {
            capacity: self.inner.capacity,
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            paused: self.is_paused(),
            remaining: self.inner.balance.remaining(),
        }
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("state", &self.state())
            .field("balance", &self.inner.balance)
            .field("acquire_buffer", &self.inner.acquire_buffer)
            .field("pause_buffer", &self.inner.pause_buffer)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for GateInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateInner")
            .field("capacity", &self.capacity)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl GateInner {
    fn try_take_slot(&self) -> bool {
        let mut curr = self.in_flight.load(Ordering::Acquire);
        loop {
            if curr >= self.capacity {
                return false;
            }

            match self.in_flight.compare_exchange(
                curr,
                curr + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => curr = actual,
            }
        }
    }

    fn lock_pause(&self) -> MutexGuard<'_, PauseState> {
        // Every write leaves the state valid, so a panic elsewhere can't corrupt it.
        self.pause.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(self: &Arc<Self>, points: i32) {
        let armed = {
            let mut state = self.lock_pause();
            self.balance.update(points);
            if self.balance.at_threshold() {
                self.arm_pause(&mut state)
            } else {
                None
            }
        };

        // Freed before the callback, which may panic.
        self.in_flight.fetch_sub(1, Ordering::Release);

        if let Some(duration) = armed {
            (self.on_pause)(points, duration);
        }
    }

    /// Start a new pause unless the previous one's window is still open.
    ///
    /// Must be called with `state` locked.
    fn arm_pause(self: &Arc<Self>, state: &mut PauseState) -> Option<Duration> {
        let now = Instant::now();
        let duration = self.balance.refill_duration() + self.pause_buffer;
        let remaining = self.balance.remaining();

        if let Some(paused_at) = state.paused_at {
            if now < paused_at + duration {
                debug!(remaining, "balance at threshold, pause already in effect");
                return None;
            }
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!(remaining, "balance at threshold, but no runtime to schedule a resume on");
            return None;
        };

        if let Some(previous) = state.resume.take() {
            previous.abort();
        }
        state.generation = state.generation.wrapping_add(1);
        state.paused_at = Some(now);
        self.paused.send_replace(true);

        let generation = state.generation;
        let inner = Arc::clone(self);
        let task = runtime.spawn(async move {
            sleep_until(now + duration).await;
            inner.resume(generation);
        });
        state.resume = Some(task.abort_handle());

        info!(remaining, ?duration, "balance at threshold, pausing admissions");
        Some(duration)
    }

    fn resume(&self, generation: u64) {
        {
            let mut state = self.lock_pause();
            if state.generation != generation {
                debug!(generation, "ignoring resume of a superseded pause");
                return;
            }
            state.resume = None;
            self.paused.send_replace(false);
        }

        info!("resuming admissions");
        (self.on_resume)();
    }
}

impl<'t> Token<'t> {
    fn new(inner: &'t Arc<GateInner>) -> Self {
        Self { inner }
    }
}

impl Drop for Token<'_> {
    /// Frees the slot without a balance observation.
    fn drop(&mut self) {
        self.inner.release(SENTINEL);
    }
}

impl GateState {
    /// The maximum number of concurrent holders.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
    /// The number of slots free to acquire, ignoring any pause.
    pub fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.in_flight)
    }
    /// The number of tokens currently held.
    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }
    pub fn paused(&self) -> bool {
        self.paused
    }
    /// The last known point balance.
    pub fn remaining(&self) -> i32 {
        self.remaining
    }
}
