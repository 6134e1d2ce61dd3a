//! In-memory periodic timers keyed by (job kind, scope, bank id).
//!
//! Timers are a cache of the persisted run flags: every tick body re-reads its
//! flag before doing work, so a timer that outlives its flag only produces
//! no-op ticks. The scheduler itself never touches persisted state.

use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::models::scope::{JobKey, JobKind};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// A thread that calls `tick` once per interval until cancelled.
///
/// The first tick fires one full interval after spawning. Cancelling stops
/// future ticks but never interrupts one in flight.
pub struct Timer {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
    interval: Duration,
}

impl Timer {
    pub fn spawn<F>(name: String, interval: Duration, mut tick: F) -> io::Result<Timer>
    where
        F: FnMut() + Send + 'static,
    {
        let interval = interval.max(MIN_INTERVAL);
        let (cancel, cancelled) = mpsc::channel::<()>();
        let handle = thread::Builder::new().name(name).spawn(move || {
            let mut next = Instant::now() + interval;
            loop {
                let wait = next.saturating_duration_since(Instant::now());
                match cancelled.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {
                        tick();
                        // Maintain steady cadence; deadlines missed by a slow tick are skipped.
                        next += interval;
                        let now = Instant::now();
                        while next <= now {
                            next += interval;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;
        Ok(Timer {
            cancel,
            handle,
            interval,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn cancel(self) {
        let _ = self.cancel.send(());
    }

    /// Park the caller on the timer thread. An uncancelled timer never exits,
    /// so this only returns if the tick panics.
    pub fn join(self) {
        let Timer { cancel, handle, .. } = self;
        let _ = handle.join();
        // Dropping the sender earlier would end the loop.
        drop(cancel);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns one timer map per job kind; a sensor may fetch without sending and
/// the reverse.
#[derive(Default)]
pub struct Scheduler {
    fetch: Mutex<HashMap<JobKey, Timer>>,
    send: Mutex<HashMap<JobKey, Timer>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn timers(&self, kind: JobKind) -> &Mutex<HashMap<JobKey, Timer>> {
        match kind {
            JobKind::Fetch => &self.fetch,
            JobKind::Send => &self.send,
        }
    }

    /// Returns `Ok(false)` when a timer for `key` already exists; the call is
    /// then a no-op.
    pub fn start<F>(&self, kind: JobKind, key: JobKey, interval: Duration, tick: F) -> io::Result<bool>
    where
        F: FnMut() + Send + 'static,
    {
        let mut timers = lock(self.timers(kind));
        if timers.contains_key(&key) {
            debug!("{} timer for {} already running", kind.as_str(), key);
            return Ok(false);
        }
        let name = format!("{}-{}-{}", kind.as_str(), key.scope.tenant_id().0, key.bank_id.0);
        let timer = Timer::spawn(name, interval, tick)?;
        timers.insert(key, timer);
        info!("Started {} timer for {} every {}s", kind.as_str(), key, interval.as_secs_f64());
        Ok(true)
    }

    /// Returns whether a timer was cancelled.
    pub fn stop(&self, kind: JobKind, key: &JobKey) -> bool {
        let removed = lock(self.timers(kind)).remove(key);
        match removed {
            Some(timer) => {
                timer.cancel();
                info!("Stopped {} timer for {}", kind.as_str(), key);
                true
            }
            None => false,
        }
    }

    pub fn start_fetch<F>(&self, key: JobKey, interval: Duration, tick: F) -> io::Result<bool>
    where
        F: FnMut() + Send + 'static,
    {
        self.start(JobKind::Fetch, key, interval, tick)
    }

    pub fn stop_fetch(&self, key: &JobKey) -> bool {
        self.stop(JobKind::Fetch, key)
    }

    pub fn start_send<F>(&self, key: JobKey, interval: Duration, tick: F) -> io::Result<bool>
    where
        F: FnMut() + Send + 'static,
    {
        self.start(JobKind::Send, key, interval, tick)
    }

    pub fn stop_send(&self, key: &JobKey) -> bool {
        self.stop(JobKind::Send, key)
    }

    /// Cancel every fetch and send timer in every scope. Returns how many.
    pub fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for kind in [JobKind::Fetch, JobKind::Send] {
            let drained: Vec<Timer> = lock(self.timers(kind)).drain().map(|(_, t)| t).collect();
            stopped += drained.len();
            drained.into_iter().for_each(Timer::cancel);
        }
        if stopped > 0 {
            info!("Stopped all timers ({})", stopped);
        }
        stopped
    }

    pub fn is_running(&self, kind: JobKind, key: &JobKey) -> bool {
        lock(self.timers(kind)).contains_key(key)
    }

    pub fn is_fetching(&self, key: &JobKey) -> bool {
        self.is_running(JobKind::Fetch, key)
    }

    pub fn is_sending(&self, key: &JobKey) -> bool {
        self.is_running(JobKind::Send, key)
    }

    pub fn count(&self, kind: JobKind) -> usize {
        lock(self.timers(kind)).len()
    }

    pub fn fetch_count(&self) -> usize {
        self.count(JobKind::Fetch)
    }

    pub fn send_count(&self) -> usize {
        self.count(JobKind::Send)
    }

    pub fn interval_of(&self, kind: JobKind, key: &JobKey) -> Option<Duration> {
        lock(self.timers(kind)).get(key).map(Timer::interval)
    }

    pub fn active_keys(&self, kind: JobKind) -> Vec<JobKey> {
        let mut keys: Vec<JobKey> = lock(self.timers(kind)).keys().copied().collect();
        keys.sort();
        keys
    }
}

/// Per-sensor mutual exclusion for tick bodies.
///
/// A stop followed by a start can leave the old timer's last tick in flight
/// while the new timer fires; only one of them may work on the sensor.
#[derive(Default)]
pub struct TickLocks {
    held: Mutex<HashSet<(JobKind, JobKey)>>,
}

impl TickLocks {
    pub fn try_claim(&self, kind: JobKind, key: JobKey) -> Option<TickGuard<'_>> {
        if lock(&self.held).insert((kind, key)) {
            Some(TickGuard {
                locks: self,
                entry: (kind, key),
            })
        } else {
            None
        }
    }
}

/// Releases the claim on drop, on every exit path of the tick.
pub struct TickGuard<'a> {
    locks: &'a TickLocks,
    entry: (JobKind, JobKey),
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        lock(&self.locks.held).remove(&self.entry);
    }
}
