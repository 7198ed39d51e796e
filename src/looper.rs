//! Shared periodic scheduler.
//!
//! One thread notifies every registered [`LooperClient`] at its period and
//! phase offset. The thread sleeps in units of a common tick, the greatest
//! common divisor of all periods and non-zero offsets, aligned to the wall
//! clock, so a client with period 1000 ms and offset 0 fires at the top of
//! every second.
//!
//! ```text
//! tick = gcd(100, 300, 100) = 100 ms
//!
//! counter   0    1    2    3    4    5    6    7
//! A (100,0) x    x    x    x    x    x    x    x     divisor 1, modulus 0
//! B (300,100)    x              x              x     divisor 3, modulus 1
//! ```
//!
//! The thread is started by the first registration and retired when the last
//! client is removed, including from inside a notification. Callbacks run on
//! the looper thread without any looper lock held and must be short.

use crate::error::{DaqError, Result};
use crate::sample::{now_usecs, Timetag};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Identifier of one registration.
pub type ClientId = u64;

/// Receiver of periodic notifications.
pub trait LooperClient: Send + Sync {
    /// Called on the looper thread at each due tick. `now` is the wall time.
    fn looper_notify(&self, now: Timetag);
}

/// Scheduling parameters of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// Registration id
    pub id: ClientId,
    /// Period, ms
    pub period_ms: u64,
    /// Offset within the period, ms
    pub offset_ms: u64,
    /// `period / tick`
    pub divisor: u64,
    /// `offset / tick`
    pub modulus: u64,
}

impl Registration {
    /// Whether the client fires at tick `counter`.
    #[must_use]
    pub fn is_due(&self, counter: u64) -> bool {
        counter % self.divisor == self.modulus
    }
}

struct Entry {
    reg: Registration,
    client: Arc<dyn LooperClient>,
}

#[derive(Default)]
struct State {
    // Sorted by (period, id): shorter periods first, ties in registration order.
    entries: Vec<Entry>,
    tick_ms: u64,
    generation: u64,
    // A thread exits once the epoch moves past the one it was started with.
    epoch: u64,
    running: bool,
    next_id: ClientId,
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl State {
    fn recompute(&mut self) {
        let tick = self
            .entries
            .iter()
            .flat_map(|e| [e.reg.period_ms, e.reg.offset_ms])
            .filter(|&v| v != 0)
            .fold(0, gcd);
        self.tick_ms = tick;
        if tick == 0 {
            return;
        }
        for e in &mut self.entries {
            e.reg.divisor = e.reg.period_ms / tick;
            e.reg.modulus = e.reg.offset_ms / tick;
        }
        self.generation += 1;
    }
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// The periodic scheduler.
pub struct Looper {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Looper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("Looper")
            .field("clients", &st.entries.len())
            .field("tick_ms", &st.tick_ms)
            .field("running", &st.running)
            .finish()
    }
}

impl Default for Looper {
    fn default() -> Self {
        Self::new()
    }
}

impl Looper {
    /// New looper with no clients and no thread.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                cond: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Register `client` to be notified every `period_ms`, `offset_ms` into
    /// the period.
    pub fn add_client(
        &self,
        client: Arc<dyn LooperClient>,
        period_ms: u64,
        offset_ms: u64,
    ) -> Result<ClientId> {
        if period_ms == 0 {
            return Err(DaqError::configuration("looper", "period must be greater than 0"));
        }
        if offset_ms >= period_ms {
            return Err(DaqError::configuration(
                "looper",
                format!("offset {} ms not less than period {} ms", offset_ms, period_ms),
            ));
        }

        let mut st = self.shared.state.lock();
        st.next_id += 1;
        let id = st.next_id;
        let reg = Registration {
            id,
            period_ms,
            offset_ms,
            divisor: 1,
            modulus: 0,
        };
        let pos = st
            .entries
            .partition_point(|e| (e.reg.period_ms, e.reg.id) < (period_ms, id));
        st.entries.insert(pos, Entry { reg, client });
        st.recompute();
        debug!(id, period_ms, offset_ms, tick_ms = st.tick_ms, "looper client added");

        if !st.running {
            st.running = true;
            let shared = Arc::clone(&self.shared);
            let epoch = st.epoch;
            let spawned = thread::Builder::new()
                .name("looper".to_string())
                .spawn(move || run(&shared, epoch));
            match spawned {
                Ok(handle) => *self.thread.lock() = Some(handle),
                Err(e) => {
                    st.running = false;
                    st.entries.retain(|e| e.reg.id != id);
                    st.recompute();
                    return Err(DaqError::io("looper", "spawn", e));
                }
            }
        }
        drop(st);
        self.shared.cond.notify_all();
        Ok(id)
    }

    /// Remove a registration. Returns whether it existed.
    pub fn remove_client(&self, id: ClientId) -> bool {
        let mut st = self.shared.state.lock();
        let Some(pos) = st.entries.iter().position(|e| e.reg.id == id) else {
            return false;
        };
        st.entries.remove(pos);
        st.recompute();
        debug!(id, tick_ms = st.tick_ms, "looper client removed");
        let handle = if st.entries.is_empty() {
            self.retire(&mut st)
        } else {
            None
        };
        drop(st);
        self.shared.cond.notify_all();
        join_unless_current(handle);
        true
    }

    /// Remove every client and stop the thread.
    pub fn stop(&self) {
        let mut st = self.shared.state.lock();
        st.entries.clear();
        st.recompute();
        let handle = self.retire(&mut st);
        drop(st);
        self.shared.cond.notify_all();
        join_unless_current(handle);
    }

    fn retire(&self, st: &mut MutexGuard<'_, State>) -> Option<JoinHandle<()>> {
        if !st.running {
            return None;
        }
        st.epoch += 1;
        st.running = false;
        self.thread.lock().take()
    }

    /// Current tick, ms; 0 with no clients.
    #[must_use]
    pub fn tick_ms(&self) -> u64 {
        self.shared.state.lock().tick_ms
    }

    /// Registrations in notification order.
    #[must_use]
    pub fn registrations(&self) -> Vec<Registration> {
        self.shared.state.lock().entries.iter().map(|e| e.reg).collect()
    }

    /// Whether the looper thread is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_unless_current(handle: Option<JoinHandle<()>>) {
    let Some(handle) = handle else {
        return;
    };
    // Removing the last client from inside a callback: the thread exits on
    // its own after the callback returns.
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if let Err(e) = handle.join() {
        error!("Looper thread panicked: {:?}", e);
    }
}

fn wall_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

fn run(shared: &Shared, epoch: u64) {
    debug!("looper thread started");
    let mut st = shared.state.lock();
    loop {
        if st.epoch != epoch {
            break;
        }
        let tick = st.tick_ms.max(1);
        let generation = st.generation;
        let now_ms = wall_ms();
        let next = (now_ms / tick + 1) * tick;
        let deadline = Instant::now() + Duration::from_millis(next - now_ms);

        let mut changed = false;
        loop {
            let timed_out = shared.cond.wait_until(&mut st, deadline).timed_out();
            if st.epoch != epoch || st.generation != generation {
                changed = true;
                break;
            }
            if timed_out || Instant::now() >= deadline {
                break;
            }
        }
        if changed {
            continue;
        }

        let counter = next / tick;
        let due: Vec<Arc<dyn LooperClient>> = st
            .entries
            .iter()
            .filter(|e| e.reg.is_due(counter))
            .map(|e| Arc::clone(&e.client))
            .collect();
        if due.is_empty() {
            continue;
        }
        MutexGuard::unlocked(&mut st, || {
            let now = now_usecs();
            for client in &due {
                client.looper_notify(now);
            }
        });
    }
    debug!("looper thread exiting");
}
