//! Object locking: thin locks in the header word, fat monitors on demand.
//!
//! The lock word lives at [`jolt_object::LOCK_OFFSET`] in every header.
//! Uncontended acquire and release never leave the header; contention,
//! recursion overflow and any wait/notify inflate the word to a handle
//! into the [`MonitorTable`]. Inflation is one-way.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use jolt_object::{LockState, LockWord, MAX_THIN_COUNT, ObjectHeader};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::MonitorError;
use crate::fatal;
use crate::threading::{self, ManagedThread, ParkOutcome};

/// How a successful wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Notified,
    TimedOut,
}

#[derive(Debug, Default)]
struct MonitorState {
    /// Owning thread id, 0 when free.
    owner: u32,
    count: u32,
    waiters: VecDeque<Arc<ManagedThread>>,
}

/// A fat lock: recursive mutual exclusion plus an ordered wait set.
#[derive(Debug, Default)]
pub struct Monitor {
    state: Mutex<MonitorState>,
    available: Condvar,
}

impl Monitor {
    fn acquire(&self, me: u32) {
        let mut state = self.state.lock();
        if state.owner == me {
            state.count += 1;
            return;
        }
        while state.owner != 0 {
            self.available.wait(&mut state);
        }
        state.owner = me;
        state.count = 1;
    }

    /// Acquires with a preset recursion count.
    fn lock_all(&self, me: u32, count: u32) {
        let mut state = self.state.lock();
        while state.owner != 0 && state.owner != me {
            self.available.wait(&mut state);
        }
        state.owner = me;
        state.count = count;
    }

    fn release(&self, me: u32) {
        let mut state = self.state.lock();
        if state.owner != me {
            fatal!("thread {me} released a monitor owned by {}", state.owner);
        }
        state.count -= 1;
        if state.count == 0 {
            state.owner = 0;
            self.available.notify_one();
        }
    }

    fn owner(&self) -> u32 {
        self.state.lock().owner
    }

    fn wait(&self, me: &Arc<ManagedThread>, deadline: Option<Instant>) -> Result<WaitOutcome, MonitorError> {
        let mut state = self.state.lock();
        if state.owner != me.id() {
            return Err(MonitorError::IllegalMonitorState);
        }
        if me.take_interrupt() {
            return Err(MonitorError::Interrupted);
        }

        me.parker().reset();
        state.waiters.push_back(me.clone());
        let recursion = state.count;
        state.owner = 0;
        state.count = 0;
        self.available.notify_one();
        drop(state);

        let outcome = me.parker().park(me, deadline);

        let mut state = self.state.lock();
        while state.owner != 0 {
            self.available.wait(&mut state);
        }
        state.owner = me.id();
        state.count = recursion;
        // a notify that dequeued us after the park gave up still counts
        let notified = outcome == ParkOutcome::Signaled || {
            let queued = state.waiters.len();
            state.waiters.retain(|t| !Arc::ptr_eq(t, me));
            state.waiters.len() == queued
        };
        drop(state);

        if notified {
            return Ok(WaitOutcome::Notified);
        }
        match outcome {
            ParkOutcome::Signaled => Ok(WaitOutcome::Notified),
            ParkOutcome::TimedOut => Ok(WaitOutcome::TimedOut),
            ParkOutcome::Interrupted => {
                me.take_interrupt();
                Err(MonitorError::Interrupted)
            }
        }
    }

    fn notify(&self, me: u32) -> Result<(), MonitorError> {
        let mut state = self.state.lock();
        if state.owner != me {
            return Err(MonitorError::IllegalMonitorState);
        }
        let mut i = 0;
        while i < state.waiters.len() {
            let waiter = &state.waiters[i];
            if !waiter.is_alive() {
                state.waiters.remove(i);
            } else if waiter.is_interrupted() {
                i += 1;
            } else {
                if let Some(waiter) = state.waiters.remove(i) {
                    waiter.parker().signal();
                }
                break;
            }
        }
        Ok(())
    }

    fn notify_all(&self, me: u32) -> Result<(), MonitorError> {
        let mut state = self.state.lock();
        if state.owner != me {
            return Err(MonitorError::IllegalMonitorState);
        }
        for waiter in state.waiters.drain(..) {
            waiter.parker().signal();
        }
        Ok(())
    }
}

struct MonitorTableImpl {
    slots: Vec<Option<Arc<Monitor>>>,
    free: Vec<u32>,
    live: usize,
}

/// Owner of every fat monitor; lock words refer to monitors by index.
pub struct MonitorTable {
    inner: RwLock<MonitorTableImpl>,
    capacity: usize,
    spin_limit: u32,
}

impl MonitorTable {
    pub fn new(capacity: usize, spin_limit: u32) -> Self {
        Self {
            inner: RwLock::new(MonitorTableImpl {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
            capacity: capacity.min(jolt_object::HANDLE_MASK as usize + 1),
            spin_limit,
        }
    }

    fn allocate(&self) -> Result<(u32, Arc<Monitor>), MonitorError> {
        let mut inner = self.inner.write();
        if inner.live >= self.capacity {
            log::warn!("monitor table full ({} live)", inner.live);
            return Err(MonitorError::OutOfMemory);
        }
        let monitor = Arc::new(Monitor::default());
        let handle = match inner.free.pop() {
            Some(handle) => {
                inner.slots[handle as usize] = Some(monitor.clone());
                handle
            }
            None => {
                inner.slots.push(Some(monitor.clone()));
                (inner.slots.len() - 1) as u32
            }
        };
        inner.live += 1;
        log::trace!("allocated monitor {handle}");
        Ok((handle, monitor))
    }

    fn get(&self, handle: u32) -> Arc<Monitor> {
        match self.inner.read().slots.get(handle as usize) {
            Some(Some(monitor)) => monitor.clone(),
            _ => fatal!("lock word refers to dead monitor {handle}"),
        }
    }

    /// Returns a monitor to the table. Called by the collector once the
    /// owning object is unreachable, or when inflation loses a race.
    pub fn reclaim(&self, handle: u32) {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.slots.get_mut(handle as usize) {
            if slot.take().is_some() {
                inner.free.push(handle);
                inner.live -= 1;
            }
        }
    }

    /// Collector hook for a dead object.
    pub fn reclaim_object(&self, obj: &ObjectHeader) {
        if let LockState::Fat { handle } = obj.lock_word().decode() {
            self.reclaim(handle);
        }
    }

    pub fn live(&self) -> usize {
        self.inner.read().live
    }

    // ── lock protocol ──────────────────────────────────────────────

    #[inline]
    pub fn acquire(&self, obj: &ObjectHeader) -> Result<(), MonitorError> {
        let me = threading::current_id();
        if obj
            .compare_exchange_lock_word(LockWord::UNLOCKED, LockWord::thin(me, 1))
            .is_ok()
        {
            return Ok(());
        }
        self.acquire_slow(obj, me)
    }

    fn acquire_slow(&self, obj: &ObjectHeader, me: u32) -> Result<(), MonitorError> {
        loop {
            let word = obj.lock_word();
            match word.decode() {
                LockState::Unlocked | LockState::Biased { .. } => {
                    if obj
                        .compare_exchange_lock_word(word, LockWord::thin(me, 1))
                        .is_ok()
                    {
                        return Ok(());
                    }
                }
                LockState::Thin { owner, count } if owner == me => {
                    if count < MAX_THIN_COUNT {
                        obj.store_lock_word(LockWord::thin(me, count + 1));
                    } else {
                        let (handle, monitor) = self.allocate()?;
                        monitor.lock_all(me, count + 1);
                        obj.store_lock_word(LockWord::fat(handle));
                        log::debug!("lock recursion overflow, inflated to monitor {handle}");
                    }
                    return Ok(());
                }
                LockState::Thin { .. } => return self.acquire_contended(obj, me),
                LockState::Fat { handle } => {
                    self.get(handle).acquire(me);
                    return Ok(());
                }
            }
        }
    }

    /// Spins until the thin holder lets go, then installs a fat monitor so
    /// later contenders block instead of spinning.
    fn acquire_contended(&self, obj: &ObjectHeader, me: u32) -> Result<(), MonitorError> {
        let (handle, monitor) = self.allocate()?;
        let mut spins = 0;
        loop {
            let word = obj.lock_word();
            if word.is_fat() {
                self.reclaim(handle);
                self.get(word.handle()).acquire(me);
                return Ok(());
            }
            if word.count() == 0 {
                if obj
                    .compare_exchange_lock_word(word, LockWord::fat(handle))
                    .is_ok()
                {
                    log::debug!("contention inflated lock to monitor {handle}");
                    monitor.acquire(me);
                    return Ok(());
                }
                continue;
            }
            if spins < self.spin_limit {
                spins += 1;
                std::hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
    }

    #[inline]
    pub fn release(&self, obj: &ObjectHeader) {
        let me = threading::current_id();
        let word = obj.lock_word();
        match word.decode() {
            LockState::Thin { owner, count } if owner == me => {
                let next = if count == 1 {
                    word.unheld()
                } else {
                    LockWord::thin(me, count - 1)
                };
                obj.store_lock_word(next);
            }
            LockState::Fat { handle } => self.get(handle).release(me),
            state => fatal!("thread {me} released a lock it does not hold: {state:?}"),
        }
    }

    /// The current thread's monitor for `obj`, inflating a thin lock.
    fn owned_monitor(&self, obj: &ObjectHeader, me: u32) -> Result<Arc<Monitor>, MonitorError> {
        match obj.lock_word().decode() {
            LockState::Thin { owner, count } if owner == me => {
                let (handle, monitor) = self.allocate()?;
                monitor.lock_all(me, count);
                obj.store_lock_word(LockWord::fat(handle));
                Ok(monitor)
            }
            LockState::Fat { handle } => {
                let monitor = self.get(handle);
                if monitor.owner() == me {
                    Ok(monitor)
                } else {
                    Err(MonitorError::IllegalMonitorState)
                }
            }
            _ => Err(MonitorError::IllegalMonitorState),
        }
    }

    pub fn wait(&self, obj: &ObjectHeader) -> Result<(), MonitorError> {
        let me = threading::current();
        self.owned_monitor(obj, me.id())?.wait(&me, None).map(|_| ())
    }

    pub fn wait_timeout(&self, obj: &ObjectHeader, timeout: Duration) -> Result<WaitOutcome, MonitorError> {
        let me = threading::current();
        let deadline = Instant::now() + timeout;
        self.owned_monitor(obj, me.id())?.wait(&me, Some(deadline))
    }

    pub fn notify(&self, obj: &ObjectHeader) -> Result<(), MonitorError> {
        let me = threading::current_id();
        self.owned_monitor(obj, me)?.notify(me)
    }

    pub fn notify_all(&self, obj: &ObjectHeader) -> Result<(), MonitorError> {
        let me = threading::current_id();
        self.owned_monitor(obj, me)?.notify_all(me)
    }

    // ── introspection ──────────────────────────────────────────────

    pub fn state(&self, obj: &ObjectHeader) -> LockState {
        obj.lock_word().decode()
    }

    /// Whether the current thread holds `obj`'s lock.
    pub fn holds_lock(&self, obj: &ObjectHeader) -> bool {
        let me = threading::current_id();
        match obj.lock_word().decode() {
            LockState::Thin { owner, .. } => owner == me,
            LockState::Fat { handle } => self.get(handle).owner() == me,
            _ => false,
        }
    }

    /// Whether any thread holds `obj`'s lock.
    pub fn is_locked(&self, obj: &ObjectHeader) -> bool {
        match obj.lock_word().decode() {
            LockState::Thin { .. } => true,
            LockState::Fat { handle } => self.get(handle).owner() != 0,
            _ => false,
        }
    }

    pub fn waiter_count(&self, obj: &ObjectHeader) -> usize {
        match obj.lock_word().decode() {
            LockState::Fat { handle } => self.get(handle).state.lock().waiters.len(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threading::spawn_managed;
    use std::cell::UnsafeCell;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    fn table() -> Arc<MonitorTable> {
        Arc::new(MonitorTable::new(1024, 16))
    }

    fn object() -> Arc<ObjectHeader> {
        Arc::new(ObjectHeader::new(0, 0))
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "condition never became true");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn uncontended_acquire_is_thin() {
        let monitors = table();
        let obj = object();
        monitors.acquire(&obj).unwrap();
        let me = threading::current_id();
        assert_eq!(monitors.state(&obj), LockState::Thin { owner: me, count: 1 });
        monitors.acquire(&obj).unwrap();
        assert_eq!(monitors.state(&obj), LockState::Thin { owner: me, count: 2 });
        monitors.release(&obj);
        monitors.release(&obj);
        assert_eq!(monitors.state(&obj), LockState::Biased { owner: me });
        assert!(!monitors.is_locked(&obj));
        assert_eq!(monitors.live(), 0);
    }

    #[test]
    fn biased_lock_reacquires_without_inflating() {
        let monitors = table();
        let obj = object();
        monitors.acquire(&obj).unwrap();
        monitors.release(&obj);
        monitors.acquire(&obj).unwrap();
        assert!(monitors.holds_lock(&obj));
        assert!(!obj.lock_word().is_fat());
        monitors.release(&obj);
    }

    #[test]
    fn recursion_overflow_inflates_on_256th_acquire() {
        let monitors = table();
        let obj = object();
        for _ in 0..255 {
            monitors.acquire(&obj).unwrap();
        }
        assert!(!obj.lock_word().is_fat());
        monitors.acquire(&obj).unwrap();
        assert!(matches!(monitors.state(&obj), LockState::Fat { .. }));
        for _ in 0..256 {
            assert!(monitors.holds_lock(&obj));
            monitors.release(&obj);
        }
        assert!(!monitors.is_locked(&obj));

        let other = {
            let monitors = monitors.clone();
            let obj = obj.clone();
            spawn_managed(move || {
                monitors.acquire(&obj).unwrap();
                monitors.release(&obj);
            })
        };
        other.join().expect("lock should be free");
    }

    #[test]
    fn second_thread_blocks_until_release() {
        let monitors = table();
        let obj = object();
        monitors.acquire(&obj).unwrap();
        assert_eq!(
            monitors.state(&obj),
            LockState::Thin { owner: threading::current_id(), count: 1 }
        );

        let acquired = Arc::new(AtomicBool::new(false));
        let t = {
            let (monitors, obj, acquired) = (monitors.clone(), obj.clone(), acquired.clone());
            spawn_managed(move || {
                monitors.acquire(&obj).unwrap();
                acquired.store(true, Ordering::SeqCst);
                monitors.release(&obj);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        monitors.release(&obj);
        t.join().expect("join");
        assert!(acquired.load(Ordering::SeqCst));
        assert!(!monitors.is_locked(&obj));
    }

    struct Shared(UnsafeCell<u64>);
    // SAFETY: only touched while holding the object lock
    unsafe impl Sync for Shared {}

    #[test]
    fn mutual_exclusion_under_contention() {
        let monitors = table();
        let obj = object();
        let counter = Arc::new(Shared(UnsafeCell::new(0)));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let (monitors, obj, counter) = (monitors.clone(), obj.clone(), counter.clone());
                spawn_managed(move || {
                    for _ in 0..500 {
                        monitors.acquire(&obj).unwrap();
                        unsafe { *counter.0.get() += 1 };
                        monitors.release(&obj);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("join");
        }
        assert_eq!(unsafe { *counter.0.get() }, 2000);
        assert!(!monitors.is_locked(&obj));
    }

    #[test]
    fn wait_and_notify_require_ownership() {
        let monitors = table();
        let obj = object();
        assert_eq!(monitors.notify(&obj), Err(MonitorError::IllegalMonitorState));
        assert_eq!(monitors.notify_all(&obj), Err(MonitorError::IllegalMonitorState));
        assert_eq!(monitors.wait(&obj), Err(MonitorError::IllegalMonitorState));
        assert!(!obj.lock_word().is_fat());
    }

    #[test]
    fn timed_wait_restores_recursion() {
        let monitors = table();
        let obj = object();
        monitors.acquire(&obj).unwrap();
        monitors.acquire(&obj).unwrap();
        let outcome = monitors.wait_timeout(&obj, Duration::from_millis(10));
        assert_eq!(outcome, Ok(WaitOutcome::TimedOut));
        assert!(obj.lock_word().is_fat());
        assert_eq!(monitors.waiter_count(&obj), 0);
        monitors.release(&obj);
        assert!(monitors.holds_lock(&obj));
        monitors.release(&obj);
        assert!(!monitors.is_locked(&obj));
    }

    #[test]
    fn notify_after_timeout_is_not_lost() {
        let monitors = table();
        let obj = object();
        let (tx, rx) = mpsc::channel();
        let timed = {
            let (monitors, obj) = (monitors.clone(), obj.clone());
            spawn_managed(move || {
                monitors.acquire(&obj).unwrap();
                let outcome = monitors.wait_timeout(&obj, Duration::from_millis(300));
                monitors.release(&obj);
                outcome
            })
        };
        wait_for(|| monitors.waiter_count(&obj) == 1);
        let queued = spawn_waiter(&monitors, &obj, 1, tx);
        wait_for(|| monitors.waiter_count(&obj) == 2);

        // the timed waiter gives up while we hold the monitor and stays queued
        monitors.acquire(&obj).unwrap();
        thread::sleep(Duration::from_millis(500));
        monitors.notify(&obj).unwrap();
        assert_eq!(monitors.waiter_count(&obj), 1);
        monitors.release(&obj);
        assert_eq!(timed.join().expect("join"), Ok(WaitOutcome::Notified));
        assert!(rx.try_recv().is_err());

        monitors.acquire(&obj).unwrap();
        monitors.notify(&obj).unwrap();
        monitors.release(&obj);
        assert_eq!(rx.recv().expect("queued waiter woken"), 1);
        assert_eq!(queued.join().expect("join"), Ok(()));
        assert_eq!(monitors.waiter_count(&obj), 0);
    }

    #[test]
    fn pending_interrupt_fails_wait() {
        let monitors = table();
        let obj = object();
        monitors.acquire(&obj).unwrap();
        threading::current().interrupt();
        assert_eq!(monitors.wait(&obj), Err(MonitorError::Interrupted));
        assert!(!threading::current().is_interrupted());
        assert!(monitors.holds_lock(&obj));
        monitors.release(&obj);
    }

    fn spawn_waiter(
        monitors: &Arc<MonitorTable>,
        obj: &Arc<ObjectHeader>,
        tag: usize,
        done: mpsc::Sender<usize>,
    ) -> thread::JoinHandle<Result<(), MonitorError>> {
        let (monitors, obj) = (monitors.clone(), obj.clone());
        spawn_managed(move || {
            monitors.acquire(&obj).unwrap();
            let result = monitors.wait(&obj);
            done.send(tag).expect("report wake");
            monitors.release(&obj);
            result
        })
    }

    #[test]
    fn notify_wakes_in_registration_order() {
        let monitors = table();
        let obj = object();
        monitors.acquire(&obj).unwrap();
        monitors.notify(&obj).unwrap();
        monitors.release(&obj);

        let (tx, rx) = mpsc::channel();
        let mut threads = Vec::new();
        for tag in 0..3 {
            threads.push(spawn_waiter(&monitors, &obj, tag, tx.clone()));
            wait_for(|| monitors.waiter_count(&obj) == tag + 1);
        }

        let mut order = Vec::new();
        for _ in 0..3 {
            monitors.acquire(&obj).unwrap();
            monitors.notify(&obj).unwrap();
            monitors.release(&obj);
            order.push(rx.recv().expect("woken waiter"));
        }
        assert_eq!(order, vec![0, 1, 2]);
        for t in threads {
            assert_eq!(t.join().expect("join"), Ok(()));
        }
    }

    #[test]
    fn notify_all_wakes_everyone() {
        let monitors = table();
        let obj = object();
        let (tx, rx) = mpsc::channel();
        let mut threads = Vec::new();
        for tag in 0..3 {
            threads.push(spawn_waiter(&monitors, &obj, tag, tx.clone()));
            wait_for(|| monitors.waiter_count(&obj) == tag + 1);
        }
        monitors.acquire(&obj).unwrap();
        monitors.notify_all(&obj).unwrap();
        assert_eq!(monitors.waiter_count(&obj), 0);
        monitors.release(&obj);
        let mut woken: Vec<usize> = (0..3).map(|_| rx.recv().expect("woken")).collect();
        woken.sort();
        assert_eq!(woken, vec![0, 1, 2]);
        for t in threads {
            assert_eq!(t.join().expect("join"), Ok(()));
        }
    }

    #[test]
    fn notify_skips_interrupted_waiter() {
        let monitors = table();
        let obj = object();
        let (tx, rx) = mpsc::channel();
        let (id_tx, id_rx) = mpsc::channel();
        let first = {
            let (monitors, obj, tx) = (monitors.clone(), obj.clone(), tx.clone());
            spawn_managed(move || {
                id_tx.send(threading::current()).expect("send record");
                monitors.acquire(&obj).unwrap();
                let result = monitors.wait(&obj);
                tx.send(0).expect("report");
                monitors.release(&obj);
                result
            })
        };
        let first_record = id_rx.recv().expect("record");
        wait_for(|| monitors.waiter_count(&obj) == 1);
        let second = spawn_waiter(&monitors, &obj, 1, tx);
        wait_for(|| monitors.waiter_count(&obj) == 2);

        monitors.acquire(&obj).unwrap();
        first_record.interrupt();
        monitors.notify(&obj).unwrap();
        monitors.release(&obj);

        assert_eq!(second.join().expect("join"), Ok(()));
        assert_eq!(first.join().expect("join"), Err(MonitorError::Interrupted));
        let mut reports: Vec<usize> = rx.try_iter().collect();
        reports.sort();
        assert_eq!(reports, vec![0, 1]);
        assert_eq!(monitors.waiter_count(&obj), 0);
    }

    #[test]
    fn exhausted_table_reports_out_of_memory() {
        let monitors = Arc::new(MonitorTable::new(1, 4));
        let a = object();
        let b = object();
        monitors.acquire(&a).unwrap();
        monitors.notify(&a).unwrap();
        monitors.acquire(&b).unwrap();
        assert_eq!(monitors.notify(&b), Err(MonitorError::OutOfMemory));
        assert!(!b.lock_word().is_fat());
        monitors.release(&b);
        monitors.release(&a);

        monitors.reclaim_object(&a);
        assert_eq!(monitors.live(), 0);
        monitors.acquire(&b).unwrap();
        monitors.notify(&b).unwrap();
        assert_eq!(monitors.live(), 1);
        monitors.release(&b);
    }
}
