use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use jolt_object::MAX_OWNER;
use parking_lot::{Condvar, Mutex};

use crate::fatal;

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);
static THREAD_REGISTRY: OnceLock<Mutex<HashMap<u32, Weak<ManagedThread>>>> = OnceLock::new();

thread_local! {
    static CURRENT: Attached = Attached::new();
}

/// Keeps the current thread's record alive and marks it dead on exit.
struct Attached(Arc<ManagedThread>);

impl Attached {
    fn new() -> Self {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        if id > MAX_OWNER {
            fatal!("thread id {id} does not fit the lock word");
        }
        let thread = Arc::new(ManagedThread {
            id,
            interrupted: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            parker: Parker::new(),
        });
        registry().lock().insert(id, Arc::downgrade(&thread));
        log::trace!("attached thread {id}");
        Self(thread)
    }
}

impl Drop for Attached {
    fn drop(&mut self) {
        self.0.alive.store(false, Ordering::Release);
        registry().lock().remove(&self.0.id);
    }
}

fn registry() -> &'static Mutex<HashMap<u32, Weak<ManagedThread>>> {
    THREAD_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Per-thread record the monitor protocol needs: a lock-word id, the
/// interrupt flag, and a private condition to block on.
#[derive(Debug)]
pub struct ManagedThread {
    id: u32,
    interrupted: AtomicBool,
    alive: AtomicBool,
    parker: Parker,
}

impl ManagedThread {
    /// Non-zero and at most [`MAX_OWNER`].
    #[inline(always)]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Returns and clears the interrupt flag.
    pub fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Sets the interrupt flag and wakes the thread if it is waiting.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.parker.wake();
    }

    pub(crate) fn parker(&self) -> &Parker {
        &self.parker
    }
}

pub fn current() -> Arc<ManagedThread> {
    CURRENT.with(|t| t.0.clone())
}

#[inline]
pub fn current_id() -> u32 {
    CURRENT.with(|t| t.0.id)
}

pub fn lookup(id: u32) -> Option<Arc<ManagedThread>> {
    registry().lock().get(&id).and_then(Weak::upgrade)
}

/// Spawns an OS thread that is attached before `f` runs.
pub fn spawn_managed<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::spawn(move || {
        current_id();
        f()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParkOutcome {
    Signaled,
    Interrupted,
    TimedOut,
}

/// A one-shot signal owned by a single thread.
///
/// The owner arms it with [`Parker::reset`] before publishing itself
/// somewhere a waker can find it, so a signal sent in between is kept.
#[derive(Debug, Default)]
pub(crate) struct Parker {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reset(&self) {
        *self.signaled.lock() = false;
    }

    pub(crate) fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cv.notify_one();
    }

    fn wake(&self) {
        let _guard = self.signaled.lock();
        self.cv.notify_one();
    }

    /// Blocks `thread` (the owner) until signaled, interrupted, or the
    /// deadline passes. A signal wins over a simultaneous interrupt.
    pub(crate) fn park(&self, thread: &ManagedThread, deadline: Option<Instant>) -> ParkOutcome {
        let mut signaled = self.signaled.lock();
        loop {
            if *signaled {
                *signaled = false;
                return ParkOutcome::Signaled;
            }
            if thread.is_interrupted() {
                return ParkOutcome::Interrupted;
            }
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut signaled, deadline).timed_out() && !*signaled {
                        return ParkOutcome::TimedOut;
                    }
                }
                None => self.cv.wait(&mut signaled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn ids_are_unique_and_nonzero() {
        let main = current_id();
        let other = spawn_managed(current_id).join().expect("join");
        assert_ne!(main, 0);
        assert_ne!(other, 0);
        assert_ne!(main, other);
        assert_eq!(current().id(), main);
    }

    #[test]
    fn registry_tracks_live_threads() {
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let t = spawn_managed(move || {
            tx.send(current_id()).expect("send id");
            done_rx.recv().expect("wait for release");
        });
        let id = rx.recv().expect("recv id");
        let record = lookup(id).expect("thread registered");
        assert!(record.is_alive());
        done_tx.send(()).expect("release thread");
        t.join().expect("join");
        assert!(!record.is_alive());
        assert!(lookup(id).is_none());
    }

    #[test]
    fn signal_before_park_is_not_lost() {
        let me = current();
        me.parker().reset();
        me.parker().signal();
        assert_eq!(me.parker().park(&me, None), ParkOutcome::Signaled);
    }

    #[test]
    fn park_times_out() {
        let me = current();
        me.parker().reset();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(me.parker().park(&me, Some(deadline)), ParkOutcome::TimedOut);
    }

    #[test]
    fn interrupt_wakes_parked_thread() {
        let (tx, rx) = mpsc::channel();
        let t = spawn_managed(move || {
            let me = current();
            me.parker().reset();
            tx.send(me.clone()).expect("send record");
            let outcome = me.parker().park(&me, None);
            (outcome, me.take_interrupt())
        });
        let record = rx.recv().expect("recv record");
        record.interrupt();
        let (outcome, was_interrupted) = t.join().expect("join");
        assert_eq!(outcome, ParkOutcome::Interrupted);
        assert!(was_interrupted);
    }

    #[test]
    fn signal_from_another_thread() {
        let (tx, rx) = mpsc::channel();
        let t = spawn_managed(move || {
            let me = current();
            me.parker().reset();
            tx.send(me.clone()).expect("send record");
            me.parker().park(&me, Some(Instant::now() + Duration::from_secs(10)))
        });
        let record = rx.recv().expect("recv record");
        record.parker().signal();
        assert_eq!(t.join().expect("join"), ParkOutcome::Signaled);
    }
}
