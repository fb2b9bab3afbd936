//! A deadline-ordered task queue.
//!
//! Entries are keyed by absolute trigger time in milliseconds; ties fire in
//! insertion order. The queue itself never blocks: some thread is expected
//! to call [`Timer::spak`] whenever [`Timer::delay`] elapses; inside the
//! runtime that thread is whichever worker is blocked closest to the next
//! due time, and the poller's wait bound is exactly this delay.
//!
//! Two flavors of entry exist: posted-and-forgotten ([`Timer::post`],
//! [`Timer::post_at`]) which free themselves after the first fire, and
//! handle-returning ([`Timer::task_init`]) which live until
//! [`Timer::task_exit`]. Killing a task keeps its callback: it runs exactly
//! once more with the killed flag set so resources can be freed.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Instant;

use slab::Slab;

/// The callback type: invoked with `true` when the entry was killed.
pub type TimerFunc = Box<dyn FnMut(bool) + Send>;

/// A handle to a timer entry created with [`Timer::task_init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle {
    id: usize,
    token: u64,
}

/// The deadline queue.
pub struct Timer {
    epoch: Instant,
    inner: Mutex<Inner>,
}

struct Inner {
    entries: Slab<Entry>,
    heap: BinaryHeap<Reverse<Key>>,
    seq: u64,
    token: u64,
}

/// Heap key; `seq` preserves insertion order among equal due times.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    when: u64,
    seq: u64,
    id: usize,
    token: u64,
}

struct Entry {
    token: u64,
    when: u64,
    period: u64,
    repeat: bool,
    killed: bool,
    func: Option<TimerFunc>,
}

impl Timer {
    /// An empty queue; its clock starts now.
    pub fn new() -> Timer {
        Timer {
            epoch: Instant::now(),
            inner: Mutex::new(Inner::new()),
        }
    }

    /// The current time in milliseconds on this timer's clock.
    pub fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Post a one-shot or repeating entry `delay` ms from now.
    pub fn post<F>(&self, delay: u64, repeat: bool, func: F)
    where
        F: FnMut(bool) + Send + 'static,
    {
        let when = self.now() + delay;
        self.post_at(when, delay, repeat, func);
    }

    /// Post an entry at the absolute time `when` with the given period.
    pub fn post_at<F>(&self, when: u64, period: u64, repeat: bool, func: F)
    where
        F: FnMut(bool) + Send + 'static,
    {
        let _ = self.insert(when, period, repeat, Box::new(func));
    }

    /// Post a handle-returning entry; it lives until [`Timer::task_exit`].
    pub fn task_init<F>(&self, delay: u64, repeat: bool, func: F) -> TaskHandle
    where
        F: FnMut(bool) + Send + 'static,
    {
        let when = self.now() + delay;
        self.insert(when, delay, repeat, Box::new(func))
    }

    /// Mark an entry killed. Its callback runs once more with the killed
    /// flag set at the next spak, then the entry is removed.
    pub fn task_kill(&self, task: TaskHandle) {
        let now = self.now();
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let inner = &mut *inner;
        let entry = match inner.entries.get_mut(task.id) {
            Some(entry) if entry.token == task.token => entry,
            _ => return,
        };
        if entry.killed {
            return;
        }
        entry.killed = true;
        entry.when = now;
        let key = Key {
            when: now,
            seq: inner.seq,
            id: task.id,
            token: task.token,
        };
        inner.seq += 1;
        inner.heap.push(Reverse(key));
    }

    /// Remove an entry without invoking its callback.
    pub fn task_exit(&self, task: TaskHandle) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let matched = matches!(
            inner.entries.get(task.id),
            Some(entry) if entry.token == task.token
        );
        if matched {
            inner.entries.remove(task.id);
        }
    }

    /// Milliseconds until the next due entry, or `None` when empty.
    pub fn delay(&self) -> Option<u64> {
        let now = self.now();
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            let key = match inner.heap.peek() {
                Some(Reverse(key)) => Key {
                    when: key.when,
                    seq: key.seq,
                    id: key.id,
                    token: key.token,
                },
                None => return None,
            };
            if inner.is_stale(&key) {
                inner.heap.pop();
                continue;
            }
            return Some(key.when.saturating_sub(now));
        }
    }

    /// Fire every entry due at or before now, in `(when, seq)` order.
    pub fn spak(&self) {
        let now = self.now();
        loop {
            // take one due entry at a time so callbacks run unlocked and
            // may post further entries
            let (task, killed, mut func, requeue) = {
                let mut inner = match self.inner.lock() {
                    Ok(inner) => inner,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let inner = &mut *inner;
                let key = match inner.heap.peek() {
                    Some(Reverse(key)) if key.when <= now => Key {
                        when: key.when,
                        seq: key.seq,
                        id: key.id,
                        token: key.token,
                    },
                    _ => return,
                };
                inner.heap.pop();
                if inner.is_stale(&key) {
                    continue;
                }
                let entry = match inner.entries.get_mut(key.id) {
                    Some(entry) => entry,
                    None => continue,
                };
                let killed = entry.killed;
                let func = match entry.func.take() {
                    Some(func) => func,
                    None => continue,
                };
                let requeue = entry.repeat && !killed;
                if requeue {
                    entry.when += entry.period;
                    let key = Key {
                        when: entry.when,
                        seq: inner.seq,
                        id: key.id,
                        token: key.token,
                    };
                    inner.seq += 1;
                    inner.heap.push(Reverse(key));
                } else {
                    inner.entries.remove(key.id);
                }
                (key, killed, func, requeue)
            };

            func(killed);

            if requeue {
                let mut inner = match self.inner.lock() {
                    Ok(inner) => inner,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(entry) = inner.entries.get_mut(task.id) {
                    if entry.token == task.token && entry.func.is_none() {
                        entry.func = Some(func);
                    }
                }
            }
        }
    }

    fn insert(&self, when: u64, period: u64, repeat: bool, func: TimerFunc) -> TaskHandle {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let token = inner.token;
        inner.token += 1;
        let id = inner.entries.insert(Entry {
            token,
            when,
            period,
            repeat,
            killed: false,
            func: Some(func),
        });
        let key = Key {
            when,
            seq: inner.seq,
            id,
            token,
        };
        inner.seq += 1;
        inner.heap.push(Reverse(key));
        TaskHandle { id, token }
    }
}

impl Inner {
    fn new() -> Inner {
        Inner {
            entries: Slab::new(),
            heap: BinaryHeap::new(),
            seq: 0,
            token: 0,
        }
    }

    /// A key is stale when its entry is gone, replaced, or re-queued under
    /// a different deadline (kill or repeat moved it).
    fn is_stale(&self, key: &Key) -> bool {
        match self.entries.get(key.id) {
            Some(entry) => entry.token != key.token || entry.when != key.when,
            None => true,
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fires_in_due_order_with_insertion_ties() {
        let timer = Timer::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let now = timer.now();
        for (label, delay) in &[("b", 5u64), ("a", 0), ("c", 5), ("d", 1)] {
            let order = order.clone();
            let label = *label;
            timer.post_at(now + delay, 0, false, move |_| {
                order.lock().unwrap().push(label);
            });
        }
        thread::sleep(Duration::from_millis(20));
        timer.spak();
        assert_eq!(*order.lock().unwrap(), vec!["a", "d", "b", "c"]);
    }

    #[test]
    fn delay_tracks_next_entry() {
        let timer = Timer::new();
        assert_eq!(timer.delay(), None);
        timer.post(50, false, |_| {});
        let delay = timer.delay().unwrap();
        assert!(delay <= 50);
    }

    #[test]
    fn repeat_reenqueues_after_fire() {
        let timer = Timer::new();
        let (tx, rx) = mpsc::channel();
        timer.post(1, true, move |killed| {
            tx.send(killed).unwrap();
        });
        for _ in 0..3 {
            thread::sleep(Duration::from_millis(5));
            timer.spak();
        }
        let fired = rx.try_iter().count();
        assert!(fired >= 2, "repeating entry fired {} times", fired);
    }

    #[test]
    fn task_kill_notifies_once_with_flag() {
        let timer = Timer::new();
        let (tx, rx) = mpsc::channel();
        let task = timer.task_init(60_000, false, move |killed| {
            tx.send(killed).unwrap();
        });
        timer.task_kill(task);
        timer.spak();
        assert_eq!(rx.try_recv(), Ok(true));
        assert!(rx.try_recv().is_err());
        // the entry is gone, a second kill is a no-op
        timer.task_kill(task);
        timer.spak();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn task_exit_removes_silently() {
        let timer = Timer::new();
        let (tx, rx) = mpsc::channel();
        let task = timer.task_init(1, false, move |killed| {
            tx.send(killed).unwrap();
        });
        timer.task_exit(task);
        thread::sleep(Duration::from_millis(5));
        timer.spak();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn callbacks_may_post_from_spak() {
        let timer = Arc::new(Timer::new());
        let (tx, rx) = mpsc::channel();
        let inner = timer.clone();
        timer.post(0, false, move |_| {
            let tx = tx.clone();
            inner.post(0, false, move |_| {
                tx.send(()).unwrap();
            });
        });
        timer.spak();
        timer.spak();
        assert!(rx.try_recv().is_ok());
    }
}
