//! A cooperating pool of worker threads draining a due-time-ordered
//! priority queue of callbacks. Callbacks return `bool` ("reschedule at
//! the same period?"), run without the queue lock held, and cancellation
//! is left to the callback itself (typically by testing a captured
//! `Weak` reference).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type Callback = Box<dyn FnMut() -> bool + Send>;

struct Event {
    due: Instant,
    period: Duration,
    callback: Callback,
}

// A min-heap on `due` out of std's max-heap `BinaryHeap`.
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}
impl Eq for Event {}
impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due)
    }
}

#[derive(Default)]
struct Shared {
    queue: BinaryHeap<Event>,
    quit: bool,
    running: usize,
}

pub struct TimerService {
    shared: Arc<Mutex<Shared>>,
    new_event: Arc<Condvar>,
    all_done: Arc<Condvar>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl TimerService {
    pub fn new(worker_count: usize) -> Self {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let new_event = Arc::new(Condvar::new());
        let all_done = Arc::new(Condvar::new());

        let workers = (0..worker_count.max(1))
            .map(|_| {
                let shared = shared.clone();
                let new_event = new_event.clone();
                let all_done = all_done.clone();
                thread::spawn(move || worker_loop(shared, new_event, all_done))
            })
            .collect();

        TimerService {
            shared,
            new_event,
            all_done,
            workers,
        }
    }

    /// Schedules `callback` to run once, `delay` from now. If it returns
    /// `true` it is rescheduled `delay` later; if `false`, retired.
    pub fn schedule<F>(&self, delay: Duration, callback: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let mut shared = self.shared.lock().unwrap();
        shared.queue.push(Event {
            due: Instant::now() + delay,
            period: delay,
            callback: Box::new(callback),
        });
        self.new_event.notify_one();
    }

    /// Wakes every worker and stops pulling new work. Already-running
    /// callbacks finish normally.
    pub fn stop(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.quit = true;
        self.new_event.notify_all();
    }

    /// Blocks until the queue is empty and no worker is mid-callback.
    pub fn wait_idle(&self) {
        let shared = self.shared.lock().unwrap();
        let _guard = self
            .all_done
            .wait_while(shared, |s| !s.queue.is_empty() || s.running > 0)
            .unwrap();
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.stop();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Mutex<Shared>>, new_event: Arc<Condvar>, all_done: Arc<Condvar>) {
    loop {
        let mut guard = shared.lock().unwrap();
        loop {
            if guard.quit {
                return;
            }

            match guard.queue.peek() {
                None => {
                    guard = new_event.wait(guard).unwrap();
                }
                Some(top) => {
                    let now = Instant::now();
                    let due = top.due;
                    if due <= now {
                        break;
                    }
                    let (g, timed_out) = new_event.wait_timeout(guard, due - now).unwrap();
                    guard = g;
                    let _ = timed_out;
                }
            }
        }

        let mut event = guard.queue.pop().unwrap();
        guard.running += 1;
        drop(guard);

        let again = (event.callback)();

        let mut guard = shared.lock().unwrap();
        guard.running -= 1;
        if again && !guard.quit {
            event.due = Instant::now() + event.period;
            guard.queue.push(event);
            new_event.notify_one();
        }
        if guard.queue.is_empty() && guard.running == 0 {
            all_done.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[test]
    fn one_shot_fires_once() {
        let timer = TimerService::new(2);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        timer.schedule(Duration::from_millis(5), move || {
            c.fetch_add(1, AtomicOrdering::SeqCst);
            false
        });

        timer.wait_idle();
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn repeating_timer_reschedules_until_false() {
        let timer = TimerService::new(2);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        timer.schedule(Duration::from_millis(2), move || {
            c.fetch_add(1, AtomicOrdering::SeqCst) < 2
        });

        // Wait for three fires: two reschedules (true, true) then a
        // retiring false.
        loop {
            timer.wait_idle();
            if count.load(AtomicOrdering::SeqCst) >= 3 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(AtomicOrdering::SeqCst), 3);
    }

    #[test]
    fn cooperative_cancellation_via_weak() {
        let timer = TimerService::new(1);
        let alive = Arc::new(());
        let weak = Arc::downgrade(&alive);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();

        timer.schedule(Duration::from_millis(5), move || {
            if weak.upgrade().is_none() {
                return false;
            }
            f.fetch_add(1, AtomicOrdering::SeqCst);
            false
        });

        drop(alive);
        timer.wait_idle();
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }
}
