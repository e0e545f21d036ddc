//! Worker pool for connection futures.
//!
//! Every connection runs start to finish on one worker thread, which parks
//! while the connection waits on the reactor or the timer. A controller that
//! blocks inside an invocation only holds up its own connection.
//!
//! Workers are spawned on demand up to `max_workers` and leave after sitting
//! idle for `keep_alive`.
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::thread::{self, Thread};
use std::time::Duration;

use futures::pin_mut;
use futures::task::{waker, ArcWake};

use crate::error::{ExecutorError, ExecutorResult};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Unparks the thread blocked in [`block_on`].
struct Unparker {
    thread: Thread,
    woken: AtomicBool,
}

impl ArcWake for Unparker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if !arc_self.woken.swap(true, Ordering::Release) {
            arc_self.thread.unpark();
        }
    }
}

/// Drives `future` to completion on the calling thread.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let unparker = Arc::new(Unparker {
        thread: thread::current(),
        woken: AtomicBool::new(false),
    });
    let waker = waker(unparker.clone());
    let mut cx = Context::from_waker(&waker);
    pin_mut!(future);

    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return output;
        }
        // A wake that raced the poll above leaves `woken` set.
        while !unparker.woken.swap(false, Ordering::Acquire) {
            thread::park();
        }
    }
}

#[derive(Clone)]
pub struct Executor {
    pool: Arc<Pool>,
}

struct Pool {
    state: Mutex<State>,
    available: Condvar,
    max_workers: usize,
    keep_alive: Duration,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Job>,
    workers: usize,
    idle: usize,
    /// Hand-offs from `spawn` not yet picked up by a waiting worker.
    handoffs: usize,
}

impl Executor {
    /// `max_workers` defaults to 15 per CPU, `keep_alive` to six seconds.
    pub fn new(max_workers: Option<usize>, keep_alive: Option<Duration>) -> Self {
        Executor {
            pool: Arc::new(Pool {
                state: Mutex::new(State::default()),
                available: Condvar::new(),
                max_workers: max_workers.unwrap_or_else(|| num_cpus::get() * 15).max(1),
                keep_alive: keep_alive.unwrap_or(Duration::from_secs(6)),
            }),
        }
    }

    /// Queues `future` and makes sure a worker will pick it up.
    ///
    /// An idle worker is woken if there is one, otherwise a new worker is
    /// started. At `max_workers` the job waits for the next free worker.
    pub fn spawn<F>(&self, future: F) -> ExecutorResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.pool.lock();
        state.queue.push_back(Box::pin(future));

        if state.idle > 0 {
            state.idle -= 1;
            state.handoffs += 1;
            self.pool.available.notify_one();
            return Ok(());
        }
        if state.workers >= self.pool.max_workers {
            return Ok(());
        }

        state.workers += 1;
        let pool = self.pool.clone();
        let spawned = thread::Builder::new()
            .name("vigil-worker".to_owned())
            .spawn(move || pool.work());
        match spawned {
            Ok(_) => Ok(()),
            Err(err) => {
                state.workers -= 1;
                if state.workers > 0 {
                    log::warn!("worker spawn failed, job queued: {}", err);
                    return Ok(());
                }
                state.queue.pop_back();
                Err(ExecutorError::ThreadSpawn(err))
            }
        }
    }

    /// Number of live worker threads.
    pub fn workers(&self) -> usize {
        self.pool.lock().workers
    }
}

impl Pool {
    fn lock(&self) -> MutexGuard<'_, State> {
        // Jobs run outside the lock, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn work(&self) {
        let mut state = self.lock();
        loop {
            if let Some(job) = state.queue.pop_front() {
                drop(state);
                if panic::catch_unwind(AssertUnwindSafe(|| block_on(job))).is_err() {
                    log::error!("connection task panicked");
                }
                state = self.lock();
                continue;
            }

            state.idle += 1;
            let (guard, wait) = self
                .available
                .wait_timeout(state, self.keep_alive)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;

            if state.handoffs > 0 {
                // `spawn` already took us off the idle count.
                state.handoffs -= 1;
                continue;
            }
            state.idle -= 1;
            if wait.timed_out() {
                break;
            }
        }
        state.workers -= 1;
    }
}

impl<F> hyper::rt::Executor<F> for Executor
where
    F: Future<Output = ()> + Send + 'static,
{
    fn execute(&self, future: F) {
        if let Err(err) = self.spawn(future) {
            log::error!("failed to run connection task: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn eventually(what: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if what() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_defaults() {
        let executor = Executor::new(None, None);
        assert_eq!(executor.pool.max_workers, num_cpus::get() * 15);
        assert_eq!(executor.pool.keep_alive, Duration::from_secs(6));

        let bounded = Executor::new(Some(4), Some(Duration::from_secs(10)));
        assert_eq!(bounded.pool.max_workers, 4);
        assert_eq!(bounded.pool.keep_alive, Duration::from_secs(10));
    }

    #[test]
    fn test_spawned_future_runs() {
        let executor = Executor::new(None, None);
        let (done, finished) = mpsc::channel();

        executor.spawn(async move { done.send(7).unwrap() }).unwrap();

        assert_eq!(finished.recv_timeout(Duration::from_secs(1)).unwrap(), 7);
    }

    #[test]
    fn test_blocking_task_does_not_stall_others() {
        let executor = Executor::new(Some(4), None);
        let (release, blocked) = mpsc::channel::<()>();
        let (done, finished) = mpsc::channel();

        executor.spawn(async move {
            let _ = blocked.recv();
        })
        .unwrap();
        executor.spawn(async move { done.send(()).unwrap() }).unwrap();

        finished
            .recv_timeout(Duration::from_secs(1))
            .expect("second task stalled behind the blocked one");
        release.send(()).unwrap();
    }

    #[test]
    fn test_jobs_queue_when_every_worker_is_busy() {
        let executor = Executor::new(Some(1), None);
        let (release, blocked) = mpsc::channel::<()>();
        let (done, finished) = mpsc::channel();

        executor.spawn(async move {
            let _ = blocked.recv();
        })
        .unwrap();
        executor.spawn(async move { done.send(()).unwrap() }).unwrap();

        assert!(finished.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(executor.workers(), 1);
        release.send(()).unwrap();
        finished.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_panicking_task_keeps_its_worker() {
        let executor = Executor::new(Some(1), None);
        let (done, finished) = mpsc::channel();

        executor.spawn(async {
            panic!("controller bug");
        })
        .unwrap();
        executor.spawn(async move { done.send(()).unwrap() }).unwrap();

        finished.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(executor.workers(), 1);
    }

    #[test]
    fn test_idle_workers_leave_after_keep_alive() {
        let executor = Executor::new(Some(2), Some(Duration::from_millis(20)));
        let (done, finished) = mpsc::channel();

        executor.spawn(async move { done.send(()).unwrap() }).unwrap();
        finished.recv_timeout(Duration::from_secs(1)).unwrap();

        assert!(eventually(|| executor.workers() == 0));
    }

    #[test]
    fn test_block_on_wakes_from_other_thread() {
        let (tx, rx) = futures::channel::oneshot::channel();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            tx.send("completed").unwrap();
        });

        assert_eq!(block_on(rx).unwrap(), "completed");
    }
}
