//! Bounded worker pool for background refresh and per-item parallel sweeps.
//!
//! Tasks either run detached (owning their references) or as a parallel
//! foreach that blocks the submitter until every item completed. Abort is
//! cooperative: the pool stops accepting work, queued tasks are dropped
//! unrun, and running tasks are expected to poll the shared flag at their
//! own safe boundaries.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkPool {
    abort: Arc<AtomicBool>,
    /// Tasks submitted but not yet finished; mirrors the handle's
    /// `threads_internal` counter.
    in_flight: Arc<AtomicU32>,
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkPool {
    /// `in_flight` is shared with the owning handle so its close sequence
    /// can drain on it.
    pub fn new(worker_count: usize, in_flight: Arc<AtomicU32>) -> Self {
        let worker_count = worker_count.max(1);
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let abort = Arc::new(AtomicBool::new(false));

        let workers = (0..worker_count)
            .map(|i| {
                let rx = Arc::clone(&rx);
                std::thread::Builder::new()
                    .name(format!("vmm-work-{}", i))
                    .spawn(move || worker_loop(rx))
                    .expect("spawn worker")
            })
            .collect();

        Self { abort, in_flight, tx: Mutex::new(Some(tx)), workers: Mutex::new(workers) }
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Enqueue a detached task. Refused after abort.
    pub fn submit<F: FnOnce() + Send + 'static>(&self, f: F) -> bool {
        if self.aborted() {
            return false;
        }
        let tx = self.tx.lock().unwrap();
        let Some(tx) = tx.as_ref() else {
            return false;
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let in_flight = Arc::clone(&self.in_flight);
        let job: Job = Box::new(move || {
            f();
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });
        if tx.send(job).is_err() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Run `action` over every item across the workers and wait for all of
    /// them. Items not yet started when abort hits are skipped.
    pub fn parallel_foreach<T, F>(&self, items: Vec<T>, action: F)
    where
        T: Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        if items.is_empty() {
            return;
        }
        let action = Arc::new(action);
        let wg = Arc::new(WaitGroup::new(items.len()));
        let mut submitted = 0usize;
        for item in items {
            let action = Arc::clone(&action);
            let wg = Arc::clone(&wg);
            let abort = Arc::clone(&self.abort);
            let ok = self.submit(move || {
                if !abort.load(Ordering::Acquire) {
                    action(item);
                }
                wg.done();
            });
            if !ok {
                break;
            }
            submitted += 1;
        }
        wg.wait_for(submitted);
    }

    /// Stop accepting tasks and signal running ones.
    pub fn interrupt(&self) {
        self.abort.store(true, Ordering::Release);
    }

    /// Interrupt, then join every worker. Called once at handle teardown.
    pub fn close(&self) {
        self.interrupt();
        self.tx.lock().unwrap().take();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        for w in workers {
            let _ = w.join();
        }
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let rx = rx.lock().unwrap();
            rx.recv()
        };
        match job {
            // the wrapper maintains the in-flight counter and must run even
            // after abort; payloads poll the abort flag themselves
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}

struct WaitGroup {
    expected: usize,
    state: Mutex<usize>,
    cv: Condvar,
}

impl WaitGroup {
    fn new(expected: usize) -> Self {
        Self { expected, state: Mutex::new(0), cv: Condvar::new() }
    }

    fn done(&self) {
        let mut n = self.state.lock().unwrap();
        *n += 1;
        if *n >= self.expected {
            self.cv.notify_all();
        }
    }

    fn wait_for(&self, count: usize) {
        let mut n = self.state.lock().unwrap();
        while *n < count {
            n = self.cv.wait(n).unwrap();
        }
    }
}
