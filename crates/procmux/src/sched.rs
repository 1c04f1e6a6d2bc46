//! The scheduler: a bounded pool of worker threads draining one shared ready
//! queue.
//!
//! Workers are detached OS threads named `procmux-worker-<id>`. Each loops:
//! pop the ready-queue head (blocking on the work-available condition),
//! resume the process' script, then dispatch on the outcome: completion
//! (recycle or destroy the interpreter, decrement the active count),
//! suspension (service the request inline, or complete the park: store the
//! engine back, append the descriptor to the channel's wait queue, release
//! the channel), or fault (report and destroy).
//!
//! The channel acquired during a send/receive is released *here*, at the
//! suspension point, which is what makes park-vs-match atomic: no other
//! thread can probe the channel between the script's decision to block and
//! the descriptor landing on the wait queue.
//!
//! Pool resizing is asymmetric: growth spawns threads; shrinking enqueues
//! engine-less sentinel descriptors flagged to stop whichever worker
//! completes them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::engine::Resume;
use crate::list::ProcList;
use crate::process::Process;
use crate::runtime::{RuntimeCore, Serviced};
use crate::types::{RuntimeError, Status};

// ── Scheduler state ───────────────────────────────────────────────────────────

struct ReadyQueue {
    queue: ProcList,
    /// Set once all processes finished (or at teardown); idle workers exit.
    shutdown: bool,
}

pub(crate) struct Sched {
    ready: Mutex<ReadyQueue>,
    work_available: Condvar,
    /// Count of processes not yet in a terminal state.
    active: Mutex<usize>,
    quiescent: Condvar,
    /// Live worker threads.
    workers: Mutex<usize>,
    worker_exited: Condvar,
    next_worker_id: AtomicUsize,
}

impl Sched {
    pub(crate) fn new() -> Self {
        Sched {
            ready: Mutex::new(ReadyQueue { queue: ProcList::new(), shutdown: false }),
            work_available: Condvar::new(),
            active: Mutex::new(0),
            quiescent: Condvar::new(),
            workers: Mutex::new(0),
            worker_exited: Condvar::new(),
            next_worker_id: AtomicUsize::new(0),
        }
    }

    // ── Ready queue ──────────────────────────────────────────────────────────

    /// Move a process to the ready queue and wake one worker.
    pub(crate) fn queue_ready(&self, lp: Arc<Process>) {
        lp.state().status = Status::Ready;
        let mut rq = self.ready.lock().expect("ready queue poisoned");
        rq.queue.push(lp);
        self.work_available.notify_one();
    }

    /// Blocking pop for workers. `None` means the shutdown flag is set and
    /// the queue is drained: exit.
    fn next_ready(&self) -> Option<Arc<Process>> {
        let mut rq = self.ready.lock().expect("ready queue poisoned");
        loop {
            if let Some(lp) = rq.queue.pop() {
                return Some(lp);
            }
            if rq.shutdown {
                return None;
            }
            rq = self
                .work_available
                .wait(rq)
                .expect("ready queue poisoned");
        }
    }

    /// Set the shutdown flag and wake every idle worker. Idempotent.
    pub(crate) fn shutdown(&self) {
        let mut rq = self.ready.lock().expect("ready queue poisoned");
        rq.shutdown = true;
        self.work_available.notify_all();
    }

    // ── Active-process counter ───────────────────────────────────────────────

    pub(crate) fn inc_active(&self) {
        *self.active.lock().expect("active counter poisoned") += 1;
    }

    pub(crate) fn dec_active(&self) {
        let mut n = self.active.lock().expect("active counter poisoned");
        *n -= 1;
        if *n == 0 {
            self.quiescent.notify_all();
        }
    }

    /// Block until the active count reaches zero, then shut the pool down so
    /// idle workers exit.
    pub(crate) fn wait_quiescent(&self) {
        let mut n = self.active.lock().expect("active counter poisoned");
        while *n != 0 {
            n = self.quiescent.wait(n).expect("active counter poisoned");
        }
        drop(n);
        self.shutdown();
    }

    // ── Worker accounting ────────────────────────────────────────────────────

    pub(crate) fn workers(&self) -> usize {
        *self.workers.lock().expect("worker count poisoned")
    }

    fn note_worker_started(&self) {
        *self.workers.lock().expect("worker count poisoned") += 1;
    }

    fn note_worker_exited(&self) {
        let mut n = self.workers.lock().expect("worker count poisoned");
        *n -= 1;
        self.worker_exited.notify_all();
    }

    /// Block until every worker thread has exited.
    pub(crate) fn wait_workers_gone(&self) {
        let mut n = self.workers.lock().expect("worker count poisoned");
        while *n != 0 {
            n = self.worker_exited.wait(n).expect("worker count poisoned");
        }
    }
}

// ── Workers ───────────────────────────────────────────────────────────────────

/// Spawn one detached worker thread.
pub(crate) fn spawn_worker(core: &Arc<RuntimeCore>) -> Result<(), RuntimeError> {
    let id = core.sched.next_worker_id.fetch_add(1, Ordering::Relaxed);
    let core_for_worker = Arc::clone(core);
    thread::Builder::new()
        .name(format!("procmux-worker-{id}"))
        .spawn(move || worker_main(core_for_worker))
        .map_err(|e| RuntimeError::WorkerSpawn { message: e.to_string() })?;
    core.sched.note_worker_started();
    Ok(())
}

fn worker_main(core: Arc<RuntimeCore>) {
    'pool: loop {
        let Some(lp) = core.sched.next_ready() else {
            break 'pool;
        };

        let (engine, mut nargs, destroy_worker) = {
            let mut st = lp.state();
            let engine = st.engine.take();
            let nargs = st.args;
            st.args = 0;
            (engine, nargs, st.destroy_worker)
        };

        // Engine-less descriptors are worker-shutdown sentinels: they
        // complete immediately.
        let Some(mut engine) = engine else {
            lp.state().status = Status::Finished;
            core.sched.dec_active();
            if destroy_worker {
                break 'pool;
            }
            continue 'pool;
        };

        'run: loop {
            match engine.resume(nargs) {
                Resume::Finished => {
                    core.finish(&lp, engine);
                    core.sched.dec_active();
                    if destroy_worker {
                        break 'pool;
                    }
                    break 'run;
                }
                Resume::Fault(message) => {
                    log::error!("script process failed: {message}");
                    lp.state().status = Status::Finished;
                    drop(engine);
                    core.sched.dec_active();
                    break 'run;
                }
                Resume::Yield(request) => match RuntimeCore::service(&core, &lp, engine.as_mut(), request) {
                    Serviced::Reply(n) => {
                        nargs = n;
                    }
                    Serviced::Park(chan) => {
                        // Complete the park: the engine goes back into the
                        // descriptor, the descriptor onto the wait queue the
                        // operation chose, and only then is the channel
                        // released.
                        let status = {
                            let mut st = lp.state();
                            st.engine = Some(engine);
                            st.status
                        };
                        {
                            let mut cst = chan.state();
                            match status {
                                Status::BlockedSend => cst.send.push(Arc::clone(&lp)),
                                Status::BlockedRecv => cst.recv.push(Arc::clone(&lp)),
                                other => unreachable!("parked with status {other:?}"),
                            }
                        }
                        core.registry.unlock(&chan);
                        break 'run;
                    }
                    Serviced::Pass => {
                        lp.state().engine = Some(engine);
                        core.sched.queue_ready(Arc::clone(&lp));
                        break 'run;
                    }
                },
            }
        }
    }
    core.sched.note_worker_exited();
}
