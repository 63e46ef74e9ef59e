//! The worker pool: a fixed set of parked threads fed one color class at
//! a time.
//!
//! One mutex guards the published batch and the idle counter. Workers wait
//! on the "work available" condition; the dispatcher waits on the "all
//! idle" condition. Packets are claimed with a fetch-add on an atomic
//! cursor, so dispatch is O(1) per packet and the mutex is only taken at
//! batch boundaries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_utils::CachePadded;

use crate::work::{Packet, RunnerRef};

/// One color class worth of packets, published to the workers.
///
/// The slice is borrowed from the dispatcher's stack; `run_batch` does not
/// return before every worker is idle again, which is what keeps the
/// pointers valid while any worker can still read them.
#[derive(Copy, Clone)]
struct Batch {
    packets: *const Packet,
    len: usize,
    runner: RunnerRef,
}

unsafe impl Send for Batch {}

struct PoolState {
    /// Bumped once per published batch; workers compare it against the
    /// last epoch they served to detect fresh work.
    epoch: u64,
    batch: Option<Batch>,
    /// Number of workers with nothing left to claim.
    idle: usize,
    stop: bool,
}

struct Shared {
    num_workers: usize,
    state: Mutex<PoolState>,
    /// Workers park here between batches.
    work_cond: Condvar,
    /// The dispatcher parks here until `idle == num_workers`.
    idle_cond: Condvar,
    /// Claim cursor over the published packet slice.
    cursor: CachePadded<AtomicUsize>,
}

pub(crate) struct WorkerPool {
    shared: Arc<Shared>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(num_workers: usize) -> WorkerPool {
        let shared = Arc::new(Shared {
            num_workers,
            state: Mutex::new(PoolState {
                epoch: 0,
                batch: None,
                // Workers start parked with nothing to claim.
                idle: num_workers,
                stop: false,
            }),
            work_cond: Condvar::new(),
            idle_cond: Condvar::new(),
            cursor: CachePadded::new(AtomicUsize::new(0)),
        });

        let mut joins = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let shared = Arc::clone(&shared);
            let join = std::thread::Builder::new()
                .name(format!("parloop-worker-{}", i))
                .spawn(move || run_worker(&shared, i))
                .unwrap();
            joins.push(join);
        }

        WorkerPool { shared, joins }
    }

    pub fn num_workers(&self) -> usize {
        self.shared.num_workers
    }

    /// Publish one color class and block until the pool has drained it.
    ///
    /// On return every packet of `packets` has been executed exactly once
    /// and all workers are parked again, which establishes the barrier
    /// between consecutive color classes.
    pub fn run_batch(&self, packets: &[Packet], runner: RunnerRef) {
        profiling::scope!("run_batch");

        if packets.is_empty() {
            return;
        }

        let mut state = self.shared.state.lock().unwrap();
        debug_assert_eq!(state.idle, self.shared.num_workers);

        self.shared.cursor.store(0, Ordering::Relaxed);
        state.batch = Some(Batch {
            packets: packets.as_ptr(),
            len: packets.len(),
            runner,
        });
        state.idle = 0;
        state.epoch += 1;
        self.shared.work_cond.notify_all();

        while state.idle < self.shared.num_workers {
            state = self.shared.idle_cond.wait(state).unwrap();
        }

        state.batch = None;
    }

    pub fn shut_down(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop = true;
            self.shared.work_cond.notify_all();
        }

        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shut_down();
    }
}

fn run_worker(shared: &Shared, worker: usize) {
    profiling::register_thread!("Worker");

    let mut seen = 0u64;
    let mut state = shared.state.lock().unwrap();

    loop {
        if state.stop {
            return;
        }

        if state.epoch != seen {
            seen = state.epoch;
            let batch = state.batch.unwrap();
            drop(state);

            // Claim packets until the cursor runs past the batch. The
            // batch was read under the mutex, which orders it after the
            // publication in `run_batch`.
            loop {
                let i = shared.cursor.fetch_add(1, Ordering::Relaxed);
                if i >= batch.len {
                    break;
                }

                unsafe {
                    let packet = *batch.packets.add(i);
                    batch.runner.run(packet.begin, packet.end, worker);
                }
            }

            state = shared.state.lock().unwrap();
            state.idle += 1;
            if state.idle == shared.num_workers {
                shared.idle_cond.notify_one();
            }
        } else {
            state = shared.work_cond.wait(state).unwrap();
        }
    }
}
