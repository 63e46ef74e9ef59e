//! The public scheduler: entity registry, dependency bookkeeping and the
//! launch dispatcher.

use thiserror::Error as ThisError;

use crate::coloring::color_packets;
use crate::family::{Family, FamilyId};
use crate::links::{DependencyLink, Observer};
use crate::pool::WorkerPool;
use crate::time::wall_clock;
use crate::work::{Packet, PacketRunner, RunnerRef};

/// Hard cap on the worker count.
pub const MAX_WORKERS: usize = 128;

/// Configuration errors. All of them are caller mistakes; the scheduler
/// never retries and never exits the process.
#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum Error {
    #[error("unknown entity family {0:?}")]
    UnknownFamily(FamilyId),
    #[error("no dependency link from {writer:?} to {target:?}")]
    UnknownLink { writer: FamilyId, target: FamilyId },
}

/// A fixed pool of workers plus the per-family tables driving them.
///
/// Launches are serialized and the registry is frozen while workers run:
/// both follow from `launch` taking `&mut self`.
pub struct Scheduler {
    pool: WorkerPool,
    families: Vec<Family>,
    links: Vec<DependencyLink>,
    /// Bumped on every registry or link mutation, for logging and debug
    /// checks; colorings are invalidated through the per-family dirty
    /// flags.
    generation: u64,
}

impl Scheduler {
    /// Spawn a scheduler with `num_workers` threads, clamped to
    /// `[1, MAX_WORKERS]`. Workers are joined when the scheduler drops.
    pub fn new(num_workers: usize) -> Scheduler {
        let num_workers = num_workers.max(1).min(MAX_WORKERS);
        Scheduler {
            pool: WorkerPool::new(num_workers),
            families: Vec::new(),
            links: Vec::new(),
            generation: 0,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.pool.num_workers()
    }

    pub fn num_families(&self) -> usize {
        self.families.len()
    }

    /// (worker count, registered family count).
    pub fn info(&self) -> (usize, usize) {
        (self.num_workers(), self.num_families())
    }

    /// Register an index family of `cardinality` entities (1-based).
    pub fn register_family(&mut self, cardinality: usize) -> FamilyId {
        self.generation += 1;
        let id = FamilyId(self.families.len() as u32);
        let family = Family::new(cardinality, self.num_workers());
        log::debug!(
            "registered family {:?}: {} entities in {} packets",
            id,
            cardinality,
            family.packets.len()
        );
        self.families.push(family);
        id
    }

    /// Declare that loops over `writer` write cells of `target` through an
    /// indirection described by `observer`. Replaces any previous link for
    /// the same pair and invalidates `writer`'s coloring.
    pub fn add_dependency(
        &mut self,
        writer: FamilyId,
        target: FamilyId,
        observer: impl Observer + 'static,
    ) -> Result<(), Error> {
        self.check(writer)?;
        self.check(target)?;

        self.generation += 1;
        self.links
            .retain(|link| !(link.writer == writer && link.target == target));
        self.links.push(DependencyLink {
            writer,
            target,
            observer: Box::new(observer),
        });
        self.families[writer.0 as usize].dirty = true;
        Ok(())
    }

    /// Erase the (writer, target) link and invalidate `writer`'s coloring.
    pub fn remove_dependency(&mut self, writer: FamilyId, target: FamilyId) -> Result<(), Error> {
        self.check(writer)?;
        self.check(target)?;

        let before = self.links.len();
        self.links
            .retain(|link| !(link.writer == writer && link.target == target));
        if self.links.len() == before {
            return Err(Error::UnknownLink { writer, target });
        }

        self.generation += 1;
        self.families[writer.0 as usize].dirty = true;
        Ok(())
    }

    /// Change a family's cardinality. Repartitions it and invalidates the
    /// coloring of the family itself and of every family writing into it.
    pub fn resize_family(&mut self, family: FamilyId, cardinality: usize) -> Result<(), Error> {
        self.check(family)?;

        self.generation += 1;
        let num_workers = self.num_workers();
        self.families[family.0 as usize].resize(cardinality, num_workers);

        for link in &self.links {
            if link.target == family {
                self.families[link.writer.0 as usize].dirty = true;
            }
        }
        Ok(())
    }

    /// Run `runner` over every packet of `family`, one color class at a
    /// time, recoloring first if the family is dirty. Returns the elapsed
    /// wall-clock seconds.
    ///
    /// Every packet executes exactly once; two packets of the same class
    /// may run concurrently but never share a touched cell of any linked
    /// family, and classes are separated by an all-idle barrier.
    pub fn launch(&mut self, family: FamilyId, runner: &dyn PacketRunner) -> Result<f64, Error> {
        profiling::scope!("launch");

        self.check(family)?;
        self.ensure_colored(family);

        let start = wall_clock();

        let entry = &self.families[family.0 as usize];
        debug_assert!(!entry.dirty);

        // Read only while `run_batch` blocks on the pool, never after
        // `launch` returns.
        let runner = unsafe { RunnerRef::new(runner) };

        let mut batch: Vec<Packet> = Vec::new();
        for class in &entry.colors {
            batch.clear();
            batch.extend(class.iter().map(|&p| entry.packets[p as usize]));
            self.pool.run_batch(&batch, runner);
        }

        Ok(wall_clock() - start)
    }

    /// Join all workers. Dropping the scheduler does the same.
    pub fn shutdown(self) {
        drop(self);
    }

    fn check(&self, family: FamilyId) -> Result<(), Error> {
        if (family.0 as usize) < self.families.len() {
            Ok(())
        } else {
            Err(Error::UnknownFamily(family))
        }
    }

    fn ensure_colored(&mut self, family: FamilyId) {
        let idx = family.0 as usize;
        if !self.families[idx].dirty {
            return;
        }

        let observers: Vec<&dyn Observer> = self
            .links
            .iter()
            .filter(|link| link.writer == family)
            .map(|link| &*link.observer)
            .collect();

        let classes = color_packets(&self.families[idx].packets, &observers);

        log::debug!(
            "colored family {:?} at generation {}: {} packets in {} classes",
            family,
            self.generation,
            self.families[idx].packets.len(),
            classes.len()
        );

        let entry = &mut self.families[idx];
        entry.colors = classes;
        entry.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn every_index_runs_exactly_once() {
        let mut scheduler = Scheduler::new(4);
        let family = scheduler.register_family(10_000);

        let counters: Vec<AtomicU32> = (0..10_000).map(|_| AtomicU32::new(0)).collect();
        let elapsed = scheduler
            .launch(family, &|begin: usize, end: usize, _worker: usize| {
                for i in begin..=end {
                    counters[i - 1].fetch_add(1, Ordering::Relaxed);
                }
            })
            .unwrap();

        assert!(elapsed >= 0.0);
        for counter in &counters {
            assert_eq!(counter.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn classes_run_in_order() {
        // Every packet writes the same cell, which serializes the loop
        // into singleton classes; completion order must follow class
        // order.
        let mut scheduler = Scheduler::new(8);
        let family = scheduler.register_family(64);
        scheduler
            .add_dependency(family, family, |_packet: Packet, touched: &mut Vec<usize>| {
                touched.push(1);
            })
            .unwrap();

        let ticket = AtomicUsize::new(0);
        let log = Mutex::new(Vec::new());
        scheduler
            .launch(family, &|begin: usize, _end: usize, _worker: usize| {
                let t = ticket.fetch_add(1, Ordering::SeqCst);
                log.lock().unwrap().push((t, begin));
            })
            .unwrap();

        let entry = &scheduler.families[0];
        assert_eq!(entry.colors.len(), entry.packets.len());

        let log = log.lock().unwrap();
        assert_eq!(log.len(), entry.packets.len());
        for (t, begin) in log.iter() {
            let packet = entry.colors[*t][0] as usize;
            assert_eq!(entry.packets[packet].begin, *begin);
        }
    }

    #[test]
    fn colored_classes_have_disjoint_footprints() {
        let mut scheduler = Scheduler::new(4);
        let family = scheduler.register_family(1000);

        let observe = |packet: Packet, touched: &mut Vec<usize>| {
            for i in packet.begin..=packet.end {
                touched.push(1 + (i * 7) % 500);
            }
        };
        scheduler.add_dependency(family, family, observe).unwrap();
        scheduler
            .launch(family, &|_: usize, _: usize, _: usize| {})
            .unwrap();

        let entry = &scheduler.families[0];
        assert!(entry.colors.len() > 1);
        for class in &entry.colors {
            let mut seen = HashSet::new();
            let mut total = 0;
            for &p in class {
                let mut touched = Vec::new();
                observe(entry.packets[p as usize], &mut touched);
                touched.sort_unstable();
                touched.dedup();
                total += touched.len();
                seen.extend(touched);
            }
            assert_eq!(seen.len(), total);
        }
    }

    #[test]
    fn unknown_family_is_reported() {
        let mut scheduler = Scheduler::new(2);
        let err = scheduler
            .launch(FamilyId(7), &|_: usize, _: usize, _: usize| {})
            .unwrap_err();
        assert_eq!(err, Error::UnknownFamily(FamilyId(7)));
    }

    #[test]
    fn removing_a_link_restores_a_single_class() {
        let mut scheduler = Scheduler::new(2);
        let family = scheduler.register_family(100);
        scheduler
            .add_dependency(family, family, |_: Packet, touched: &mut Vec<usize>| {
                touched.push(1);
            })
            .unwrap();

        scheduler
            .launch(family, &|_: usize, _: usize, _: usize| {})
            .unwrap();
        assert!(scheduler.families[0].colors.len() > 1);

        scheduler.remove_dependency(family, family).unwrap();
        scheduler
            .launch(family, &|_: usize, _: usize, _: usize| {})
            .unwrap();
        assert_eq!(scheduler.families[0].colors.len(), 1);

        let missing = scheduler.remove_dependency(family, family).unwrap_err();
        assert_eq!(
            missing,
            Error::UnknownLink {
                writer: family,
                target: family
            }
        );
    }

    #[test]
    fn resize_dirties_the_writers() {
        let mut scheduler = Scheduler::new(2);
        let target = scheduler.register_family(50);
        let writer = scheduler.register_family(100);
        scheduler
            .add_dependency(writer, target, |packet: Packet, touched: &mut Vec<usize>| {
                touched.push(1 + packet.begin % 50);
            })
            .unwrap();

        scheduler
            .launch(writer, &|_: usize, _: usize, _: usize| {})
            .unwrap();
        assert!(!scheduler.families[writer.0 as usize].dirty);

        scheduler.resize_family(target, 75).unwrap();
        assert!(scheduler.families[writer.0 as usize].dirty);
        assert!(scheduler.families[target.0 as usize].dirty);
        assert_eq!(scheduler.families[target.0 as usize].cardinality, 75);
    }

    #[test]
    fn worker_count_is_clamped() {
        let scheduler = Scheduler::new(0);
        assert_eq!(scheduler.num_workers(), 1);

        let scheduler = Scheduler::new(100_000);
        assert_eq!(scheduler.num_workers(), MAX_WORKERS);
    }
}
