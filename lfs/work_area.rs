//! Per-case scratch memory and the arena that hands it out.
//!
//! `K` work areas are built once per engine. A case leases one for its whole optimization;
//! the lease gives exclusive access and returns the slot on drop, on every exit path. The
//! free list is lock-free; each slot additionally sits behind a `Mutex` that is only ever
//! `try_lock`ed, so a second holder of the same id is detected instead of waited on.

use crate::simplex::{LpSolver, SolveCounters};
use crate::types::SolverKind;
use crate::weights::WeightScratch;
use crossbeam_queue::ArrayQueue;
use ndarray::{Array2, ArrayView2, s};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkAreaError {
    #[error("Work area {id} was handed out while still in use.")]
    Collision { id: usize },

    #[error("No work area became free after {attempts} attempts.")]
    Exhausted { attempts: usize },
}

/// Everything one case optimization writes to.
pub struct WorkArea {
    /// Negated weighted intra-class spread per variable.
    pub a: Vec<f64>,
    /// Weighted inter-class spread per variable.
    pub b: Vec<f64>,
    /// `x[target] - x[j]` in row `j`.
    pub delta: Array2<f64>,
    pub weights: Vec<f64>,
    pub weight_scratch: WeightScratch,
    pub distances: Vec<f64>,
    pub order: Vec<usize>,
    pub sort_scratch: Vec<(f64, usize)>,
    pub sample: Vec<u8>,
    pub best_sample: Vec<u8>,
    pub best_overall: Vec<u8>,
    /// Shared selection rows followed by one private row for the β threshold.
    pub constraints: Array2<f64>,
    pub inter: Box<dyn LpSolver>,
    pub intra: Box<dyn LpSolver>,
    /// Solver exit tallies accumulated over every case this area has served.
    pub solver_totals: SolveCounters,
}

impl WorkArea {
    /// `shared` holds the `n_vars + 2` selection rows common to every case.
    pub fn new(
        n_cases: usize,
        n_vars: usize,
        shared: ArrayView2<'_, f64>,
        solver: SolverKind,
    ) -> Self {
        let mut constraints = Array2::zeros((shared.nrows() + 1, n_vars + 1));
        constraints
            .slice_mut(s![..shared.nrows(), ..])
            .assign(&shared);
        Self {
            a: vec![0.0; n_vars],
            b: vec![0.0; n_vars],
            delta: Array2::zeros((n_cases, n_vars)),
            weights: vec![1.0; n_cases],
            weight_scratch: WeightScratch::new(n_cases, n_vars),
            distances: vec![0.0; n_cases],
            order: (0..n_cases).collect(),
            sort_scratch: Vec::with_capacity(n_cases),
            sample: vec![0; n_vars],
            best_sample: vec![0; n_vars],
            best_overall: vec![0; n_vars],
            constraints,
            inter: solver.create(),
            intra: solver.create(),
            solver_totals: SolveCounters::default(),
        }
    }
}

/// Snapshot of arena activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub acquisitions: u64,
    pub collisions: u64,
    pub peak_live: usize,
}

pub struct Arena<T> {
    slots: Vec<Mutex<T>>,
    free: ArrayQueue<usize>,
    in_use: Vec<AtomicBool>,
    acquisitions: AtomicU64,
    collisions: AtomicU64,
    live: AtomicUsize,
    peak_live: AtomicUsize,
}

pub type WorkAreaArena = Arena<WorkArea>;

/// Exclusive access to one slot; the slot is returned when this is dropped.
pub struct Lease<'a, T> {
    // Field order matters: the guard unlocks before the id goes back on the free list.
    guard: MutexGuard<'a, T>,
    release: SlotRelease<'a, T>,
}

struct SlotRelease<'a, T> {
    arena: &'a Arena<T>,
    id: usize,
}

pub type WorkAreaLease<'a> = Lease<'a, WorkArea>;

impl<T> Arena<T> {
    pub fn new(items: Vec<T>) -> Self {
        let n = items.len();
        let free = ArrayQueue::new(n.max(1));
        for id in 0..n {
            // Capacity equals the slot count.
            let _ = free.push(id);
        }
        Self {
            slots: items.into_iter().map(Mutex::new).collect(),
            free,
            in_use: (0..n).map(|_| AtomicBool::new(false)).collect(),
            acquisitions: AtomicU64::new(0),
            collisions: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            peak_live: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Takes a free slot, or `Ok(None)` when every slot is leased.
    pub fn acquire(&self) -> Result<Option<Lease<'_, T>>, WorkAreaError> {
        let Some(id) = self.free.pop() else {
            return Ok(None);
        };
        if self.in_use[id].swap(true, Ordering::AcqRel) {
            self.collisions.fetch_add(1, Ordering::Relaxed);
            return Err(WorkAreaError::Collision { id });
        }
        let guard = match self.slots[id].try_lock() {
            Ok(guard) => guard,
            // Scratch is fully rewritten by the next case, so a panicked holder leaves
            // nothing to repair.
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                self.collisions.fetch_add(1, Ordering::Relaxed);
                return Err(WorkAreaError::Collision { id });
            }
        };
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        let live = self.live.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_live.fetch_max(live, Ordering::AcqRel);
        Ok(Some(Lease {
            guard,
            release: SlotRelease { arena: self, id },
        }))
    }

    /// Retries [`Arena::acquire`] until a slot frees up, yielding between attempts.
    pub fn acquire_with_retry(
        &self,
        max_attempts: usize,
    ) -> Result<Lease<'_, T>, WorkAreaError> {
        for attempt in 0..max_attempts {
            if let Some(lease) = self.acquire()? {
                return Ok(lease);
            }
            if attempt < 64 {
                thread::yield_now();
            } else {
                thread::sleep(Duration::from_micros(50));
            }
        }
        Err(WorkAreaError::Exhausted {
            attempts: max_attempts,
        })
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            collisions: self.collisions.load(Ordering::Relaxed),
            peak_live: self.peak_live.load(Ordering::Relaxed),
        }
    }

    /// Mutable access to every slot while no lease can exist.
    pub fn slots_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots
            .iter_mut()
            .map(|m| m.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

impl<T> Lease<'_, T> {
    pub fn id(&self) -> usize {
        self.release.id
    }
}

impl<T> Deref for Lease<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for Lease<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for SlotRelease<'_, T> {
    fn drop(&mut self) {
        self.arena.in_use[self.id].store(false, Ordering::Release);
        self.arena.live.fetch_sub(1, Ordering::AcqRel);
        let _ = self.arena.free.push(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_handed_out_once_until_released() {
        let arena = Arena::new(vec![10, 20]);
        let a = arena.acquire().unwrap().unwrap();
        let b = arena.acquire().unwrap().unwrap();
        assert_ne!(a.id(), b.id());
        assert!(arena.acquire().unwrap().is_none());
        drop(a);
        let c = arena.acquire().unwrap().unwrap();
        assert_eq!(*c + *b, 30);
        assert_eq!(arena.stats().peak_live, 2);
        assert_eq!(arena.stats().acquisitions, 3);
    }

    #[test]
    fn leases_are_exclusive_under_contention() {
        let arena = Arena::new((0..3).map(|_| 0u64).collect());
        let holders: Vec<AtomicUsize> = (0..3).map(|_| AtomicUsize::new(0)).collect();
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..500 {
                        let mut lease = arena.acquire_with_retry(1_000_000).unwrap();
                        let id = lease.id();
                        assert_eq!(holders[id].fetch_add(1, Ordering::SeqCst), 0);
                        *lease += 1;
                        thread::yield_now();
                        holders[id].fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });
        let stats = arena.stats();
        assert_eq!(stats.collisions, 0);
        assert_eq!(stats.acquisitions, 4000);
        assert!(stats.peak_live <= 3);
        let mut arena = arena;
        let total: u64 = arena.slots_mut().map(|v| *v).sum();
        assert_eq!(total, 4000);
    }

    #[test]
    fn exhausted_arena_reports_attempts() {
        let arena = Arena::new(vec![()]);
        let held = arena.acquire().unwrap().unwrap();
        assert_eq!(
            arena.acquire_with_retry(3).err(),
            Some(WorkAreaError::Exhausted { attempts: 3 })
        );
        drop(held);
        assert!(arena.acquire_with_retry(3).is_ok());
    }

    #[test]
    fn work_area_copies_shared_rows() {
        let shared = ndarray::array![
            [1.0, 1.0, 0.0],
            [1.0, 0.0, 1.0],
            [2.0, 1.0, 1.0],
            [1.0, 1.0, 1.0]
        ];
        let area = WorkArea::new(5, 2, shared.view(), SolverKind::Tableau);
        assert_eq!(area.constraints.dim(), (5, 3));
        assert_eq!(area.constraints.row(2).to_vec(), vec![2.0, 1.0, 1.0]);
        assert!(area.constraints.row(4).iter().all(|x| *x == 0.0));
        assert_eq!(area.inter.name(), "tableau");
        assert_eq!(area.order, vec![0, 1, 2, 3, 4]);
    }
}
