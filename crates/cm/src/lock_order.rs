//! Per-resource-class locks with a fixed acquisition order.
//!
//! Every device table sits behind its own [`RankedMutex`]. A thread may only
//! take a lock whose rank is higher than every lock it already holds; debug
//! builds assert this on each acquisition. Code that needs a lower-ranked
//! lock while holding a higher one must drop the guard and re-acquire.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

/// Lock ranks, lowest first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockRank {
    Queue,
    Task,
    ThreadSpace,
    ThreadGroupSpace,
    ProgramKernel,
    Sampler,
    Sampler8x8,
    Vebox,
    Surface,
    Surf2DUserData,
}

thread_local! {
    static HELD: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
}

/// Ranks currently held by this thread, in acquisition order.
pub fn held_ranks() -> Vec<LockRank> {
    HELD.with(|held| held.borrow().clone())
}

/// Mutex tagged with a [`LockRank`].
pub struct RankedMutex<T> {
    rank: LockRank,
    inner: Mutex<T>,
}

impl<T> RankedMutex<T> {
    pub const fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: parking_lot::const_mutex(value),
        }
    }

    pub fn rank(&self) -> LockRank {
        self.rank
    }

    pub fn lock(&self) -> RankedGuard<'_, T> {
        HELD.with(|held| {
            let held = held.borrow();
            debug_assert!(
                held.last().map_or(true, |top| *top < self.rank),
                "lock order violation: acquiring {:?} while holding {:?}",
                self.rank,
                *held
            );
        });
        let guard = self.inner.lock();
        HELD.with(|held| held.borrow_mut().push(self.rank));
        RankedGuard {
            guard,
            rank: self.rank,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RankedMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankedMutex")
            .field("rank", &self.rank)
            .field("inner", &self.inner)
            .finish()
    }
}

pub struct RankedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    rank: LockRank,
}

impl<T> Deref for RankedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RankedGuard<'_, T> {
    fn drop(&mut self) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|r| *r == self.rank) {
                held.remove(pos);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascending_acquisition_tracks_ranks() {
        let queue = RankedMutex::new(LockRank::Queue, 0u32);
        let surface = RankedMutex::new(LockRank::Surface, 0u32);
        {
            let _q = queue.lock();
            let mut s = surface.lock();
            *s += 1;
            assert_eq!(held_ranks(), vec![LockRank::Queue, LockRank::Surface]);
        }
        assert!(held_ranks().is_empty());
    }

    #[test]
    fn release_and_reacquire_is_allowed() {
        let queue = RankedMutex::new(LockRank::Queue, ());
        let surface = RankedMutex::new(LockRank::Surface, ());
        let s = surface.lock();
        drop(s);
        let _q = queue.lock();
        let _s = surface.lock();
        assert_eq!(held_ranks().len(), 2);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn descending_acquisition_panics_in_debug() {
        let queue = RankedMutex::new(LockRank::Queue, ());
        let surface = RankedMutex::new(LockRank::Surface, ());
        let _s = surface.lock();
        let _q = queue.lock();
    }
}
