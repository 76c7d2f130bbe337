/*!
The bundle slot pool.

A fixed-cardinality arena of bundle cells with reference counting.
Every bundle that exists on this node occupies exactly one slot;
handing a bundle to another component clones its [`Handle`]
(incrementing the count) and dropping the last handle returns the slot
to the pool and clears its contents. Keeping the pool fixed makes
memory use predictable and puts a hard bound on in-flight bundles.
*/

use super::*;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Every slot is in use.
    #[error("Bundle slot pool exhausted")]
    Exhausted,
}

struct Cell {
    bundle: RwLock<bundle::Bundle>,
}

pub struct Pool {
    cells: Box<[Cell]>,
    refs: Mutex<Box<[u32]>>,
}

impl Pool {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            cells: (0..count)
                .map(|_| Cell {
                    bundle: RwLock::new(bundle::Bundle::default()),
                })
                .collect(),
            refs: Mutex::new(vec![0; count].into_boxed_slice()),
        })
    }

    /// Installs `bundle` into a free slot with a reference count of one.
    pub fn create(self: &Arc<Self>, bundle: bundle::Bundle) -> Result<Handle, Error> {
        let index = {
            let mut refs = self.refs.lock().trace_expect("slot pool poisoned");
            let Some(index) = refs.iter().position(|r| *r == 0) else {
                warn!("Could not allocate slot for a bundle");
                return Err(Error::Exhausted);
            };
            refs[index] = 1;
            index
        };

        *self.cells[index].bundle.write().trace_expect("slot poisoned") = bundle;

        Ok(Handle {
            pool: self.clone(),
            index,
        })
    }

    /// Number of slots currently held.
    pub fn in_use(&self) -> usize {
        self.refs
            .lock()
            .trace_expect("slot pool poisoned")
            .iter()
            .filter(|r| **r != 0)
            .count()
    }

    fn increment(&self, index: usize) {
        let mut refs = self.refs.lock().trace_expect("slot pool poisoned");
        debug_assert_ne!(refs[index], 0);
        refs[index] += 1;
        trace!("slot {index} incremented to {}", refs[index]);
    }

    fn decrement(&self, index: usize) {
        let release = {
            let mut refs = self.refs.lock().trace_expect("slot pool poisoned");
            if refs[index] == 0 {
                error!("Duplicate free of slot {index}");
                return;
            }
            refs[index] -= 1;
            trace!("slot {index} decremented to {}", refs[index]);
            refs[index] == 0
        };

        if release {
            // Clear the freed slot so no stale bundle data lingers.
            *self.cells[index].bundle.write().trace_expect("slot poisoned") = bundle::Bundle::default();
        }
    }
}

/// A reference-counted handle onto one pooled bundle.
pub struct Handle {
    pool: Arc<Pool>,
    index: usize,
}

impl Handle {
    /// Shared access to the bundle.
    pub fn read(&self) -> RwLockReadGuard<'_, bundle::Bundle> {
        self.pool.cells[self.index].bundle.read().trace_expect("slot poisoned")
    }

    /// Exclusive access to the bundle.
    pub fn lock(&self) -> RwLockWriteGuard<'_, bundle::Bundle> {
        self.pool.cells[self.index]
            .bundle
            .write()
            .trace_expect("slot poisoned")
    }

    pub fn bundle_number(&self) -> u32 {
        self.read().bundle_number()
    }
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        self.pool.increment(self.index);
        Self {
            pool: self.pool.clone(),
            index: self.index,
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.pool.decrement(self.index);
    }
}

impl core::fmt::Debug for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handle").field("slot", &self.index).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_bundle(seq: u32) -> bundle::Bundle {
        bundle::Bundle::new(
            tundra_bpv6::bundle::Bundle {
                creation_sequence: seq,
                ..Default::default()
            },
            0,
        )
    }

    #[test]
    fn create_and_release() {
        let pool = Pool::new(4);
        let handle = pool.create(pool_bundle(1)).unwrap();
        assert_eq!(pool.in_use(), 1);
        assert_eq!(handle.read().bundle.creation_sequence, 1);

        drop(handle);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn clone_holds_slot_until_last_drop() {
        let pool = Pool::new(2);
        let a = pool.create(pool_bundle(1)).unwrap();
        let b = a.clone();

        drop(a);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(b.read().bundle.creation_sequence, 1);

        drop(b);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn exhaustion() {
        let pool = Pool::new(2);
        let _a = pool.create(pool_bundle(1)).unwrap();
        let _b = pool.create(pool_bundle(2)).unwrap();
        assert!(matches!(pool.create(pool_bundle(3)), Err(Error::Exhausted)));

        drop(_a);
        assert!(pool.create(pool_bundle(3)).is_ok());
    }

    #[test]
    fn freed_slot_is_cleared() {
        let pool = Pool::new(1);
        let handle = pool.create(pool_bundle(7)).unwrap();
        drop(handle);

        let handle = pool.create(pool_bundle(0)).unwrap();
        assert_eq!(handle.read().bundle.creation_sequence, 0);
    }
}
