//! The heap shared by concurrently running call stacks.
//!
//! Allocation and mutation go through a mutex. Collection is stop-the-world:
//! the collecting stack raises `stop_requested`, every other attached stack
//! parks at its next safepoint (handing over its roots), and only then is
//! the heap traced. Parked stacks resume when the epoch advances. The
//! statics of every registered program are roots of each collection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use tracing::trace;

use super::arena::{Heap, HeapObject, HeapStats};
use super::statics::Statics;
use super::value::{Handle, Value};

#[derive(Debug, Default)]
struct WorldState {
    /// Stacks currently attached as mutators.
    mutators: usize,
    /// Attached stacks parked at a safepoint.
    parked: usize,
    /// A collection is in progress.
    collecting: bool,
    /// Bumped after every collection; parked stacks wait for it to change.
    epoch: u64,
    /// Roots handed over by parked stacks.
    pending_roots: Vec<Value>,
}

#[derive(Debug)]
pub struct SharedHeap {
    heap: Mutex<Heap>,
    world: Mutex<WorldState>,
    /// Signalled when a stack parks or detaches.
    parked_changed: Condvar,
    /// Signalled when a collection finishes.
    resumed: Condvar,
    stop_requested: AtomicBool,
    allocations: AtomicUsize,
    threshold: usize,
    /// Lock order: world, then statics, then heap.
    statics: Mutex<Vec<Weak<Statics>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock leaves the data structurally intact.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SharedHeap {
    /// Create a heap that requests a collection every `threshold` allocations.
    pub fn new(threshold: usize) -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(Heap::new()),
            world: Mutex::new(WorldState::default()),
            parked_changed: Condvar::new(),
            resumed: Condvar::new(),
            stop_requested: AtomicBool::new(false),
            allocations: AtomicUsize::new(0),
            threshold: threshold.max(1),
            statics: Mutex::new(Vec::new()),
        })
    }

    /// Register the calling stack as a mutator for the guard's lifetime.
    pub fn attach(self: &Arc<Self>) -> Mutator {
        lock(&self.world).mutators += 1;
        Mutator {
            heap: Arc::clone(self),
        }
    }

    /// Run `f` with exclusive access to the heap.
    pub fn with<R>(&self, f: impl FnOnce(&mut Heap) -> R) -> R {
        f(&mut lock(&self.heap))
    }

    pub fn alloc(&self, object: HeapObject) -> Handle {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        lock(&self.heap).alloc(object)
    }

    /// Keep the values in `statics` alive until the table itself is dropped.
    pub fn register_statics(&self, statics: &Arc<Statics>) {
        let mut registered = lock(&self.statics);
        registered.retain(|weak| weak.strong_count() > 0);
        let weak = Arc::downgrade(statics);
        if !registered.iter().any(|known| known.ptr_eq(&weak)) {
            registered.push(weak);
        }
    }

    fn static_roots(&self) -> Vec<Value> {
        lock(&self.statics)
            .iter()
            .filter_map(Weak::upgrade)
            .flat_map(|statics| statics.roots())
            .collect()
    }

    /// Allocation pressure has reached the collection threshold.
    pub fn wants_collection(&self) -> bool {
        self.allocations.load(Ordering::Relaxed) >= self.threshold
    }

    pub fn stats(&self) -> HeapStats {
        lock(&self.heap).stats()
    }

    /// Collect from a thread that is not an attached mutator (the host).
    /// Waits for every attached stack to park.
    pub fn collect_detached(&self, roots: Vec<Value>) -> Option<usize> {
        self.stop_the_world(roots, false)
    }

    fn stop_the_world(&self, own_roots: Vec<Value>, attached: bool) -> Option<usize> {
        let mut world = lock(&self.world);
        if world.collecting {
            // Someone else is collecting: contribute our roots instead.
            if attached {
                self.park(world, own_roots);
            } else {
                let epoch = world.epoch;
                while world.epoch == epoch {
                    world = self.resumed.wait(world).unwrap_or_else(|p| p.into_inner());
                }
            }
            return None;
        }

        world.collecting = true;
        self.stop_requested.store(true, Ordering::SeqCst);
        // Mutators may detach while we wait, so recount every time.
        while world.parked < world.mutators - usize::from(attached) {
            world = self
                .parked_changed
                .wait(world)
                .unwrap_or_else(|p| p.into_inner());
        }

        let mut roots = std::mem::take(&mut world.pending_roots);
        roots.extend(own_roots);
        roots.extend(self.static_roots());
        let reclaimed = lock(&self.heap).collect(roots);
        self.allocations.store(0, Ordering::Relaxed);

        world.collecting = false;
        world.epoch += 1;
        self.stop_requested.store(false, Ordering::SeqCst);
        trace!(epoch = world.epoch, reclaimed, "world resumed");
        drop(world);
        self.resumed.notify_all();
        Some(reclaimed)
    }

    fn park(&self, mut world: MutexGuard<'_, WorldState>, roots: Vec<Value>) {
        world.pending_roots.extend(roots);
        world.parked += 1;
        self.parked_changed.notify_all();
        let epoch = world.epoch;
        while world.epoch == epoch {
            world = self.resumed.wait(world).unwrap_or_else(|p| p.into_inner());
        }
        world.parked -= 1;
    }
}

/// An attached call stack. Dropping it detaches.
#[derive(Debug)]
pub struct Mutator {
    heap: Arc<SharedHeap>,
}

impl Mutator {
    pub fn heap(&self) -> &SharedHeap {
        &self.heap
    }

    /// Called between instructions. If another stack is collecting, park
    /// until it finishes, handing over the roots produced by `roots`.
    pub fn safepoint(&self, roots: impl FnOnce() -> Vec<Value>) {
        if !self.heap.stop_requested.load(Ordering::SeqCst) {
            return;
        }
        let world = lock(&self.heap.world);
        if !world.collecting {
            return;
        }
        self.heap.park(world, roots());
    }

    /// Collect now, with this stack's roots. Returns `None` when another
    /// stack's collection ran instead.
    pub fn collect(&self, roots: Vec<Value>) -> Option<usize> {
        self.heap.stop_the_world(roots, true)
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        let mut world = lock(&self.heap.world);
        world.mutators -= 1;
        drop(world);
        self.heap.parked_changed.notify_all();
    }
}
