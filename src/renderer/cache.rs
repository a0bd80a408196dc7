use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::rc::{Rc, Weak};

use crate::error::Result;

/// Creates pooled resources on a cache miss.
pub trait SurfaceAllocator {
    type Key: Clone + Eq + Hash + Debug;
    type Resource;

    fn allocate(&self, key: &Self::Key) -> Result<Self::Resource>;

    fn key_of(resource: &Self::Resource) -> Self::Key;
}

struct PoolState<K, R> {
    free: HashMap<K, Vec<R>>,
    allocations: usize,
    outstanding: usize,
}

impl<K: Clone + Eq + Hash, R> PoolState<K, R> {
    fn release(&mut self, key: K, resource: R) {
        self.free.entry(key).or_default().push(resource);
    }
}

/// Pool of transient GPU surfaces keyed by their exact description.
///
/// [`ResourcePool::pop`] reuses a previously returned resource with an equal
/// key or allocates a new one. The returned [`Pooled`] guard goes back to the
/// free list when dropped, so a slot's previous resource is always returned
/// before the slot is filled again. The pool is single threaded.
pub struct ResourcePool<A: SurfaceAllocator> {
    allocator: A,
    state: Rc<RefCell<PoolState<A::Key, A::Resource>>>,
}

impl<A: SurfaceAllocator> ResourcePool<A> {
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            state: Rc::new(RefCell::new(PoolState {
                free: HashMap::new(),
                allocations: 0,
                outstanding: 0,
            })),
        }
    }

    pub fn pop(&self, key: &A::Key) -> Result<Pooled<A::Key, A::Resource>> {
        let reused = {
            let mut state = self.state.borrow_mut();
            let reused = state.free.get_mut(key).and_then(Vec::pop);
            if reused.is_some() {
                state.outstanding += 1;
            }
            reused
        };

        let resource = match reused {
            Some(resource) => resource,
            None => {
                let resource = self.allocator.allocate(key)?;
                let mut state = self.state.borrow_mut();
                state.allocations += 1;
                state.outstanding += 1;
                log::debug!(
                    "Pool miss for {:?}; {} allocations so far",
                    key,
                    state.allocations
                );
                resource
            }
        };

        Ok(Pooled {
            key: key.clone(),
            resource: Some(resource),
            home: Rc::downgrade(&self.state),
        })
    }

    /// Return a detached resource to the free list. `None` is a no-op.
    pub fn push(&self, resource: Option<A::Resource>) {
        if let Some(resource) = resource {
            let key = A::key_of(&resource);
            self.state.borrow_mut().release(key, resource);
        }
    }

    /// Number of resources created through the allocator.
    pub fn allocations(&self) -> usize {
        self.state.borrow().allocations
    }

    /// Number of guards currently lent out.
    pub fn outstanding(&self) -> usize {
        self.state.borrow().outstanding
    }

    pub fn free_count(&self) -> usize {
        self.state.borrow().free.values().map(Vec::len).sum()
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }
}

/// A resource lent out by a [`ResourcePool`], returned on drop.
pub struct Pooled<K: Clone + Eq + Hash, R> {
    key: K,
    resource: Option<R>,
    home: Weak<RefCell<PoolState<K, R>>>,
}

impl<K: Clone + Eq + Hash, R> Pooled<K, R> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Take the resource out of pool management. It can be handed back later
    /// with [`ResourcePool::push`].
    pub fn detach(mut self) -> R {
        if let Some(home) = self.home.upgrade() {
            home.borrow_mut().outstanding -= 1;
        }
        self.home = Weak::new();
        match self.resource.take() {
            Some(resource) => resource,
            None => unreachable!("pooled resource is only taken once"),
        }
    }
}

impl<K: Clone + Eq + Hash, R> Deref for Pooled<K, R> {
    type Target = R;

    fn deref(&self) -> &R {
        match &self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled resource is only taken on drop or detach"),
        }
    }
}

impl<K: Clone + Eq + Hash, R> DerefMut for Pooled<K, R> {
    fn deref_mut(&mut self) -> &mut R {
        match &mut self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled resource is only taken on drop or detach"),
        }
    }
}

impl<K: Clone + Eq + Hash, R> Drop for Pooled<K, R> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        if let Some(home) = self.home.upgrade() {
            let mut state = home.borrow_mut();
            state.outstanding -= 1;
            state.release(self.key.clone(), resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Key {
        width: u32,
        height: u32,
        format: &'static str,
    }

    #[derive(Debug)]
    struct Fake {
        key: Key,
        id: usize,
    }

    #[derive(Default)]
    struct CountingAllocator {
        created: Cell<usize>,
    }

    impl SurfaceAllocator for CountingAllocator {
        type Key = Key;
        type Resource = Fake;

        fn allocate(&self, key: &Key) -> Result<Fake> {
            let id = self.created.get();
            self.created.set(id + 1);
            Ok(Fake {
                key: key.clone(),
                id,
            })
        }

        fn key_of(resource: &Fake) -> Key {
            resource.key.clone()
        }
    }

    fn key(width: u32, height: u32) -> Key {
        Key {
            width,
            height,
            format: "rgba16f",
        }
    }

    #[test]
    fn push_then_pop_reuses_without_allocating() {
        let pool = ResourcePool::new(CountingAllocator::default());

        let first = pool.pop(&key(640, 480)).expect("allocate");
        let first_id = first.id;
        assert_eq!(pool.allocations(), 1);
        drop(first);

        let again = pool.pop(&key(640, 480)).expect("reuse");
        assert_eq!(again.id, first_id);
        assert_eq!(again.key, key(640, 480));
        assert_eq!(pool.allocations(), 1);
        assert_eq!(pool.allocator().created.get(), 1);
    }

    #[test]
    fn mismatched_key_allocates() {
        let pool = ResourcePool::new(CountingAllocator::default());
        drop(pool.pop(&key(640, 480)).expect("allocate"));

        let other = pool.pop(&key(320, 240)).expect("allocate");
        assert_eq!(other.key, key(320, 240));
        assert_eq!(pool.allocations(), 2);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn outstanding_tracks_guards() {
        let pool = ResourcePool::new(CountingAllocator::default());
        let a = pool.pop(&key(1, 1)).expect("allocate");
        let b = pool.pop(&key(1, 1)).expect("allocate");
        assert_eq!(pool.outstanding(), 2);
        assert_ne!(a.id, b.id);
        drop(a);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.free_count(), 1);
        drop(b);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn detached_resource_can_be_pushed_back() {
        let pool = ResourcePool::new(CountingAllocator::default());
        let raw = pool.pop(&key(8, 8)).expect("allocate").detach();
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.free_count(), 0);

        pool.push(None);
        assert_eq!(pool.free_count(), 0);

        pool.push(Some(raw));
        assert_eq!(pool.free_count(), 1);
        pool.pop(&key(8, 8)).expect("reuse");
        assert_eq!(pool.allocations(), 1);
    }

    #[test]
    fn guard_outliving_pool_is_dropped_quietly() {
        let pool = ResourcePool::new(CountingAllocator::default());
        let guard = pool.pop(&key(2, 2)).expect("allocate");
        drop(pool);
        drop(guard);
    }
}
