use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A thread-safe, reference-counted resource container with read-write locking.
///
/// `MtResource` provides synchronized access to a value of type `T` that can be
/// shared across threads. It uses an `Arc<RwLock<T>>` internally, so cloning is
/// cheap and all clones refer to the same underlying value. The block map, map
/// blocks and active objects are all shared this way between the simulation
/// thread and the emerge workers.
///
/// # Examples
///
/// ```
/// use voxel_server::core::MtResource;
///
/// let counter = MtResource::new(0);
/// *counter.get_mut() += 1;
/// assert_eq!(*counter.get(), 1);
/// ```
///
/// # Performance Considerations
/// - Read guards (`get()`) can be held concurrently by any number of threads
/// - Write guards (`get_mut()`) are exclusive and block other accessors
/// - Long algorithms (lighting, liquid settling) must acquire and release
///   per-block guards as they walk their worklists instead of pinning one
pub struct MtResource<T: Send + Sync> {
    resource: Arc<RwLock<T>>,
}

impl<T: Send + Sync + 'static> MtResource<T> {
    /// Creates a new `MtResource` containing the given value.
    pub fn new(resource: T) -> Self {
        Self {
            resource: Arc::new(RwLock::new(resource)),
        }
    }

    /// Returns a read-only guard for the contained value.
    ///
    /// # Panics
    /// Panics if the lock is poisoned.
    pub fn get(&self) -> RwLockReadGuard<'_, T> {
        self.resource.read().unwrap()
    }

    /// Returns an exclusive guard for the contained value.
    ///
    /// # Panics
    /// Panics if the lock is poisoned.
    pub fn get_mut(&self) -> RwLockWriteGuard<'_, T> {
        self.resource.write().unwrap()
    }

    /// Returns an exclusive guard without blocking, or `None` if the lock is
    /// currently held. Used by sweeps that must never stall the tick on a
    /// contended block.
    pub fn try_get_mut(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.resource.try_write().ok()
    }

    /// Number of strong references to the underlying value.
    ///
    /// The block store uses this as its external reference count: a count of
    /// one means the store itself is the only owner and the block is eligible
    /// for eviction.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.resource)
    }
}

impl<T: Send + Sync> Clone for MtResource<T> {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn shared_mutation_is_visible_to_clones() {
        let counter = MtResource::new(0);
        let counter_clone = counter.clone();

        let handle = thread::spawn(move || {
            *counter_clone.get_mut() += 1;
        });
        handle.join().unwrap();

        assert_eq!(*counter.get(), 1);
    }

    #[test]
    fn ref_count_tracks_clones() {
        let res = MtResource::new(5u32);
        assert_eq!(res.ref_count(), 1);
        let clone = res.clone();
        assert_eq!(res.ref_count(), 2);
        drop(clone);
        assert_eq!(res.ref_count(), 1);
    }

    #[test]
    fn try_get_mut_fails_while_read_locked() {
        let res = MtResource::new(());
        let guard = res.get();
        assert!(res.try_get_mut().is_none());
        drop(guard);
        assert!(res.try_get_mut().is_some());
    }
}
