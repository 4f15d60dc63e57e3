//! Object pools (§4.6): reusable buffers with an allocation counter, a
//! spinlock-protected free list, and a configured low-water mark that the
//! loop's 1 s timer trims down to.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A pool of `T`, created via `factory` on miss. `get`/`put` are O(1).
pub struct ObjectPool<T> {
    free: Mutex<Vec<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    allocations: AtomicU64,
    low_water_mark: usize,
}

impl<T> ObjectPool<T> {
    pub fn new(low_water_mark: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        ObjectPool {
            free: Mutex::new(Vec::with_capacity(low_water_mark)),
            factory: Box::new(factory),
            allocations: AtomicU64::new(0),
            low_water_mark,
        }
    }

    pub fn get(&self) -> T {
        if let Some(item) = self.free.lock().pop() {
            item
        } else {
            self.allocations.fetch_add(1, Ordering::Relaxed);
            (self.factory)()
        }
    }

    pub fn put(&self, item: T) {
        self.free.lock().push(item);
    }

    /// Trims the free list down to `low_water_mark`, called from the
    /// loop's 1 s timer (§4.6 "trim object pools to low-water marks").
    pub fn trim(&self) {
        let mut free = self.free.lock();
        if free.len() > self.low_water_mark {
            free.truncate(self.low_water_mark);
        }
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn free_len(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_items_without_new_allocations() {
        let pool: ObjectPool<Vec<u8>> = ObjectPool::new(4, || Vec::with_capacity(64));
        let a = pool.get();
        assert_eq!(pool.allocations(), 1);
        pool.put(a);
        let _b = pool.get();
        assert_eq!(pool.allocations(), 1);
    }

    #[test]
    fn trim_respects_low_water_mark() {
        let pool: ObjectPool<u32> = ObjectPool::new(2, || 0);
        for i in 0..10 {
            pool.put(i);
        }
        pool.trim();
        assert_eq!(pool.free_len(), 2);
    }
}
