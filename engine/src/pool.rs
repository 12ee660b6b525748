//! Object pooling shared between the audio interrupt and the
//! maintenance task.
//!
//! The interrupt must be able to obtain and release objects instantly,
//! without blocking and without touching the heap. Each pool keeps four
//! structures with a strict ownership split:
//!
//! * allocation ring — maintenance advances the head, interrupt the tail
//! * allocation list — maintenance only, overflow of constructed objects
//! * free ring — interrupt advances the head, maintenance the tail
//! * free list — interrupt only; reused directly when the pool is
//!   configured list-first
//!
//! Rings always keep the head pointing at an empty slot, so effective
//! capacity is one less than the configured size.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::mutex::UnsafeMutex;

pub const DEFAULT_RING_SIZE: usize = 128;

/// Implemented by everything that lives in an [`ObjectPool`].
pub trait Pooled: Send {
    fn is_pooled(&self) -> bool;
    fn set_pooled(&mut self, pooled: bool);
    /// Restore the object to a clean state before it is handed out again.
    /// Runs on the maintenance task, never in the interrupt.
    fn recycle(&mut self) {}
}

struct Ring<T> {
    slots: Box<[UnsafeMutex<Option<Box<T>>>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl<T> Ring<T> {
    fn new(size: usize) -> Self {
        let slots = (0..size).map(|_| UnsafeMutex::new(None)).collect::<Vec<_>>();
        Ring {
            slots: slots.into_boxed_slice(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    fn occupancy(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= tail {
            head - tail
        } else {
            self.slots.len() - (tail - head)
        }
    }

    /// Consumer side: take the object at the tail, if any.
    fn pop(&self) -> Option<Box<T>> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let obj = self.slots[tail].lock().take();
        let mut next = tail + 1;
        if next >= self.slots.len() {
            next = 0;
        }
        self.tail.store(next, Ordering::Release);
        obj
    }

    /// Producer side: place an object at the head. Returns the object
    /// back when the ring is full.
    fn push(&self, obj: Box<T>) -> Option<Box<T>> {
        let head = self.head.load(Ordering::Relaxed);
        let mut next = head + 1;
        if next >= self.slots.len() {
            next = 0;
        }
        if next == self.tail.load(Ordering::Acquire) {
            return Some(obj);
        }
        *self.slots[head].lock() = Some(obj);
        self.head.store(next, Ordering::Release);
        None
    }
}

pub struct PoolConfig {
    pub name: &'static str,
    pub ring_size: usize,
    /// Occupancy below which the maintenance task is signalled.
    pub warning: usize,
    /// When true, freed objects stay on the interrupt-owned free list and
    /// are reused directly by the next alloc. When false they spill to
    /// the free ring so maintenance can recycle them (large objects).
    pub list_first: bool,
    /// Free-list length at which freed objects spill to the free ring.
    pub spill_threshold: usize,
}

impl PoolConfig {
    pub fn new(name: &'static str) -> Self {
        PoolConfig {
            name,
            ring_size: DEFAULT_RING_SIZE,
            warning: DEFAULT_RING_SIZE / 2,
            list_first: true,
            spill_threshold: DEFAULT_RING_SIZE,
        }
    }
}

pub struct ObjectPool<T: Pooled> {
    name: &'static str,
    alloc_ring: Ring<T>,
    free_ring: Ring<T>,
    // maintenance side only
    alloc_list: UnsafeMutex<Vec<Box<T>>>,
    // interrupt side only
    free_list: UnsafeMutex<Vec<Box<T>>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    list_first: bool,
    spill_threshold: usize,
    warning: usize,
    starved: AtomicUsize,
    maintenance_wanted: AtomicBool,
    notify: Arc<Notify>,
}

impl<T: Pooled> ObjectPool<T> {
    pub fn new<F>(config: PoolConfig, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        // the head must always point at an empty slot
        let ring_size = config.ring_size.max(2) + 1;
        ObjectPool {
            name: config.name,
            alloc_ring: Ring::new(ring_size),
            free_ring: Ring::new(ring_size),
            alloc_list: UnsafeMutex::new(Vec::new()),
            free_list: UnsafeMutex::new(Vec::new()),
            factory: Box::new(factory),
            list_first: config.list_first,
            spill_threshold: config.spill_threshold,
            warning: config.warning.max(1),
            starved: AtomicUsize::new(0),
            maintenance_wanted: AtomicBool::new(false),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Handle the maintenance task waits on.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Times the interrupt had to fall back to the heap factory.
    pub fn starvation_count(&self) -> usize {
        self.starved.load(Ordering::Relaxed)
    }

    pub fn maintenance_wanted(&self) -> bool {
        self.maintenance_wanted.load(Ordering::Relaxed)
    }

    /// Interrupt side. Never blocks; falls back to the heap factory only
    /// when both the free list and the allocation ring are exhausted.
    pub fn alloc(&self) -> Box<T> {
        let mut obj = if self.list_first || !self.free_list.lock().is_empty() {
            self.free_list.lock().pop()
        } else {
            None
        };

        if obj.is_none() {
            obj = self.alloc_ring.pop();
            if obj.is_none() {
                warn!(pool = self.name, "allocation ring empty, falling back to heap");
                self.starved.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut obj = obj.unwrap_or_else(|| Box::new((self.factory)()));
        obj.set_pooled(false);

        if self.alloc_ring.occupancy() < self.warning {
            self.request_maintenance();
        }
        obj
    }

    /// Interrupt side. Double frees are detected via the pooled flag and
    /// the object is discarded rather than corrupting the pool.
    pub fn free(&self, mut obj: Box<T>) {
        if obj.is_pooled() {
            error!(pool = self.name, "attempt to free an object already in the pool");
            return;
        }
        obj.set_pooled(true);

        let list = self.free_list.lock();
        if self.list_first && list.len() < self.spill_threshold {
            list.push(obj);
            return;
        }
        if let Some(back) = self.free_ring.push(obj) {
            debug!(pool = self.name, "free ring overflow, spilling to free list");
            list.push(back);
        }
    }

    /// Maintenance side: recycle the free ring onto the allocation list,
    /// then fill the allocation ring, constructing new objects as needed.
    pub fn maintain(&self) {
        self.maintenance_wanted.store(false, Ordering::Relaxed);

        let mut recycled = 0usize;
        while let Some(mut obj) = self.free_ring.pop() {
            obj.recycle();
            self.alloc_list.lock().push(obj);
            recycled += 1;
        }
        if recycled > 0 {
            debug!(pool = self.name, recycled, "consumed free ring");
        }

        let mut added = 0usize;
        loop {
            let mut obj = match self.alloc_list.lock().pop() {
                Some(obj) => obj,
                None => {
                    let mut fresh = Box::new((self.factory)());
                    fresh.set_pooled(true);
                    fresh
                }
            };
            obj.set_pooled(true);
            if let Some(back) = self.alloc_ring.push(obj) {
                self.alloc_list.lock().push(back);
                break;
            }
            added += 1;
        }
        if added > 0 {
            debug!(pool = self.name, added, "filled allocation ring");
        }
    }

    fn request_maintenance(&self) {
        if !self.maintenance_wanted.swap(true, Ordering::Relaxed) {
            self.notify.notify_one();
        }
    }
}

unsafe impl<T: Pooled> Send for ObjectPool<T> {}
unsafe impl<T: Pooled> Sync for ObjectPool<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Thing {
        pooled: bool,
        value: u32,
    }

    impl Pooled for Thing {
        fn is_pooled(&self) -> bool {
            self.pooled
        }
        fn set_pooled(&mut self, pooled: bool) {
            self.pooled = pooled;
        }
        fn recycle(&mut self) {
            self.value = 0;
        }
    }

    fn pool(list_first: bool) -> ObjectPool<Thing> {
        let mut config = PoolConfig::new("thing");
        config.ring_size = 8;
        config.warning = 4;
        config.list_first = list_first;
        ObjectPool::new(config, || Thing { pooled: false, value: 0 })
    }

    #[test]
    fn alloc_never_returns_pooled_object() {
        let p = pool(true);
        p.maintain();
        for _ in 0..32 {
            let obj = p.alloc();
            assert!(!obj.is_pooled());
            p.free(obj);
        }
    }

    #[test]
    fn primed_pool_does_not_starve() {
        let p = pool(true);
        p.maintain();
        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(p.alloc());
        }
        assert_eq!(p.starvation_count(), 0);
        for obj in held {
            p.free(obj);
        }
        // everything freed to the list is reused before the ring
        for _ in 0..8 {
            let _ = p.alloc();
        }
        assert_eq!(p.starvation_count(), 0);
    }

    #[test]
    fn unprimed_pool_falls_back_to_factory() {
        let p = pool(true);
        let obj = p.alloc();
        assert_eq!(p.starvation_count(), 1);
        assert!(!obj.is_pooled());
    }

    #[test]
    fn double_free_is_detected() {
        let p = pool(true);
        p.maintain();
        let mut obj = p.alloc();
        obj.set_pooled(true);
        p.free(obj);
        // the poisoned object was dropped, the pool still works
        let again = p.alloc();
        assert!(!again.is_pooled());
    }

    #[test]
    fn free_ring_recycles_through_maintenance() {
        let p = pool(false);
        p.maintain();
        let mut obj = p.alloc();
        obj.value = 99;
        p.free(obj);
        p.maintain();
        // recycled objects come back cleared
        let mut seen_recycled = false;
        for _ in 0..16 {
            let obj = p.alloc();
            if obj.value == 0 {
                seen_recycled = true;
            }
            assert!(!obj.is_pooled());
        }
        assert!(seen_recycled);
    }

    #[test]
    fn low_ring_occupancy_requests_maintenance() {
        let p = pool(false);
        p.maintain();
        let mut held = Vec::new();
        for _ in 0..6 {
            held.push(p.alloc());
        }
        assert!(p.maintenance_wanted());
    }

    #[test]
    fn ring_order_is_fifo() {
        let ring: Ring<u32> = Ring::new(5);
        assert!(ring.push(Box::new(1)).is_none());
        assert!(ring.push(Box::new(2)).is_none());
        assert!(ring.push(Box::new(3)).is_none());
        assert!(ring.push(Box::new(4)).is_none());
        // full: head must keep pointing at an empty slot
        assert!(ring.push(Box::new(5)).is_some());
        assert_eq!(*ring.pop().unwrap(), 1);
        assert_eq!(*ring.pop().unwrap(), 2);
        assert!(ring.push(Box::new(5)).is_none());
        assert_eq!(*ring.pop().unwrap(), 3);
        assert_eq!(*ring.pop().unwrap(), 4);
        assert_eq!(*ring.pop().unwrap(), 5);
        assert!(ring.pop().is_none());
    }
}
