/*
 * Kernel Heap Allocator
 *
 * Uses linked_list_allocator::Heap on top of a region handed over by the
 * board. Task stacks come from here, so this is where "the scheduler's own
 * bookkeeping could not be allocated" is detected.
 *
 * On failure the heap records a diagnostic snapshot (requested size, total
 * free, largest free block), logs it, and then applies the configured
 * policy: return NoMemory to the caller, or halt.
 */

use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

use linked_list_allocator::Heap;

use crate::error::KernelError;

/// What to do when kernel bookkeeping cannot be allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocFailurePolicy {
    /// Report KernelError::NoMemory to the caller
    ReturnError,

    /// Log the diagnostics and halt the system
    Halt,
}

/// Snapshot taken when an allocation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocFailure {
    /// Bytes that were asked for
    pub requested: usize,

    /// Bytes free in the heap at the time
    pub total_free: usize,

    /// Largest single block that could still have been allocated
    pub largest_free: usize,
}

impl fmt::Display for AllocFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requested {} bytes, {} free, largest block {}",
            self.requested, self.total_free, self.largest_free
        )
    }
}

/// Heap backing task stacks and other scheduler allocations
pub struct KernelHeap {
    heap: Heap,
    policy: AllocFailurePolicy,
    last_failure: Option<AllocFailure>,
    failures: usize,
}

// SAFETY: the heap owns its region exclusively; all access goes through &mut self
unsafe impl Send for KernelHeap {}

impl KernelHeap {
    /// Create a heap over `size` bytes starting at `start`
    ///
    /// # Safety
    /// The region must be valid, writable, unused by anything else, and live
    /// for as long as the heap.
    pub unsafe fn new(start: *mut u8, size: usize, policy: AllocFailurePolicy) -> Self {
        log::info!("Kernel heap: {:#x} - {:#x} ({} KiB)", start as usize, start as usize + size, size / 1024);
        Self {
            // SAFETY: forwarded from the caller's contract
            heap: unsafe { Heap::new(start, size) },
            policy,
            last_failure: None,
            failures: 0,
        }
    }

    /// Create a heap over a region the caller gives up for good
    pub fn from_static(region: &'static mut [u8], policy: AllocFailurePolicy) -> Self {
        // SAFETY: the 'static exclusive borrow hands the region over permanently
        unsafe { Self::new(region.as_mut_ptr(), region.len(), policy) }
    }

    pub fn policy(&self) -> AllocFailurePolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: AllocFailurePolicy) {
        self.policy = policy;
    }

    /// Allocate, applying the failure policy on exhaustion
    pub fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, KernelError> {
        match self.heap.allocate_first_fit(layout) {
            Ok(ptr) => Ok(ptr),
            Err(()) => Err(self.allocation_failed(layout.size())),
        }
    }

    /// Return memory obtained from allocate()
    ///
    /// # Safety
    /// `ptr` must come from this heap's allocate() with the same layout and
    /// must not be used afterwards.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { self.heap.deallocate(ptr, layout) }
    }

    /// Record a failed allocation of `requested` bytes and apply the policy
    ///
    /// Also used by the fixed pools (TCBs, watchdogs) when they run dry, so
    /// every kind of bookkeeping exhaustion goes through the same policy.
    pub fn allocation_failed(&mut self, requested: usize) -> KernelError {
        let failure = AllocFailure {
            requested,
            total_free: self.heap.free(),
            largest_free: self.largest_free_block(),
        };
        self.last_failure = Some(failure);
        self.failures += 1;

        match self.policy {
            AllocFailurePolicy::ReturnError => {
                log::warn!("kernel heap: allocation failed: {}", failure);
                KernelError::NoMemory(failure)
            }
            AllocFailurePolicy::Halt => {
                log::error!("kernel heap: allocation failed: {}", failure);
                panic!("kernel allocation failure: {}", failure);
            }
        }
    }

    /// Largest block that can currently be allocated
    ///
    /// The allocator does not track this, so it is probed by bisection. Only
    /// used on the failure path and for diagnostics.
    pub fn largest_free_block(&mut self) -> usize {
        let align = core::mem::align_of::<usize>();
        let mut low = 0usize;
        let mut high = self.heap.free();

        while low < high {
            let mid = low + (high - low + 1) / 2;
            let Ok(layout) = Layout::from_size_align(mid, align) else {
                high = mid - 1;
                continue;
            };
            match self.heap.allocate_first_fit(layout) {
                Ok(ptr) => {
                    // SAFETY: just allocated with this exact layout
                    unsafe { self.heap.deallocate(ptr, layout) };
                    low = mid;
                }
                Err(()) => high = mid - 1,
            }
        }
        low
    }

    pub fn last_failure(&self) -> Option<AllocFailure> {
        self.last_failure
    }

    pub fn failure_count(&self) -> usize {
        self.failures
    }

    pub fn size(&self) -> usize {
        self.heap.size()
    }

    pub fn used(&self) -> usize {
        self.heap.used()
    }

    pub fn free(&self) -> usize {
        self.heap.free()
    }
}

#[cfg(test)]
pub(crate) fn test_heap(size: usize, policy: AllocFailurePolicy) -> KernelHeap {
    // Back the region with u64s so it starts word aligned
    let words: &'static mut [u64] = alloc::boxed::Box::leak(alloc::vec![0u64; size / 8].into_boxed_slice());
    let region = unsafe { core::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, size) };
    KernelHeap::from_static(region, policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_round_trip() {
        let mut heap = test_heap(4096, AllocFailurePolicy::ReturnError);
        let layout = Layout::from_size_align(512, 16).unwrap();
        let ptr = heap.allocate(layout).unwrap();
        assert!(heap.used() >= 512);
        unsafe { heap.deallocate(ptr, layout) };
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn failure_records_diagnostics() {
        let mut heap = test_heap(4096, AllocFailurePolicy::ReturnError);
        let big = Layout::from_size_align(8192, 16).unwrap();
        let err = heap.allocate(big).unwrap_err();

        let KernelError::NoMemory(failure) = err else {
            panic!("expected NoMemory, got {:?}", err);
        };
        assert_eq!(failure.requested, 8192);
        assert_eq!(failure.total_free, heap.free());
        assert!(failure.largest_free <= failure.total_free);
        assert!(failure.largest_free > 2048);
        assert_eq!(heap.last_failure(), Some(failure));
        assert_eq!(heap.failure_count(), 1);
    }

    #[test]
    fn largest_block_sees_fragmentation() {
        let mut heap = test_heap(4096, AllocFailurePolicy::ReturnError);
        let layout = Layout::from_size_align(1024, 16).unwrap();
        let a = heap.allocate(layout).unwrap();
        let _b = heap.allocate(layout).unwrap();
        let c = heap.allocate(layout).unwrap();
        let rest = Layout::from_size_align(heap.largest_free_block(), 8).unwrap();
        let _filler = heap.allocate(rest).unwrap();
        unsafe {
            heap.deallocate(a, layout);
            heap.deallocate(c, layout);
        }
        // Two separate 1 KiB holes: free is ~2 KiB, no single 2 KiB block exists
        assert!(heap.free() >= 2048);
        assert!(heap.largest_free_block() < 2048);
    }

    #[test]
    #[should_panic(expected = "kernel allocation failure")]
    fn halt_policy_is_fatal() {
        let mut heap = test_heap(1024, AllocFailurePolicy::Halt);
        let _ = heap.allocate(Layout::from_size_align(4096, 16).unwrap());
    }
}
