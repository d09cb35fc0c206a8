/*
 * Task Stacks
 *
 * Every task runs on a stack carved out of the kernel heap. Stacks grow
 * down, so an overflow first clobbers the lowest word: that word (the guard)
 * is painted with STACK_COLOR when the stack is created and must still hold
 * it every time the task is dispatched.
 *
 * With coloration enabled the whole stack is painted, which also lets us
 * report how deep a task has ever reached (high-water mark).
 *
 *   base                                                     top
 *   [GUARD][color color color ... color][used by the task ...]
 */

use core::alloc::Layout;
use core::ptr::NonNull;

use volatile::VolatilePtr;

use super::heap::KernelHeap;
use crate::config::{MIN_STACK_SIZE, STACK_COLOR};
use crate::error::KernelError;

/// Stack alignment required by every supported ABI
pub const STACK_ALIGN: usize = 16;

const WORD: usize = core::mem::size_of::<u32>();

/// A task stack owned by the scheduler
pub struct TaskStack {
    base: NonNull<u8>,
    size: usize,
    layout: Layout,
    painted: bool,
}

// SAFETY: the stack memory is owned exclusively by the TCB holding this value
unsafe impl Send for TaskStack {}

impl TaskStack {
    /// Allocate a stack of at least `size` bytes from the kernel heap
    pub fn allocate(heap: &mut KernelHeap, size: usize, paint_all: bool) -> Result<Self, KernelError> {
        if size < MIN_STACK_SIZE {
            return Err(KernelError::InvalidArgument);
        }

        let size = size.next_multiple_of(STACK_ALIGN);
        let layout = Layout::from_size_align(size, STACK_ALIGN).map_err(|_| KernelError::InvalidArgument)?;
        let base = heap.allocate(layout)?;

        let stack = Self {
            base,
            size,
            layout,
            painted: paint_all,
        };
        stack.paint();
        Ok(stack)
    }

    /// Give the memory back to the heap it came from
    pub fn release(self, heap: &mut KernelHeap) {
        // SAFETY: allocated from this heap with this layout in allocate()
        unsafe { heap.deallocate(self.base, self.layout) };
    }

    fn paint(&self) {
        if self.painted {
            let words = self.size / WORD;
            let ptr = self.base.as_ptr() as *mut u32;
            for i in 0..words {
                // SAFETY: i < size / 4, inside the allocation
                unsafe { ptr.add(i).write(STACK_COLOR) };
            }
        } else {
            self.guard().write(STACK_COLOR);
        }
    }

    fn guard(&self) -> VolatilePtr<'_, u32> {
        // SAFETY: the base is 16-byte aligned and inside our allocation. The
        // task may overwrite it behind the compiler's back, hence volatile.
        unsafe { VolatilePtr::new(self.base.cast::<u32>()) }
    }

    /// Whether the guard word still holds the stack color
    pub fn guard_intact(&self) -> bool {
        self.guard().read() == STACK_COLOR
    }

    /// Current guard word value (for the overflow report)
    pub fn guard_value(&self) -> u32 {
        self.guard().read()
    }

    /// Deepest extent of stack use in bytes, if the stack was painted
    pub fn high_water_mark(&self) -> Option<usize> {
        if !self.painted {
            return None;
        }

        let words = self.size / WORD;
        let ptr = self.base.as_ptr() as *const u32;
        let mut untouched = 0;
        while untouched < words {
            // SAFETY: untouched < size / 4
            let word = unsafe { ptr.add(untouched).read_volatile() };
            if word != STACK_COLOR {
                break;
            }
            untouched += 1;
        }
        Some(self.size - untouched * WORD)
    }

    /// Lowest address of the stack
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// One past the highest address; initial stack pointer
    pub fn top(&self) -> usize {
        self.base() + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Raw view of the stack memory
    ///
    /// Intended for diagnostics and fault injection; the running task owns
    /// this memory on real hardware.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: we own size bytes at base for as long as self lives
        unsafe { core::slice::from_raw_parts_mut(self.base.as_ptr(), self.size) }
    }
}
