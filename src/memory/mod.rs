/*
 * Memory Management
 *
 * High-level module that ties together:
 *  - Kernel heap for scheduler bookkeeping (heap)
 *  - Task stacks carved out of that heap, with guard words (stack)
 */

pub mod heap;
pub mod stack;

pub use heap::{AllocFailure, AllocFailurePolicy, KernelHeap};
pub use stack::TaskStack;
