//! Kernel heap allocator
//!
//! First-fit free-list allocator behind an `IrqLock`, so allocation is
//! legal while interrupts are disabled and from any core. The back
//! pointer to the block header is stashed one word below the returned
//! allocation so `dealloc` can find it regardless of alignment gap.
//!
//! Host tests use the standard library allocator; the global hookup is
//! compiled out there.

use ::core::alloc::{GlobalAlloc, Layout};

use crate::sync::IrqLock;

/// Smallest carved block, large enough for a free-list header.
const MIN_BLOCK: usize = 32;

#[repr(C)]
struct FreeBlock {
    size: usize,
    next: Option<*mut FreeBlock>,
}

struct HeapInner {
    free_list: Option<*mut FreeBlock>,
    start: usize,
    end: usize,
}

unsafe impl Send for HeapInner {}

/// The kernel heap.
pub struct Heap {
    inner: IrqLock<HeapInner>,
}

impl Heap {
    pub const fn new() -> Self {
        Self {
            inner: IrqLock::new(HeapInner {
                free_list: None,
                start: 0,
                end: 0,
            }),
        }
    }

    /// Hand the heap its backing range.
    ///
    /// # Safety
    /// The range must be unused, writable memory that stays mapped in
    /// every page table (it lives in the shared kernel half).
    pub unsafe fn init(&self, start: usize, size: usize) {
        let mut inner = self.inner.lock();
        inner.start = start;
        inner.end = start + size;
        let head = start as *mut FreeBlock;
        unsafe {
            (*head).size = size;
            (*head).next = None;
        }
        inner.free_list = Some(head);
    }

    fn alloc_inner(&self, layout: Layout) -> *mut u8 {
        let align = layout.align().max(::core::mem::size_of::<usize>());
        let mut inner = self.inner.lock();

        let mut prev: Option<*mut FreeBlock> = None;
        let mut cursor = inner.free_list;

        while let Some(block) = cursor {
            let block_start = block as usize;
            let block_size = unsafe { (*block).size };

            // Keep the size word intact and leave room for the back
            // pointer, then align up
            let payload =
                (block_start + ::core::mem::size_of::<FreeBlock>()).next_multiple_of(align);
            let needed_end = payload + layout.size();
            let block_end = block_start + block_size;

            if needed_end <= block_end {
                let next = unsafe { (*block).next };

                // Split off the tail when it can hold another block
                let remainder = block_end - needed_end;
                let replacement = if remainder >= MIN_BLOCK {
                    let tail = needed_end.next_multiple_of(::core::mem::align_of::<FreeBlock>());
                    if block_end - tail >= MIN_BLOCK {
                        let tail_block = tail as *mut FreeBlock;
                        unsafe {
                            (*tail_block).size = block_end - tail;
                            (*tail_block).next = next;
                        }
                        unsafe {
                            (*block).size = tail - block_start;
                        }
                        Some(tail_block)
                    } else {
                        next
                    }
                } else {
                    next
                };

                match prev {
                    Some(p) => unsafe { (*p).next = replacement },
                    None => inner.free_list = replacement,
                }

                // Back pointer to the block header
                unsafe {
                    ((payload - ::core::mem::size_of::<usize>()) as *mut usize).write(block_start);
                }
                return payload as *mut u8;
            }

            prev = cursor;
            cursor = unsafe { (*block).next };
        }

        ::core::ptr::null_mut()
    }

    fn dealloc_inner(&self, ptr: *mut u8) {
        let payload = ptr as usize;
        let block_start =
            unsafe { ((payload - ::core::mem::size_of::<usize>()) as *const usize).read() };
        let block = block_start as *mut FreeBlock;

        let mut inner = self.inner.lock();
        // Size was preserved in the header across the allocation
        unsafe {
            (*block).next = inner.free_list;
        }
        inner.free_list = Some(block);
    }
}

unsafe impl GlobalAlloc for Heap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc_inner(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.dealloc_inner(ptr)
    }
}
