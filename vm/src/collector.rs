use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;

use jolt_object::ObjectRef;
use parking_lot::Mutex;

use crate::error::AllocError;

/// The allocation side of the garbage collector.
///
/// Blocks are zeroed. A non-zero `vtable` is stored at
/// [`jolt_object::VTABLE_OFFSET`]; zero leaves the block untagged (static storage).
pub trait Collector: Send + Sync {
    fn allocate(&self, layout: Layout, vtable: usize) -> Result<NonNull<u8>, AllocError>;

    /// Frees a block the collector has proven unreachable.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Collector::allocate`] on this collector and
    /// must not be used afterwards.
    unsafe fn reclaim(&self, ptr: NonNull<u8>);

    /// Bytes currently allocated.
    fn allocated(&self) -> usize;
}

/// Receives the address of every reference slot while tracing.
pub type RootVisitor<'a> = dyn FnMut(*mut usize) + 'a;

/// Collector backed by the system allocator with a fixed byte budget.
///
/// It never collects on its own; embedders drive reclamation.
pub struct SystemCollector {
    budget: usize,
    blocks: Mutex<SystemCollectorImpl>,
}

struct SystemCollectorImpl {
    live: HashMap<usize, Layout>,
    allocated: usize,
}

impl SystemCollector {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            blocks: Mutex::new(SystemCollectorImpl {
                live: HashMap::new(),
                allocated: 0,
            }),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }
}

impl Collector for SystemCollector {
    fn allocate(&self, layout: Layout, vtable: usize) -> Result<NonNull<u8>, AllocError> {
        let error = AllocError { size: layout.size() };
        let mut blocks = self.blocks.lock();
        if blocks.allocated.saturating_add(layout.size()) > self.budget {
            return Err(error);
        }
        // zero-sized static blocks still get a unique address
        let layout = Layout::from_size_align(layout.size().max(1), layout.align())
            .map_err(|_| error)?;
        // SAFETY: non-zero size
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or(error)?;
        if vtable != 0 {
            // SAFETY: every tagged block starts with an object header
            unsafe { ObjectRef::from_raw(ptr) }.header().set_vtable(vtable);
        }
        blocks.allocated += layout.size();
        blocks.live.insert(ptr.as_ptr() as usize, layout);
        Ok(ptr)
    }

    unsafe fn reclaim(&self, ptr: NonNull<u8>) {
        let mut blocks = self.blocks.lock();
        if let Some(layout) = blocks.live.remove(&(ptr.as_ptr() as usize)) {
            blocks.allocated -= layout.size();
            // SAFETY: allocated above with this layout
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }

    fn allocated(&self) -> usize {
        self.blocks.lock().allocated
    }
}

impl Drop for SystemCollector {
    fn drop(&mut self) {
        let blocks = self.blocks.get_mut();
        for (addr, layout) in blocks.live.drain() {
            // SAFETY: every live entry was allocated with its layout
            unsafe { alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}
