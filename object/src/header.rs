use core::mem::offset_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::LockWord;

pub const POINTER_SIZE: usize = size_of::<usize>();

/// The header at the start of every managed object.
///
/// ```text
/// word 0:  vtable pointer
/// word 1:  class pointer
/// word 2:  lock word (u32), rest padding
/// ```
///
/// Generated code addresses these fields through the `*_OFFSET` constants
/// below; they are identical for every class.
#[repr(C)]
pub struct ObjectHeader {
    vtable: AtomicUsize,
    class: AtomicUsize,
    lock: AtomicU32,
}

/// Header of an array object; elements follow at [`ARRAY_ELEMENTS_OFFSET`].
#[repr(C)]
pub struct ArrayHeader {
    pub header: ObjectHeader,
    length: AtomicUsize,
}

pub const VTABLE_OFFSET: usize = offset_of!(ObjectHeader, vtable);
pub const CLASS_OFFSET: usize = offset_of!(ObjectHeader, class);
pub const LOCK_OFFSET: usize = offset_of!(ObjectHeader, lock);
pub const HEADER_SIZE: usize = size_of::<ObjectHeader>();
pub const ARRAY_LENGTH_OFFSET: usize = offset_of!(ArrayHeader, length);
pub const ARRAY_ELEMENTS_OFFSET: usize = size_of::<ArrayHeader>();

const _: () = assert!(POINTER_SIZE == 4 || POINTER_SIZE == 8);
const _: () = assert!(VTABLE_OFFSET == 0);
const _: () = assert!(CLASS_OFFSET == POINTER_SIZE);
const _: () = assert!(LOCK_OFFSET == 2 * POINTER_SIZE);
const _: () = assert!(ARRAY_LENGTH_OFFSET == HEADER_SIZE);
const _: () = assert!(ARRAY_ELEMENTS_OFFSET % 8 == 0);

impl ObjectHeader {
    pub const fn new(vtable: usize, class: usize) -> Self {
        Self {
            vtable: AtomicUsize::new(vtable),
            class: AtomicUsize::new(class),
            lock: AtomicU32::new(0),
        }
    }

    // ── vtable / class ─────────────────────────────────────────────

    #[inline(always)]
    pub fn vtable(&self) -> usize {
        self.vtable.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_vtable(&self, vtable: usize) {
        self.vtable.store(vtable, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn class(&self) -> usize {
        self.class.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_class(&self, class: usize) {
        self.class.store(class, Ordering::Relaxed);
    }

    // ── lock word ──────────────────────────────────────────────────

    #[inline(always)]
    pub fn lock_word(&self) -> LockWord {
        LockWord::from_raw(self.lock.load(Ordering::Acquire))
    }

    /// Plain store; only legal for the current owner or for publishing a
    /// fat word.
    #[inline(always)]
    pub fn store_lock_word(&self, word: LockWord) {
        self.lock.store(word.raw(), Ordering::Release);
    }

    /// Returns `Ok(previous)` on success, `Err(actual)` on failure.
    #[inline(always)]
    pub fn compare_exchange_lock_word(
        &self,
        current: LockWord,
        new: LockWord,
    ) -> Result<LockWord, LockWord> {
        self.lock
            .compare_exchange(
                current.raw(),
                new.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(LockWord::from_raw)
            .map_err(LockWord::from_raw)
    }
}

impl ArrayHeader {
    #[inline(always)]
    pub fn length(&self) -> usize {
        self.length.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_length(&self, length: usize) {
        self.length.store(length, Ordering::Relaxed);
    }
}

impl core::fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("vtable", &format_args!("0x{:x}", self.vtable()))
            .field("class", &format_args!("0x{:x}", self.class()))
            .field("lock", &self.lock_word())
            .finish()
    }
}

/// An untyped pointer to a live managed object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectRef(NonNull<ObjectHeader>);

// SAFETY: the header is only mutated through atomics; field access goes
// through raw pointers under the caller's own synchronization.
unsafe impl Send for ObjectRef {}
// SAFETY: see above
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    /// # Safety
    ///
    /// `ptr` must point to an initialized [`ObjectHeader`] that outlives
    /// every use of the returned reference.
    #[inline(always)]
    pub unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
        Self(ptr.cast())
    }

    /// # Safety
    ///
    /// Same as [`ObjectRef::from_raw`]; `addr` must be non-zero.
    #[inline(always)]
    pub unsafe fn from_addr(addr: usize) -> Self {
        debug_assert!(addr != 0);
        unsafe { Self(NonNull::new_unchecked(addr as *mut ObjectHeader)) }
    }

    #[inline(always)]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr().cast()
    }

    #[inline(always)]
    pub fn header<'a>(self) -> &'a ObjectHeader {
        // SAFETY: construction guarantees a live header
        unsafe { self.0.as_ref() }
    }

    /// # Safety
    ///
    /// The object must have been allocated as an array.
    #[inline(always)]
    pub unsafe fn array_header<'a>(self) -> &'a ArrayHeader {
        unsafe { &*(self.0.as_ptr() as *const ArrayHeader) }
    }

    /// Address of the byte at `offset` from the object start.
    #[inline(always)]
    pub fn field_ptr(self, offset: usize) -> *mut u8 {
        self.as_ptr().wrapping_add(offset)
    }
}

impl core::fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ObjectRef(0x{:x})", self.addr())
    }
}
