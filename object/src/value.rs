const TAG_MASK: u64 = 0b11;
const REF_TAG: u64 = 0b01;

/// A tagged absolute address.
///
/// Encoding:
/// - **Null**:      all bits zero.
/// - **Reference**: `...XXXX01`, a resident pointer (mask low 2 bits; requires
///   4-byte alignment).
///
/// Dynamic-mode constants are handed to generated code in this form, so the
/// low tag bits must survive every copy of the value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    pub const NULL: Self = Self(0);

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    // ── Reference ──────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_ref(self) -> bool {
        self.0 & TAG_MASK == REF_TAG
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        let addr = ptr as usize as u64;
        debug_assert!(addr & TAG_MASK == 0, "pointer not aligned");
        Self(addr | REF_TAG)
    }

    #[inline(always)]
    pub fn from_addr(addr: usize) -> Self {
        if addr == 0 {
            return Self::NULL;
        }
        Self::from_ptr(addr as *const u8)
    }

    #[inline(always)]
    pub const fn ref_bits(self) -> u64 {
        self.0 & !TAG_MASK
    }

    #[inline(always)]
    pub const fn addr(self) -> usize {
        self.ref_bits() as usize
    }

    /// # Safety
    ///
    /// The value must be a reference to a valid, live `T`.
    #[inline(always)]
    pub unsafe fn as_ref<'a, T>(self) -> &'a T {
        debug_assert!(self.is_ref());
        unsafe { &*(self.ref_bits() as usize as *const T) }
    }
}

impl core::fmt::Debug for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_null() {
            write!(f, "Null")
        } else if self.is_ref() {
            write!(f, "Ref(0x{:x})", self.ref_bits())
        } else {
            write!(f, "Raw(0x{:016x})", self.0)
        }
    }
}
