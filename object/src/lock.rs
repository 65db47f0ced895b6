/// Number of bits holding the thin-lock recursion count.
pub const COUNT_BITS: u32 = 8;
/// Number of bits holding the owning thread id.
pub const OWNER_BITS: u32 = 23;

pub const COUNT_MASK: u32 = (1 << COUNT_BITS) - 1;
pub const OWNER_MASK: u32 = ((1 << OWNER_BITS) - 1) << COUNT_BITS;
pub const FAT_BIT: u32 = 1 << (COUNT_BITS + OWNER_BITS);
pub const HANDLE_MASK: u32 = !FAT_BIT;

/// Highest recursion count a thin lock can hold before inflating.
pub const MAX_THIN_COUNT: u32 = COUNT_MASK;
/// Highest thread id that fits in the owner field.
pub const MAX_OWNER: u32 = (1 << OWNER_BITS) - 1;

const _: () = assert!(COUNT_BITS + OWNER_BITS + 1 == u32::BITS);
const _: () = assert!(COUNT_MASK & OWNER_MASK == 0);
const _: () = assert!((COUNT_MASK | OWNER_MASK | FAT_BIT) == u32::MAX);

/// Decoded view of a [`LockWord`].
///
/// ```text
/// bit  31      : fat flag
/// bits 8‥30    : owner thread id        (thin)
/// bits 0‥7     : recursion count        (thin)
/// bits 0‥30    : monitor table handle   (fat)
/// ```
///
/// A thin word whose count is zero but whose owner field is set is
/// *biased*: reserved for that thread but not held by anyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Biased { owner: u32 },
    Thin { owner: u32, count: u32 },
    Fat { handle: u32 },
}

impl LockState {
    #[inline(always)]
    pub const fn is_held(self) -> bool {
        matches!(self, Self::Thin { .. })
    }
}

/// The raw 32-bit lock word stored in every object header.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct LockWord(u32);

impl LockWord {
    pub const UNLOCKED: Self = Self(0);

    #[inline(always)]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub const fn thin(owner: u32, count: u32) -> Self {
        debug_assert!(owner != 0 && owner <= MAX_OWNER);
        debug_assert!(count <= MAX_THIN_COUNT);
        Self((owner << COUNT_BITS) | count)
    }

    #[inline(always)]
    pub const fn fat(handle: u32) -> Self {
        debug_assert!(handle & FAT_BIT == 0);
        Self(handle | FAT_BIT)
    }

    #[inline(always)]
    pub const fn is_fat(self) -> bool {
        self.0 & FAT_BIT != 0
    }

    /// Recursion count of a thin word; meaningless when fat.
    #[inline(always)]
    pub const fn count(self) -> u32 {
        self.0 & COUNT_MASK
    }

    #[inline(always)]
    pub const fn owner(self) -> u32 {
        (self.0 & OWNER_MASK) >> COUNT_BITS
    }

    #[inline(always)]
    pub const fn handle(self) -> u32 {
        self.0 & HANDLE_MASK
    }

    /// The same word with the recursion count cleared.
    #[inline(always)]
    pub const fn unheld(self) -> Self {
        Self(self.0 & !COUNT_MASK)
    }

    pub const fn decode(self) -> LockState {
        if self.is_fat() {
            return LockState::Fat { handle: self.handle() };
        }
        match (self.owner(), self.count()) {
            (0, _) => LockState::Unlocked,
            (owner, 0) => LockState::Biased { owner },
            (owner, count) => LockState::Thin { owner, count },
        }
    }

    pub const fn encode(state: LockState) -> Self {
        match state {
            LockState::Unlocked => Self::UNLOCKED,
            LockState::Biased { owner } => Self::thin(owner, 0),
            LockState::Thin { owner, count } => Self::thin(owner, count),
            LockState::Fat { handle } => Self::fat(handle),
        }
    }
}

impl core::fmt::Debug for LockWord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "LockWord(0x{:08x} = {:?})", self.0, self.decode())
    }
}
