mod header;
mod lock;
mod value;

pub use header::{
    ARRAY_ELEMENTS_OFFSET, ARRAY_LENGTH_OFFSET, ArrayHeader, CLASS_OFFSET,
    HEADER_SIZE, LOCK_OFFSET, ObjectHeader, ObjectRef, POINTER_SIZE,
    VTABLE_OFFSET,
};
pub use lock::{
    COUNT_BITS, COUNT_MASK, FAT_BIT, HANDLE_MASK, LockState, LockWord,
    MAX_OWNER, MAX_THIN_COUNT, OWNER_BITS, OWNER_MASK,
};
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::NonNull;

    // ── Value tagging ──────────────────────────────────────────────

    #[test]
    fn null_is_zero_bits() {
        assert_eq!(Value::NULL.raw(), 0);
        assert!(Value::NULL.is_null());
        assert!(!Value::NULL.is_ref());
        assert_eq!(Value::from_addr(0), Value::NULL);
    }

    #[test]
    fn ref_tagging() {
        let dummy: u64 = 0;
        let ptr = &dummy as *const u64;
        let v = Value::from_ptr(ptr);
        assert!(v.is_ref());
        assert!(!v.is_null());
        assert_eq!(v.ref_bits(), ptr as u64);
        assert_eq!(v.addr(), ptr as usize);
        assert_eq!(unsafe { *v.as_ref::<u64>() }, 0);
    }

    // ── Header offsets ─────────────────────────────────────────────

    #[test]
    fn header_offsets_are_word_indexed() {
        assert_eq!(VTABLE_OFFSET, 0);
        assert_eq!(CLASS_OFFSET, POINTER_SIZE);
        assert_eq!(LOCK_OFFSET, 2 * POINTER_SIZE);
        assert_eq!(ARRAY_LENGTH_OFFSET, HEADER_SIZE);
        assert_eq!(ARRAY_ELEMENTS_OFFSET, HEADER_SIZE + POINTER_SIZE);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn header_sizes_on_64_bit() {
        assert_eq!(HEADER_SIZE, 24);
        assert_eq!(ARRAY_ELEMENTS_OFFSET, 32);
    }

    #[test]
    fn header_fields_read_back() {
        let h = ObjectHeader::new(0x1000, 0x2000);
        assert_eq!(h.vtable(), 0x1000);
        assert_eq!(h.class(), 0x2000);
        assert_eq!(h.lock_word(), LockWord::UNLOCKED);
        h.set_class(0x3000);
        assert_eq!(h.class(), 0x3000);
    }

    #[test]
    fn header_raw_offsets_match_accessors() {
        let h = ObjectHeader::new(0xAA00, 0xBB00);
        h.store_lock_word(LockWord::thin(7, 2));
        let base = &h as *const ObjectHeader as *const u8;
        unsafe {
            assert_eq!(*(base.add(VTABLE_OFFSET) as *const usize), 0xAA00);
            assert_eq!(*(base.add(CLASS_OFFSET) as *const usize), 0xBB00);
            assert_eq!(
                *(base.add(LOCK_OFFSET) as *const u32),
                LockWord::thin(7, 2).raw()
            );
        }
    }

    #[test]
    fn lock_word_cas() {
        let h = ObjectHeader::new(0, 0);
        let thin = LockWord::thin(1, 1);
        assert_eq!(
            h.compare_exchange_lock_word(LockWord::UNLOCKED, thin),
            Ok(LockWord::UNLOCKED)
        );
        assert_eq!(
            h.compare_exchange_lock_word(LockWord::UNLOCKED, thin),
            Err(thin)
        );
    }

    #[test]
    fn object_ref_field_pointer() {
        let mut storage = [0u64; 6];
        let obj = unsafe {
            ObjectRef::from_raw(NonNull::new_unchecked(
                storage.as_mut_ptr() as *mut u8
            ))
        };
        assert_eq!(obj.addr(), storage.as_ptr() as usize);
        assert_eq!(obj.field_ptr(HEADER_SIZE) as usize, obj.addr() + HEADER_SIZE);
        obj.header().set_vtable(0x40);
        assert_eq!(storage[0], 0x40);
    }

    // ── Lock word ──────────────────────────────────────────────────

    #[test]
    fn lock_word_layout() {
        assert_eq!(COUNT_MASK, 0x0000_00FF);
        assert_eq!(OWNER_MASK, 0x7FFF_FF00);
        assert_eq!(FAT_BIT, 0x8000_0000);
        assert_eq!(MAX_THIN_COUNT, 255);
        assert_eq!(MAX_OWNER, 0x7F_FFFF);
    }

    #[test]
    fn lock_word_decodes_every_state() {
        assert_eq!(LockWord::UNLOCKED.decode(), LockState::Unlocked);
        assert_eq!(
            LockWord::thin(42, 0).decode(),
            LockState::Biased { owner: 42 }
        );
        assert_eq!(
            LockWord::thin(42, 3).decode(),
            LockState::Thin { owner: 42, count: 3 }
        );
        assert_eq!(
            LockWord::fat(0x1234).decode(),
            LockState::Fat { handle: 0x1234 }
        );
    }

    #[test]
    fn lock_word_encode_inverts_decode() {
        for state in [
            LockState::Unlocked,
            LockState::Biased { owner: MAX_OWNER },
            LockState::Thin { owner: 1, count: MAX_THIN_COUNT },
            LockState::Fat { handle: HANDLE_MASK },
        ] {
            assert_eq!(LockWord::encode(state).decode(), state);
        }
    }

    #[test]
    fn unheld_keeps_owner() {
        let w = LockWord::thin(9, 17).unheld();
        assert_eq!(w.count(), 0);
        assert_eq!(w.owner(), 9);
        assert!(!w.decode().is_held());
    }
}
