//! Word-granular memcpy for memory-like device regions (Tensix L1, DRAM,
//! ARC CSM).
//!
//! A standard memcpy is unsafe here for two hardware reasons:
//!
//! 1. ARM64 and RISC-V device memory disallows misaligned accesses,
//!    including the paired loads/stores glibc emits when unrolling.
//! 2. A Wormhole GDDR controller erratum corrupts data when a 1-byte write
//!    lands temporally adjacent to a 2-byte write, so no access narrower
//!    than a word may ever reach the device.
//!
//! Both routines therefore do a read-modify-write of the partial word at a
//! misaligned head, copy the aligned middle word by word, and RMW the
//! partial tail. Host-side buffers may be arbitrarily aligned; only the
//! device side is constrained. Do not replace the loops with anything the
//! autovectorizer might widen.

type Copy32 = u32;

const WORD: usize = std::mem::size_of::<Copy32>();

/// Copy `src` to device memory at `dest`.
///
/// # Safety
/// `dest` must be valid for `src.len()` bytes of device memory, rounded out
/// to word boundaries on both ends (the RMW touches the enclosing words).
pub unsafe fn memcpy_to_device(dest: *mut u8, src: &[u8]) {
    let mut num_bytes = src.len();
    let mut sp = src.as_ptr();

    // Align the destination pointer, fixing up the first partial word.
    let dest_misalignment = dest as usize % WORD;
    let mut dp: *mut Copy32;
    if dest_misalignment != 0 {
        dp = dest.sub(dest_misalignment) as *mut Copy32;
        let mut tmp = dp.read_volatile();
        let leading_len = (WORD - dest_misalignment).min(num_bytes);
        std::ptr::copy_nonoverlapping(
            sp,
            (&mut tmp as *mut Copy32 as *mut u8).add(dest_misalignment),
            leading_len,
        );
        num_bytes -= leading_len;
        sp = sp.add(leading_len);
        dp.write_volatile(tmp);
        dp = dp.add(1);
    } else {
        dp = dest as *mut Copy32;
    }

    // Destination-aligned middle.
    let num_words = num_bytes / WORD;
    for _ in 0..num_words {
        let word = (sp as *const Copy32).read_unaligned();
        dp.write_volatile(word);
        dp = dp.add(1);
        sp = sp.add(WORD);
    }

    // Sub-word trailer, again RMW on the destination.
    let trailing_len = num_bytes % WORD;
    if trailing_len != 0 {
        let mut tmp = dp.read_volatile();
        std::ptr::copy_nonoverlapping(sp, &mut tmp as *mut Copy32 as *mut u8, trailing_len);
        dp.write_volatile(tmp);
    }
}

/// Copy device memory at `src` into `dest`.
///
/// # Safety
/// `src` must be valid for `dest.len()` bytes of device memory, rounded out
/// to word boundaries on both ends.
pub unsafe fn memcpy_from_device(dest: &mut [u8], src: *const u8) {
    let mut num_bytes = dest.len();
    let mut dp = dest.as_mut_ptr();

    // Align the source pointer.
    let src_misalignment = src as usize % WORD;
    let mut sp: *const Copy32;
    if src_misalignment != 0 {
        sp = src.sub(src_misalignment) as *const Copy32;
        let tmp = sp.read_volatile();
        sp = sp.add(1);
        let leading_len = (WORD - src_misalignment).min(num_bytes);
        std::ptr::copy_nonoverlapping(
            (&tmp as *const Copy32 as *const u8).add(src_misalignment),
            dp,
            leading_len,
        );
        num_bytes -= leading_len;
        dp = dp.add(leading_len);
    } else {
        sp = src as *const Copy32;
    }

    // Source-aligned middle.
    let num_words = num_bytes / WORD;
    for _ in 0..num_words {
        let word = sp.read_volatile();
        (dp as *mut Copy32).write_unaligned(word);
        sp = sp.add(1);
        dp = dp.add(WORD);
    }

    // Sub-word trailer.
    let trailing_len = num_bytes % WORD;
    if trailing_len != 0 {
        let tmp = sp.read_volatile();
        std::ptr::copy_nonoverlapping(&tmp as *const Copy32 as *const u8, dp, trailing_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // Exercise both directions against a plain memory "device" buffer. The
    // word padding on each side gives the RMW head/tail room to operate.
    fn round_trip(dest_misalignment: usize, payload: &[u8]) -> Vec<u8> {
        let mut device = vec![0u8; payload.len() + 2 * WORD];
        unsafe {
            memcpy_to_device(device.as_mut_ptr().add(dest_misalignment), payload);
        }
        let mut read_back = vec![0u8; payload.len()];
        unsafe {
            memcpy_from_device(&mut read_back, device.as_ptr().add(dest_misalignment));
        }
        read_back
    }

    #[test]
    fn aligned_word_copy() {
        let payload: Vec<u8> = (0..64u8).collect();
        assert_eq!(round_trip(0, &payload), payload);
    }

    #[test]
    fn single_byte_at_every_misalignment() {
        for mis in 0..WORD {
            assert_eq!(round_trip(mis, &[0xA5]), &[0xA5]);
        }
    }

    #[test]
    fn rmw_preserves_neighboring_bytes() {
        let mut device = vec![0xEEu8; 16];
        unsafe { memcpy_to_device(device.as_mut_ptr().add(3), &[1, 2, 3]) };
        assert_eq!(&device[..3], &[0xEE, 0xEE, 0xEE]);
        assert_eq!(&device[3..6], &[1, 2, 3]);
        assert!(device[6..].iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn large_transfer_round_trips() {
        let payload: Vec<u8> = (0..32 * 1024u32).map(|i| (i * 7 + 13) as u8).collect();
        for mis in 0..WORD {
            assert_eq!(round_trip(mis, &payload), payload);
        }
    }

    proptest! {
        #[test]
        fn fidelity_over_misalignments_and_sizes(
            mis in 0usize..WORD,
            payload in proptest::collection::vec(any::<u8>(), 1..4096),
        ) {
            prop_assert_eq!(round_trip(mis, &payload), payload);
        }

        #[test]
        fn misaligned_host_source_is_fine(
            mis in 0usize..WORD,
            host_shift in 1usize..WORD,
            payload in proptest::collection::vec(any::<u8>(), 1..512),
        ) {
            // Shift the host buffer so its pointer is misaligned too.
            let mut shifted = vec![0u8; payload.len() + host_shift];
            shifted[host_shift..].copy_from_slice(&payload);
            let mut device = vec![0u8; payload.len() + 2 * WORD];
            unsafe {
                memcpy_to_device(device.as_mut_ptr().add(mis), &shifted[host_shift..]);
            }
            let mut read_back = vec![0u8; payload.len()];
            unsafe {
                memcpy_from_device(&mut read_back, device.as_ptr().add(mis));
            }
            prop_assert_eq!(read_back, payload);
        }
    }
}
