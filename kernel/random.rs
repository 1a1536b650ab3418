//! Kernel pseudo-random source
//!
//! An xorshift generator seeded from the cycle counter at boot. It
//! backs exec's address-space randomization and the entropy syscall;
//! it is not a cryptographic source and the capability gate on
//! `getrandom` is the only thing standing between it and userland.

use ::core::sync::atomic::{AtomicU64, Ordering};

static STATE: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

/// Mix boot-time entropy into the generator.
pub fn seed(value: u64) {
    STATE.fetch_xor(value | 1, Ordering::Relaxed);
}

/// Next 64 pseudo-random bits.
pub fn next_u64() -> u64 {
    let mut x = STATE.load(Ordering::Relaxed);
    loop {
        let mut n = x;
        n ^= n << 13;
        n ^= n >> 7;
        n ^= n << 17;
        match STATE.compare_exchange_weak(x, n, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return n,
            Err(seen) => x = seen,
        }
    }
}

/// Fill a buffer with pseudo-random bytes.
pub fn fill(buf: &mut [u8]) {
    for chunk in buf.chunks_mut(8) {
        let bytes = next_u64().to_ne_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
}

/// A fresh load base for a position-independent executable: somewhere
/// in the lower gigabytes, page-aligned.
pub fn aslr_base() -> u64 {
    const ASLR_FLOOR: u64 = 0x0000_2000_0000;
    const ASLR_SPAN: u64 = 0x0000_4000_0000;
    ASLR_FLOOR + (next_u64() % ASLR_SPAN) & !0xFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_moves() {
        let a = next_u64();
        let b = next_u64();
        assert_ne!(a, b);
    }

    #[test]
    fn aslr_bases_are_aligned_and_bounded() {
        for _ in 0..64 {
            let base = aslr_base();
            assert_eq!(base % 4096, 0);
            assert!(base < 0x0000_8000_0000_0000);
        }
    }
}
