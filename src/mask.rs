//! WebSocket frame masking utilities
//!
//! Supports multiple RNG backends via feature flags:
//! - `fastrand`: fast PRNG (default)
//! - `getrandom`: cryptographically secure RNG
//! - `rand_rng`: alternative PRNG (prefer if `rand` is already in dependency tree)

/// Apply a WebSocket mask in place
///
/// XORs the data with the repeating 4-byte key. The transform is its own
/// inverse, so the same call masks and unmasks.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    if data.is_empty() {
        return;
    }

    // Process 8 bytes at a time using u64
    let mask_u64 = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ mask_u64;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    // Chunks are multiples of 8, so the tail starts on mask index 0
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Apply mask with offset
///
/// When unmasking across multiple reads, the offset determines which
/// byte of the mask to start with.
#[inline]
pub fn apply_mask_offset(data: &mut [u8], mask: [u8; 4], offset: usize) {
    if offset & 3 == 0 {
        apply_mask(data, mask);
        return;
    }

    let offset = offset & 3;
    let rotated_mask = [
        mask[offset],
        mask[(offset + 1) & 3],
        mask[(offset + 2) & 3],
        mask[(offset + 3) & 3],
    ];
    apply_mask(data, rotated_mask);
}

/// Generate a random mask for WebSocket client frames.
///
/// If multiple features are enabled, priority is: getrandom > rand_rng > fastrand.
/// If no RNG feature is enabled, this function will fail to compile.
#[inline]
pub fn generate_mask() -> [u8; 4] {
    generate_mask_inner()
}

#[cfg(feature = "getrandom")]
#[inline]
fn generate_mask_inner() -> [u8; 4] {
    let mut buf = [0u8; 4];
    if getrandom::getrandom(&mut buf).is_err() {
        // An all-zero key is still a valid mask; the entropy failure is logged
        tracing::warn!("getrandom failed, falling back to a zero masking key");
    }
    buf
}

#[cfg(all(feature = "rand_rng", not(feature = "getrandom")))]
#[inline]
fn generate_mask_inner() -> [u8; 4] {
    use rand::Rng;
    rand::rng().random()
}

#[cfg(all(
    feature = "fastrand",
    not(feature = "getrandom"),
    not(feature = "rand_rng")
))]
#[inline]
fn generate_mask_inner() -> [u8; 4] {
    fastrand::u32(..).to_ne_bytes()
}

#[cfg(not(any(feature = "fastrand", feature = "getrandom", feature = "rand_rng")))]
fn generate_mask_inner() -> [u8; 4] {
    compile_error!("At least one RNG feature must be enabled: fastrand, getrandom, or rand_rng");
}
