//! Frame masking.
//!
//! Clients XOR every payload byte with `key[i % 4]`. Masking twice with the
//! same key is the identity, so the same routine serves both directions.

/// Generate a random masking key.
///
/// `rand::random` draws from the thread RNG, which is cryptographically
/// secure as RFC 6455 requires for masking keys.
#[inline]
pub fn generate() -> [u8; 4] {
    rand::random()
}

/// XOR the buffer with the masking key, four bytes at a time.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let mask_word = u32::from_ne_bytes(mask);

    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in chunks.by_ref() {
        let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ mask_word;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }

    for (byte, key) in chunks.into_remainder().iter_mut().zip(mask) {
        *byte ^= key;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mask_is_involution() {
        for len in [0usize, 1, 3, 4, 5, 31, 64, 1023] {
            let original: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            let key = generate();

            let mut buf = original.clone();
            apply_mask(&mut buf, key);
            if len > 0 && key != [0; 4] {
                assert_ne!(buf, original);
            }
            apply_mask(&mut buf, key);
            assert_eq!(buf, original);
        }
    }

    #[test]
    fn mask_matches_byte_at_a_time() {
        let key = [0xA1, 0x07, 0x5C, 0xFF];
        let data: Vec<u8> = (0..133).map(|i| i as u8).collect();

        let mut fast = data.clone();
        apply_mask(&mut fast, key);

        let slow: Vec<u8> = data.iter().enumerate().map(|(i, b)| b ^ key[i & 3]).collect();
        assert_eq!(fast, slow);
    }
}
