use crate::{hex_encode_u64, CanonicalEncoder};

/// Types that hash via the canonical encoding.
///
/// Implementors only describe how to serialize themselves into the
/// encoder; the digest and hex rendering are shared.
pub trait TurboHash {
    fn encode(&self, enc: &mut CanonicalEncoder);

    fn hash(&self) -> String {
        let mut enc = CanonicalEncoder::new();
        self.encode(&mut enc);

        let out = xxhash_rust::xxh64::xxh64(enc.as_bytes(), 0);

        // Encode into a stack buffer and create the String from that,
        // avoiding the intermediate Vec allocation hex::encode performs.
        let mut hex_buf = [0u8; 16];
        hex_encode_u64(out, &mut hex_buf).to_owned()
    }
}
