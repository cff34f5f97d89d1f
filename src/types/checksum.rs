#![forbid(unsafe_code)]

use super::object::header::CKSUM;

const MOD: u64 = 0xffff_ffff;

/// Streaming checksum over little-endian 32-bit words.
pub trait Checksum {
    /// Clears any accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes into the checksum.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed so far.
    fn finalize(&self) -> u64;
}

/// Fletcher-64 as used by APFS object headers.
///
/// Trailing bytes that do not fill a whole word are zero padded on `finalize`.
#[derive(Default, Clone)]
pub struct Fletcher64 {
    sum1: u64,
    sum2: u64,
    pending: [u8; 4],
    pending_len: usize,
}

impl Fletcher64 {
    fn push_word(&mut self, word: u32) {
        self.sum1 = (self.sum1 + u64::from(word)) % MOD;
        self.sum2 = (self.sum2 + self.sum1) % MOD;
    }
}

impl Checksum for Fletcher64 {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn update(&mut self, mut bytes: &[u8]) {
        if self.pending_len > 0 {
            let take = (4 - self.pending_len).min(bytes.len());
            self.pending[self.pending_len..self.pending_len + take]
                .copy_from_slice(&bytes[..take]);
            self.pending_len += take;
            bytes = &bytes[take..];
            if self.pending_len < 4 {
                return;
            }
            let word = u32::from_le_bytes(self.pending);
            self.push_word(word);
            self.pending_len = 0;
        }
        let mut chunks = bytes.chunks_exact(4);
        for chunk in &mut chunks {
            self.push_word(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        let rest = chunks.remainder();
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    fn finalize(&self) -> u64 {
        let mut state = self.clone();
        if state.pending_len > 0 {
            let mut word = [0u8; 4];
            word[..state.pending_len].copy_from_slice(&state.pending[..state.pending_len]);
            state.push_word(u32::from_le_bytes(word));
        }
        let c1 = MOD - ((state.sum1 + state.sum2) % MOD);
        let c2 = MOD - ((state.sum1 + c1) % MOD);
        (c2 << 32) | c1
    }
}

/// Computes the object checksum of `block`, skipping the stored checksum field.
pub fn object_checksum(block: &[u8]) -> u64 {
    let mut hasher = Fletcher64::default();
    hasher.update(block.get(CKSUM.end..).unwrap_or(&[]));
    hasher.finalize()
}

/// Returns true when the checksum stored in the first eight bytes matches the block.
///
/// All-zero and all-ones checksums never verify; they mark unwritten or wiped blocks.
pub fn verify_object(block: &[u8]) -> bool {
    let Some(stored) = block.get(CKSUM) else {
        return false;
    };
    let mut raw = [0u8; 8];
    raw.copy_from_slice(stored);
    let stored = u64::from_le_bytes(raw);
    if stored == 0 || stored == u64::MAX {
        return false;
    }
    stored == object_checksum(block)
}

/// Stores the object checksum of `block` into its first eight bytes.
pub fn seal_object(block: &mut [u8]) {
    if block.len() < CKSUM.end {
        return;
    }
    let cksum = object_checksum(block);
    block[CKSUM].copy_from_slice(&cksum.to_le_bytes());
}
