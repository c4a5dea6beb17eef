//! Content signatures over byte ranges.
//!
//! Signatures identify filters, blobs, specs, object URIs and attribute
//! values, and they are persisted in the result cache, so the digest must be
//! stable across builds: a 128-bit MurmurHash3-x64 computed over the ordered
//! concatenation of the input ranges. The implementation self-checks against
//! the published verification vector before the first digest is produced.

use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

pub const SIG_SIZE: usize = 16;

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

/// Fixed-width content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Signature(pub [u8; SIG_SIZE]);

impl Signature {
    /// Digest an ordered sequence of byte ranges.
    pub fn hash(ranges: &[&[u8]]) -> Self {
        ensure_verified();
        let mut hasher = SigHasher::with_seed(0);
        for range in ranges {
            hasher.update(range);
        }
        Signature(hasher.finish())
    }

    pub fn hash_bytes(data: &[u8]) -> Self {
        Self::hash(&[data])
    }

    pub fn hash_str(s: &str) -> Self {
        Self::hash(&[s.as_bytes()])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// 32 lowercase hex chars, no separators. Used for database blobs and
    /// log lines.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(SIG_SIZE * 2);
        for b in self.0 {
            out.push(nibble(b >> 4));
            out.push(nibble(b & 0xf));
        }
        out
    }

    /// Colon-separated byte pairs, the rendering used in persistent
    /// filenames.
    pub fn to_filename(&self) -> String {
        let mut out = String::with_capacity(SIG_SIZE * 3 - 1);
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(':');
            }
            out.push(nibble(b >> 4));
            out.push(nibble(b & 0xf));
        }
        out
    }

    /// Parse the plain 32-hex-char form; colons are tolerated.
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; SIG_SIZE];
        let mut i = 0;
        let mut hi: Option<u8> = None;
        for c in s.chars() {
            if c == ':' {
                continue;
            }
            let v = c.to_digit(16)? as u8;
            match hi.take() {
                None => hi = Some(v),
                Some(h) => {
                    if i >= SIG_SIZE {
                        return None;
                    }
                    bytes[i] = (h << 4) | v;
                    i += 1;
                }
            }
        }
        if i == SIG_SIZE && hi.is_none() {
            Some(Signature(bytes))
        } else {
            None
        }
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn nibble(v: u8) -> char {
    char::from_digit(v as u32, 16).unwrap_or('0')
}

/// Streaming MurmurHash3-x64-128.
///
/// Equivalent to hashing the concatenation of every `update` call; the
/// 16-byte block buffer carries partial blocks between calls.
pub struct SigHasher {
    h1: u64,
    h2: u64,
    buf: [u8; 16],
    buf_len: usize,
    total: u64,
}

impl SigHasher {
    pub fn with_seed(seed: u32) -> Self {
        SigHasher {
            h1: seed as u64,
            h2: seed as u64,
            buf: [0; 16],
            buf_len: 0,
            total: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.total += data.len() as u64;

        if self.buf_len > 0 {
            let need = 16 - self.buf_len;
            let take = need.min(data.len());
            self.buf[self.buf_len..self.buf_len + take].copy_from_slice(&data[..take]);
            self.buf_len += take;
            data = &data[take..];
            if self.buf_len < 16 {
                return;
            }
            let block = self.buf;
            self.mix_block(&block);
            self.buf_len = 0;
        }

        while data.len() >= 16 {
            let (block, rest) = data.split_at(16);
            let mut b = [0u8; 16];
            b.copy_from_slice(block);
            self.mix_block(&b);
            data = rest;
        }

        if !data.is_empty() {
            self.buf[..data.len()].copy_from_slice(data);
            self.buf_len = data.len();
        }
    }

    fn mix_block(&mut self, block: &[u8; 16]) {
        let mut k1 = u64::from_le_bytes(block[0..8].try_into().unwrap());
        let mut k2 = u64::from_le_bytes(block[8..16].try_into().unwrap());

        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        self.h1 ^= k1;

        self.h1 = self.h1.rotate_left(27);
        self.h1 = self.h1.wrapping_add(self.h2);
        self.h1 = self.h1.wrapping_mul(5).wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        self.h2 ^= k2;

        self.h2 = self.h2.rotate_left(31);
        self.h2 = self.h2.wrapping_add(self.h1);
        self.h2 = self.h2.wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    pub fn finish(mut self) -> [u8; 16] {
        let tail = &self.buf[..self.buf_len];
        let mut k1: u64 = 0;
        let mut k2: u64 = 0;

        if tail.len() > 8 {
            for (i, &b) in tail[8..].iter().enumerate() {
                k2 ^= (b as u64) << (8 * i);
            }
            k2 = k2.wrapping_mul(C2);
            k2 = k2.rotate_left(33);
            k2 = k2.wrapping_mul(C1);
            self.h2 ^= k2;
        }
        if !tail.is_empty() {
            for (i, &b) in tail[..tail.len().min(8)].iter().enumerate() {
                k1 ^= (b as u64) << (8 * i);
            }
            k1 = k1.wrapping_mul(C1);
            k1 = k1.rotate_left(31);
            k1 = k1.wrapping_mul(C2);
            self.h1 ^= k1;
        }

        self.h1 ^= self.total;
        self.h2 ^= self.total;

        self.h1 = self.h1.wrapping_add(self.h2);
        self.h2 = self.h2.wrapping_add(self.h1);

        self.h1 = fmix64(self.h1);
        self.h2 = fmix64(self.h2);

        self.h1 = self.h1.wrapping_add(self.h2);
        self.h2 = self.h2.wrapping_add(self.h1);

        let mut out = [0u8; 16];
        out[0..8].copy_from_slice(&self.h1.to_le_bytes());
        out[8..16].copy_from_slice(&self.h2.to_le_bytes());
        out
    }
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// Verification value for the 256-key test vector, interpreted as a
/// little-endian u32 over the first four output bytes.
const VERIFICATION: u32 = 0x6384_BA69;

fn self_test() -> bool {
    let mut key = [0u8; 256];
    let mut hashes = [0u8; 16 * 256];

    for i in 0..256 {
        key[i] = i as u8;
        let mut h = SigHasher::with_seed(256 - i as u32);
        h.update(&key[..i]);
        hashes[i * 16..(i + 1) * 16].copy_from_slice(&h.finish());
    }

    let mut h = SigHasher::with_seed(0);
    h.update(&hashes);
    let fin = h.finish();

    u32::from_le_bytes(fin[0..4].try_into().unwrap()) == VERIFICATION
}

fn ensure_verified() {
    static VERIFIED: OnceLock<bool> = OnceLock::new();
    if !*VERIFIED.get_or_init(self_test) {
        panic!("MurmurHash3-x64-128 self-test failed; refusing to produce signatures");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_vector() {
        assert!(self_test());
    }

    #[test]
    fn hex_round_trip() {
        let sig = Signature::hash_str("obj/a");
        let hex = sig.to_hex();
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(Signature::from_hex(&hex), Some(sig));
        assert_eq!(Signature::from_hex(&sig.to_filename()), Some(sig));
    }

    #[test]
    fn filename_form_uses_colons() {
        let sig = Signature::hash_str("x");
        let name = sig.to_filename();
        assert_eq!(name.len(), 47);
        assert_eq!(name.matches(':').count(), 15);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let whole = Signature::hash_bytes(data);
        for split in [1, 7, 16, 17, 42] {
            let (a, b) = data.split_at(split);
            assert_eq!(Signature::hash(&[a, b]), whole, "split at {split}");
        }
    }

    #[test]
    fn distinct_inputs_distinct_sigs() {
        assert_ne!(Signature::hash_str("obj/a"), Signature::hash_str("obj/b"));
        assert!(!Signature::hash_str("obj/a").is_zero());
        assert!(Signature::default().is_zero());
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert_eq!(Signature::from_hex("zz"), None);
        assert_eq!(Signature::from_hex("abcd"), None);
        assert_eq!(Signature::from_hex(&"ab".repeat(17)), None);
    }
}
