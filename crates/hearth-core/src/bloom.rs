//! Bloom summary: a fixed-size probabilistic digest of known event ids
//!
//! Summaries are exchanged between peers to compute the symmetric difference
//! of their stores without cursors or vector clocks. The serialized form
//! (filter || event_count || timestamp || optional signature) must fit in a
//! single datagram.

use crate::keys::KeyPair;
use crate::types::EventId;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reference filter size in bits (256 bytes on the wire).
pub const DEFAULT_BITS: usize = 2048;
/// Reference number of hash positions per id.
pub const DEFAULT_HASHES: u32 = 3;

const COUNT_LEN: usize = 4;
const TS_LEN: usize = 8;
const SIG_LEN: usize = 64;

/// Bloom summary errors
#[derive(Debug, Error)]
pub enum BloomError {
    #[error("filter size mismatch: {ours} vs {theirs} bits")]
    SizeMismatch { ours: usize, theirs: usize },
    #[error("summary truncated: {0} bytes")]
    Truncated(usize),
    #[error("filter bits must be a positive multiple of 8, got {0}")]
    BadGeometry(usize),
}

/// Fixed-size Bloom filter over event ids, with the metadata that travels
/// with it on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomSummary {
    bits: Vec<u8>,
    m_bits: usize,
    k: u32,
    event_count: u32,
    timestamp: u64,
}

impl BloomSummary {
    /// Create an empty summary. `m_bits` must be a positive multiple of 8.
    pub fn new(m_bits: usize, k: u32, timestamp: u64) -> Result<Self, BloomError> {
        if m_bits == 0 || m_bits % 8 != 0 {
            return Err(BloomError::BadGeometry(m_bits));
        }
        Ok(Self {
            bits: vec![0u8; m_bits / 8],
            m_bits,
            k,
            event_count: 0,
            timestamp,
        })
    }

    /// Bit position for hash round `i`: SHA-256(event_id || i)[0..4] mod m.
    fn position(&self, id: &EventId, i: u32) -> usize {
        let mut hasher = Sha256::new();
        hasher.update(id.0);
        hasher.update([i as u8]);
        let digest = hasher.finalize();
        let word = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        word as usize % self.m_bits
    }

    /// Add an event id to the filter.
    pub fn add(&mut self, id: &EventId) {
        for i in 0..self.k {
            let pos = self.position(id, i);
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
        self.event_count = self.event_count.saturating_add(1);
    }

    /// Probabilistic membership test: false means definitely absent.
    pub fn maybe_contains(&self, id: &EventId) -> bool {
        (0..self.k).all(|i| {
            let pos = self.position(id, i);
            self.bits[pos / 8] & (1 << (pos % 8)) != 0
        })
    }

    /// Bitwise-OR merge; event counts sum, the newer timestamp wins.
    pub fn merge(&mut self, other: &BloomSummary) -> Result<(), BloomError> {
        if self.m_bits != other.m_bits {
            return Err(BloomError::SizeMismatch {
                ours: self.m_bits,
                theirs: other.m_bits,
            });
        }
        for (byte, theirs) in self.bits.iter_mut().zip(other.bits.iter()) {
            *byte |= theirs;
        }
        self.event_count = self.event_count.saturating_add(other.event_count);
        self.timestamp = self.timestamp.max(other.timestamp);
        Ok(())
    }

    /// Analytical false-positive rate: (1 − e^(−k·n/m))^k.
    pub fn estimated_fpr(&self) -> f64 {
        let k = self.k as f64;
        let n = self.event_count as f64;
        let m = self.m_bits as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    pub fn event_count(&self) -> u32 {
        self.event_count
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Wire form: filter_bytes || event_count (u32 BE) || timestamp (u64 BE).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bits.len() + COUNT_LEN + TS_LEN);
        out.extend_from_slice(&self.bits);
        out.extend_from_slice(&self.event_count.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out
    }

    /// Parse a wire summary of known geometry; a trailing 64 bytes, if
    /// present, is a signature.
    pub fn from_bytes(
        bytes: &[u8],
        m_bits: usize,
        k: u32,
    ) -> Result<(Self, Option<[u8; 64]>), BloomError> {
        if m_bits == 0 || m_bits % 8 != 0 {
            return Err(BloomError::BadGeometry(m_bits));
        }
        let filter_len = m_bits / 8;
        let unsigned_len = filter_len + COUNT_LEN + TS_LEN;
        let (body, signature) = if bytes.len() == unsigned_len + SIG_LEN {
            let (body, sig) = bytes.split_at(unsigned_len);
            let sig: [u8; 64] = sig.try_into().expect("split at 64");
            (body, Some(sig))
        } else if bytes.len() == unsigned_len {
            (bytes, None)
        } else {
            return Err(BloomError::Truncated(bytes.len()));
        };

        let (bits, rest) = body.split_at(filter_len);
        let event_count = u32::from_be_bytes(rest[..COUNT_LEN].try_into().expect("count bytes"));
        let timestamp =
            u64::from_be_bytes(rest[COUNT_LEN..COUNT_LEN + TS_LEN].try_into().expect("ts bytes"));

        Ok((
            Self {
                bits: bits.to_vec(),
                m_bits,
                k,
                event_count,
                timestamp,
            },
            signature,
        ))
    }

    /// Sign the wire form with a device key.
    pub fn sign(&self, keys: &KeyPair) -> SignedSummary {
        let signature = keys.sign(&self.to_bytes());
        SignedSummary {
            summary: self.clone(),
            signature,
        }
    }
}

/// A Bloom summary plus its author's Ed25519 signature over the wire bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedSummary {
    pub summary: BloomSummary,
    pub signature: [u8; 64],
}

impl SignedSummary {
    /// Verify the signature against the author's public key.
    pub fn verify(&self, public_key: &[u8; 32]) -> bool {
        KeyPair::verify(public_key, &self.summary.to_bytes(), &self.signature).is_ok()
    }

    /// Wire form with the trailing signature.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.summary.to_bytes();
        out.extend_from_slice(&self.signature);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha12Rng;

    fn id(rng: &mut ChaCha12Rng) -> EventId {
        EventId(rng.gen())
    }

    #[test]
    fn added_ids_are_always_found() {
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        let mut bloom = BloomSummary::new(DEFAULT_BITS, DEFAULT_HASHES, 0).unwrap();
        let ids: Vec<EventId> = (0..200).map(|_| id(&mut rng)).collect();
        for e in &ids {
            bloom.add(e);
        }
        assert!(ids.iter().all(|e| bloom.maybe_contains(e)));
        assert_eq!(bloom.event_count(), 200);
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let bloom = BloomSummary::new(DEFAULT_BITS, DEFAULT_HASHES, 0).unwrap();
        let mut rng = ChaCha12Rng::seed_from_u64(2);
        assert!(!(0..100).any(|_| bloom.maybe_contains(&id(&mut rng))));
    }

    #[test]
    fn merge_is_union() {
        let mut rng = ChaCha12Rng::seed_from_u64(3);
        let a_ids: Vec<EventId> = (0..50).map(|_| id(&mut rng)).collect();
        let b_ids: Vec<EventId> = (0..50).map(|_| id(&mut rng)).collect();

        let mut a = BloomSummary::new(DEFAULT_BITS, DEFAULT_HASHES, 10).unwrap();
        let mut b = BloomSummary::new(DEFAULT_BITS, DEFAULT_HASHES, 20).unwrap();
        a_ids.iter().for_each(|e| a.add(e));
        b_ids.iter().for_each(|e| b.add(e));

        a.merge(&b).unwrap();
        assert!(a_ids.iter().chain(&b_ids).all(|e| a.maybe_contains(e)));
        assert_eq!(a.event_count(), 100);
        assert_eq!(a.timestamp(), 20);
    }

    #[test]
    fn merge_rejects_size_mismatch() {
        let mut a = BloomSummary::new(2048, 3, 0).unwrap();
        let b = BloomSummary::new(1024, 3, 0).unwrap();
        assert!(matches!(a.merge(&b), Err(BloomError::SizeMismatch { .. })));
    }

    #[test]
    fn wire_roundtrip_unsigned_and_signed() {
        let mut rng = ChaCha12Rng::seed_from_u64(4);
        let mut bloom = BloomSummary::new(DEFAULT_BITS, DEFAULT_HASHES, 777).unwrap();
        (0..32).for_each(|_| bloom.add(&id(&mut rng)));

        let (parsed, sig) = BloomSummary::from_bytes(&bloom.to_bytes(), DEFAULT_BITS, DEFAULT_HASHES).unwrap();
        assert_eq!(parsed, bloom);
        assert!(sig.is_none());

        let keys = KeyPair::from_seed(&[1; 32]);
        let signed = bloom.sign(&keys);
        let (parsed, sig) = BloomSummary::from_bytes(&signed.to_bytes(), DEFAULT_BITS, DEFAULT_HASHES).unwrap();
        assert_eq!(parsed, bloom);
        let reparsed = SignedSummary {
            summary: parsed,
            signature: sig.unwrap(),
        };
        assert!(reparsed.verify(&keys.public_key()));
        assert!(!reparsed.verify(&KeyPair::from_seed(&[2; 32]).public_key()));
    }

    #[test]
    fn summary_fits_one_datagram() {
        let keys = KeyPair::from_seed(&[1; 32]);
        let bloom = BloomSummary::new(DEFAULT_BITS, DEFAULT_HASHES, 0).unwrap();
        assert!(bloom.sign(&keys).to_bytes().len() <= 1200 - 64);
    }

    #[test]
    fn observed_fpr_within_twice_analytical() {
        // n = m/(2k) keeps the filter in its accurate regime
        let n = DEFAULT_BITS / (2 * DEFAULT_HASHES as usize);
        let mut rng = ChaCha12Rng::seed_from_u64(5);
        let mut bloom = BloomSummary::new(DEFAULT_BITS, DEFAULT_HASHES, 0).unwrap();
        (0..n).for_each(|_| bloom.add(&id(&mut rng)));

        let trials = 20_000;
        let false_positives = (0..trials)
            .filter(|_| bloom.maybe_contains(&id(&mut rng)))
            .count();
        let observed = false_positives as f64 / trials as f64;
        let analytical = bloom.estimated_fpr();
        assert!(
            observed <= analytical * 2.0,
            "observed {observed} > 2x analytical {analytical}"
        );
    }
}
