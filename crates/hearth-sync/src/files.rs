//! File chunking, per-chunk encryption and XOR-parity reassembly
//!
//! A file becomes a fresh `file_id`, a fresh `file_key` and a sequence of
//! `file_chunk` events: fixed-size plaintext slices encrypted under the file
//! key, each carrying an HMAC-derived PRF tag so key holders can find chunks
//! in a store without decrypting anything. Parity chunks are XOR over their
//! group and recover at most one missing data chunk per parity subset.

use hearth_core::codec::{NonceSource, NONCE_LEN, TAG_LEN};
use hearth_core::keys::FileKey;
use hearth_core::types::{FileId, FileManifest, Payload, PrfTag};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::collections::BTreeMap;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Plaintext bytes per chunk; the ciphertext is longer by nonce and tag.
pub const CHUNK_SIZE: usize = 500;

/// File layer errors
#[derive(Debug, Error)]
pub enum FileError {
    #[error("parity group size {0} out of range (g + g/2 must be <= 128)")]
    BadGroupSize(usize),
}

/// Erasure coding configuration.
#[derive(Clone, Debug)]
pub struct ErasureConfig {
    pub enabled: bool,
    /// Data chunks per parity group.
    pub group_size: usize,
}

impl Default for ErasureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group_size: 8,
        }
    }
}

impl ErasureConfig {
    fn validate(&self) -> Result<(), FileError> {
        if self.group_size == 0 || self.group_size + self.group_size / 2 > 128 {
            return Err(FileError::BadGroupSize(self.group_size));
        }
        Ok(())
    }
}

/// PRF tag for one chunk: HMAC-SHA256(file_key, "tag" || chunk_no || is_parity).
pub fn prf_tag(file_key: &FileKey, chunk_no: u32, is_parity: bool) -> PrfTag {
    let mut mac: HmacSha256 =
        Mac::new_from_slice(&file_key.0).expect("HMAC accepts any key length");
    mac.update(b"tag");
    mac.update(&chunk_no.to_be_bytes());
    mac.update(&[is_parity as u8]);
    let digest = mac.finalize().into_bytes();
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&digest[..16]);
    PrfTag(tag)
}

fn encrypt_chunk(file_key: &FileKey, plain: &[u8], nonces: &mut dyn NonceSource) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new_from_slice(&file_key.0).expect("file key is 32 bytes");
    let nonce_bytes = nonces.next_nonce();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plain)
        .expect("chunk encryption cannot fail");
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

fn decrypt_chunk(file_key: &FileKey, cipher_bytes: &[u8]) -> Option<Vec<u8>> {
    if cipher_bytes.len() < NONCE_LEN + TAG_LEN {
        return None;
    }
    let (nonce, ciphertext) = cipher_bytes.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new_from_slice(&file_key.0).expect("file key is 32 bytes");
    cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()
}

/// Parity chunks per group of `len` data chunks.
fn parity_per_group(len: usize) -> usize {
    (len / 2).max(1)
}

/// Slice `data` into chunk payloads and a manifest.
///
/// Data chunk numbering is 0..N; parity numbering continues after the data
/// chunks, grouped in order. The chunk payloads are returned in that order
/// and are ready to author as events.
pub fn chunk_file(
    data: &[u8],
    mime: &str,
    erasure: &ErasureConfig,
    rng: &mut dyn RngCore,
    nonces: &mut dyn NonceSource,
) -> Result<(FileManifest, Vec<Payload>), FileError> {
    erasure.validate()?;

    let file_key = FileKey::generate(rng);
    let mut file_id = [0u8; 32];
    rng.fill_bytes(&mut file_id);
    let file_id = FileId(file_id);

    // Pad the last chunk; the manifest remembers the true length.
    let padded: Vec<Vec<u8>> = data
        .chunks(CHUNK_SIZE)
        .map(|chunk| {
            let mut block = chunk.to_vec();
            block.resize(CHUNK_SIZE, 0);
            block
        })
        .collect();
    let chunk_count = padded.len() as u32;

    let mut payloads = Vec::with_capacity(padded.len() * 2);
    for (chunk_no, block) in padded.iter().enumerate() {
        let chunk_no = chunk_no as u32;
        payloads.push(Payload::FileChunk {
            file_id,
            chunk_no,
            is_parity: false,
            prf_tag: prf_tag(&file_key, chunk_no, false),
            cipher: encrypt_chunk(&file_key, block, nonces),
        });
    }

    let mut parity_count = 0u32;
    if erasure.enabled && !padded.is_empty() {
        for group in padded.chunks(erasure.group_size) {
            let p = parity_per_group(group.len());
            for j in 0..p {
                let mut parity = vec![0u8; CHUNK_SIZE];
                for (i, block) in group.iter().enumerate() {
                    if i % p == j {
                        for (byte, src) in parity.iter_mut().zip(block.iter()) {
                            *byte ^= src;
                        }
                    }
                }
                let chunk_no = chunk_count + parity_count;
                payloads.push(Payload::FileChunk {
                    file_id,
                    chunk_no,
                    is_parity: true,
                    prf_tag: prf_tag(&file_key, chunk_no, true),
                    cipher: encrypt_chunk(&file_key, &parity, nonces),
                });
                parity_count += 1;
            }
        }
    }

    let manifest = FileManifest {
        file_id,
        file_key,
        mime: mime.to_string(),
        byte_length: data.len() as u64,
        chunk_count,
        parity_count,
        parity_group_size: erasure.group_size as u32,
        content_hash: *blake3::hash(data).as_bytes(),
    };

    Ok((manifest, payloads))
}

/// One decrypted-from-the-envelope chunk, as pulled out of a `file_chunk`
/// payload. The inner cipher is still under the file key.
#[derive(Clone, Debug)]
pub struct ChunkCipher {
    pub chunk_no: u32,
    pub is_parity: bool,
    pub cipher: Vec<u8>,
}

impl ChunkCipher {
    /// Extract from a payload if it is a chunk of the given file.
    pub fn from_payload(payload: &Payload, file_id: &FileId) -> Option<Self> {
        match payload {
            Payload::FileChunk {
                file_id: id,
                chunk_no,
                is_parity,
                cipher,
                ..
            } if id == file_id => Some(Self {
                chunk_no: *chunk_no,
                is_parity: *is_parity,
                cipher: cipher.clone(),
            }),
            _ => None,
        }
    }
}

/// Reassemble a file from whatever chunks are available.
///
/// Missing data chunks are recovered through XOR parity where exactly one
/// chunk of a parity subset is absent; anything worse returns None. The
/// result is trimmed to the manifest length and checked against the content
/// hash.
pub fn assemble(manifest: &FileManifest, chunks: &[ChunkCipher]) -> Option<Vec<u8>> {
    let n = manifest.chunk_count as usize;
    let group_size = manifest.parity_group_size as usize;
    if group_size == 0 && n > 0 && manifest.parity_count > 0 {
        return None;
    }

    // Decrypt whatever is present; undecryptable chunks count as missing.
    let mut data: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
    let mut parity: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
    for chunk in chunks {
        let Some(plain) = decrypt_chunk(&manifest.file_key, &chunk.cipher) else {
            continue;
        };
        if plain.len() != CHUNK_SIZE {
            continue;
        }
        if chunk.is_parity {
            parity.insert(chunk.chunk_no as usize, plain);
        } else if (chunk.chunk_no as usize) < n {
            data.insert(chunk.chunk_no as usize, plain);
        }
    }

    // Walk parity groups and repair single missing chunks.
    if manifest.parity_count > 0 {
        let mut parity_no = n;
        let mut group_start = 0usize;
        while group_start < n {
            let len = group_size.min(n - group_start);
            let p = parity_per_group(len);
            for j in 0..p {
                let subset: Vec<usize> = (0..len)
                    .filter(|i| i % p == j)
                    .map(|i| group_start + i)
                    .collect();
                let missing: Vec<usize> = subset
                    .iter()
                    .copied()
                    .filter(|no| !data.contains_key(no))
                    .collect();
                if missing.len() == 1 {
                    if let Some(parity_plain) = parity.get(&parity_no) {
                        let mut recovered = parity_plain.clone();
                        for no in &subset {
                            if let Some(block) = data.get(no) {
                                for (byte, src) in recovered.iter_mut().zip(block.iter()) {
                                    *byte ^= src;
                                }
                            }
                        }
                        data.insert(missing[0], recovered);
                    }
                }
                parity_no += 1;
            }
            group_start += len;
        }
    }

    if data.len() != n {
        return None;
    }

    let mut out = Vec::with_capacity(n * CHUNK_SIZE);
    for no in 0..n {
        out.extend_from_slice(data.get(&no)?);
    }
    out.truncate(manifest.byte_length as usize);

    if *blake3::hash(&out).as_bytes() != manifest.content_hash {
        return None;
    }
    Some(out)
}
