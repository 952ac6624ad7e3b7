//! Streaming content-hash capability.
//!
//! The copy worker feeds file chunks through a [`ContentHasher`] and compares
//! the resulting hex digests byte-for-byte. Which algorithm backs the hasher
//! is decided once per service by configuration; the worker only requires
//! that source and destination digests come from the same one.

use sha2::{Digest, Sha256};
use xxhash_rust::xxh3::Xxh3;
use xxhash_rust::xxh64::Xxh64;

use mirrex_model::HashAlgorithm;

/// Incremental hasher over one of the supported algorithms.
pub enum ContentHasher {
    Sha256(Box<Sha256>),
    Xxh64(Xxh64),
    Xxh3(Box<Xxh3>),
}

impl std::fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContentHasher::Sha256(_) => "sha256",
            ContentHasher::Xxh64(_) => "xxhash64",
            ContentHasher::Xxh3(_) => "xxhash3",
        };
        f.debug_tuple("ContentHasher").field(&name).finish()
    }
}

impl ContentHasher {
    pub fn update(&mut self, chunk: &[u8]) {
        match self {
            ContentHasher::Sha256(hasher) => hasher.update(chunk),
            ContentHasher::Xxh64(hasher) => hasher.update(chunk),
            ContentHasher::Xxh3(hasher) => hasher.update(chunk),
        }
    }

    /// Consume the hasher and return the lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        match self {
            ContentHasher::Sha256(hasher) => to_hex(&hasher.finalize()),
            ContentHasher::Xxh64(hasher) => format!("{:016x}", hasher.digest()),
            ContentHasher::Xxh3(hasher) => format!("{:016x}", hasher.digest()),
        }
    }
}

/// Constructor seam so callers never match on the algorithm themselves.
pub trait HashAlgorithmExt {
    fn new_hasher(&self) -> ContentHasher;
}

impl HashAlgorithmExt for HashAlgorithm {
    fn new_hasher(&self) -> ContentHasher {
        match self {
            HashAlgorithm::Sha256 => ContentHasher::Sha256(Box::new(Sha256::new())),
            HashAlgorithm::Xxhash64 => ContentHasher::Xxh64(Xxh64::new(0)),
            HashAlgorithm::Xxhash3 => ContentHasher::Xxh3(Box::new(Xxh3::new())),
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(algorithm: HashAlgorithm, data: &[u8]) -> String {
        let mut hasher = algorithm.new_hasher();
        hasher.update(data);
        hasher.finalize_hex()
    }

    #[test]
    fn sha256_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            digest_of(HashAlgorithm::Sha256, b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn sha256_hello_world() {
        assert_eq!(
            digest_of(HashAlgorithm::Sha256, b"hello, world."),
            digest_of(HashAlgorithm::Sha256, b"hello, world."),
        );
        assert_ne!(
            digest_of(HashAlgorithm::Sha256, b"hello, world."),
            digest_of(HashAlgorithm::Sha256, b"hello, world!"),
        );
    }

    #[test]
    fn xxh64_empty_vector() {
        // xxh64 of the empty input with seed 0.
        assert_eq!(
            digest_of(HashAlgorithm::Xxhash64, b""),
            "ef46db3751d8e999"
        );
    }

    #[test]
    fn chunked_matches_oneshot() {
        for algorithm in [
            HashAlgorithm::Sha256,
            HashAlgorithm::Xxhash64,
            HashAlgorithm::Xxhash3,
        ] {
            let data = vec![0xa5u8; 10_000];
            let mut chunked = algorithm.new_hasher();
            for piece in data.chunks(997) {
                chunked.update(piece);
            }
            assert_eq!(
                chunked.finalize_hex(),
                digest_of(algorithm, &data),
                "chunked digest must match one-shot for {algorithm}"
            );
        }
    }
}
