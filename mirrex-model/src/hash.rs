use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Content-hash algorithm used for copy verification.
///
/// The fast xxHash variants trade collision resistance for throughput;
/// SHA-256 is the cryptographic option. Source and destination digests are
/// always produced by the same algorithm and compared byte-for-byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Xxhash64,
    #[default]
    Xxhash3,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Xxhash64 => "xxhash64",
            HashAlgorithm::Xxhash3 => "xxhash3",
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = ModelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "xxhash64" => Ok(HashAlgorithm::Xxhash64),
            "xxhash3" => Ok(HashAlgorithm::Xxhash3),
            other => Err(ModelError::UnknownAlgorithm(other.to_string())),
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
