//! Content hashes as claimed by uploaders and recomputed by the verify stage.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("empty multihash")]
    Empty,
    #[error("unsupported hash algorithm code 0x{0:x}")]
    UnsupportedAlgorithm(u8),
    #[error("digest length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("invalid hash encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("stream ended after {actual} of {expected} bytes")]
    ShortRead { expected: u64, actual: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Hash function a digest was produced with. Discriminants are the
/// multicodec codes used in the multihash prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum HashAlgorithm {
    Blake3,
    Sha2256,
}

impl HashAlgorithm {
    pub fn code(self) -> u8 {
        match self {
            HashAlgorithm::Blake3 => 0x1e,
            HashAlgorithm::Sha2256 => 0x12,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, HashError> {
        match code {
            0x1e => Ok(HashAlgorithm::Blake3),
            0x12 => Ok(HashAlgorithm::Sha2256),
            other => Err(HashError::UnsupportedAlgorithm(other)),
        }
    }

    pub fn digest_len(self) -> usize {
        32
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Blake3 => write!(f, "blake3"),
            HashAlgorithm::Sha2256 => write!(f, "sha2-256"),
        }
    }
}

/// Digest plus the algorithm that produced it. The optional proof is
/// advisory and never takes part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageHash {
    pub digest: Vec<u8>,
    pub algorithm: HashAlgorithm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<Vec<u8>>,
}

impl PartialEq for StorageHash {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm && self.digest == other.digest
    }
}

impl Eq for StorageHash {}

impl StorageHash {
    pub fn new(algorithm: HashAlgorithm, digest: impl Into<Vec<u8>>) -> Self {
        Self {
            digest: digest.into(),
            algorithm,
            proof: None,
        }
    }

    pub fn with_proof(mut self, proof: Option<Vec<u8>>) -> Self {
        self.proof = proof;
        self
    }

    /// `[code, len, digest...]`
    pub fn to_multihash(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.digest.len() + 2);
        out.push(self.algorithm.code());
        out.push(self.digest.len() as u8);
        out.extend_from_slice(&self.digest);
        out
    }

    pub fn from_multihash(bytes: &[u8]) -> Result<Self, HashError> {
        let (&code, rest) = bytes.split_first().ok_or(HashError::Empty)?;
        let algorithm = HashAlgorithm::from_code(code)?;
        let (&len, digest) = rest.split_first().ok_or(HashError::Empty)?;
        let expected = algorithm.digest_len();
        if len as usize != expected || digest.len() != expected {
            return Err(HashError::LengthMismatch {
                expected,
                actual: digest.len(),
            });
        }
        Ok(Self::new(algorithm, digest))
    }

    /// Base64url (unpadded) multihash, the form clients send in upload metadata.
    pub fn to_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_multihash())
    }

    pub fn from_base64url(value: &str) -> Result<Self, HashError> {
        let bytes = URL_SAFE_NO_PAD.decode(value.trim().trim_end_matches('='))?;
        Self::from_multihash(&bytes)
    }
}

impl fmt::Display for StorageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.to_base64url())
    }
}
