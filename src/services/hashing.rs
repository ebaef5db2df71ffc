//! Streaming content hashing.

use crate::{
    backends::ObjectReader,
    models::hash::{HashAlgorithm, HashError, StorageHash},
};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;

/// Computes the content hash of a byte stream.
#[async_trait]
pub trait ContentHasher: Send + Sync + 'static {
    fn algorithm(&self) -> HashAlgorithm;

    /// Hash exactly `size` bytes of `reader`. A stream that ends early is an
    /// error, extra bytes are ignored.
    async fn hash(&self, reader: ObjectReader, size: u64) -> Result<StorageHash, HashError>;

    /// Recompute and compare against `expected`. Returns the recomputed hash,
    /// which may carry a proof the claim did not.
    async fn verify(
        &self,
        reader: ObjectReader,
        size: u64,
        expected: &StorageHash,
    ) -> Result<Option<StorageHash>, HashError> {
        let actual = self.hash(reader, size).await?;
        Ok((actual == *expected).then_some(actual))
    }
}

enum State {
    Blake3(Box<blake3::Hasher>),
    Sha2(Sha256),
}

impl State {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Blake3 => State::Blake3(Box::new(blake3::Hasher::new())),
            HashAlgorithm::Sha2256 => State::Sha2(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            State::Blake3(h) => {
                h.update(data);
            }
            State::Sha2(h) => h.update(data),
        }
    }

    fn finish(self) -> Vec<u8> {
        match self {
            State::Blake3(h) => h.finalize().as_bytes().to_vec(),
            State::Sha2(h) => h.finalize().to_vec(),
        }
    }
}

/// Plain digest without a verification proof.
#[derive(Debug, Clone, Copy)]
pub struct DefaultHasher {
    algorithm: HashAlgorithm,
}

impl DefaultHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }
}

impl Default for DefaultHasher {
    fn default() -> Self {
        Self::new(HashAlgorithm::Blake3)
    }
}

#[async_trait]
impl ContentHasher for DefaultHasher {
    fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    async fn hash(&self, mut reader: ObjectReader, size: u64) -> Result<StorageHash, HashError> {
        let mut state = State::new(self.algorithm);
        let mut buf = vec![0u8; READ_CHUNK];
        let mut read = 0u64;
        while read < size {
            let want = (size - read).min(READ_CHUNK as u64) as usize;
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(HashError::ShortRead {
                    expected: size,
                    actual: read,
                });
            }
            state.update(&buf[..n]);
            read += n as u64;
        }
        Ok(StorageHash::new(self.algorithm, state.finish()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(data: &'static [u8]) -> ObjectReader {
        Box::pin(std::io::Cursor::new(data))
    }

    #[tokio::test]
    async fn hashes_match_reference_implementations() {
        let data = b"hello world";
        let blake = DefaultHasher::new(HashAlgorithm::Blake3)
            .hash(reader(data), data.len() as u64)
            .await
            .unwrap();
        assert_eq!(blake.digest, blake3::hash(data).as_bytes().to_vec());

        let sha = DefaultHasher::new(HashAlgorithm::Sha2256)
            .hash(reader(data), data.len() as u64)
            .await
            .unwrap();
        assert_eq!(sha.digest, Sha256::digest(data).to_vec());
    }

    #[tokio::test]
    async fn short_stream_is_an_error() {
        let err = DefaultHasher::default()
            .hash(reader(b"abc"), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, HashError::ShortRead { expected: 10, actual: 3 }));
    }

    #[tokio::test]
    async fn verify_reports_mismatch() {
        let hasher = DefaultHasher::default();
        let good = StorageHash::new(HashAlgorithm::Blake3, blake3::hash(b"abc").as_bytes().to_vec());
        assert!(hasher.verify(reader(b"abc"), 3, &good).await.unwrap().is_some());
        assert!(hasher.verify(reader(b"abd"), 3, &good).await.unwrap().is_none());
    }
}
