//! Naming of stored objects per storage protocol.

use crate::models::hash::StorageHash;

/// Suffix of the object holding a verification proof next to its data.
pub const PROOF_EXTENSION: &str = ".obao";

pub trait StorageProtocol: Send + Sync + 'static {
    /// Protocol name, also the durable bucket objects are stored in.
    fn name(&self) -> &'static str;

    /// Object key for content with this hash.
    fn encode_file_name(&self, hash: &StorageHash) -> String;

    fn proof_file_name(&self, hash: &StorageHash) -> String {
        format!("{}{}", self.encode_file_name(hash), PROOF_EXTENSION)
    }
}

/// `u` + base64url multihash.
#[derive(Debug, Clone, Copy, Default)]
pub struct S5Protocol;

impl StorageProtocol for S5Protocol {
    fn name(&self) -> &'static str {
        "s5"
    }

    fn encode_file_name(&self, hash: &StorageHash) -> String {
        format!("u{}", hash.to_base64url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::hash::HashAlgorithm;

    #[test]
    fn names_are_multibase_prefixed() {
        let hash = StorageHash::new(HashAlgorithm::Blake3, vec![0u8; 32]);
        let name = S5Protocol.encode_file_name(&hash);
        assert!(name.starts_with("uHiA"));
        assert_eq!(StorageHash::from_base64url(&name[1..]).unwrap(), hash);
        assert_eq!(S5Protocol.proof_file_name(&hash), format!("{name}.obao"));
    }
}
