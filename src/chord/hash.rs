use crate::chord::types::Digest;
use crate::chord::RING_SIZE;
use sha2::{Digest as _, Sha256};

/// Hash used to place names and keys on the ring.
///
/// Every node of a network has to agree on the same function.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum HashFunction {
    /// First byte(s) of the MD5 digest
    #[default]
    Md5,
    Sha256,
}

/// Maps `key` onto the ring by keeping the low `NUM_BITS` of the digest's
/// leading bytes, read little-endian.
pub fn hash_key(key: &str, function: HashFunction) -> Digest {
    let mut prefix = [0u8; 4];
    match function {
        HashFunction::Md5 => prefix.copy_from_slice(&md5::compute(key.as_bytes()).0[..4]),
        HashFunction::Sha256 => prefix.copy_from_slice(&Sha256::digest(key.as_bytes())[..4]),
    }
    Digest::new(u32::from_le_bytes(prefix) & (RING_SIZE - 1))
}

/// Key names used by experiments: `<prefix>_0`, `<prefix>_1`, ...
pub fn generate_keys(num_keys: usize, prefix: &str) -> Vec<String> {
    (0..num_keys).map(|i| format!("{}_{}", prefix, i)).collect()
}
