//! Hashing utilities for minictl
//!
//! - Sharding: namespace name to virtual partition (BLAKE3)
//! - HRW (Highest Random Weight) for partition ownership

/// First eight bytes of the BLAKE3 digest as a little-endian u64.
fn blake3_u64(data: &[u8]) -> u64 {
    let hash = blake3::hash(data);
    let mut word = [0u8; 8];
    word.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(word)
}

/// Compute the shard (partition) for a key
pub fn shard_key(key: &str, num_shards: u64) -> u64 {
    blake3_u64(key.as_bytes()) % num_shards.max(1)
}

/// HRW weight of `node` for `key`.
pub fn hrw_weight(key: &str, node: &str) -> u64 {
    // The separator keeps ("ab", "c") and ("a", "bc") apart.
    let combined = format!("{}\u{0}{}", key, node);
    blake3_u64(combined.as_bytes())
}

/// HRW (Highest Random Weight) owner: the single highest-weight node for
/// `key`, if any. Ties, which need a 64-bit collision, fall back to node ID
/// order so the result never depends on input order.
pub fn hrw_owner<'a, S: AsRef<str>>(key: &str, nodes: &'a [S]) -> Option<&'a str> {
    nodes
        .iter()
        .map(|node| (node.as_ref(), hrw_weight(key, node.as_ref())))
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(node, _)| node)
}
