//! The ordering domain events are grouped into: `(match_id, map_id)`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A shard is the pair that defines an ordered log: all events for the same
/// match and map are strictly ordered against each other; events across
/// shards carry no ordering relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shard {
    /// Match identifier.
    pub match_id: String,
    /// Map identifier.
    pub map_id: String,
}

impl Shard {
    /// Build a shard from its two components.
    pub fn new(match_id: impl Into<String>, map_id: impl Into<String>) -> Self {
        Self {
            match_id: match_id.into(),
            map_id: map_id.into(),
        }
    }

    /// The canonical, colon-joined key used for storage lookups
    /// (`"{match_id}:{map_id}"`). This is the authoritative ordering key.
    pub fn key(&self) -> String {
        format!("{}:{}", self.match_id, self.map_id)
    }

    /// A numeric bucket derived from the shard key via CRC32. Not used for
    /// ordering -- only as a convenience for coarse sharding of metrics or
    /// admin tooling that wants a stable small-cardinality label.
    pub fn bucket(&self, buckets: u32) -> u32 {
        debug_assert!(buckets > 0);
        crc32fast::hash(self.key().as_bytes()) % buckets.max(1)
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_colon_joined() {
        let shard = Shard::new("m1", "de_dust2");
        assert_eq!(shard.key(), "m1:de_dust2");
    }

    #[test]
    fn bucket_is_deterministic() {
        let shard = Shard::new("m1", "de_dust2");
        assert_eq!(shard.bucket(16), shard.bucket(16));
    }
}
