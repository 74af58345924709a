//! Sharder implementation.
//!
//! The bucket an entity falls into must match the server-side evaluator bit-for-bit, so the hash
//! input is the decimal flag id immediately followed by the entity id, with no separator.

/// Total number of buckets. Percentages are scaled by [`PERCENT_MULTIPLIER`] into this space.
pub const TOTAL_BUCKETS: u64 = 1000;

/// Scale factor from a 0..=100 percentage to the bucket space.
pub const PERCENT_MULTIPLIER: i64 = 10;

pub trait Sharder {
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64;
}

/// The default (and only) sharder: CRC32 with the IEEE polynomial.
pub struct Crc32Sharder;

impl Sharder for Crc32Sharder {
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64 {
        let value = crc32fast::hash(input.as_ref());
        (value as u64) % total_shards
    }
}

/// Bucket of `entity_id` for the flag `flag_id`, in `0..TOTAL_BUCKETS`.
pub fn bucket(sharder: &impl Sharder, flag_id: i64, entity_id: &str) -> u64 {
    sharder.get_shard(format!("{flag_id}{entity_id}"), TOTAL_BUCKETS)
}
