//! Key-based partition routing.
//!
//! Keys are hashed with Kafka's default partitioner hash (murmur2, seed
//! `0x9747b28c`), masked positive and reduced modulo the destination's
//! partition count. Equal keys therefore always land on the same partition
//! channel, and the mapping agrees with Kafka clients hashing the same bytes.
//!
//! Partition counts are looked up once per destination in the coordination
//! backend and cached.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::group::CoordinationClient;
use crate::group::retry;
use crate::types::{PartitionId, partition_channel};

const MURMUR2_SEED: u32 = 0x9747_b28c;
const MURMUR2_M: u32 = 0x5bd1_e995;
const MURMUR2_R: u32 = 24;

/// Kafka's 32-bit murmur2.
pub fn murmur2(data: &[u8]) -> i32 {
    let length = data.len();
    let mut h: u32 = MURMUR2_SEED ^ (length as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(MURMUR2_M);
        k ^= k >> MURMUR2_R;
        k = k.wrapping_mul(MURMUR2_M);
        h = h.wrapping_mul(MURMUR2_M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(MURMUR2_M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(MURMUR2_M);
    h ^= h >> 15;
    h as i32
}

/// Clear the sign bit, as Kafka's `Utils.toPositive`.
#[inline]
pub fn to_positive(n: i32) -> u32 {
    (n & 0x7fff_ffff) as u32
}

/// Partition for `key` among `partition_count` partitions.
///
/// `partition_count` must be non-zero.
#[inline]
pub fn partition_for_key(key: &str, partition_count: u32) -> PartitionId {
    to_positive(murmur2(key.as_bytes())) % partition_count
}

/// Where a message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: String,
    pub partition: PartitionId,
    pub channel: String,
}

/// Resolves `(destination, key)` to a partition channel.
pub struct PartitionRouter {
    coordinator: Arc<dyn CoordinationClient>,
    partition_counts: DashMap<String, u32>,
}

impl PartitionRouter {
    pub fn new(coordinator: Arc<dyn CoordinationClient>) -> Self {
        Self {
            coordinator,
            partition_counts: DashMap::new(),
        }
    }

    /// Partition count of `destination`, from the cache or the backend.
    pub async fn partition_count(&self, destination: &str) -> Result<u32> {
        if let Some(count) = self.partition_counts.get(destination) {
            return Ok(*count);
        }

        let stored = retry::with_coordination_policy("partition_count", || {
            self.coordinator.partition_count(destination)
        })
        .await?;
        match stored {
            Some(count) if count > 0 => {
                debug!(destination, partition_count = count, "Cached partition count");
                self.partition_counts.insert(destination.to_string(), count);
                Ok(count)
            }
            _ => Err(Error::UnknownDestination(destination.to_string())),
        }
    }

    /// Remember a partition count learned elsewhere (e.g. from a declaration).
    pub fn cache_partition_count(&self, destination: &str, partition_count: u32) {
        self.partition_counts
            .insert(destination.to_string(), partition_count);
    }

    pub fn invalidate(&self, destination: &str) {
        self.partition_counts.remove(destination);
    }

    pub async fn route(&self, destination: &str, key: &str) -> Result<Route> {
        let partition_count = self.partition_count(destination).await?;
        let partition = partition_for_key(key, partition_count);
        Ok(Route {
            destination: destination.to_string(),
            partition,
            channel: partition_channel(destination, partition),
        })
    }
}

impl std::fmt::Debug for PartitionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionRouter")
            .field("cached_destinations", &self.partition_counts.len())
            .finish()
    }
}
