//! Deterministic range assignment of partitions to group members.
//!
//! Every member computes the assignment independently from the membership
//! snapshot it observes, so the function must be pure: the same member set
//! (in any order, with or without duplicates) and partition count always
//! produce the same mapping.
//!
//! Members are sorted lexicographically and partition `p` goes to member
//! index `floor(p * |M| / N)`. Each member therefore receives a contiguous
//! band of either `floor(N / |M|)` or `ceil(N / |M|)` partitions.
//!
//! ```text
//!  N = 5, M = [a, b, c]
//!
//!  partition:  0   1   2   3   4
//!  owner:      a   a   b   b   c
//! ```

use std::collections::BTreeMap;

use crate::types::{MemberId, PartitionId};

/// Result of [`assign_partitions`]: an owner for every partition in `[0, N)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Assignment {
    partition_count: u32,
    /// Canonical (sorted, deduplicated) member list the assignment was built from.
    members: Vec<MemberId>,
    /// `owners[p]` is the index into `members` owning partition `p`.
    owners: Vec<usize>,
}

impl Assignment {
    /// Owner of `partition`, or `None` if out of range or there are no members.
    pub fn owner_of(&self, partition: PartitionId) -> Option<&str> {
        self.owners
            .get(partition as usize)
            .map(|&idx| self.members[idx].as_str())
    }

    /// Partitions assigned to `member`, ascending. Empty for unknown members.
    pub fn partitions_for(&self, member: &str) -> Vec<PartitionId> {
        let Ok(idx) = self.members.binary_search_by(|m| m.as_str().cmp(member)) else {
            return Vec::new();
        };
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == idx)
            .map(|(p, _)| p as PartitionId)
            .collect()
    }

    /// Canonical member list.
    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// True if every partition has an owner.
    pub fn is_complete(&self) -> bool {
        self.owners.len() == self.partition_count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Partition counts per member, for balance checks and logging.
    pub fn load_per_member(&self) -> BTreeMap<&str, usize> {
        let mut load: BTreeMap<&str, usize> =
            self.members.iter().map(|m| (m.as_str(), 0)).collect();
        for &idx in &self.owners {
            if let Some(count) = load.get_mut(self.members[idx].as_str()) {
                *count += 1;
            }
        }
        load
    }
}

/// Compute the range assignment of `partition_count` partitions over `members`.
///
/// An empty member set or zero partitions yields an empty assignment.
pub fn assign_partitions<S: AsRef<str>>(members: &[S], partition_count: u32) -> Assignment {
    let mut canonical: Vec<MemberId> = members.iter().map(|m| m.as_ref().to_string()).collect();
    canonical.sort();
    canonical.dedup();

    if canonical.is_empty() || partition_count == 0 {
        return Assignment {
            partition_count,
            members: canonical,
            owners: Vec::new(),
        };
    }

    let n = partition_count as u64;
    let k = canonical.len() as u64;
    let owners = (0..n).map(|p| ((p * k) / n) as usize).collect();

    Assignment {
        partition_count,
        members: canonical,
        owners,
    }
}
