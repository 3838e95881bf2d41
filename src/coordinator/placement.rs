//! Partition assignment using HRW hashing
//!
//! The keyspace is a fixed ring of virtual partitions. Each partition is
//! owned by the worker with the highest HRW weight for it, so adding a
//! worker only moves the partitions that worker wins (about 1/(N+1) of
//! them) and removing one only moves the partitions it owned.
//!
//! Assignments are a pure function of the worker set. They are recomputed
//! on demand and never stored in the replicated log.

use crate::common::{hrw_owner, shard_key, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A contiguous, inclusive run of partitions owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionRange {
    pub start: u32,
    pub end: u32,
}

impl PartitionRange {
    pub fn contains(&self, partition: u32) -> bool {
        self.start <= partition && partition <= self.end
    }

    /// Number of partitions in the range.
    pub fn size(&self) -> u32 {
        self.end - self.start + 1
    }
}

/// PartitionCalculator maps namespaces to partitions and partitions to
/// workers. Stateless apart from the partition count; safe to share.
#[derive(Debug, Clone, Copy)]
pub struct PartitionCalculator {
    num_partitions: u32,
}

impl PartitionCalculator {
    pub fn new(num_partitions: u32) -> Self {
        Self {
            num_partitions: num_partitions.max(1),
        }
    }

    pub fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    /// Partition a namespace hashes to.
    pub fn partition_for(&self, namespace: &str) -> u32 {
        shard_key(namespace, self.num_partitions as u64) as u32
    }

    fn partition_key(partition: u32) -> String {
        format!("partition-{}", partition)
    }

    /// Owner of one partition.
    pub fn owner_of<'a, S: AsRef<str>>(&self, partition: u32, workers: &'a [S]) -> Option<&'a str> {
        hrw_owner(&Self::partition_key(partition), workers)
    }

    /// Owner of every partition, indexed by partition ID.
    pub fn assignments<S: AsRef<str>>(&self, workers: &[S]) -> Vec<Option<String>> {
        (0..self.num_partitions)
            .map(|p| self.owner_of(p, workers).map(str::to_string))
            .collect()
    }

    /// Ranges for every worker. Workers that win no partition map to an
    /// empty list.
    pub fn compute_all_ranges<S: AsRef<str>>(
        &self,
        workers: &[S],
    ) -> BTreeMap<String, Vec<PartitionRange>> {
        let mut ranges: BTreeMap<String, Vec<PartitionRange>> = workers
            .iter()
            .map(|w| (w.as_ref().to_string(), Vec::new()))
            .collect();

        let mut run: Option<(String, u32, u32)> = None;
        for (partition, owner) in self.assignments(workers).into_iter().enumerate() {
            let partition = partition as u32;
            let Some(owner) = owner else { continue };
            run = match run {
                Some((current, start, end)) if current == owner && end + 1 == partition => {
                    Some((current, start, partition))
                }
                Some((current, start, end)) => {
                    ranges
                        .entry(current)
                        .or_default()
                        .push(PartitionRange { start, end });
                    Some((owner, partition, partition))
                }
                None => Some((owner, partition, partition)),
            };
        }
        if let Some((current, start, end)) = run {
            ranges
                .entry(current)
                .or_default()
                .push(PartitionRange { start, end });
        }
        ranges
    }

    /// Ranges owned by `worker` within `workers`.
    pub fn compute_ranges<S: AsRef<str>>(&self, worker: &str, workers: &[S]) -> Vec<PartitionRange> {
        self.compute_all_ranges(workers)
            .remove(worker)
            .unwrap_or_default()
    }

    /// Partitions whose owner differs between two worker sets. Used to
    /// preview a rebalance before a worker joins or leaves.
    pub fn moved_partitions<S: AsRef<str>, T: AsRef<str>>(
        &self,
        before: &[S],
        after: &[T],
    ) -> Vec<u32> {
        (0..self.num_partitions)
            .filter(|p| self.owner_of(*p, before) != self.owner_of(*p, after))
            .collect()
    }

    /// Check that ranges cover every partition exactly once.
    pub fn validate_coverage(&self, ranges: &BTreeMap<String, Vec<PartitionRange>>) -> Result<()> {
        let mut owners: Vec<Option<&str>> = vec![None; self.num_partitions as usize];
        for (worker, worker_ranges) in ranges {
            for range in worker_ranges {
                if range.start > range.end || range.end >= self.num_partitions {
                    return Err(Error::Internal(format!(
                        "invalid range {}-{} for {}",
                        range.start, range.end, worker
                    )));
                }
                for partition in range.start..=range.end {
                    let slot = &mut owners[partition as usize];
                    if let Some(other) = slot {
                        return Err(Error::Internal(format!(
                            "partition {} assigned to both {} and {}",
                            partition, other, worker
                        )));
                    }
                    *slot = Some(worker.as_str());
                }
            }
        }
        if let Some(missing) = owners.iter().position(Option::is_none) {
            return Err(Error::Internal(format!("partition {} unassigned", missing)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workers(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("worker-{}", i)).collect()
    }

    #[test]
    fn test_single_worker_owns_everything() {
        let calc = PartitionCalculator::new(256);
        let ranges = calc.compute_ranges("w1", &["w1"]);
        assert_eq!(ranges, vec![PartitionRange { start: 0, end: 255 }]);
    }

    #[test]
    fn test_no_workers() {
        let calc = PartitionCalculator::new(256);
        let none: [&str; 0] = [];
        assert!(calc.compute_all_ranges(&none).is_empty());
        assert_eq!(calc.owner_of(3, &none), None);
    }

    #[test]
    fn test_ranges_are_deterministic_and_cover_keyspace() {
        let calc = PartitionCalculator::new(256);
        let mut set = workers(5);
        let first = calc.compute_all_ranges(&set);
        set.reverse();
        let second = calc.compute_all_ranges(&set);
        assert_eq!(first, second);
        calc.validate_coverage(&first).unwrap();

        let total: u32 = first.values().flatten().map(|r| r.size()).sum();
        assert_eq!(total, 256);
    }

    #[test]
    fn test_ranges_are_maximal_runs() {
        let calc = PartitionCalculator::new(256);
        let set = workers(3);
        let assignments = calc.assignments(&set);
        for (worker, ranges) in calc.compute_all_ranges(&set) {
            for range in ranges {
                for p in range.start..=range.end {
                    assert_eq!(assignments[p as usize].as_deref(), Some(worker.as_str()));
                }
                if range.end + 1 < 256 {
                    assert_ne!(
                        assignments[(range.end + 1) as usize].as_deref(),
                        Some(worker.as_str())
                    );
                }
            }
        }
    }

    #[test]
    fn test_adding_worker_moves_bounded_fraction() {
        let calc = PartitionCalculator::new(256);
        for n in 1..8 {
            let before = workers(n);
            let after = workers(n + 1);
            let moved = calc.moved_partitions(&before, &after);

            // Only partitions won by the new worker move.
            let assignments = calc.assignments(&after);
            for p in &moved {
                assert_eq!(
                    assignments[*p as usize].as_deref(),
                    Some(after[n].as_str())
                );
            }
            // Expected 256/(n+1); allow generous statistical slack.
            let expected = 256.0 / (n as f64 + 1.0);
            assert!(
                (moved.len() as f64) < expected * 1.6 + 8.0,
                "n={} moved {} partitions",
                n,
                moved.len()
            );
        }
    }

    #[test]
    fn test_partition_for_namespace() {
        let calc = PartitionCalculator::new(256);
        let p = calc.partition_for("orders");
        assert!(p < 256);
        assert_eq!(p, calc.partition_for("orders"));
    }

    #[test]
    fn test_validate_coverage_detects_gaps_and_overlaps() {
        let calc = PartitionCalculator::new(4);
        let mut ranges = BTreeMap::new();
        ranges.insert("a".to_string(), vec![PartitionRange { start: 0, end: 1 }]);
        assert!(calc.validate_coverage(&ranges).is_err());

        ranges.insert("b".to_string(), vec![PartitionRange { start: 1, end: 3 }]);
        assert!(calc.validate_coverage(&ranges).is_err());

        ranges.insert("b".to_string(), vec![PartitionRange { start: 2, end: 3 }]);
        calc.validate_coverage(&ranges).unwrap();
    }
}
