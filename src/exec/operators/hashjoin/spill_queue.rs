// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! FIFO of spilled partition pairs and the spill-cycle bookkeeping.
//!
//! Responsibilities:
//! - Tracks the current cycle, the partition routing mask/bits, and the
//!   queue of spilled build/probe pairs awaiting reprocessing.
//! - Detects runaway recursion when repartitioning stops making progress.

use std::collections::VecDeque;

use crate::common::logging::info;
use crate::exec::spill::SpillFile;

/// One spilled build/probe pair produced by a cycle's build phase. The outer
/// side is attached after the probe drain; reading it earlier is an internal
/// error.
#[derive(Debug)]
pub(crate) struct SpilledPartitionRef {
    cycle: u32,
    origin_partition: usize,
    prev_origin_partition: i32,
    inner_file: Option<SpillFile>,
    inner_batches: usize,
    outer_file: Option<SpillFile>,
    outer_batches: usize,
    updated_outer: bool,
}

impl SpilledPartitionRef {
    pub(crate) fn new(
        cycle: u32,
        origin_partition: usize,
        prev_origin_partition: i32,
        inner_file: SpillFile,
        inner_batches: usize,
    ) -> Self {
        Self {
            cycle,
            origin_partition,
            prev_origin_partition,
            inner_file: Some(inner_file),
            inner_batches,
            outer_file: None,
            outer_batches: 0,
            updated_outer: false,
        }
    }

    pub(crate) fn cycle(&self) -> u32 {
        self.cycle
    }

    pub(crate) fn origin_partition(&self) -> usize {
        self.origin_partition
    }

    pub(crate) fn take_inner_file(&mut self) -> Result<SpillFile, String> {
        self.inner_file
            .take()
            .ok_or_else(|| "spilled partition inner file already taken".to_string())
    }

    /// Attach the probe-side spill produced for this partition. May only be
    /// called once.
    pub(crate) fn update_outer(
        &mut self,
        outer_batches: usize,
        outer_file: Option<SpillFile>,
    ) -> Result<(), String> {
        if self.updated_outer {
            return Err("spilled partition outer side already updated".to_string());
        }
        if outer_batches > 0 && outer_file.is_none() {
            return Err("spilled partition outer file missing".to_string());
        }
        self.updated_outer = true;
        self.outer_batches = outer_batches;
        self.outer_file = outer_file;
        Ok(())
    }

    pub(crate) fn outer_batches(&self) -> Result<usize, String> {
        if !self.updated_outer {
            return Err("spilled partition outer side read before update".to_string());
        }
        Ok(self.outer_batches)
    }

    pub(crate) fn take_outer_file(&mut self) -> Result<Option<SpillFile>, String> {
        if !self.updated_outer {
            return Err("spilled partition outer side read before update".to_string());
        }
        Ok(self.outer_file.take())
    }

    /// Remaining files for cleanup paths.
    pub(crate) fn take_files(&mut self) -> Vec<SpillFile> {
        let mut files = Vec::new();
        if let Some(file) = self.inner_file.take() {
            files.push(file);
        }
        if let Some(file) = self.outer_file.take() {
            files.push(file);
        }
        files
    }

    pub(crate) fn make_debug_string(&self) -> String {
        format!(
            "spilled partition {} (prev {}) from cycle {} ({} inner / {} outer batches)",
            self.origin_partition,
            self.prev_origin_partition,
            self.cycle,
            self.inner_batches,
            self.outer_batches
        )
    }
}

/// FIFO of spilled partition pairs plus the cycle counter and routing bits
/// shared by every cycle of one operator.
#[derive(Debug, Default)]
pub(crate) struct SpillQueue {
    queue: VecDeque<SpilledPartitionRef>,
    cycle: u32,
    partition_mask: u32,
    bits_in_mask: u32,
    partition_limit: u32,
}

impl SpillQueue {
    /// Called once the partition count is final (first cycle only).
    pub(crate) fn initialize(&mut self, num_partitions: usize) {
        debug_assert!(num_partitions.is_power_of_two());
        self.partition_mask = (num_partitions - 1) as u32;
        self.bits_in_mask = num_partitions.trailing_zeros();
        self.partition_limit = num_partitions as u32;
    }

    pub(crate) fn is_first_cycle(&self) -> bool {
        self.cycle == 0
    }

    pub(crate) fn cycle(&self) -> u32 {
        self.cycle
    }

    pub(crate) fn partition_mask(&self) -> u32 {
        self.partition_mask
    }

    pub(crate) fn bits_in_mask(&self) -> u32 {
        self.bits_in_mask
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn push(&mut self, sp: SpilledPartitionRef) {
        self.queue.push_back(sp);
    }

    pub(crate) fn pop(&mut self) -> Option<SpilledPartitionRef> {
        self.queue.pop_front()
    }

    /// Advance the cycle counter for the pair about to be reprocessed. Fails
    /// when recursion has exceeded the partition limit, which means the join
    /// keys are too skewed for repartitioning to make progress.
    pub(crate) fn update_cycle(
        &mut self,
        sp: &SpilledPartitionRef,
        mem_limit: i64,
    ) -> Result<(), String> {
        self.cycle = sp.cycle() + 1;
        let severity = match self.cycle {
            0 | 1 => "primary",
            2 => "secondary",
            3 => "tertiary",
            _ => "deep",
        };
        info!(
            "started reading {} spill cycle {}: {} (queued={} mem_limit={})",
            severity,
            self.cycle,
            sp.make_debug_string(),
            self.queue.len(),
            mem_limit
        );
        if self.cycle > self.partition_limit {
            return Err(format!(
                "hash join can not partition the inner data any further (probably due to too \
                 many join-key duplicates): cycle={} partition_limit={} mem_limit={}",
                self.cycle, self.partition_limit, mem_limit
            ));
        }
        Ok(())
    }

    /// Hand out every queued ref for cleanup-time file deletion.
    pub(crate) fn drain(&mut self) -> Vec<SpilledPartitionRef> {
        self.queue.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn dummy_file(name: &str) -> SpillFile {
        SpillFile {
            path: PathBuf::from(name),
            batches: 1,
            bytes: 10,
        }
    }

    fn sp(cycle: u32, partition: usize) -> SpilledPartitionRef {
        SpilledPartitionRef::new(cycle, partition, -1, dummy_file("inner"), 1)
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut queue = SpillQueue::default();
        queue.initialize(4);
        assert_eq!(queue.partition_mask(), 3);
        assert_eq!(queue.bits_in_mask(), 2);

        queue.push(sp(0, 2));
        queue.push(sp(0, 3));
        assert_eq!(queue.pop().unwrap().origin_partition(), 2);
        assert_eq!(queue.pop().unwrap().origin_partition(), 3);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn outer_side_must_be_updated_before_reads() {
        let mut r = sp(0, 1);
        assert!(r.outer_batches().is_err());
        r.update_outer(2, Some(dummy_file("outer"))).unwrap();
        assert_eq!(r.outer_batches().unwrap(), 2);
        assert!(r.update_outer(0, None).is_err());
        assert!(r.take_outer_file().unwrap().is_some());
    }

    #[test]
    fn missing_outer_file_with_batches_is_rejected() {
        let mut r = sp(0, 1);
        assert!(r.update_outer(3, None).is_err());
    }

    #[test]
    fn runaway_recursion_is_detected() {
        let mut queue = SpillQueue::default();
        queue.initialize(2);
        assert!(queue.update_cycle(&sp(0, 0), 1024).is_ok());
        assert!(queue.update_cycle(&sp(1, 0), 1024).is_ok());
        let err = queue.update_cycle(&sp(2, 0), 1024).unwrap_err();
        assert!(err.contains("can not partition the inner data any further"), "{err}");
    }
}
