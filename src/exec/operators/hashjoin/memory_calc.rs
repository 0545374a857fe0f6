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
//! Memory planning for the partitioned hash join build.
//!
//! Two strategies: a flat in-memory batch count limit, and a memory estimate
//! driven by observed input batch sizes and configured safety factors. The
//! lifecycle runs pre-build partition tuning, per-append spill checks, and
//! the stateful post-build keep-or-spill decisions.
//!
//! Key exported interfaces:
//! - Types: `MemoryCalculator`, `BuildSidePartitioning`,
//!   `PostBuildCalculations`.

use super::JoinOptions;

/// Estimated hash table bytes per build row, before the doubling factor.
const HASH_TABLE_ENTRY_BYTES: f64 = 20.0;
const MIN_TUNED_PARTITIONS: usize = 2;

#[derive(Clone, Debug)]
pub(crate) enum CalcStrategy {
    BatchCount {
        max_batches: usize,
    },
    Estimate {
        safety_factor: f64,
        fragmentation_factor: f64,
        doubling_factor: f64,
        conservative: bool,
    },
}

impl CalcStrategy {
    fn from_options(options: &JoinOptions) -> Self {
        if options.max_batches_in_memory > 0 {
            CalcStrategy::BatchCount {
                max_batches: options.max_batches_in_memory,
            }
        } else {
            CalcStrategy::Estimate {
                safety_factor: options.safety_factor,
                fragmentation_factor: options.fragmentation_factor,
                doubling_factor: options.hash_table_doubling_factor,
                conservative: options
                    .hash_table_calc_type
                    .eq_ignore_ascii_case("CONSERVATIVE"),
            }
        }
    }
}

/// Entry point of the calculator lifecycle.
#[derive(Clone, Debug)]
pub(crate) struct MemoryCalculator {
    strategy: CalcStrategy,
    do_memory_calculation: bool,
}

impl MemoryCalculator {
    pub(crate) fn from_options(options: &JoinOptions) -> Self {
        Self {
            strategy: CalcStrategy::from_options(options),
            do_memory_calculation: false,
        }
    }

    pub(crate) fn initialize(&mut self, do_memory_calculation: bool) {
        self.do_memory_calculation = do_memory_calculation;
    }

    pub(crate) fn next(self) -> BuildSidePartitioning {
        BuildSidePartitioning {
            strategy: self.strategy,
            do_calc: self.do_memory_calculation,
            first_cycle: true,
            probe_empty: false,
            mem_limit: i64::MAX,
            num_partitions: 1,
            records_per_batch: 0,
            build_batch_bytes: 0,
            probe_batch_bytes: 0,
            output_batch_bytes: 0,
            in_memory_batches: 0,
            partition_bytes: Vec::new(),
        }
    }
}

/// Pre-build partition tuning plus per-append spill checks during the build
/// drain.
#[derive(Debug)]
pub(crate) struct BuildSidePartitioning {
    strategy: CalcStrategy,
    do_calc: bool,
    first_cycle: bool,
    probe_empty: bool,
    mem_limit: i64,
    num_partitions: usize,
    records_per_batch: usize,
    build_batch_bytes: i64,
    probe_batch_bytes: i64,
    output_batch_bytes: i64,
    in_memory_batches: usize,
    partition_bytes: Vec<i64>,
}

impl BuildSidePartitioning {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn initialize(
        &mut self,
        first_cycle: bool,
        probe_empty: bool,
        mem_limit: i64,
        num_partitions: usize,
        records_per_batch: usize,
        build_batch_bytes: i64,
        probe_batch_bytes: i64,
        output_batch_bytes: i64,
    ) {
        self.first_cycle = first_cycle;
        self.probe_empty = probe_empty;
        self.mem_limit = mem_limit;
        self.num_partitions = num_partitions.max(1);
        self.records_per_batch = records_per_batch;
        self.build_batch_bytes = build_batch_bytes.max(1);
        self.probe_batch_bytes = probe_batch_bytes.max(0);
        self.output_batch_bytes = output_batch_bytes.max(0);
        self.in_memory_batches = 0;

        if self.do_calc && first_cycle {
            // Halve the partition count until the reservation fits; the
            // caller handles the floor case via the fallback rules.
            while self.num_partitions > MIN_TUNED_PARTITIONS
                && self.reserved_for(self.num_partitions) > self.mem_limit
            {
                self.num_partitions /= 2;
            }
        }
        self.partition_bytes = vec![0; self.num_partitions];
    }

    /// The tuned partition count.
    pub(crate) fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Memory reserved up front for the chosen partition count; compared
    /// against the allocator limit to decide on the spilling fallback.
    pub(crate) fn max_reserved_memory(&self) -> i64 {
        self.reserved_for(self.num_partitions)
    }

    fn reserved_for(&self, num_partitions: usize) -> i64 {
        match &self.strategy {
            CalcStrategy::BatchCount { .. } => 0,
            CalcStrategy::Estimate {
                safety_factor,
                fragmentation_factor,
                ..
            } => {
                // Each partition keeps a pending batch plus one completed
                // batch in flight while the build drains.
                let per_partition =
                    (self.build_batch_bytes as f64 * 2.0 * fragmentation_factor * safety_factor)
                        as i64;
                let probe_reserve = if self.probe_empty {
                    0
                } else {
                    (self.probe_batch_bytes as f64 * fragmentation_factor) as i64
                };
                (num_partitions as i64)
                    .saturating_mul(per_partition)
                    .saturating_add(probe_reserve)
                    .saturating_add(self.output_batch_bytes)
            }
        }
    }

    /// Record a completed in-memory batch for `partition`.
    pub(crate) fn batch_completed(&mut self, partition: usize, bytes: i64) {
        self.in_memory_batches += 1;
        if let Some(slot) = self.partition_bytes.get_mut(partition) {
            *slot = slot.saturating_add(bytes);
        }
    }

    /// Forget the in-memory footprint of a partition that spilled.
    pub(crate) fn partition_spilled(&mut self, partition: usize, batches: usize) {
        self.in_memory_batches = self.in_memory_batches.saturating_sub(batches);
        if let Some(slot) = self.partition_bytes.get_mut(partition) {
            *slot = 0;
        }
    }

    /// Consulted after a partition completes a batch; true tells the caller
    /// to spill that partition now.
    pub(crate) fn should_spill(&mut self) -> bool {
        if !self.do_calc {
            return false;
        }
        match &self.strategy {
            CalcStrategy::BatchCount { max_batches } => self.in_memory_batches > *max_batches,
            CalcStrategy::Estimate {
                fragmentation_factor,
                ..
            } => {
                let in_memory: i64 = self.partition_bytes.iter().sum();
                let consumed = (in_memory as f64 * fragmentation_factor) as i64;
                let probe_reserve = if self.probe_empty {
                    0
                } else {
                    (self.probe_batch_bytes as f64 * fragmentation_factor) as i64
                };
                consumed
                    .saturating_add(probe_reserve)
                    .saturating_add(self.output_batch_bytes)
                    > self.mem_limit
            }
        }
    }

    pub(crate) fn next(self) -> PostBuildCalculations {
        PostBuildCalculations {
            strategy: self.strategy,
            do_calc: self.do_calc,
            probe_empty: self.probe_empty,
            mem_limit: self.mem_limit,
            probe_batch_bytes: self.probe_batch_bytes,
            output_batch_bytes: self.output_batch_bytes,
            available: 0,
            kept_batches: 0,
            kept_partitions: 0,
            spill_decisions: 0,
        }
    }

    pub(crate) fn make_debug_string(&self) -> String {
        format!(
            "BuildSidePartitioning[strategy={:?} do_calc={} first_cycle={} probe_empty={} \
             mem_limit={} num_partitions={} records_per_batch={} build_batch_bytes={} \
             probe_batch_bytes={} in_memory_batches={}]",
            self.strategy,
            self.do_calc,
            self.first_cycle,
            self.probe_empty,
            self.mem_limit,
            self.num_partitions,
            self.records_per_batch,
            self.build_batch_bytes,
            self.probe_batch_bytes,
            self.in_memory_batches
        )
    }
}

/// Stateful keep-or-spill decisions made per partition, in index order,
/// after the build drain.
#[derive(Debug)]
pub(crate) struct PostBuildCalculations {
    strategy: CalcStrategy,
    do_calc: bool,
    probe_empty: bool,
    mem_limit: i64,
    probe_batch_bytes: i64,
    output_batch_bytes: i64,
    available: i64,
    kept_batches: usize,
    kept_partitions: usize,
    spill_decisions: usize,
}

impl PostBuildCalculations {
    pub(crate) fn initialize(&mut self, probe_empty: bool) {
        self.probe_empty = probe_empty;
        self.kept_batches = 0;
        self.kept_partitions = 0;
        self.spill_decisions = 0;
        let probe_reserve = if probe_empty {
            0
        } else {
            self.probe_batch_bytes
        };
        self.available = self
            .mem_limit
            .saturating_sub(self.output_batch_bytes)
            .saturating_sub(probe_reserve);
    }

    /// Decide the fate of the next in-memory partition. Each call updates
    /// the accounting with the partition it just admitted or evicted.
    pub(crate) fn should_spill(
        &mut self,
        in_memory_bytes: i64,
        in_memory_batches: usize,
        num_rows: usize,
    ) -> bool {
        if !self.do_calc {
            self.kept_partitions += 1;
            self.kept_batches += in_memory_batches;
            return false;
        }
        match &self.strategy {
            CalcStrategy::BatchCount { max_batches } => {
                if self.kept_batches + in_memory_batches > *max_batches {
                    self.spill_decisions += 1;
                    true
                } else {
                    self.kept_partitions += 1;
                    self.kept_batches += in_memory_batches;
                    false
                }
            }
            CalcStrategy::Estimate {
                safety_factor,
                fragmentation_factor,
                doubling_factor,
                conservative,
            } => {
                let table_scale = if *conservative { 1.5 } else { 1.0 };
                let table_bytes = (num_rows as f64
                    * HASH_TABLE_ENTRY_BYTES
                    * doubling_factor
                    * table_scale
                    * safety_factor) as i64;
                let need = ((in_memory_bytes as f64 * fragmentation_factor) as i64)
                    .saturating_add(table_bytes);
                if need > self.available {
                    // A spilled partition still buffers one probe-side batch
                    // for its outer file.
                    self.available = self.available.saturating_sub(self.probe_batch_bytes);
                    self.spill_decisions += 1;
                    true
                } else {
                    self.available -= need;
                    self.kept_partitions += 1;
                    self.kept_batches += in_memory_batches;
                    false
                }
            }
        }
    }

    pub(crate) fn make_debug_string(&self) -> String {
        format!(
            "PostBuildCalculations[strategy={:?} do_calc={} probe_empty={} mem_limit={} \
             available={} kept_partitions={} kept_batches={} spill_decisions={}]",
            self.strategy,
            self.do_calc,
            self.probe_empty,
            self.mem_limit,
            self.available,
            self.kept_partitions,
            self.kept_batches,
            self.spill_decisions
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimate_options() -> JoinOptions {
        JoinOptions::default()
    }

    fn batch_count_options(max: usize) -> JoinOptions {
        JoinOptions {
            max_batches_in_memory: max,
            ..JoinOptions::default()
        }
    }

    fn build_calc(options: &JoinOptions, do_calc: bool) -> BuildSidePartitioning {
        let mut calc = MemoryCalculator::from_options(options);
        calc.initialize(do_calc);
        calc.next()
    }

    #[test]
    fn partition_tuning_halves_until_reservation_fits() {
        let mut calc = build_calc(&estimate_options(), true);
        // 16 partitions of ~2KB double-buffered cannot fit in 16KB.
        calc.initialize(true, false, 16 * 1024, 16, 1024, 2048, 1024, 4096);
        assert!(calc.num_partitions() < 16);
        assert!(calc.num_partitions() >= MIN_TUNED_PARTITIONS);
        assert!(calc.num_partitions().is_power_of_two());
    }

    #[test]
    fn no_calculation_never_spills() {
        let mut calc = build_calc(&estimate_options(), false);
        calc.initialize(true, false, 1, 4, 1024, 1 << 20, 1 << 20, 1 << 20);
        calc.batch_completed(0, 1 << 30);
        assert!(!calc.should_spill());
        let mut post = calc.next();
        post.initialize(false);
        assert!(!post.should_spill(1 << 30, 100, 1_000_000));
    }

    #[test]
    fn batch_count_strategy_spills_past_the_limit() {
        let mut calc = build_calc(&batch_count_options(2), true);
        calc.initialize(true, false, i64::MAX, 4, 1024, 1024, 1024, 4096);
        calc.batch_completed(0, 1024);
        assert!(!calc.should_spill());
        calc.batch_completed(1, 1024);
        calc.batch_completed(2, 1024);
        assert!(calc.should_spill());
        calc.partition_spilled(2, 1);
        assert!(!calc.should_spill());
    }

    #[test]
    fn post_build_decisions_are_stateful() {
        let mut calc = build_calc(&batch_count_options(3), true);
        calc.initialize(true, false, i64::MAX, 4, 1024, 1024, 1024, 4096);
        let mut post = calc.next();
        post.initialize(false);
        assert!(!post.should_spill(1024, 2, 10));
        // Admitting two more batches would exceed the limit of three.
        assert!(post.should_spill(1024, 2, 10));
        assert!(!post.should_spill(1024, 1, 10));
    }

    #[test]
    fn estimate_post_build_spills_when_tables_do_not_fit() {
        let mut calc = build_calc(&estimate_options(), true);
        calc.initialize(true, false, 64 * 1024, 2, 1024, 4096, 4096, 8192);
        let mut post = calc.next();
        post.initialize(false);
        // A small partition fits.
        assert!(!post.should_spill(8192, 2, 100));
        // A huge partition does not.
        assert!(post.should_spill(1 << 20, 64, 100_000));
    }
}
