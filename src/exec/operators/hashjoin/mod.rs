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
//! Partitioned, spill-capable hash join operator.
//!
//! Responsibilities:
//! - Builds per-partition hash tables from the right (build) input, probes
//!   them with the left (probe) input, and recursively partitions both sides
//!   to disk when the memory budget is exceeded.
//! - Emits build-key Bloom filters downstream before probing begins.
//!
//! Key exported interfaces:
//! - Types: `HashJoinOperator`, `JoinType`, `JoinSpec`, `JoinOptions`.

pub mod driver;
pub mod join_hash_table;
pub mod memory_calc;
pub mod output;
pub mod partition;
pub mod probe;
pub mod runtime_filter;
pub mod spill_queue;

use std::path::PathBuf;

pub use driver::HashJoinOperator;
pub use runtime_filter::{BloomFilterDef, RuntimeFilterDef, RuntimeFilterEntry, RuntimeFilterSink};

use crate::exec::spill::SpillCodec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    LeftSemi,
    IntersectDistinct,
    ExceptDistinct,
}

impl JoinType {
    /// True when every probe-side row must appear in the output even without
    /// a build-side match.
    pub fn preserves_probe(self) -> bool {
        matches!(
            self,
            JoinType::LeftOuter | JoinType::FullOuter | JoinType::ExceptDistinct
        )
    }

    /// True when every build-side row must appear in the output even without
    /// a probe-side match.
    pub fn preserves_build(self) -> bool {
        matches!(self, JoinType::RightOuter | JoinType::FullOuter)
    }

    /// True when the output carries probe-side columns only.
    pub fn probe_only_output(self) -> bool {
        matches!(
            self,
            JoinType::LeftSemi | JoinType::IntersectDistinct | JoinType::ExceptDistinct
        )
    }

    /// Set-operation variants compare keys null-safely (NULL equals NULL).
    pub fn null_safe_keys(self) -> bool {
        matches!(self, JoinType::IntersectDistinct | JoinType::ExceptDistinct)
    }
}

pub fn join_type_str(join_type: JoinType) -> &'static str {
    match join_type {
        JoinType::Inner => "INNER",
        JoinType::LeftOuter => "LEFT_OUTER",
        JoinType::RightOuter => "RIGHT_OUTER",
        JoinType::FullOuter => "FULL_OUTER",
        JoinType::LeftSemi => "LEFT_SEMI",
        JoinType::IntersectDistinct => "INTERSECT_DISTINCT",
        JoinType::ExceptDistinct => "EXCEPT_DISTINCT",
    }
}

/// Plan-side description of one hash join instance.
#[derive(Clone, Debug)]
pub struct JoinSpec {
    pub operator_id: i32,
    pub join_type: JoinType,
    /// Key column indices into the build-side schema.
    pub build_key_indices: Vec<usize>,
    /// Key column indices into the probe-side schema, positionally paired
    /// with `build_key_indices`.
    pub probe_key_indices: Vec<usize>,
    pub runtime_filter: Option<RuntimeFilterDef>,
}

/// Construction-time tuning options.
#[derive(Clone, Debug)]
pub struct JoinOptions {
    /// Initial partition count; rounded up to a power of two. A value of 1
    /// disables spilling up front.
    pub num_partitions: usize,
    /// Operator memory limit in bytes; 0 inherits the tracker default.
    pub max_memory: i64,
    /// Row count of the operator's internal per-partition batches.
    pub records_per_batch: usize,
    /// When nonzero, selects the batch-count spill strategy with this limit.
    pub max_batches_in_memory: usize,
    pub safety_factor: f64,
    pub fragmentation_factor: f64,
    pub hash_table_doubling_factor: f64,
    /// "LEAN" or "CONSERVATIVE" hash table size estimation.
    pub hash_table_calc_type: String,
    /// Allow falling back to unbounded single-partition operation when the
    /// memory budget cannot support partitioning.
    pub fallback_enabled: bool,
    pub output_batch_size: usize,
    pub output_batch_size_avail_mem_factor: f64,
    pub spill_dirs: Vec<PathBuf>,
    pub spill_codec: SpillCodec,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            num_partitions: 32,
            max_memory: 0,
            records_per_batch: 1024,
            max_batches_in_memory: 0,
            safety_factor: 1.0,
            fragmentation_factor: 1.33,
            hash_table_doubling_factor: 2.0,
            hash_table_calc_type: "LEAN".to_string(),
            fallback_enabled: false,
            output_batch_size: 16 * 1024 * 1024,
            output_batch_size_avail_mem_factor: 0.1,
            spill_dirs: vec![std::env::temp_dir()],
            spill_codec: SpillCodec::None,
        }
    }
}
