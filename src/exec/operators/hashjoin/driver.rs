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
//! Top-level hash join operator: the pull state machine.
//!
//! Responsibilities:
//! - Drives schema discovery, the partitioned build phase, probing, and the
//!   cycle-by-cycle reprocessing of spilled partition pairs.
//! - Owns the operator allocator, the spill set, the runtime filter
//!   emission, and cleanup on every exit path.
//!
//! Key exported interfaces:
//! - Types: `HashJoinOperator`.

use std::sync::Arc;

use arrow::array::UInt32Array;
use arrow::datatypes::{Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use arrow::row::RowConverter;

use super::join_hash_table::{fold_hash, key_converter, key_hash, serialize_keys};
use super::memory_calc::{BuildSidePartitioning, MemoryCalculator};
use super::output::{estimated_row_bytes, join_output_schema};
use super::partition::HashPartition;
use super::probe::{Probe, ProbeState};
use super::runtime_filter::{RuntimeFilterBuilder, RuntimeFilterSink};
use super::spill_queue::{SpillQueue, SpilledPartitionRef};
use super::{JoinOptions, JoinSpec, join_type_str};
use crate::common::logging::{debug, info, warn};
use crate::exec::batch_stream::{BatchStream, ChunkQueueStream, Outcome};
use crate::exec::chunk::Chunk;
use crate::exec::spill::spill_stream::SpilledBatchReader;
use crate::exec::spill::{SpillConfig, SpillSet, spilled_schema_for};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::{CounterUnit, RuntimeProfile};

const MAX_TARGET_OUTPUT_ROWS: usize = 65536;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BatchState {
    BuildSchema,
    First,
    NotFirst,
    Done,
}

/// Partitioned, spill-capable hash join. Pull `next()` until it reports
/// end-of-stream, collecting each produced batch with `take_output()`.
pub struct HashJoinOperator {
    name: String,
    spec: JoinSpec,
    options: JoinOptions,
    join_is_left_or_full: bool,
    join_is_right_or_full: bool,

    allocator: Arc<MemTracker>,
    spill_set: Arc<SpillSet>,

    build_input: Box<dyn BatchStream>,
    probe_input: Box<dyn BatchStream>,
    build_from_spill: bool,
    probe_from_spill: bool,

    state: BatchState,
    prefetched_build: bool,
    prefetched_probe: bool,
    build_side_is_empty: bool,
    probe_side_is_empty: bool,
    staged_build: Option<Chunk>,
    staged_probe: Option<Chunk>,

    build_schema: Option<SchemaRef>,
    probe_schema: Option<SchemaRef>,
    output_schema: Option<SchemaRef>,
    build_key_converter: Option<RowConverter>,

    skip_hash_table_build: bool,
    can_spill: bool,
    was_killed: bool,
    cleaned_up: bool,

    num_partitions: usize,
    partitions: Vec<HashPartition>,
    spill_queue: SpillQueue,
    spilled_inners: Vec<Option<SpilledPartitionRef>>,
    current_origin_partition: i32,

    probe: Option<Probe>,
    runtime_filter: Option<RuntimeFilterBuilder>,
    filter_sink: Option<Box<dyn RuntimeFilterSink>>,
    filters_emitted: bool,

    output: Option<Chunk>,
    output_records: usize,
    target_output_rows: usize,
    output_batch_bytes: usize,
    first_build_batch_bytes: i64,
    first_probe_batch_bytes: i64,

    profile: RuntimeProfile,
    left_input_batches: u64,
    left_input_rows: u64,
    left_input_bytes: u64,
    right_input_batches: u64,
    right_input_rows: u64,
    right_input_bytes: u64,
    output_batches: u64,
    output_rows: u64,
    output_bytes: u64,
}

impl HashJoinOperator {
    pub fn new(
        spec: JoinSpec,
        options: JoinOptions,
        probe_input: Box<dyn BatchStream>,
        build_input: Box<dyn BatchStream>,
        filter_sink: Option<Box<dyn RuntimeFilterSink>>,
    ) -> Result<Self, String> {
        if spec.build_key_indices.is_empty() {
            return Err("hash join requires at least one key column".to_string());
        }
        if spec.build_key_indices.len() != spec.probe_key_indices.len() {
            return Err(format!(
                "hash join key count mismatch: build={} probe={}",
                spec.build_key_indices.len(),
                spec.probe_key_indices.len()
            ));
        }

        let name = format!("HASH_JOIN (id={})", spec.operator_id);
        let allocator = MemTracker::new_root(name.clone());
        if options.max_memory > 0 {
            allocator.set_limit(options.max_memory);
        }
        info!(
            "{}: join_type={} memory_limit={} num_partitions={} records_per_batch={}",
            name,
            join_type_str(spec.join_type),
            allocator.limit(),
            options.num_partitions,
            options.records_per_batch
        );

        let spill_config = SpillConfig {
            local_dirs: options.spill_dirs.clone(),
            codec: options.spill_codec,
        };
        let spill_set = SpillSet::new(&spill_config, spec.operator_id)?;

        // Cap the output batch at a power-of-two share of the memory limit.
        let output_batch_bytes = if allocator.limit() > 0 {
            let avail = ((allocator.limit() as f64 * options.output_batch_size_avail_mem_factor)
                as u64)
                .max(1);
            let highest_one_bit = 1usize << (63 - avail.leading_zeros()) as usize;
            options.output_batch_size.min(highest_one_bit)
        } else {
            options.output_batch_size
        };

        let join_type = spec.join_type;
        let configured_partitions = options.num_partitions.max(1).next_power_of_two();
        let profile = RuntimeProfile::new(name.clone());
        profile.add_info_string("JoinType", join_type_str(join_type));

        let mut operator = Self {
            name,
            join_is_left_or_full: join_type.preserves_probe(),
            join_is_right_or_full: join_type.preserves_build(),
            allocator,
            spill_set,
            build_input,
            probe_input,
            build_from_spill: false,
            probe_from_spill: false,
            state: BatchState::BuildSchema,
            prefetched_build: false,
            prefetched_probe: false,
            build_side_is_empty: false,
            probe_side_is_empty: false,
            staged_build: None,
            staged_probe: None,
            build_schema: None,
            probe_schema: None,
            output_schema: None,
            build_key_converter: None,
            skip_hash_table_build: false,
            can_spill: true,
            was_killed: false,
            cleaned_up: false,
            num_partitions: configured_partitions,
            partitions: Vec::new(),
            spill_queue: SpillQueue::default(),
            spilled_inners: Vec::new(),
            current_origin_partition: -1,
            probe: None,
            runtime_filter: None,
            filter_sink,
            filters_emitted: false,
            output: None,
            output_records: 0,
            target_output_rows: 1024,
            output_batch_bytes,
            first_build_batch_bytes: 0,
            first_probe_batch_bytes: 0,
            profile,
            left_input_batches: 0,
            left_input_rows: 0,
            left_input_bytes: 0,
            right_input_batches: 0,
            right_input_rows: 0,
            right_input_bytes: 0,
            output_batches: 0,
            output_rows: 0,
            output_bytes: 0,
            spec,
            options,
        };

        if operator.options.num_partitions == 1 {
            operator.disable_spilling(Some(
                "spilling is disabled due to configuration setting of num_partitions to 1",
            ))?;
        }
        Ok(operator)
    }

    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    pub fn schema(&self) -> Option<SchemaRef> {
        self.output_schema.clone()
    }

    pub fn record_count(&self) -> usize {
        self.output_records
    }

    pub fn take_output(&mut self) -> Option<Chunk> {
        self.output.take()
    }

    /// Ask the operator to stop. The next `next()` call drains both inputs,
    /// deletes spill files and reports end-of-stream.
    pub fn cancel(&mut self) {
        self.was_killed = true;
        self.probe_input.cancel();
        self.build_input.cancel();
    }

    /// Idempotent teardown; safe on every path, including after errors.
    pub fn close(&mut self) {
        self.update_metrics();
        self.cleanup();
    }

    pub fn next(&mut self) -> Result<Outcome, String> {
        match self.next_inner() {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.cleanup();
                Err(e)
            }
        }
    }

    fn next_inner(&mut self) -> Result<Outcome, String> {
        if self.was_killed {
            self.drain_input(true);
            self.drain_input(false);
            self.state = BatchState::Done;
            self.cleanup();
            return Ok(Outcome::None);
        }

        match self.state {
            BatchState::Done => return Ok(Outcome::None),
            BatchState::BuildSchema => {
                self.discover_schemas()?;
                self.state = BatchState::First;
                let schema = self.output_schema.clone().expect("output schema");
                self.output = Some(Chunk::new(RecordBatch::new_empty(schema)));
                self.output_records = 0;
                return Ok(Outcome::OkNewSchema);
            }
            BatchState::First | BatchState::NotFirst => {}
        }

        loop {
            if self.state == BatchState::First {
                self.prefetch_first_build_batch()?;
                self.execute_build_phase()?;
            }

            if !self.build_side_is_empty || self.join_is_left_or_full {
                self.prefetch_first_probe_batch()?;

                let probe_dead_end = self.probe_side_is_empty && !self.join_is_right_or_full;
                if !probe_dead_end && (!self.build_side_is_empty || !self.probe_side_is_empty) {
                    if self.state == BatchState::First {
                        self.setup_probe()?;
                    }
                    let produced = self.probe_and_project()?;
                    if produced > 0 || self.state == BatchState::First {
                        self.state = BatchState::NotFirst;
                        return Ok(Outcome::Ok);
                    }
                }

                // Streaming output for this cycle is exhausted.
                self.finish_probe_cycle()?;

                if !self.build_side_is_empty {
                    let mut advanced = false;
                    while let Some(mut sp) = self.spill_queue.pop() {
                        if sp.outer_batches()? == 0 && !self.join_is_right_or_full {
                            // No probe rows reached this partition; no
                            // matches are possible.
                            debug!("skipping {}", sp.make_debug_string());
                            for file in sp.take_files() {
                                self.spill_set.delete_quietly(&file.path);
                            }
                            continue;
                        }
                        self.begin_spilled_cycle(sp)?;
                        advanced = true;
                        break;
                    }
                    if advanced {
                        continue;
                    }
                }
            } else {
                // Empty build side and nothing owed to the probe side.
                self.drain_input(true);
            }

            self.state = BatchState::Done;
            self.cleanup();
            return Ok(Outcome::None);
        }
    }

    /// Sniff the first non-empty batch on both sides and derive the
    /// schemas, the output schema and the short-circuit flags.
    fn discover_schemas(&mut self) -> Result<(), String> {
        self.prefetch_first_build_batch()?;
        self.prefetch_first_probe_batch()?;

        // The probe side starting at end-of-stream makes the hash table
        // useless unless build-preserving output is owed.
        self.skip_hash_table_build = self.probe_side_is_empty && !self.join_is_right_or_full;

        if let (Some(build_schema), Some(probe_schema)) =
            (self.build_schema.as_ref(), self.probe_schema.as_ref())
        {
            for (b, p) in self
                .spec
                .build_key_indices
                .iter()
                .zip(self.spec.probe_key_indices.iter())
            {
                let build_field = build_schema
                    .fields()
                    .get(*b)
                    .ok_or_else(|| format!("build key index {b} out of bounds"))?;
                let probe_field = probe_schema
                    .fields()
                    .get(*p)
                    .ok_or_else(|| format!("probe key index {p} out of bounds"))?;
                if build_field.data_type() != probe_field.data_type() {
                    return Err(format!(
                        "join key type mismatch: build {} is {:?}, probe {} is {:?}",
                        build_field.name(),
                        build_field.data_type(),
                        probe_field.name(),
                        probe_field.data_type()
                    ));
                }
            }
        }

        let probe_schema = self
            .probe_schema
            .clone()
            .unwrap_or_else(|| Arc::new(Schema::empty()));
        let build_schema = self
            .build_schema
            .clone()
            .unwrap_or_else(|| Arc::new(Schema::empty()));
        let output_schema = if self.spec.join_type.probe_only_output() {
            probe_schema
        } else {
            join_output_schema(
                &probe_schema,
                &build_schema,
                self.join_is_right_or_full,
                self.join_is_left_or_full,
            )
        };
        self.target_output_rows = (self.output_batch_bytes / estimated_row_bytes(&output_schema))
            .clamp(1, MAX_TARGET_OUTPUT_ROWS);
        self.output_schema = Some(output_schema);
        Ok(())
    }

    fn prefetch_first_build_batch(&mut self) -> Result<(), String> {
        if self.prefetched_build {
            return Ok(());
        }
        self.prefetched_build = true;
        let staged = self.sniff_non_empty_batch(false)?;
        self.build_side_is_empty = staged.is_none();
        if self.build_schema.is_none() {
            if let Some(schema) = self.build_input.schema() {
                self.build_schema = Some(schema);
            }
        }
        if let Some(chunk) = staged.as_ref() {
            if self.spill_queue.is_first_cycle() {
                self.first_build_batch_bytes = chunk.logical_bytes() as i64;
            }
        }
        self.staged_build = staged;
        Ok(())
    }

    fn prefetch_first_probe_batch(&mut self) -> Result<(), String> {
        if self.prefetched_probe {
            return Ok(());
        }
        self.prefetched_probe = true;
        let staged = self.sniff_non_empty_batch(true)?;
        self.probe_side_is_empty = staged.is_none();
        if self.probe_schema.is_none() {
            if let Some(schema) = self.probe_input.schema() {
                self.probe_schema = Some(schema);
            }
        }
        if let Some(chunk) = staged.as_ref() {
            if self.spill_queue.is_first_cycle() {
                self.first_probe_batch_bytes = chunk.logical_bytes() as i64;
            }
        }
        self.staged_probe = staged;
        Ok(())
    }

    /// Pull until the first batch that holds data; empty batches carry only
    /// schema information.
    fn sniff_non_empty_batch(&mut self, is_probe: bool) -> Result<Option<Chunk>, String> {
        loop {
            let input = if is_probe {
                &mut self.probe_input
            } else {
                &mut self.build_input
            };
            match input.next()? {
                Outcome::Ok | Outcome::OkNewSchema => {
                    let chunk = input.take_batch()?;
                    self.count_input(is_probe, &chunk);
                    if chunk.len() > 0 {
                        return Ok(Some(chunk));
                    }
                }
                Outcome::NotYet => continue,
                Outcome::None => return Ok(None),
            }
        }
    }

    fn count_input(&mut self, is_probe: bool, chunk: &Chunk) {
        if !self.spill_queue.is_first_cycle() {
            return;
        }
        let bytes = chunk.logical_bytes() as u64;
        if is_probe {
            self.left_input_batches += 1;
            self.left_input_rows += chunk.len() as u64;
            self.left_input_bytes += bytes;
        } else {
            self.right_input_batches += 1;
            self.right_input_rows += chunk.len() as u64;
            self.right_input_bytes += bytes;
        }
    }

    /// Drain build input, hash-partition its rows and decide which
    /// partitions stay resident.
    fn execute_build_phase(&mut self) -> Result<(), String> {
        if self.build_side_is_empty {
            return Ok(());
        }
        if self.skip_hash_table_build {
            // No hash table needed; consume the remaining build input.
            self.drain_input(false);
            return Ok(());
        }

        let first_cycle = self.spill_queue.is_first_cycle();
        let do_calc = self.can_spill && !self.probe_side_is_empty;
        let mem_limit = self.effective_mem_limit();

        let mut calc = MemoryCalculator::from_options(&self.options);
        calc.initialize(do_calc);
        let mut build_calc = calc.next();
        build_calc.initialize(
            first_cycle,
            self.probe_side_is_empty,
            mem_limit,
            self.num_partitions,
            self.options.records_per_batch,
            self.first_build_batch_bytes,
            self.first_probe_batch_bytes,
            self.output_batch_bytes as i64,
        );

        if first_cycle && do_calc {
            self.num_partitions = build_calc.num_partitions();
            debug!("{}", build_calc.make_debug_string());
            if build_calc.max_reserved_memory() > mem_limit {
                // Partitioning cannot fit; fall back to unbounded
                // single-partition operation or fail.
                self.disable_spilling(None)?;
                let mut calc = MemoryCalculator::from_options(&self.options);
                calc.initialize(false);
                build_calc = calc.next();
                build_calc.initialize(
                    first_cycle,
                    self.probe_side_is_empty,
                    self.effective_mem_limit(),
                    self.num_partitions,
                    self.options.records_per_batch,
                    self.first_build_batch_bytes,
                    self.first_probe_batch_bytes,
                    self.output_batch_bytes as i64,
                );
            }
        }
        if first_cycle {
            self.spill_queue.initialize(self.num_partitions);
        }

        if self.build_key_converter.is_none() {
            let build_schema = self
                .build_schema
                .as_ref()
                .ok_or_else(|| "build schema missing for hash table setup".to_string())?;
            let key_types = self
                .spec
                .build_key_indices
                .iter()
                .map(|idx| {
                    build_schema
                        .fields()
                        .get(*idx)
                        .map(|f| f.data_type().clone())
                        .ok_or_else(|| format!("build key index {idx} out of bounds"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            self.build_key_converter = Some(key_converter(&key_types)?);
        }

        self.create_partitions()?;

        if first_cycle && !self.filters_emitted {
            if let Some(def) = self.spec.runtime_filter.as_ref() {
                let build_schema = self
                    .build_schema
                    .as_ref()
                    .ok_or_else(|| "build schema missing for runtime filter".to_string())?;
                self.runtime_filter = Some(RuntimeFilterBuilder::new(def, build_schema.as_ref()));
            }
        }

        // Drain the build side.
        while let Some(chunk) = self.next_build_batch()? {
            self.route_build_batch(chunk, &mut build_calc)?;
        }
        if self.num_partitions > 1 {
            for partition in self.partitions.iter_mut() {
                partition.complete_pending(&mut build_calc)?;
            }
        }

        if first_cycle {
            if let Some(builder) = self.runtime_filter.take() {
                if let Some(sink) = self.filter_sink.as_ref() {
                    debug!("{}: sending runtime filters downstream", self.name);
                    builder.emit(sink.as_ref(), self.spec.operator_id);
                }
            }
            self.filters_emitted = true;
        }

        // The post-build calculator needs to know whether probe data exists.
        self.prefetch_first_probe_batch()?;

        let mut post_calc = build_calc.next();
        post_calc.initialize(self.probe_side_is_empty);
        for index in 0..self.partitions.len() {
            if self.partitions[index].is_spilled() {
                continue;
            }
            let spill_now = post_calc.should_spill(
                self.partitions[index].in_memory_bytes(),
                self.partitions[index].in_memory_batches(),
                self.partitions[index].in_memory_rows(),
            );
            if spill_now {
                self.partitions[index].spill(None)?;
            } else {
                let converter = self.build_key_converter.as_ref().expect("key converter");
                let null_safe = self.spec.join_type.null_safe_keys();
                self.partitions[index]
                    .build_hash_table(
                        converter,
                        &self.spec.build_key_indices,
                        null_safe,
                        &self.allocator,
                    )
                    .map_err(|e| {
                        format!(
                            "{e}\n{}\n{}",
                            self.make_debug_string(),
                            post_calc.make_debug_string()
                        )
                    })?;
            }
        }
        debug!("{}", post_calc.make_debug_string());

        // Stage a spilled-pair ref per spilled partition; the outer side is
        // attached when the probe drain completes.
        self.spilled_inners = Vec::with_capacity(self.num_partitions);
        for _ in 0..self.num_partitions {
            self.spilled_inners.push(None);
        }
        for index in 0..self.partitions.len() {
            if !self.partitions[index].is_spilled() {
                continue;
            }
            let (file, batches) = self.partitions[index].finish_spill()?;
            let sp = SpilledPartitionRef::new(
                self.spill_queue.cycle(),
                index,
                self.current_origin_partition,
                file,
                batches,
            );
            self.spilled_inners[index] = Some(sp);
        }

        self.update_build_stats();
        Ok(())
    }

    fn effective_mem_limit(&self) -> i64 {
        let limit = self.allocator.limit();
        if limit >= 0 { limit } else { i64::MAX }
    }

    fn create_partitions(&mut self) -> Result<(), String> {
        let build_schema = self
            .build_schema
            .clone()
            .ok_or_else(|| "build schema missing for partition setup".to_string())?;
        let probe_schema = self
            .probe_schema
            .clone()
            .unwrap_or_else(|| Arc::new(Schema::empty()));
        let cycle = self.spill_queue.cycle();
        self.partitions = (0..self.num_partitions)
            .map(|index| {
                HashPartition::new(
                    index,
                    cycle,
                    build_schema.clone(),
                    probe_schema.clone(),
                    self.options.records_per_batch,
                    self.num_partitions == 1,
                    &self.allocator,
                    Arc::clone(&self.spill_set),
                )
            })
            .collect();
        Ok(())
    }

    fn next_build_batch(&mut self) -> Result<Option<Chunk>, String> {
        if let Some(chunk) = self.staged_build.take() {
            return Ok(Some(chunk));
        }
        loop {
            match self.build_input.next()? {
                Outcome::Ok => {
                    let chunk = self.build_input.take_batch()?;
                    self.count_input(false, &chunk);
                    if chunk.len() > 0 {
                        return Ok(Some(chunk));
                    }
                }
                Outcome::OkNewSchema => {
                    let chunk = self.build_input.take_batch()?;
                    self.count_input(false, &chunk);
                    self.check_build_schema(&chunk)?;
                    if chunk.len() > 0 {
                        return Ok(Some(chunk));
                    }
                }
                Outcome::None | Outcome::NotYet => return Ok(None),
            }
        }
    }

    fn expected_build_schema(&self) -> Option<SchemaRef> {
        let schema = self.build_schema.as_ref()?;
        if self.build_from_spill {
            Some(spilled_schema_for(schema))
        } else {
            Some(schema.clone())
        }
    }

    fn check_build_schema(&self, chunk: &Chunk) -> Result<(), String> {
        let Some(expected) = self.expected_build_schema() else {
            return Ok(());
        };
        let incoming = chunk.schema();
        if incoming.fields() != expected.fields() {
            return Err(format!(
                "hash join does not support schema changes in build side: had {expected}, got {incoming}",
            ));
        }
        Ok(())
    }

    /// Route one build batch into the partitions. On the first cycle the
    /// key hash is computed here; on later cycles it is read back from the
    /// hidden hash-value column.
    fn route_build_batch(
        &mut self,
        chunk: Chunk,
        build_calc: &mut BuildSidePartitioning,
    ) -> Result<(), String> {
        let (data_chunk, raw_hashes) = if self.build_from_spill {
            let columns = chunk.batch.columns();
            let n = columns.len();
            if n < 2 {
                return Err("spilled build batch is missing the hash-value column".to_string());
            }
            let hashes = columns[n - 1]
                .as_any()
                .downcast_ref::<UInt32Array>()
                .ok_or_else(|| "spilled hash-value column must be UInt32".to_string())?
                .values()
                .to_vec();
            let schema = self
                .build_schema
                .clone()
                .ok_or_else(|| "build schema missing".to_string())?;
            let data = RecordBatch::try_new(schema, columns[..n - 1].to_vec())
                .map_err(|e| e.to_string())?;
            (Chunk::new(data), Some(hashes))
        } else {
            (chunk, None)
        };

        if let Some(builder) = self.runtime_filter.as_mut() {
            builder.add_build_batch(&data_chunk)?;
        }

        if self.num_partitions == 1 {
            return self.partitions[0].append_batch(data_chunk);
        }

        let raw_hashes = match raw_hashes {
            Some(hashes) => hashes,
            None => {
                let converter = self.build_key_converter.as_ref().expect("key converter");
                let rows = serialize_keys(converter, &data_chunk, &self.spec.build_key_indices)?;
                (0..data_chunk.len())
                    .map(|row| fold_hash(key_hash(rows.row(row).data())))
                    .collect()
            }
        };

        let mask = self.spill_queue.partition_mask();
        let bits = self.spill_queue.bits_in_mask();
        let mut per_partition: Vec<(Vec<u32>, Vec<u32>)> =
            vec![(Vec::new(), Vec::new()); self.num_partitions];
        for (row, raw) in raw_hashes.iter().enumerate() {
            let part = (raw & mask) as usize;
            per_partition[part].0.push(row as u32);
            per_partition[part].1.push(raw >> bits);
        }
        for (part, (indices, hashes)) in per_partition.into_iter().enumerate() {
            if indices.is_empty() {
                continue;
            }
            self.partitions[part].append_inner_rows(&data_chunk, &indices, &hashes, build_calc)?;
        }
        Ok(())
    }

    fn setup_probe(&mut self) -> Result<(), String> {
        let probe_schema = self
            .probe_schema
            .clone()
            .unwrap_or_else(|| Arc::new(Schema::empty()));
        let build_schema = self
            .build_schema
            .clone()
            .unwrap_or_else(|| Arc::new(Schema::empty()));
        let output_schema = self
            .output_schema
            .clone()
            .ok_or_else(|| "output schema missing for probe setup".to_string())?;

        let key_types = self
            .spec
            .probe_key_indices
            .iter()
            .map(|idx| {
                probe_schema
                    .fields()
                    .get(*idx)
                    .map(|f| f.data_type().clone())
                    .ok_or_else(|| format!("probe key index {idx} out of bounds"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let converter = key_converter(&key_types)?;

        let mut probe = Probe::new(
            self.spec.join_type,
            self.spec.probe_key_indices.clone(),
            converter,
            probe_schema,
            build_schema,
            output_schema,
        );
        probe.setup_partitions(&self.partitions);
        self.probe = Some(probe);
        Ok(())
    }

    fn probe_and_project(&mut self) -> Result<usize, String> {
        let target = self.target_output_rows;
        let mut probe = self
            .probe
            .take()
            .ok_or_else(|| "probe engine missing".to_string())?;
        probe.set_target_output_count(target);

        let result = self.drive_probe(&mut probe, target);
        let output = match result {
            Ok(()) => probe.take_output(),
            Err(e) => {
                self.probe = Some(probe);
                return Err(e);
            }
        };
        self.probe = Some(probe);

        match output? {
            Some(mut chunk) => {
                self.output_records = chunk.len();
                self.output_batches += 1;
                self.output_rows += chunk.len() as u64;
                self.output_bytes += chunk.logical_bytes() as u64;
                chunk.transfer_to(&self.allocator);
                self.output = Some(chunk);
            }
            None => {
                self.output_records = 0;
                self.output = None;
            }
        }
        Ok(self.output_records)
    }

    fn drive_probe(&mut self, probe: &mut Probe, target: usize) -> Result<(), String> {
        loop {
            if probe.pending_output_rows() >= target {
                return Ok(());
            }
            match probe.state() {
                ProbeState::ProbeProject => {
                    if probe.has_pending_rows() {
                        probe.process_current(&self.partitions)?;
                        continue;
                    }
                    match self.next_probe_batch()? {
                        Some(chunk) => {
                            probe.load_probe_chunk(
                                chunk,
                                self.probe_from_spill,
                                &mut self.partitions,
                                self.spill_queue.partition_mask(),
                                self.spill_queue.bits_in_mask(),
                            )?;
                        }
                        None => probe.change_to_final_probe_state(),
                    }
                }
                ProbeState::ProjectBuild => {
                    let before = probe.pending_output_rows();
                    probe.project_build_unmatched(&self.partitions)?;
                    if probe.state() == ProbeState::ProjectBuild
                        && probe.pending_output_rows() == before
                    {
                        return Ok(());
                    }
                }
                ProbeState::Done => return Ok(()),
            }
        }
    }

    fn next_probe_batch(&mut self) -> Result<Option<Chunk>, String> {
        if let Some(chunk) = self.staged_probe.take() {
            return Ok(Some(chunk));
        }
        loop {
            match self.probe_input.next()? {
                Outcome::Ok => {
                    let chunk = self.probe_input.take_batch()?;
                    self.count_input(true, &chunk);
                    if chunk.len() > 0 {
                        return Ok(Some(chunk));
                    }
                }
                Outcome::OkNewSchema => {
                    let chunk = self.probe_input.take_batch()?;
                    self.count_input(true, &chunk);
                    self.check_probe_schema(&chunk)?;
                    if chunk.len() > 0 {
                        return Ok(Some(chunk));
                    }
                }
                Outcome::None | Outcome::NotYet => return Ok(None),
            }
        }
    }

    fn check_probe_schema(&self, chunk: &Chunk) -> Result<(), String> {
        let Some(schema) = self.probe_schema.as_ref() else {
            return Ok(());
        };
        let expected = if self.probe_from_spill {
            spilled_schema_for(schema)
        } else {
            schema.clone()
        };
        let incoming = chunk.schema();
        if incoming.fields() != expected.fields() {
            return Err(format!(
                "hash join does not support schema changes in probe side: had {expected}, got {incoming}",
            ));
        }
        Ok(())
    }

    /// Attach the outer files to the staged spilled-pair refs, enqueue them,
    /// and free the in-memory partition structures (spill files survive).
    fn finish_probe_cycle(&mut self) -> Result<(), String> {
        for index in 0..self.spilled_inners.len() {
            if let Some(mut sp) = self.spilled_inners[index].take() {
                let (outer_batches, outer_file) = self.partitions[index].finish_outer()?;
                sp.update_outer(outer_batches, outer_file)?;
                debug!("queueing {}", sp.make_debug_string());
                self.spill_queue.push(sp);
            }
        }
        for partition in self.partitions.iter_mut() {
            partition.release_memory();
        }
        Ok(())
    }

    /// Rebind the inputs to the spilled pair's files and re-enter the state
    /// machine at the build phase.
    fn begin_spilled_cycle(&mut self, mut sp: SpilledPartitionRef) -> Result<(), String> {
        self.spill_queue.update_cycle(&sp, self.effective_mem_limit())?;
        self.profile.counter_set(
            "SpillCycle",
            CounterUnit::Unit,
            self.spill_queue.cycle() as i64,
        );

        let build_schema = self
            .build_schema
            .clone()
            .ok_or_else(|| "build schema missing for spilled cycle".to_string())?;
        let outer_batches = sp.outer_batches()?;
        self.current_origin_partition = sp.origin_partition() as i32;

        let inner_file = sp.take_inner_file()?;
        let reader = SpilledBatchReader::open(
            Arc::clone(&self.spill_set),
            inner_file,
            spilled_schema_for(&build_schema),
        )?;
        self.build_input = Box::new(reader);
        self.build_from_spill = true;

        if outer_batches > 0 {
            let probe_schema = self
                .probe_schema
                .clone()
                .ok_or_else(|| "probe schema missing for spilled cycle".to_string())?;
            let outer_file = sp
                .take_outer_file()?
                .ok_or_else(|| "spilled partition outer file missing".to_string())?;
            let reader = SpilledBatchReader::open(
                Arc::clone(&self.spill_set),
                outer_file,
                spilled_schema_for(&probe_schema),
            )?;
            self.probe_input = Box::new(reader);
            self.probe_from_spill = true;
        } else {
            // No spilled probe rows; the probe phase goes straight to the
            // final projection pass.
            let probe_schema = self
                .probe_schema
                .clone()
                .unwrap_or_else(|| Arc::new(Schema::empty()));
            self.probe_input = Box::new(ChunkQueueStream::empty(probe_schema));
            self.probe_from_spill = false;
        }

        self.prefetched_build = false;
        self.prefetched_probe = false;
        self.staged_build = None;
        self.staged_probe = None;
        self.build_side_is_empty = false;
        self.probe_side_is_empty = false;
        self.state = BatchState::First;
        Ok(())
    }

    /// Give up on partitioning: one resident partition, unbounded memory.
    fn disable_spilling(&mut self, reason: Option<&str>) -> Result<(), String> {
        match reason {
            Some(reason) => warn!("{}: {}", self.name, reason),
            None => {
                if !self.options.fallback_enabled {
                    return Err(format!(
                        "not enough memory for internal partitioning and the fallback to \
                         unbounded memory is disabled for {}; enable the hashjoin fallback \
                         option or increase the operator memory limit",
                        self.name
                    ));
                }
                warn!(
                    "{}: spilling is disabled - not enough memory available for internal \
                     partitioning, falling back to unbounded memory",
                    self.name
                );
            }
        }
        self.num_partitions = 1;
        self.can_spill = false;
        self.allocator.set_limit(i64::MAX);
        Ok(())
    }

    fn drain_input(&mut self, is_probe: bool) {
        if is_probe {
            self.staged_probe = None;
        } else {
            self.staged_build = None;
        }
        let input = if is_probe {
            &mut self.probe_input
        } else {
            &mut self.build_input
        };
        input.cancel();
        loop {
            match input.next() {
                Ok(outcome) if outcome.carries_batch() => {
                    let _ = input.take_batch();
                }
                Ok(_) | Err(_) => break,
            }
        }
    }

    fn update_build_stats(&mut self) {
        if !self.spill_queue.is_first_cycle() {
            return;
        }
        let mut num_buckets = 0i64;
        let mut num_entries = 0i64;
        let mut num_spilled = 0i64;
        for partition in &self.partitions {
            if partition.is_spilled() {
                num_spilled += 1;
            }
            if let Some(table) = partition.hash_table() {
                num_buckets += table.num_buckets() as i64;
                num_entries += table.num_entries() as i64;
            }
        }
        self.profile
            .counter_set("NumBuckets", CounterUnit::Unit, num_buckets);
        self.profile
            .counter_set("NumEntries", CounterUnit::Unit, num_entries);
        self.profile
            .counter_set("NumResizing", CounterUnit::Unit, 0);
        self.profile
            .counter_set("ResizingTimeMs", CounterUnit::TimeMs, 0);
        self.profile.counter_set(
            "NumPartitions",
            CounterUnit::Unit,
            self.num_partitions as i64,
        );
        self.profile
            .counter_set("SpilledPartitions", CounterUnit::Unit, num_spilled);
        self.profile.counter_set(
            "SpillCycle",
            CounterUnit::Unit,
            self.spill_queue.cycle() as i64,
        );
    }

    fn update_metrics(&mut self) {
        self.profile.counter_set(
            "LeftInputBatchCount",
            CounterUnit::Unit,
            self.left_input_batches as i64,
        );
        self.profile.counter_set(
            "LeftInputRowCount",
            CounterUnit::Unit,
            self.left_input_rows as i64,
        );
        self.profile.counter_set(
            "LeftInputBytes",
            CounterUnit::Bytes,
            self.left_input_bytes as i64,
        );
        self.profile.counter_set(
            "RightInputBatchCount",
            CounterUnit::Unit,
            self.right_input_batches as i64,
        );
        self.profile.counter_set(
            "RightInputRowCount",
            CounterUnit::Unit,
            self.right_input_rows as i64,
        );
        self.profile.counter_set(
            "RightInputBytes",
            CounterUnit::Bytes,
            self.right_input_bytes as i64,
        );
        self.profile.counter_set(
            "OutputBatchCount",
            CounterUnit::Unit,
            self.output_batches as i64,
        );
        self.profile
            .counter_set("OutputRowCount", CounterUnit::Unit, self.output_rows as i64);
        self.profile
            .counter_set("OutputBytes", CounterUnit::Bytes, self.output_bytes as i64);
    }

    /// Per-partition statistics, attached to memory-related failures.
    pub fn make_debug_string(&self) -> String {
        let mut out = String::new();
        for partition in &self.partitions {
            out.push_str(&partition.make_debug_string());
            out.push('\n');
        }
        out
    }

    /// Release every resource: partition memory, unconsumed spill files,
    /// the spill working directory. Runs on DONE, cancel and error paths.
    fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        if self.spill_set.write_bytes() > 0 {
            let mb = (self.spill_set.write_bytes() as f64 / (1024.0 * 1024.0)).round() as i64;
            self.profile.counter_set("SpillMB", CounterUnit::Unit, mb);
        }

        for partition in self.partitions.iter_mut() {
            partition.close();
        }
        for slot in self.spilled_inners.iter_mut() {
            if let Some(mut sp) = slot.take() {
                for file in sp.take_files() {
                    self.spill_set.delete_quietly(&file.path);
                }
            }
        }
        for mut sp in self.spill_queue.drain() {
            for file in sp.take_files() {
                self.spill_set.delete_quietly(&file.path);
            }
        }

        // Dropping spilled readers deletes their backing files; the original
        // inputs were exhausted or cancelled before this point.
        if self.build_from_spill {
            self.build_input = Box::new(ChunkQueueStream::empty(Arc::new(Schema::empty())));
            self.build_from_spill = false;
        }
        if self.probe_from_spill {
            self.probe_input = Box::new(ChunkQueueStream::empty(Arc::new(Schema::empty())));
            self.probe_from_spill = false;
        }

        self.probe = None;
        self.spill_set.close();
        debug!(
            "{}: cleanup done, allocator current={} peak={}",
            self.name,
            self.allocator.current(),
            self.allocator.peak()
        );
    }
}

impl Drop for HashJoinOperator {
    fn drop(&mut self) {
        self.cleanup();
    }
}
