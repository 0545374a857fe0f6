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
//! Probe engine: key lookup, match expansion and join-type row assembly.
//!
//! Responsibilities:
//! - Routes each probe row to its partition; probes resident hash tables and
//!   forwards rows of spilled partitions to their outer files.
//! - Emits joined rows per join variant, tracks matched build rows, and runs
//!   the final pass that projects unmatched build rows for build-preserving
//!   joins.
//!
//! Key exported interfaces:
//! - Types: `Probe`, `ProbeState`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use arrow::array::{RecordBatch, UInt32Array};
use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::row::{RowConverter, Rows};

use super::JoinType;
use super::join_hash_table::{fold_hash, key_hash, row_has_forbidden_null, serialize_keys};
use super::output::{
    build_with_null_probe, matched_join_batch, probe_only_batch, probe_with_null_build,
};
use super::partition::HashPartition;
use crate::exec::chunk::Chunk;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ProbeState {
    /// Streaming probe rows against the partitions.
    ProbeProject,
    /// Probe input exhausted; projecting unmatched build rows.
    ProjectBuild,
    Done,
}

struct ProbeCursor {
    chunk: Chunk,
    key_rows: Rows,
    /// Retained hash per row (routing bits already consumed).
    hashes: Vec<u32>,
    parts: Vec<u32>,
    forbidden_null: Vec<bool>,
    /// Rows left to probe, in order; rows of spilled partitions are routed
    /// to outer files at load time and never appear here.
    probe_rows: Vec<u32>,
    next_idx: usize,
}

pub(crate) struct Probe {
    join_type: JoinType,
    probe_key_indices: Vec<usize>,
    converter: RowConverter,
    probe_schema: SchemaRef,
    build_schema: SchemaRef,
    output_schema: SchemaRef,
    target_output: usize,
    state: ProbeState,
    cursor: Option<ProbeCursor>,
    emitted_keys: Option<HashSet<Vec<u8>>>,
    /// Per-partition, per-batch matched flags; populated only for
    /// build-preserving joins.
    matched_build: Vec<Vec<Vec<bool>>>,
    final_part: usize,
    final_batch: usize,
    final_row: usize,
    segments: Vec<RecordBatch>,
    segment_rows: usize,
    lookup_scratch: Vec<(u32, u32)>,
}

impl Probe {
    pub(crate) fn new(
        join_type: JoinType,
        probe_key_indices: Vec<usize>,
        converter: RowConverter,
        probe_schema: SchemaRef,
        build_schema: SchemaRef,
        output_schema: SchemaRef,
    ) -> Self {
        let emitted_keys = if join_type.null_safe_keys() {
            Some(HashSet::new())
        } else {
            None
        };
        Self {
            join_type,
            probe_key_indices,
            converter,
            probe_schema,
            build_schema,
            output_schema,
            target_output: 1,
            state: ProbeState::ProbeProject,
            cursor: None,
            emitted_keys,
            matched_build: Vec::new(),
            final_part: 0,
            final_batch: 0,
            final_row: 0,
            segments: Vec::new(),
            segment_rows: 0,
            lookup_scratch: Vec::new(),
        }
    }

    pub(crate) fn state(&self) -> ProbeState {
        self.state
    }

    pub(crate) fn set_target_output_count(&mut self, target: usize) {
        self.target_output = target.max(1);
    }

    pub(crate) fn pending_output_rows(&self) -> usize {
        self.segment_rows
    }

    pub(crate) fn has_pending_rows(&self) -> bool {
        self.cursor
            .as_ref()
            .map(|c| c.next_idx < c.probe_rows.len())
            .unwrap_or(false)
    }

    /// Size the matched-build flags to the resident partition batches.
    pub(crate) fn setup_partitions(&mut self, partitions: &[HashPartition]) {
        if !self.join_type.preserves_build() {
            return;
        }
        self.matched_build = partitions
            .iter()
            .map(|p| {
                if p.is_spilled() {
                    Vec::new()
                } else {
                    p.batches().iter().map(|b| vec![false; b.len()]).collect()
                }
            })
            .collect();
        self.final_part = 0;
        self.final_batch = 0;
        self.final_row = 0;
    }

    /// Probe input exhausted: move to the final projection pass, or finish
    /// when the join owes no build rows.
    pub(crate) fn change_to_final_probe_state(&mut self) {
        self.state = if self.join_type.preserves_build() {
            ProbeState::ProjectBuild
        } else {
            ProbeState::Done
        };
    }

    /// Accept the next probe batch: serialize keys, route every row, and
    /// append rows of spilled partitions to their outer files. `from_spill`
    /// batches carry the trailing hash-value column from a previous cycle.
    pub(crate) fn load_probe_chunk(
        &mut self,
        chunk: Chunk,
        from_spill: bool,
        partitions: &mut [HashPartition],
        partition_mask: u32,
        bits_in_mask: u32,
    ) -> Result<(), String> {
        let (data_chunk, hash_column) = if from_spill {
            let columns = chunk.batch.columns();
            let n = columns.len();
            if n < 2 {
                return Err("spilled probe batch is missing the hash-value column".to_string());
            }
            let hashes = columns[n - 1]
                .as_any()
                .downcast_ref::<UInt32Array>()
                .ok_or_else(|| "spilled hash-value column must be UInt32".to_string())?
                .clone();
            let data = RecordBatch::try_new(self.probe_schema.clone(), columns[..n - 1].to_vec())
                .map_err(|e| e.to_string())?;
            (Chunk::new(data), Some(hashes))
        } else {
            (chunk, None)
        };

        let rows = data_chunk.len();
        let key_rows = serialize_keys(&self.converter, &data_chunk, &self.probe_key_indices)?;

        let mut key_arrays = Vec::with_capacity(self.probe_key_indices.len());
        for idx in &self.probe_key_indices {
            key_arrays.push(Arc::clone(data_chunk.column(*idx)?));
        }
        let null_safe = self.join_type.null_safe_keys();

        let mut hashes = Vec::with_capacity(rows);
        let mut parts = Vec::with_capacity(rows);
        let mut forbidden_null = Vec::with_capacity(rows);
        for row in 0..rows {
            let raw = match hash_column.as_ref() {
                Some(column) => column.value(row),
                None => fold_hash(key_hash(key_rows.row(row).data())),
            };
            parts.push(raw & partition_mask);
            hashes.push(raw >> bits_in_mask);
            forbidden_null.push(row_has_forbidden_null(&key_arrays, row, null_safe));
        }

        // Rows of spilled partitions go straight to the outer files; only
        // the rest are probed.
        let mut probe_rows = Vec::with_capacity(rows);
        let mut spilled_rows: BTreeMap<u32, (Vec<u32>, Vec<u32>)> = BTreeMap::new();
        for row in 0..rows {
            let part = parts[row] as usize;
            let is_spilled = partitions.get(part).map(|p| p.is_spilled()).unwrap_or(false);
            if is_spilled {
                let entry = spilled_rows.entry(parts[row]).or_default();
                entry.0.push(row as u32);
                entry.1.push(hashes[row]);
            } else {
                probe_rows.push(row as u32);
            }
        }
        for (part, (indices, row_hashes)) in spilled_rows {
            partitions[part as usize].append_outer_rows(&data_chunk, &indices, &row_hashes)?;
        }

        self.cursor = Some(ProbeCursor {
            chunk: data_chunk,
            key_rows,
            hashes,
            parts,
            forbidden_null,
            probe_rows,
            next_idx: 0,
        });
        Ok(())
    }

    /// Probe rows from the current cursor until the output target is reached
    /// or the cursor is exhausted, then materialize the accumulated rows.
    pub(crate) fn process_current(
        &mut self,
        partitions: &[HashPartition],
    ) -> Result<(), String> {
        let Some(mut cursor) = self.cursor.take() else {
            return Ok(());
        };

        // (partition, build batch) -> (probe indices, build indices)
        let mut pairs: BTreeMap<(u32, u32), (Vec<u32>, Vec<u32>)> = BTreeMap::new();
        let mut unmatched_probe: Vec<u32> = Vec::new();
        let mut probe_only: Vec<u32> = Vec::new();
        let mut emitted = 0usize;
        let budget = self.target_output.saturating_sub(self.segment_rows);

        while cursor.next_idx < cursor.probe_rows.len() && emitted < budget {
            let row = cursor.probe_rows[cursor.next_idx] as usize;
            cursor.next_idx += 1;

            if cursor.forbidden_null[row] {
                emitted += self.on_unmatched(row, &cursor, &mut unmatched_probe, &mut probe_only);
                continue;
            }

            let part = cursor.parts[row] as usize;
            let table = partitions.get(part).and_then(|p| p.hash_table());
            let Some(table) = table else {
                emitted += self.on_unmatched(row, &cursor, &mut unmatched_probe, &mut probe_only);
                continue;
            };

            let hash = cursor.hashes[row];
            let key = cursor.key_rows.row(row).data();
            match self.join_type {
                JoinType::Inner
                | JoinType::LeftOuter
                | JoinType::RightOuter
                | JoinType::FullOuter => {
                    self.lookup_scratch.clear();
                    table.lookup_all(hash, key, &mut self.lookup_scratch)?;
                    if self.lookup_scratch.is_empty() {
                        emitted +=
                            self.on_unmatched(row, &cursor, &mut unmatched_probe, &mut probe_only);
                        continue;
                    }
                    let track = self.join_type.preserves_build();
                    for (batch, build_row) in self.lookup_scratch.iter().copied() {
                        let entry = pairs.entry((part as u32, batch)).or_default();
                        entry.0.push(row as u32);
                        entry.1.push(build_row);
                        emitted += 1;
                        if track {
                            if let Some(flags) = self
                                .matched_build
                                .get_mut(part)
                                .and_then(|b| b.get_mut(batch as usize))
                            {
                                if let Some(flag) = flags.get_mut(build_row as usize) {
                                    *flag = true;
                                }
                            }
                        }
                    }
                }
                JoinType::LeftSemi => {
                    if table.contains(hash, key)? {
                        probe_only.push(row as u32);
                        emitted += 1;
                    }
                }
                JoinType::IntersectDistinct => {
                    if table.contains(hash, key)? {
                        let keys = self.emitted_keys.as_mut().expect("set-op emitted keys");
                        if keys.insert(key.to_vec()) {
                            probe_only.push(row as u32);
                            emitted += 1;
                        }
                    }
                }
                JoinType::ExceptDistinct => {
                    if !table.contains(hash, key)? {
                        let keys = self.emitted_keys.as_mut().expect("set-op emitted keys");
                        if keys.insert(key.to_vec()) {
                            probe_only.push(row as u32);
                            emitted += 1;
                        }
                    }
                }
            }
        }

        self.flush_scan(&cursor, partitions, pairs, unmatched_probe, probe_only)?;

        if cursor.next_idx < cursor.probe_rows.len() {
            self.cursor = Some(cursor);
        }
        Ok(())
    }

    /// Count and stage one probe row with no build match.
    fn on_unmatched(
        &mut self,
        row: usize,
        cursor: &ProbeCursor,
        unmatched_probe: &mut Vec<u32>,
        probe_only: &mut Vec<u32>,
    ) -> usize {
        match self.join_type {
            JoinType::LeftOuter | JoinType::FullOuter => {
                unmatched_probe.push(row as u32);
                1
            }
            JoinType::ExceptDistinct => {
                let key = cursor.key_rows.row(row).data().to_vec();
                let keys = self.emitted_keys.as_mut().expect("set-op emitted keys");
                if keys.insert(key) {
                    probe_only.push(row as u32);
                    1
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    fn flush_scan(
        &mut self,
        cursor: &ProbeCursor,
        partitions: &[HashPartition],
        pairs: BTreeMap<(u32, u32), (Vec<u32>, Vec<u32>)>,
        unmatched_probe: Vec<u32>,
        probe_only: Vec<u32>,
    ) -> Result<(), String> {
        for ((part, batch), (probe_indices, build_indices)) in pairs {
            let build_chunk = partitions
                .get(part as usize)
                .and_then(|p| p.batches().get(batch as usize))
                .ok_or_else(|| "join build batch missing during flush".to_string())?;
            if let Some(batch) = matched_join_batch(
                &cursor.chunk,
                build_chunk,
                &probe_indices,
                &build_indices,
                &self.output_schema,
            )? {
                self.segment_rows += batch.num_rows();
                self.segments.push(batch);
            }
        }
        if !unmatched_probe.is_empty() {
            if let Some(batch) = probe_with_null_build(
                &cursor.chunk,
                &unmatched_probe,
                &self.build_schema,
                &self.output_schema,
            )? {
                self.segment_rows += batch.num_rows();
                self.segments.push(batch);
            }
        }
        if !probe_only.is_empty() {
            if let Some(batch) =
                probe_only_batch(&cursor.chunk, &probe_only, &self.output_schema)?
            {
                self.segment_rows += batch.num_rows();
                self.segments.push(batch);
            }
        }
        Ok(())
    }

    /// Final pass for build-preserving joins: project build rows that never
    /// matched, null-padded on the probe side. Honors the output target and
    /// resumes where it left off.
    pub(crate) fn project_build_unmatched(
        &mut self,
        partitions: &[HashPartition],
    ) -> Result<(), String> {
        if self.state != ProbeState::ProjectBuild {
            return Ok(());
        }
        let budget = self.target_output.saturating_sub(self.segment_rows);
        let mut emitted = 0usize;

        while self.final_part < partitions.len() && emitted < budget {
            let part = self.final_part;
            let partition = &partitions[part];
            if partition.is_spilled() || self.final_batch >= partition.batches().len() {
                self.final_part += 1;
                self.final_batch = 0;
                self.final_row = 0;
                continue;
            }

            let batch_idx = self.final_batch;
            let build_chunk = &partition.batches()[batch_idx];
            let flags = self
                .matched_build
                .get(part)
                .and_then(|b| b.get(batch_idx))
                .ok_or_else(|| "join build match flags missing".to_string())?;

            let mut indices = Vec::new();
            let mut row = self.final_row;
            while row < flags.len() && emitted + indices.len() < budget {
                if !flags[row] {
                    indices.push(row as u32);
                }
                row += 1;
            }

            if let Some(batch) = build_with_null_probe(
                build_chunk,
                &indices,
                &self.probe_schema,
                &self.output_schema,
            )? {
                emitted += batch.num_rows();
                self.segment_rows += batch.num_rows();
                self.segments.push(batch);
            }

            if row >= flags.len() {
                self.final_batch += 1;
                self.final_row = 0;
            } else {
                self.final_row = row;
            }
        }

        if self.final_part >= partitions.len() {
            self.state = ProbeState::Done;
        }
        Ok(())
    }

    /// Hand out everything accumulated since the last call as one batch.
    pub(crate) fn take_output(&mut self) -> Result<Option<Chunk>, String> {
        if self.segments.is_empty() {
            return Ok(None);
        }
        let segments = std::mem::take(&mut self.segments);
        self.segment_rows = 0;
        let batch = if segments.len() == 1 {
            segments.into_iter().next().expect("one segment")
        } else {
            concat_batches(&self.output_schema, &segments).map_err(|e| e.to_string())?
        };
        Ok(Some(Chunk::new(batch)))
    }
}
