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
//! One hash partition of a single build/probe cycle.
//!
//! Responsibilities:
//! - Buffers routed build rows into fixed-size internal batches, with the
//!   retained hash kept per row; spills itself to an inner file when told to.
//! - Receives probe rows routed to it after it spilled, appending them to an
//!   outer file for the next cycle.
//! - Builds its in-memory hash table once the build drain keeps it resident.

use std::sync::Arc;

use arrow::array::{ArrayRef, RecordBatch, UInt32Array};
use arrow::compute::{concat_batches, take};
use arrow::datatypes::SchemaRef;
use arrow::row::RowConverter;

use super::join_hash_table::JoinHashTable;
use super::memory_calc::BuildSidePartitioning;
use crate::common::logging::debug;
use crate::exec::chunk::Chunk;
use crate::exec::spill::spill_writer::SpillWriter;
use crate::exec::spill::{SpillFile, SpillSet, spilled_schema_for};
use crate::runtime::mem_tracker::MemTracker;

pub(crate) struct HashPartition {
    index: usize,
    cycle: u32,
    data_schema: SchemaRef,
    spill_schema: SchemaRef,
    probe_data_schema: SchemaRef,
    probe_spill_schema: SchemaRef,
    records_per_batch: usize,
    single_partition: bool,

    pending: Vec<RecordBatch>,
    pending_hashes: Vec<u32>,
    pending_rows: usize,

    batches: Vec<Chunk>,
    hash_columns: Vec<ArrayRef>,
    hash_table: Option<JoinHashTable>,

    num_rows: usize,
    in_memory_rows: usize,
    in_memory_bytes: i64,

    spilled: bool,
    inner_writer: Option<SpillWriter>,
    inner_spilled_batches: usize,

    outer_pending: Vec<RecordBatch>,
    outer_pending_hashes: Vec<u32>,
    outer_pending_rows: usize,
    outer_writer: Option<SpillWriter>,
    outer_spilled_batches: usize,

    tracker: Arc<MemTracker>,
    spill_set: Arc<SpillSet>,
}

impl HashPartition {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        index: usize,
        cycle: u32,
        build_schema: SchemaRef,
        probe_schema: SchemaRef,
        records_per_batch: usize,
        single_partition: bool,
        parent_tracker: &Arc<MemTracker>,
        spill_set: Arc<SpillSet>,
    ) -> Self {
        let tracker = MemTracker::new_child(format!("Partition{index}"), parent_tracker);
        Self {
            index,
            cycle,
            spill_schema: spilled_schema_for(&build_schema),
            probe_spill_schema: spilled_schema_for(&probe_schema),
            probe_data_schema: probe_schema,
            data_schema: build_schema,
            records_per_batch: records_per_batch.max(1),
            single_partition,
            pending: Vec::new(),
            pending_hashes: Vec::new(),
            pending_rows: 0,
            batches: Vec::new(),
            hash_columns: Vec::new(),
            hash_table: None,
            num_rows: 0,
            in_memory_rows: 0,
            in_memory_bytes: 0,
            spilled: false,
            inner_writer: None,
            inner_spilled_batches: 0,
            outer_pending: Vec::new(),
            outer_pending_hashes: Vec::new(),
            outer_pending_rows: 0,
            outer_writer: None,
            outer_spilled_batches: 0,
            tracker,
            spill_set,
        }
    }

    pub(crate) fn is_spilled(&self) -> bool {
        self.spilled
    }

    pub(crate) fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub(crate) fn in_memory_rows(&self) -> usize {
        self.in_memory_rows
    }

    pub(crate) fn in_memory_batches(&self) -> usize {
        self.batches.len()
    }

    pub(crate) fn in_memory_bytes(&self) -> i64 {
        self.in_memory_bytes
    }

    pub(crate) fn batches(&self) -> &[Chunk] {
        &self.batches
    }

    pub(crate) fn hash_table(&self) -> Option<&JoinHashTable> {
        self.hash_table.as_ref()
    }

    fn take_rows(&self, chunk: &Chunk, indices: &[u32]) -> Result<RecordBatch, String> {
        let idx = Arc::new(UInt32Array::from(indices.to_vec())) as ArrayRef;
        let mut columns = Vec::with_capacity(chunk.batch.num_columns());
        for col in chunk.batch.columns() {
            columns.push(take(col.as_ref(), &idx, None).map_err(|e| e.to_string())?);
        }
        RecordBatch::try_new(chunk.schema(), columns).map_err(|e| e.to_string())
    }

    /// Route `indices` of `chunk` (with their retained hashes) into this
    /// partition. Completed internal batches may trigger a spill of this
    /// partition via `calc`.
    pub(crate) fn append_inner_rows(
        &mut self,
        chunk: &Chunk,
        indices: &[u32],
        hashes: &[u32],
        calc: &mut BuildSidePartitioning,
    ) -> Result<(), String> {
        if indices.is_empty() {
            return Ok(());
        }
        if indices.len() != hashes.len() {
            return Err("partition append index/hash length mismatch".to_string());
        }
        let segment = self.take_rows(chunk, indices)?;
        self.pending_rows += segment.num_rows();
        self.num_rows += segment.num_rows();
        self.pending.push(segment);
        self.pending_hashes.extend_from_slice(hashes);

        while self.pending_rows >= self.records_per_batch {
            let bytes = self.complete_inner_batch()?;
            if !self.spilled {
                calc.batch_completed(self.index, bytes);
                if calc.should_spill() {
                    self.spill(Some(calc))?;
                }
            }
        }
        Ok(())
    }

    /// Single-partition bypass: adopt the whole incoming batch without the
    /// per-row copy or the hash column.
    pub(crate) fn append_batch(&mut self, mut chunk: Chunk) -> Result<(), String> {
        if self.spilled || !self.single_partition {
            return Err("whole-batch append requires one resident partition".to_string());
        }
        let rows = chunk.len();
        if rows == 0 {
            return Ok(());
        }
        let bytes = chunk.logical_bytes() as i64;
        chunk.transfer_to(&self.tracker);
        self.batches.push(chunk);
        self.num_rows += rows;
        self.in_memory_rows += rows;
        self.in_memory_bytes = self.in_memory_bytes.saturating_add(bytes);
        Ok(())
    }

    /// Flush any buffered partial batch. Called at the end of the build
    /// drain; routed to the inner file when the partition already spilled.
    pub(crate) fn complete_pending(
        &mut self,
        calc: &mut BuildSidePartitioning,
    ) -> Result<(), String> {
        if self.pending_rows == 0 {
            return Ok(());
        }
        let bytes = self.complete_inner_batch()?;
        if !self.spilled {
            calc.batch_completed(self.index, bytes);
        }
        Ok(())
    }

    fn complete_inner_batch(&mut self) -> Result<i64, String> {
        if self.pending_rows == 0 {
            return Ok(0);
        }
        let data = if self.pending.len() == 1 {
            self.pending.pop().expect("pending batch")
        } else {
            concat_batches(&self.data_schema, &self.pending).map_err(|e| e.to_string())?
        };
        self.pending.clear();
        let hashes = std::mem::take(&mut self.pending_hashes);
        self.pending_rows = 0;

        if self.spilled {
            let assembled = self.assemble_spill_batch(&data, &hashes)?;
            let writer = self
                .inner_writer
                .as_mut()
                .ok_or_else(|| "spilled partition has no inner writer".to_string())?;
            writer.append(&assembled)?;
            self.inner_spilled_batches += 1;
            return Ok(0);
        }

        let mut chunk = Chunk::new(data);
        let bytes = chunk.logical_bytes() as i64;
        chunk.transfer_to(&self.tracker);
        self.in_memory_rows += chunk.len();
        self.in_memory_bytes = self.in_memory_bytes.saturating_add(bytes);
        self.batches.push(chunk);
        self.hash_columns
            .push(Arc::new(UInt32Array::from(hashes)) as ArrayRef);
        Ok(bytes)
    }

    fn assemble_spill_batch(
        &self,
        data: &RecordBatch,
        hashes: &[u32],
    ) -> Result<RecordBatch, String> {
        let mut columns = data.columns().to_vec();
        columns.push(Arc::new(UInt32Array::from(hashes.to_vec())) as ArrayRef);
        RecordBatch::try_new(self.spill_schema.clone(), columns).map_err(|e| e.to_string())
    }

    /// Move this partition to disk: open the inner writer and flush every
    /// buffered batch through it.
    pub(crate) fn spill(
        &mut self,
        calc: Option<&mut BuildSidePartitioning>,
    ) -> Result<(), String> {
        if self.spilled {
            return Ok(());
        }
        if self.single_partition {
            return Err("cannot spill with spilling disabled".to_string());
        }
        debug!(
            "spilling partition: partition={} cycle={} in_memory_batches={} in_memory_bytes={}",
            self.index,
            self.cycle,
            self.batches.len(),
            self.in_memory_bytes
        );
        let label = format!("p{}_c{}_inner", self.index, self.cycle);
        let mut writer = self
            .spill_set
            .create_writer(&label, self.spill_schema.clone())?;

        let flushed = self.batches.len();
        let batches = std::mem::take(&mut self.batches);
        let hash_columns = std::mem::take(&mut self.hash_columns);
        for (chunk, hash_column) in batches.into_iter().zip(hash_columns.into_iter()) {
            let hashes = hash_column
                .as_any()
                .downcast_ref::<UInt32Array>()
                .ok_or_else(|| "partition hash column must be UInt32".to_string())?
                .values()
                .to_vec();
            let assembled = self.assemble_spill_batch(&chunk.batch, &hashes)?;
            writer.append(&assembled)?;
            self.inner_spilled_batches += 1;
        }

        self.inner_writer = Some(writer);
        self.spilled = true;
        self.in_memory_rows = 0;
        self.in_memory_bytes = 0;
        if let Some(calc) = calc {
            calc.partition_spilled(self.index, flushed);
        }
        Ok(())
    }

    /// Close the inner writer and hand out the finished file.
    pub(crate) fn finish_spill(&mut self) -> Result<(SpillFile, usize), String> {
        let mut writer = self
            .inner_writer
            .take()
            .ok_or_else(|| "finish_spill on a partition that never spilled".to_string())?;
        let file = writer.finish()?;
        Ok((file, self.inner_spilled_batches))
    }

    /// Build the in-memory hash table over the buffered batches. The
    /// allocator limit is checked before the table is admitted.
    pub(crate) fn build_hash_table(
        &mut self,
        converter: &RowConverter,
        key_indices: &[usize],
        null_safe: bool,
        allocator: &Arc<MemTracker>,
    ) -> Result<(), String> {
        if self.spilled {
            return Err("cannot build a hash table on a spilled partition".to_string());
        }
        let hash_columns = if self.hash_columns.is_empty() {
            None
        } else {
            Some(&self.hash_columns[..])
        };
        let mut table = JoinHashTable::build(
            converter,
            &self.batches,
            hash_columns,
            key_indices,
            null_safe,
        )?;
        allocator.check_limit(table.tracked_bytes()).map_err(|e| {
            format!(
                "failed building hash table on partition {}: {e}",
                self.index
            )
        })?;
        table.set_mem_tracker(MemTracker::new_child("HashTable", &self.tracker));
        self.hash_table = Some(table);
        Ok(())
    }

    /// Append probe rows routed to this (spilled) partition to its outer
    /// file.
    pub(crate) fn append_outer_rows(
        &mut self,
        chunk: &Chunk,
        indices: &[u32],
        hashes: &[u32],
    ) -> Result<(), String> {
        if !self.spilled {
            return Err("outer rows routed to a resident partition".to_string());
        }
        if indices.is_empty() {
            return Ok(());
        }
        let segment = self.take_rows(chunk, indices)?;
        self.outer_pending_rows += segment.num_rows();
        self.outer_pending.push(segment);
        self.outer_pending_hashes.extend_from_slice(hashes);

        while self.outer_pending_rows >= self.records_per_batch {
            self.complete_outer_batch()?;
        }
        Ok(())
    }

    fn complete_outer_batch(&mut self) -> Result<(), String> {
        if self.outer_pending_rows == 0 {
            return Ok(());
        }
        let data = if self.outer_pending.len() == 1 {
            self.outer_pending.pop().expect("outer pending batch")
        } else {
            concat_batches(&self.probe_data_schema, &self.outer_pending)
                .map_err(|e| e.to_string())?
        };
        self.outer_pending.clear();
        let hashes = std::mem::take(&mut self.outer_pending_hashes);
        self.outer_pending_rows = 0;

        let mut columns = data.columns().to_vec();
        columns.push(Arc::new(UInt32Array::from(hashes)) as ArrayRef);
        let assembled = RecordBatch::try_new(self.probe_spill_schema.clone(), columns)
            .map_err(|e| e.to_string())?;

        if self.outer_writer.is_none() {
            let label = format!("p{}_c{}_outer", self.index, self.cycle);
            self.outer_writer = Some(
                self.spill_set
                    .create_writer(&label, self.probe_spill_schema.clone())?,
            );
        }
        let writer = self.outer_writer.as_mut().expect("outer writer");
        writer.append(&assembled)?;
        self.outer_spilled_batches += 1;
        Ok(())
    }

    /// Flush and close the outer file after the probe drain. Returns the
    /// batch count and file; (0, None) when no probe row reached this
    /// partition.
    pub(crate) fn finish_outer(&mut self) -> Result<(usize, Option<SpillFile>), String> {
        self.complete_outer_batch()?;
        match self.outer_writer.take() {
            Some(mut writer) => {
                let file = writer.finish()?;
                Ok((self.outer_spilled_batches, Some(file)))
            }
            None => Ok((0, None)),
        }
    }

    /// Drop the in-memory structures, keeping any finished spill files
    /// alive for later cycles.
    pub(crate) fn release_memory(&mut self) {
        self.pending.clear();
        self.pending_hashes.clear();
        self.pending_rows = 0;
        self.batches.clear();
        self.hash_columns.clear();
        self.hash_table = None;
        self.in_memory_rows = 0;
        self.in_memory_bytes = 0;
    }

    /// Full teardown for cancellation and error paths: releases memory and
    /// deletes any file still owned by an unfinished writer.
    pub(crate) fn close(&mut self) {
        self.release_memory();
        if let Some(writer) = self.inner_writer.take() {
            let path = writer.path().clone();
            drop(writer);
            self.spill_set.delete_quietly(&path);
        }
        if let Some(writer) = self.outer_writer.take() {
            let path = writer.path().clone();
            drop(writer);
            self.spill_set.delete_quietly(&path);
        }
    }

    pub(crate) fn make_debug_string(&self) -> String {
        format!(
            "partition {}: rows={} in_memory_rows={} in_memory_batches={} in_memory_bytes={} \
             spilled={} inner_spilled_batches={} outer_spilled_batches={} hash_table={}",
            self.index,
            self.num_rows,
            self.in_memory_rows,
            self.batches.len(),
            self.in_memory_bytes,
            self.spilled,
            self.inner_spilled_batches,
            self.outer_spilled_batches,
            self.hash_table.is_some()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::operators::hashjoin::JoinOptions;
    use crate::exec::operators::hashjoin::join_hash_table::key_converter;
    use crate::exec::operators::hashjoin::memory_calc::MemoryCalculator;
    use crate::exec::spill::SpillConfig;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use tempfile::tempdir;

    fn build_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("k", DataType::Int32, true)]))
    }

    fn chunk(values: Vec<i32>) -> Chunk {
        Chunk::new(
            RecordBatch::try_new(build_schema(), vec![Arc::new(Int32Array::from(values))])
                .unwrap(),
        )
    }

    fn no_spill_calc() -> BuildSidePartitioning {
        let mut calc = MemoryCalculator::from_options(&JoinOptions::default());
        calc.initialize(false);
        let mut build = calc.next();
        build.initialize(true, false, i64::MAX, 4, 2, 64, 64, 1024);
        build
    }

    fn test_partition(spill_set: Arc<SpillSet>, records_per_batch: usize) -> HashPartition {
        let tracker = MemTracker::new_root("op");
        HashPartition::new(
            0,
            0,
            build_schema(),
            build_schema(),
            records_per_batch,
            false,
            &tracker,
            spill_set,
        )
    }

    fn spill_set(dir: &std::path::Path) -> Arc<SpillSet> {
        let config = SpillConfig {
            local_dirs: vec![dir.to_path_buf()],
            ..SpillConfig::default()
        };
        SpillSet::new(&config, 0).unwrap()
    }

    #[test]
    fn appended_rows_complete_into_batches_with_hash_columns() {
        let temp = tempdir().unwrap();
        let mut partition = test_partition(spill_set(temp.path()), 2);
        let mut calc = no_spill_calc();

        let source = chunk(vec![10, 20, 30]);
        partition
            .append_inner_rows(&source, &[0, 2], &[7, 9], &mut calc)
            .unwrap();
        assert_eq!(partition.in_memory_batches(), 1);
        assert_eq!(partition.num_rows(), 2);

        let converter = key_converter(&[DataType::Int32]).unwrap();
        partition
            .build_hash_table(&converter, &[0], false, &MemTracker::new_root("alloc"))
            .unwrap();
        assert_eq!(partition.hash_table().unwrap().num_entries(), 2);
    }

    #[test]
    fn spill_flushes_buffered_batches_and_later_appends() {
        let temp = tempdir().unwrap();
        let set = spill_set(temp.path());
        let mut partition = test_partition(Arc::clone(&set), 2);
        let mut calc = no_spill_calc();

        let source = chunk(vec![1, 2, 3, 4]);
        partition
            .append_inner_rows(&source, &[0, 1], &[1, 2], &mut calc)
            .unwrap();
        partition.spill(Some(&mut calc)).unwrap();
        assert!(partition.is_spilled());
        assert_eq!(partition.in_memory_batches(), 0);

        partition
            .append_inner_rows(&source, &[2, 3], &[3, 4], &mut calc)
            .unwrap();
        partition.complete_pending(&mut calc).unwrap();
        let (file, batches) = partition.finish_spill().unwrap();
        assert_eq!(batches, 2);

        let spill_schema = spilled_schema_for(&build_schema());
        let mut reader = set.open_reader(&file, spill_schema).unwrap();
        let first = reader.next_batch().unwrap().unwrap();
        assert_eq!(first.num_columns(), 2);
        assert_eq!(first.num_rows(), 2);
        set.delete(&file.path).unwrap();
        set.close();
    }

    #[test]
    fn outer_rows_land_in_the_outer_file() {
        let temp = tempdir().unwrap();
        let set = spill_set(temp.path());
        let mut partition = test_partition(Arc::clone(&set), 8);
        let mut calc = no_spill_calc();
        partition.spill(Some(&mut calc)).unwrap();

        let probe = chunk(vec![5, 6, 7]);
        partition
            .append_outer_rows(&probe, &[1, 2], &[11, 12])
            .unwrap();
        let (batches, file) = partition.finish_outer().unwrap();
        assert_eq!(batches, 1);
        let file = file.unwrap();

        let mut reader = set
            .open_reader(&file, spilled_schema_for(&build_schema()))
            .unwrap();
        let read = reader.next_batch().unwrap().unwrap();
        assert_eq!(read.num_rows(), 2);
        set.delete(&file.path).unwrap();

        let (inner_file, _) = partition.finish_spill().unwrap();
        set.delete(&inner_file.path).unwrap();
        set.close();
    }

    #[test]
    fn close_removes_unfinished_writer_files() {
        let temp = tempdir().unwrap();
        let set = spill_set(temp.path());
        let mut partition = test_partition(Arc::clone(&set), 2);
        let mut calc = no_spill_calc();
        partition.spill(Some(&mut calc)).unwrap();
        partition.close();

        // The working directory exists but holds no abandoned files.
        let mut leftover = 0;
        for entry in std::fs::read_dir(temp.path()).unwrap() {
            let dir = entry.unwrap().path();
            if dir.is_dir() {
                leftover += std::fs::read_dir(dir).unwrap().count();
            }
        }
        assert_eq!(leftover, 0);
        set.close();
    }
}
