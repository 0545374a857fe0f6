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
//! Hash-table primitive for one join partition.
//!
//! Responsibilities:
//! - Indexes buffered build batches by their retained key hash into
//!   power-of-two buckets with chained row references.
//! - Resolves probe lookups by hash plus serialized-key equality, so both
//!   sides and all spill cycles agree on key identity.
//!
//! Key exported interfaces:
//! - Types: `JoinHashTable`.
//! - Functions: `key_converter`, `serialize_keys`, `fold_hash`, `key_hash`.

use std::mem;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, UInt32Array};
use arrow::datatypes::DataType;
use arrow::row::{RowConverter, Rows, SortField};

use crate::exec::chunk::Chunk;
use crate::runtime::mem_tracker::MemTracker;

const ROW_NONE: u32 = u32::MAX;
const KEY_HASH_SEED: u64 = 0xcbf29ce484222325;

/// Build the row converter shared by key hashing, equality and routing.
pub(crate) fn key_converter(key_types: &[DataType]) -> Result<RowConverter, String> {
    if key_types.is_empty() {
        return Err("hash join requires at least one key column".to_string());
    }
    let fields = key_types
        .iter()
        .map(|t| SortField::new(t.clone()))
        .collect::<Vec<_>>();
    RowConverter::new(fields).map_err(|e| format!("join key converter: {e}"))
}

/// Serialize the key columns of one batch into comparable row bytes.
pub(crate) fn serialize_keys(
    converter: &RowConverter,
    chunk: &Chunk,
    key_indices: &[usize],
) -> Result<Rows, String> {
    let mut key_arrays = Vec::with_capacity(key_indices.len());
    for idx in key_indices {
        key_arrays.push(Arc::clone(chunk.column(*idx)?));
    }
    converter
        .convert_columns(&key_arrays)
        .map_err(|e| format!("join key serialization: {e}"))
}

/// 64-bit hash of serialized key bytes (FNV-1a with a final mix).
pub(crate) fn key_hash(bytes: &[u8]) -> u64 {
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = KEY_HASH_SEED;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    mix_u64(hash)
}

/// Fold a 64-bit key hash to the 32-bit code used for routing and storage.
pub(crate) fn fold_hash(hash: u64) -> u32 {
    (hash ^ (hash >> 32)) as u32
}

fn mix_u64(mut value: u64) -> u64 {
    value = value.wrapping_add(0x9e3779b97f4a7c15);
    value = (value ^ (value >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94d049bb133111eb);
    value ^ (value >> 31)
}

/// True when the row has a NULL in any key column and NULLs do not join.
pub(crate) fn row_has_forbidden_null(
    key_arrays: &[ArrayRef],
    row: usize,
    null_safe: bool,
) -> bool {
    if null_safe {
        return false;
    }
    key_arrays.iter().any(|a| a.is_null(row))
}

/// Chained hash table over the buffered build batches of one partition.
pub(crate) struct JoinHashTable {
    bucket_mask: u32,
    bucket_head: Vec<u32>,
    row_next: Vec<u32>,
    row_hash: Vec<u32>,
    row_batch_index: Vec<u32>,
    row_in_batch: Vec<u32>,
    key_rows: Vec<Rows>,
    num_entries: usize,
    mem_tracker: Option<Arc<MemTracker>>,
    accounted_bytes: i64,
}

impl JoinHashTable {
    /// Build the table over `batches`. `hash_columns` carries the retained
    /// per-row hash for each batch (present when the operator partitions);
    /// when absent the hash is recomputed from the serialized key, which is
    /// only equivalent for a single-partition operator (no routing bits were
    /// consumed).
    pub(crate) fn build(
        converter: &RowConverter,
        batches: &[Chunk],
        hash_columns: Option<&[ArrayRef]>,
        key_indices: &[usize],
        null_safe: bool,
    ) -> Result<Self, String> {
        if let Some(hashes) = hash_columns {
            if hashes.len() != batches.len() {
                return Err(format!(
                    "join hash column count mismatch: batches={} hash_columns={}",
                    batches.len(),
                    hashes.len()
                ));
            }
        }
        let total_rows: usize = batches.iter().map(|b| b.len()).sum();
        if total_rows > (u32::MAX as usize) - 1 {
            return Err("join build row count overflow".to_string());
        }
        let num_buckets = (total_rows.saturating_mul(4) / 3).next_power_of_two().max(16);
        let bucket_mask = (num_buckets - 1) as u32;

        let mut table = Self {
            bucket_mask,
            bucket_head: vec![ROW_NONE; num_buckets],
            row_next: vec![ROW_NONE; total_rows],
            row_hash: vec![0; total_rows],
            row_batch_index: vec![0; total_rows],
            row_in_batch: vec![0; total_rows],
            key_rows: Vec::with_capacity(batches.len()),
            num_entries: 0,
            mem_tracker: None,
            accounted_bytes: 0,
        };

        let mut row_id: u32 = 0;
        for (batch_index, chunk) in batches.iter().enumerate() {
            let mut key_arrays = Vec::with_capacity(key_indices.len());
            for idx in key_indices {
                key_arrays.push(Arc::clone(chunk.column(*idx)?));
            }
            let rows = converter
                .convert_columns(&key_arrays)
                .map_err(|e| format!("join key serialization: {e}"))?;

            let hash_values = match hash_columns {
                Some(columns) => {
                    let array = columns
                        .get(batch_index)
                        .ok_or_else(|| "join hash column missing".to_string())?;
                    let hashes = array
                        .as_any()
                        .downcast_ref::<UInt32Array>()
                        .ok_or_else(|| "join hash column must be UInt32".to_string())?;
                    if hashes.len() != chunk.len() {
                        return Err("join hash column length mismatch".to_string());
                    }
                    Some(hashes.clone())
                }
                None => None,
            };

            for row in 0..chunk.len() {
                let slot = row_id as usize;
                table.row_batch_index[slot] = batch_index as u32;
                table.row_in_batch[slot] = row as u32;
                if !row_has_forbidden_null(&key_arrays, row, null_safe) {
                    let hash = match hash_values.as_ref() {
                        Some(hashes) => hashes.value(row),
                        None => fold_hash(key_hash(rows.row(row).data())),
                    };
                    table.insert(hash, row_id);
                }
                row_id += 1;
            }
            table.key_rows.push(rows);
        }
        Ok(table)
    }

    fn insert(&mut self, hash: u32, row_id: u32) {
        let bucket = (hash & self.bucket_mask) as usize;
        let slot = row_id as usize;
        self.row_hash[slot] = hash;
        self.row_next[slot] = self.bucket_head[bucket];
        self.bucket_head[bucket] = row_id;
        self.num_entries += 1;
    }

    pub(crate) fn num_buckets(&self) -> usize {
        self.bucket_head.len()
    }

    pub(crate) fn num_entries(&self) -> usize {
        self.num_entries
    }

    fn key_bytes(&self, row_id: u32) -> Result<&[u8], String> {
        let slot = row_id as usize;
        let batch = *self
            .row_batch_index
            .get(slot)
            .ok_or_else(|| "join row id out of bounds".to_string())? as usize;
        let row = *self
            .row_in_batch
            .get(slot)
            .ok_or_else(|| "join row id out of bounds".to_string())? as usize;
        let rows = self
            .key_rows
            .get(batch)
            .ok_or_else(|| "join key rows missing".to_string())?;
        Ok(rows.row(row).data())
    }

    /// Append every build row matching (`hash`, `key`) to `out` as
    /// (batch index, row index) pairs.
    pub(crate) fn lookup_all(
        &self,
        hash: u32,
        key: &[u8],
        out: &mut Vec<(u32, u32)>,
    ) -> Result<(), String> {
        let bucket = (hash & self.bucket_mask) as usize;
        let mut row_id = self.bucket_head[bucket];
        while row_id != ROW_NONE {
            let slot = row_id as usize;
            if self.row_hash[slot] == hash && self.key_bytes(row_id)? == key {
                out.push((self.row_batch_index[slot], self.row_in_batch[slot]));
            }
            row_id = self.row_next[slot];
        }
        Ok(())
    }

    /// True when at least one build row matches (`hash`, `key`).
    pub(crate) fn contains(&self, hash: u32, key: &[u8]) -> Result<bool, String> {
        let bucket = (hash & self.bucket_mask) as usize;
        let mut row_id = self.bucket_head[bucket];
        while row_id != ROW_NONE {
            let slot = row_id as usize;
            if self.row_hash[slot] == hash && self.key_bytes(row_id)? == key {
                return Ok(true);
            }
            row_id = self.row_next[slot];
        }
        Ok(false)
    }

    pub(crate) fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        if let Some(current) = self.mem_tracker.as_ref() {
            if Arc::ptr_eq(current, &tracker) {
                return;
            }
            current.release(self.accounted_bytes);
        }
        let bytes = self.tracked_bytes();
        tracker.consume(bytes);
        self.mem_tracker = Some(tracker);
        self.accounted_bytes = bytes;
    }

    pub(crate) fn tracked_bytes(&self) -> i64 {
        fn vec_bytes<T>(v: &Vec<T>) -> i64 {
            let bytes = v.capacity().saturating_mul(mem::size_of::<T>());
            i64::try_from(bytes).unwrap_or(i64::MAX)
        }

        let key_bytes: usize = self
            .key_rows
            .iter()
            .map(|rows| rows.iter().map(|r| r.data().len()).sum::<usize>())
            .sum();
        vec_bytes(&self.bucket_head)
            .saturating_add(vec_bytes(&self.row_next))
            .saturating_add(vec_bytes(&self.row_hash))
            .saturating_add(vec_bytes(&self.row_batch_index))
            .saturating_add(vec_bytes(&self.row_in_batch))
            .saturating_add(i64::try_from(key_bytes).unwrap_or(i64::MAX))
    }
}

impl Drop for JoinHashTable {
    fn drop(&mut self) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.release(self.accounted_bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, RecordBatch};
    use arrow::datatypes::{Field, Schema};

    fn key_chunk(values: Vec<Option<i32>>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int32, true)]));
        Chunk::new(RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))]).unwrap())
    }

    fn probe_key(converter: &RowConverter, value: Option<i32>) -> (u32, Vec<u8>) {
        let array: ArrayRef = Arc::new(Int32Array::from(vec![value]));
        let rows = converter.convert_columns(&[array]).unwrap();
        let bytes = rows.row(0).data().to_vec();
        (fold_hash(key_hash(&bytes)), bytes)
    }

    #[test]
    fn duplicate_keys_chain_in_one_bucket() {
        let converter = key_converter(&[DataType::Int32]).unwrap();
        let batches = vec![
            key_chunk(vec![Some(1), Some(2)]),
            key_chunk(vec![Some(2), Some(3)]),
        ];
        let table = JoinHashTable::build(&converter, &batches, None, &[0], false).unwrap();
        assert_eq!(table.num_entries(), 4);

        let (hash, key) = probe_key(&converter, Some(2));
        let mut matches = Vec::new();
        table.lookup_all(hash, &key, &mut matches).unwrap();
        matches.sort_unstable();
        assert_eq!(matches, vec![(0, 1), (1, 0)]);

        let (hash, key) = probe_key(&converter, Some(9));
        assert!(!table.contains(hash, &key).unwrap());
    }

    #[test]
    fn null_keys_stay_out_of_the_table_unless_null_safe() {
        let converter = key_converter(&[DataType::Int32]).unwrap();
        let batches = vec![key_chunk(vec![Some(1), None])];

        let table = JoinHashTable::build(&converter, &batches, None, &[0], false).unwrap();
        assert_eq!(table.num_entries(), 1);
        let (hash, key) = probe_key(&converter, None);
        assert!(!table.contains(hash, &key).unwrap());

        let table = JoinHashTable::build(&converter, &batches, None, &[0], true).unwrap();
        assert_eq!(table.num_entries(), 2);
        let (hash, key) = probe_key(&converter, None);
        assert!(table.contains(hash, &key).unwrap());
    }

    #[test]
    fn accounting_is_released_on_drop() {
        let converter = key_converter(&[DataType::Int32]).unwrap();
        let batches = vec![key_chunk(vec![Some(1), Some(2), Some(3)])];
        let mut table = JoinHashTable::build(&converter, &batches, None, &[0], false).unwrap();

        let root = MemTracker::new_root("root");
        table.set_mem_tracker(Arc::clone(&root));
        assert!(root.current() > 0);
        drop(table);
        assert_eq!(root.current(), 0);
    }
}
