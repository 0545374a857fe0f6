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
//! Build-key Bloom filters emitted downstream before probing starts.
//!
//! Responsibilities:
//! - Block bloom filter with 32-byte buckets and salted bit spread.
//! - Accumulates build-side key hashes during the first cycle only and sends
//!   the finished filter set through an injected sink exactly once.
//!
//! Key exported interfaces:
//! - Types: `BloomFilter`, `BloomFilterDef`, `RuntimeFilterDef`,
//!   `RuntimeFilterEntry`, `RuntimeFilterSink`.

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Decimal128Array, Float32Array, Float64Array,
    Int8Array, Int16Array, Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::{DataType, Schema};

use crate::common::logging::warn;
use crate::exec::chunk::Chunk;

const SALT: [u32; 8] = [
    0x47b6137b, 0x44974d91, 0x8824ad5b, 0xa2b7289d, 0x705495c7, 0x2df1424b, 0x9efc4947, 0x5c6bfb31,
];
const BUCKET_BYTES: usize = 32;

/// One requested filter: build field feeding it, probe field it prunes.
#[derive(Clone, Debug)]
pub struct BloomFilterDef {
    pub build_field: String,
    pub probe_field: String,
    pub num_bytes: usize,
}

#[derive(Clone, Debug, Default)]
pub struct RuntimeFilterDef {
    pub bloom_filter_defs: Vec<BloomFilterDef>,
}

/// Block bloom filter over 64-bit value hashes.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    log_num_buckets: u32,
    directory_mask: u32,
    directory: Vec<u32>,
    inserted: u64,
}

impl BloomFilter {
    pub fn with_num_bytes(num_bytes: usize) -> Self {
        let buckets = (num_bytes / BUCKET_BYTES).next_power_of_two().max(2);
        let log_num_buckets = buckets.trailing_zeros();
        Self {
            log_num_buckets,
            directory_mask: (buckets - 1) as u32,
            directory: vec![0u32; buckets * 8],
            inserted: 0,
        }
    }

    pub fn num_bytes(&self) -> usize {
        self.directory.len() * 4
    }

    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    pub fn insert_hash(&mut self, hash: u64) {
        let bucket = (hash as u32) & self.directory_mask;
        let key = (hash >> self.log_num_buckets) as u32;
        let masks = make_mask(key);
        let base = bucket as usize * 8;
        for i in 0..8 {
            self.directory[base + i] |= masks[i];
        }
        self.inserted += 1;
    }

    pub fn test_hash(&self, hash: u64) -> bool {
        let bucket = (hash as u32) & self.directory_mask;
        let key = (hash >> self.log_num_buckets) as u32;
        let masks = make_mask(key);
        let base = bucket as usize * 8;
        for i in 0..8 {
            if (self.directory[base + i] & masks[i]) == 0 {
                return false;
            }
        }
        true
    }
}

fn make_mask(key: u32) -> [u32; 8] {
    let mut masks = [0u32; 8];
    for i in 0..8 {
        let mut v = key.wrapping_mul(SALT[i]);
        v >>= 27;
        masks[i] = 1u32 << v;
    }
    masks
}

fn mix_u64(mut value: u64) -> u64 {
    value = value.wrapping_add(0x9e3779b97f4a7c15);
    value = (value ^ (value >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94d049bb133111eb);
    value ^ (value >> 31)
}

fn bytes_hash(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    mix_u64(hash)
}

/// Hash the value of one build field. NULL values return None and are not
/// inserted; a bloom filter cannot express NULL membership.
pub(crate) fn value_hash64(array: &ArrayRef, row: usize) -> Result<Option<u64>, String> {
    if array.is_null(row) {
        return Ok(None);
    }
    let hash = match array.data_type() {
        DataType::Boolean => {
            let arr = array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| "runtime filter type mismatch for Boolean".to_string())?;
            mix_u64(arr.value(row) as u64)
        }
        DataType::Int8 => {
            let arr = array
                .as_any()
                .downcast_ref::<Int8Array>()
                .ok_or_else(|| "runtime filter type mismatch for Int8".to_string())?;
            mix_u64(arr.value(row) as i64 as u64)
        }
        DataType::Int16 => {
            let arr = array
                .as_any()
                .downcast_ref::<Int16Array>()
                .ok_or_else(|| "runtime filter type mismatch for Int16".to_string())?;
            mix_u64(arr.value(row) as i64 as u64)
        }
        DataType::Int32 => {
            let arr = array
                .as_any()
                .downcast_ref::<Int32Array>()
                .ok_or_else(|| "runtime filter type mismatch for Int32".to_string())?;
            mix_u64(arr.value(row) as i64 as u64)
        }
        DataType::Int64 => {
            let arr = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| "runtime filter type mismatch for Int64".to_string())?;
            mix_u64(arr.value(row) as u64)
        }
        DataType::Float32 => {
            let arr = array
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| "runtime filter type mismatch for Float32".to_string())?;
            mix_u64(arr.value(row).to_bits() as u64)
        }
        DataType::Float64 => {
            let arr = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| "runtime filter type mismatch for Float64".to_string())?;
            mix_u64(arr.value(row).to_bits())
        }
        DataType::Date32 => {
            let arr = array
                .as_any()
                .downcast_ref::<Date32Array>()
                .ok_or_else(|| "runtime filter type mismatch for Date32".to_string())?;
            mix_u64(arr.value(row) as i64 as u64)
        }
        DataType::Utf8 => {
            let arr = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| "runtime filter type mismatch for Utf8".to_string())?;
            bytes_hash(arr.value(row).as_bytes())
        }
        DataType::Decimal128(_, _) => {
            let arr = array
                .as_any()
                .downcast_ref::<Decimal128Array>()
                .ok_or_else(|| "runtime filter type mismatch for Decimal128".to_string())?;
            bytes_hash(&arr.value(row).to_le_bytes())
        }
        other => {
            return Err(format!("unsupported runtime filter type: {other:?}"));
        }
    };
    Ok(Some(hash))
}

/// One finished filter paired with the probe-side field it prunes.
#[derive(Clone, Debug)]
pub struct RuntimeFilterEntry {
    pub probe_field: String,
    pub filter: BloomFilter,
}

/// Transport for the finished filter set; concrete pipelines choose the
/// delivery mechanism.
pub trait RuntimeFilterSink: Send + Sync {
    fn send(&self, filters: Vec<RuntimeFilterEntry>, operator_id: i32);
}

struct FilterSlot {
    build_column: usize,
    probe_field: String,
    filter: BloomFilter,
}

/// Accumulates bloom filters over build keys during the first cycle and
/// emits them once when the build completes.
pub(crate) struct RuntimeFilterBuilder {
    slots: Vec<FilterSlot>,
    enabled: bool,
}

impl RuntimeFilterBuilder {
    /// Resolve the requested build fields against the build schema. Any
    /// unresolved field disables the whole filter set for this query.
    pub(crate) fn new(def: &RuntimeFilterDef, build_schema: &Schema) -> Self {
        let mut slots = Vec::with_capacity(def.bloom_filter_defs.len());
        for filter_def in &def.bloom_filter_defs {
            let Some((column, _)) = build_schema.column_with_name(&filter_def.build_field) else {
                warn!(
                    "runtime filter disabled: build field {} not found in build schema",
                    filter_def.build_field
                );
                return Self {
                    slots: Vec::new(),
                    enabled: false,
                };
            };
            slots.push(FilterSlot {
                build_column: column,
                probe_field: filter_def.probe_field.clone(),
                filter: BloomFilter::with_num_bytes(filter_def.num_bytes),
            });
        }
        let enabled = !slots.is_empty();
        Self { slots, enabled }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Insert the build-key hashes of every row in `chunk`.
    pub(crate) fn add_build_batch(&mut self, chunk: &Chunk) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        for slot in self.slots.iter_mut() {
            let array = chunk.column(slot.build_column)?;
            for row in 0..chunk.len() {
                if let Some(hash) = value_hash64(array, row)? {
                    slot.filter.insert_hash(hash);
                }
            }
        }
        Ok(())
    }

    /// Hand the finished filters to the sink. Consumes the builder so a
    /// second emission is unrepresentable.
    pub(crate) fn emit(self, sink: &dyn RuntimeFilterSink, operator_id: i32) {
        if !self.enabled {
            return;
        }
        let filters = self
            .slots
            .into_iter()
            .map(|slot| RuntimeFilterEntry {
                probe_field: slot.probe_field,
                filter: slot.filter,
            })
            .collect::<Vec<_>>();
        sink.send(filters, operator_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, RecordBatch};
    use arrow::datatypes::Field;
    use std::sync::{Arc, Mutex};

    struct CapturingSink {
        sent: Mutex<Vec<(i32, Vec<RuntimeFilterEntry>)>>,
    }

    impl RuntimeFilterSink for CapturingSink {
        fn send(&self, filters: Vec<RuntimeFilterEntry>, operator_id: i32) {
            self.sent
                .lock()
                .unwrap()
                .push((operator_id, filters));
        }
    }

    fn build_chunk(values: Vec<Option<i64>>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]));
        Chunk::new(RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap())
    }

    fn filter_def(build_field: &str) -> RuntimeFilterDef {
        RuntimeFilterDef {
            bloom_filter_defs: vec![BloomFilterDef {
                build_field: build_field.to_string(),
                probe_field: "pk".to_string(),
                num_bytes: 1024,
            }],
        }
    }

    #[test]
    fn bloom_filter_has_no_false_negatives() {
        let mut filter = BloomFilter::with_num_bytes(4096);
        for v in 0..1000u64 {
            filter.insert_hash(mix_u64(v));
        }
        for v in 0..1000u64 {
            assert!(filter.test_hash(mix_u64(v)));
        }
        let misses = (10_000..11_000u64)
            .filter(|v| filter.test_hash(mix_u64(*v)))
            .count();
        assert!(misses < 100, "false positive rate too high: {misses}/1000");
    }

    #[test]
    fn builder_accumulates_and_emits_once() {
        let chunk = build_chunk(vec![Some(1), Some(2), None]);
        let mut builder = RuntimeFilterBuilder::new(&filter_def("k"), chunk.schema().as_ref());
        assert!(builder.is_enabled());
        builder.add_build_batch(&chunk).unwrap();

        let sink = CapturingSink {
            sent: Mutex::new(Vec::new()),
        };
        builder.emit(&sink, 42);
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (op_id, filters) = &sent[0];
        assert_eq!(*op_id, 42);
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].probe_field, "pk");
        // NULL build values are not inserted.
        assert_eq!(filters[0].filter.inserted(), 2);
    }

    #[test]
    fn unresolved_build_field_disables_the_filter_set() {
        let chunk = build_chunk(vec![Some(1)]);
        let builder = RuntimeFilterBuilder::new(&filter_def("missing"), chunk.schema().as_ref());
        assert!(!builder.is_enabled());

        let sink = CapturingSink {
            sent: Mutex::new(Vec::new()),
        };
        builder.emit(&sink, 1);
        assert!(sink.sent.lock().unwrap().is_empty());
    }
}
