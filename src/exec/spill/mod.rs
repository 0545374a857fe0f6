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
//! Spill storage for the partitioned hash join.
//!
//! Responsibilities:
//! - Owns the per-operator spill working directories and every file created
//!   beneath them; all writes, reads and deletes are funneled through
//!   [`SpillSet`].
//! - Defines the spilled-batch shape: the side's data columns followed by
//!   the hidden non-null `UInt32` hash-value column, serialized as an Arrow
//!   IPC stream of length-prefixed batches.
//!
//! Key exported interfaces:
//! - Types: `SpillSet`, `SpillConfig`, `SpillFile`, `SpillCodec`.
//! - Functions: `spilled_schema_for`.

pub mod spill_stream;
pub mod spill_writer;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::ipc::CompressionType;
use arrow::ipc::writer::IpcWriteOptions;

use crate::common::logging::warn;
use crate::exec::spill::spill_stream::SpillReader;
use crate::exec::spill::spill_writer::SpillWriter;

/// Name of the hidden hash-value column every spilled batch ends with. The
/// column stores the retained per-row hash so later cycles route rows
/// without recomputing key hashes.
pub const HASH_VALUE_FIELD: &str = "__hash_value__";

/// Append the hidden hash-value column to a side's data schema.
pub fn spilled_schema_for(data_schema: &SchemaRef) -> SchemaRef {
    let mut fields = data_schema.fields().to_vec();
    fields.push(Arc::new(Field::new(
        HASH_VALUE_FIELD,
        DataType::UInt32,
        false,
    )));
    Arc::new(Schema::new(fields))
}

/// Spill files only ever hold hash-routed batches; reject anything that does
/// not end with the hash-value column.
pub(crate) fn validate_spilled_schema(schema: &Schema) -> Result<(), String> {
    let Some(field) = schema.fields().last() else {
        return Err("spilled batch schema has no columns".to_string());
    };
    if field.name() != HASH_VALUE_FIELD
        || field.data_type() != &DataType::UInt32
        || field.is_nullable()
    {
        return Err(format!(
            "spilled batches must end with the non-null UInt32 {HASH_VALUE_FIELD} column, \
             found {} {:?}",
            field.name(),
            field.data_type()
        ));
    }
    Ok(())
}

/// Compression applied to the spilled IPC stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillCodec {
    None,
    Lz4,
    Zstd,
}

impl SpillCodec {
    pub(crate) fn ipc_write_options(self) -> Result<IpcWriteOptions, String> {
        let options = IpcWriteOptions::default();
        let compression = match self {
            SpillCodec::None => return Ok(options),
            SpillCodec::Lz4 => CompressionType::LZ4_FRAME,
            SpillCodec::Zstd => CompressionType::ZSTD,
        };
        options
            .try_with_compression(Some(compression))
            .map_err(|e| format!("spill compression {self:?} unavailable: {e}"))
    }
}

#[derive(Debug, Clone)]
pub struct SpillConfig {
    pub local_dirs: Vec<PathBuf>,
    pub codec: SpillCodec,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            local_dirs: vec![std::env::temp_dir()],
            codec: SpillCodec::None,
        }
    }
}

/// Handle to one finished spill file. The holder is responsible for handing
/// the file back to [`SpillSet::delete`] once its contents are consumed.
#[derive(Debug, Clone)]
pub struct SpillFile {
    pub path: PathBuf,
    pub batches: usize,
    pub bytes: u64,
}

/// Create/append/read/delete spill files under per-operator working
/// directories. Closing the set removes the directories and anything left in
/// them.
#[derive(Debug)]
pub struct SpillSet {
    work_dirs: Vec<PathBuf>,
    codec: SpillCodec,
    next_dir: AtomicU64,
    next_file_id: AtomicU64,
    write_bytes: AtomicU64,
    closed: AtomicBool,
}

impl SpillSet {
    pub fn new(config: &SpillConfig, operator_id: i32) -> Result<Arc<Self>, String> {
        if config.local_dirs.is_empty() {
            return Err("spill local_dirs is empty".to_string());
        }
        let pid = std::process::id();
        let mut work_dirs = Vec::with_capacity(config.local_dirs.len());
        for dir in &config.local_dirs {
            if dir.as_os_str().is_empty() {
                return Err("spill local_dirs contains empty path".to_string());
            }
            work_dirs.push(dir.join(format!("hashjoin_spill_{pid:x}_op{operator_id}")));
        }
        Ok(Arc::new(Self {
            work_dirs,
            codec: config.codec,
            next_dir: AtomicU64::new(0),
            next_file_id: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn codec(&self) -> SpillCodec {
        self.codec
    }

    /// Open a writer for a new spill file. The directory is created lazily on
    /// first use; files rotate round-robin across the configured directories.
    pub fn create_writer(
        self: &Arc<Self>,
        label: &str,
        schema: SchemaRef,
    ) -> Result<SpillWriter, String> {
        if self.closed.load(Ordering::Acquire) {
            return Err("spill set is closed".to_string());
        }
        let dir_idx = self.next_dir.fetch_add(1, Ordering::AcqRel) as usize % self.work_dirs.len();
        let dir = &self.work_dirs[dir_idx];
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("create spill directory {} failed: {e}", dir.display()))?;
        let id = self.next_file_id.fetch_add(1, Ordering::AcqRel);
        let path = dir.join(format!("{label}_{id:x}.spill"));
        SpillWriter::create(Arc::clone(self), path, schema)
    }

    pub fn open_reader(&self, file: &SpillFile, schema: SchemaRef) -> Result<SpillReader, String> {
        SpillReader::open(&file.path, schema)
    }

    pub fn delete(&self, path: &Path) -> Result<(), String> {
        std::fs::remove_file(path)
            .map_err(|e| format!("delete spill file {} failed: {e}", path.display()))
    }

    /// Best-effort delete for cleanup paths; failures are logged, not raised.
    pub fn delete_quietly(&self, path: &Path) {
        if let Err(e) = self.delete(path) {
            warn!("cleanup: {e}");
        }
    }

    pub(crate) fn add_write_bytes(&self, bytes: u64) {
        self.write_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn write_bytes(&self) -> u64 {
        self.write_bytes.load(Ordering::Acquire)
    }

    /// Remove the working directories and everything still in them.
    /// Idempotent; failures are logged as warnings.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for dir in &self.work_dirs {
            if !dir.exists() {
                continue;
            }
            if let Err(e) = std::fs::remove_dir_all(dir) {
                warn!("cleanup: remove spill directory {} failed: {e}", dir.display());
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, RecordBatch, StringArray, UInt32Array};
    use tempfile::tempdir;

    fn data_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, false),
            Field::new("b", DataType::Utf8, true),
        ]))
    }

    fn spilled_batch(values: Vec<i32>, strs: Vec<Option<&str>>, hashes: Vec<u32>) -> RecordBatch {
        RecordBatch::try_new(
            spilled_schema_for(&data_schema()),
            vec![
                Arc::new(Int32Array::from(values)),
                Arc::new(StringArray::from(strs)),
                Arc::new(UInt32Array::from(hashes)),
            ],
        )
        .unwrap()
    }

    fn spill_set_in(dir: &std::path::Path, codec: SpillCodec) -> Arc<SpillSet> {
        let config = SpillConfig {
            local_dirs: vec![dir.to_path_buf()],
            codec,
        };
        SpillSet::new(&config, 7).unwrap()
    }

    #[test]
    fn spill_write_read_roundtrip() {
        let temp = tempdir().unwrap();
        let spill_set = spill_set_in(temp.path(), SpillCodec::None);
        let schema = spilled_schema_for(&data_schema());

        let mut writer = spill_set.create_writer("p0_c0_inner", schema.clone()).unwrap();
        let first = spilled_batch(vec![1, 2, 3], vec![Some("x"), None, Some("z")], vec![7, 8, 9]);
        let second = spilled_batch(vec![4, 5], vec![Some("y"), Some("w")], vec![10, 11]);
        writer.append(&first).unwrap();
        writer.append(&second).unwrap();
        let file = writer.finish().unwrap();
        assert_eq!(file.batches, 2);
        assert!(file.bytes > 0);
        assert!(spill_set.write_bytes() > 0);

        let mut reader = spill_set.open_reader(&file, schema).unwrap();
        assert_eq!(reader.next_batch().unwrap().unwrap(), first);
        assert_eq!(reader.next_batch().unwrap().unwrap(), second);
        assert!(reader.next_batch().unwrap().is_none());

        spill_set.delete(&file.path).unwrap();
        spill_set.close();
        assert!(!file.path.exists());
    }

    #[test]
    fn compressed_roundtrip_preserves_batches() {
        let temp = tempdir().unwrap();
        let spill_set = spill_set_in(temp.path(), SpillCodec::Lz4);
        let schema = spilled_schema_for(&data_schema());
        let batch = spilled_batch(vec![9, 8], vec![None, Some("q")], vec![1, 2]);

        let mut writer = spill_set.create_writer("p3_c1_inner", schema.clone()).unwrap();
        writer.append(&batch).unwrap();
        let file = writer.finish().unwrap();

        let mut reader = spill_set.open_reader(&file, schema).unwrap();
        assert_eq!(reader.next_batch().unwrap().unwrap(), batch);
        spill_set.close();
    }

    #[test]
    fn close_removes_leftover_files() {
        let temp = tempdir().unwrap();
        let spill_set = spill_set_in(temp.path(), SpillCodec::None);
        let schema = spilled_schema_for(&data_schema());
        let mut writer = spill_set.create_writer("p1_c0_outer", schema).unwrap();
        writer
            .append(&spilled_batch(vec![1], vec![Some("a")], vec![3]))
            .unwrap();
        let file = writer.finish().unwrap();
        assert!(file.path.exists());

        spill_set.close();
        assert!(!file.path.exists());
        spill_set.close();

        let remaining: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert!(remaining.is_empty());
    }

    #[test]
    fn schemas_without_the_hash_column_are_rejected() {
        let temp = tempdir().unwrap();
        let spill_set = spill_set_in(temp.path(), SpillCodec::None);
        let err = spill_set
            .create_writer("p0_c0_inner", data_schema())
            .unwrap_err();
        assert!(err.contains(HASH_VALUE_FIELD), "{err}");
        spill_set.close();
    }

    #[test]
    fn reader_rejects_a_different_schema() {
        let temp = tempdir().unwrap();
        let spill_set = spill_set_in(temp.path(), SpillCodec::None);
        let schema = spilled_schema_for(&data_schema());
        let mut writer = spill_set.create_writer("p2_c0_inner", schema).unwrap();
        writer
            .append(&spilled_batch(vec![1], vec![Some("a")], vec![5]))
            .unwrap();
        let file = writer.finish().unwrap();

        let other = spilled_schema_for(&Arc::new(Schema::new(vec![Field::new(
            "z",
            DataType::Int64,
            true,
        )])));
        let err = spill_set.open_reader(&file, other).unwrap_err();
        assert!(err.contains("schema mismatch"), "{err}");
        spill_set.close();
    }
}
