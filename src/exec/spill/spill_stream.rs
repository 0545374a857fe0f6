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
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::StreamReader;
use arrow::record_batch::RecordBatch;

use crate::exec::batch_stream::{BatchStream, Outcome};
use crate::exec::chunk::Chunk;
use crate::exec::spill::{SpillFile, SpillSet, validate_spilled_schema};

/// Sequential reader over one finished spill file. The IPC stream carries
/// the schema; it is checked against the spilled shape the caller expects
/// before any batch is handed out.
#[derive(Debug)]
pub struct SpillReader {
    reader: StreamReader<BufReader<File>>,
}

impl SpillReader {
    pub(crate) fn open(path: &Path, expected_schema: SchemaRef) -> Result<Self, String> {
        validate_spilled_schema(expected_schema.as_ref())?;
        let file = File::open(path)
            .map_err(|e| format!("open spill file {} failed: {e}", path.display()))?;
        let reader = StreamReader::try_new(BufReader::new(file), None)
            .map_err(|e| format!("open spill stream {} failed: {e}", path.display()))?;
        let found = reader.schema();
        if found.fields() != expected_schema.fields() {
            return Err(format!(
                "spilled batch schema mismatch in {}: expected {expected_schema}, found {found}",
                path.display()
            ));
        }
        Ok(Self { reader })
    }

    pub fn next_batch(&mut self) -> Result<Option<RecordBatch>, String> {
        match self.reader.next() {
            Some(Ok(batch)) => Ok(Some(batch)),
            Some(Err(e)) => Err(format!("read spilled batch failed: {e}")),
            None => Ok(None),
        }
    }
}

/// [`BatchStream`] over a spilled partition file. The first batch is read
/// eagerly at construction so the initial outcome is known; the file is
/// deleted (best effort) when the reader is dropped, which covers both the
/// fully-consumed and the cancelled cases.
pub struct SpilledBatchReader {
    spill_set: Arc<SpillSet>,
    file: SpillFile,
    reader: SpillReader,
    schema: SchemaRef,
    staged: Option<Chunk>,
    delivered_first: bool,
    current: Option<Chunk>,
    cancelled: bool,
}

impl SpilledBatchReader {
    pub fn open(
        spill_set: Arc<SpillSet>,
        file: SpillFile,
        schema: SchemaRef,
    ) -> Result<Self, String> {
        let mut reader = spill_set.open_reader(&file, schema.clone())?;
        let staged = reader.next_batch()?.map(Chunk::new);
        Ok(Self {
            spill_set,
            file,
            reader,
            schema,
            staged,
            delivered_first: false,
            current: None,
            cancelled: false,
        })
    }

    /// Outcome the first `next()` call will report.
    pub fn initial_outcome(&self) -> Outcome {
        if self.staged.is_some() {
            Outcome::OkNewSchema
        } else {
            Outcome::None
        }
    }
}

impl BatchStream for SpilledBatchReader {
    fn schema(&self) -> Option<SchemaRef> {
        Some(self.schema.clone())
    }

    fn next(&mut self) -> Result<Outcome, String> {
        if self.cancelled {
            return Ok(Outcome::None);
        }
        if !self.delivered_first {
            self.delivered_first = true;
            return match self.staged.take() {
                Some(chunk) => {
                    self.current = Some(chunk);
                    Ok(Outcome::OkNewSchema)
                }
                None => Ok(Outcome::None),
            };
        }
        match self.reader.next_batch()? {
            Some(batch) => {
                self.current = Some(Chunk::new(batch));
                Ok(Outcome::Ok)
            }
            None => Ok(Outcome::None),
        }
    }

    fn take_batch(&mut self) -> Result<Chunk, String> {
        self.current
            .take()
            .ok_or_else(|| "no batch staged in spilled batch reader".to_string())
    }

    fn cancel(&mut self) {
        self.cancelled = true;
        self.staged = None;
        self.current = None;
    }
}

impl Drop for SpilledBatchReader {
    fn drop(&mut self) {
        self.spill_set.delete_quietly(&self.file.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::spill::{SpillConfig, spilled_schema_for};
    use arrow::array::{Int32Array, UInt32Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use tempfile::tempdir;

    fn schema() -> SchemaRef {
        spilled_schema_for(&Arc::new(Schema::new(vec![Field::new(
            "k",
            DataType::Int32,
            false,
        )])))
    }

    fn batch(values: Vec<i32>, hashes: Vec<u32>) -> RecordBatch {
        RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(Int32Array::from(values)),
                Arc::new(UInt32Array::from(hashes)),
            ],
        )
        .unwrap()
    }

    fn spill_set(dir: &std::path::Path) -> Arc<SpillSet> {
        let config = SpillConfig {
            local_dirs: vec![dir.to_path_buf()],
            ..SpillConfig::default()
        };
        SpillSet::new(&config, 0).unwrap()
    }

    #[test]
    fn reader_streams_batches_and_deletes_on_drop() {
        let temp = tempdir().unwrap();
        let set = spill_set(temp.path());
        let mut writer = set.create_writer("p0_c0_inner", schema()).unwrap();
        writer.append(&batch(vec![1, 2], vec![4, 5])).unwrap();
        writer.append(&batch(vec![3], vec![6])).unwrap();
        let file = writer.finish().unwrap();
        let path = file.path.clone();

        let mut reader = SpilledBatchReader::open(set, file, schema()).unwrap();
        assert_eq!(reader.initial_outcome(), Outcome::OkNewSchema);
        assert_eq!(reader.next().unwrap(), Outcome::OkNewSchema);
        assert_eq!(reader.take_batch().unwrap().len(), 2);
        assert_eq!(reader.next().unwrap(), Outcome::Ok);
        assert_eq!(reader.take_batch().unwrap().len(), 1);
        assert_eq!(reader.next().unwrap(), Outcome::None);
        drop(reader);
        assert!(!path.exists());
    }

    #[test]
    fn empty_file_reports_end_of_stream() {
        let temp = tempdir().unwrap();
        let set = spill_set(temp.path());
        let file = set
            .create_writer("p1_c0_outer", schema())
            .unwrap()
            .finish()
            .unwrap();
        assert_eq!(file.batches, 0);

        let mut reader = SpilledBatchReader::open(set, file, schema()).unwrap();
        assert_eq!(reader.initial_outcome(), Outcome::None);
        assert_eq!(reader.next().unwrap(), Outcome::None);
    }

    #[test]
    fn cancel_stops_the_stream() {
        let temp = tempdir().unwrap();
        let set = spill_set(temp.path());
        let mut writer = set.create_writer("p2_c0_inner", schema()).unwrap();
        writer.append(&batch(vec![1], vec![9])).unwrap();
        let file = writer.finish().unwrap();

        let mut reader = SpilledBatchReader::open(set, file, schema()).unwrap();
        reader.cancel();
        assert_eq!(reader.next().unwrap(), Outcome::None);
    }
}
