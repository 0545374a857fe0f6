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
use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use arrow::ipc::writer::StreamWriter;

use crate::exec::spill::{SpillFile, SpillSet, validate_spilled_schema};

/// Appends hash-routed partition batches to one spill file as an Arrow IPC
/// stream. An unfinished file has no end-of-stream marker and must be
/// deleted by its owner instead of being read.
pub struct SpillWriter {
    spill_set: Arc<SpillSet>,
    path: PathBuf,
    writer: Option<StreamWriter<BufWriter<File>>>,
    batches: usize,
}

impl std::fmt::Debug for SpillWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillWriter")
            .field("spill_set", &self.spill_set)
            .field("path", &self.path)
            .field("writer", &self.writer.as_ref().map(|_| "StreamWriter"))
            .field("batches", &self.batches)
            .finish()
    }
}

impl SpillWriter {
    pub(crate) fn create(
        spill_set: Arc<SpillSet>,
        path: PathBuf,
        schema: SchemaRef,
    ) -> Result<Self, String> {
        validate_spilled_schema(schema.as_ref())?;
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .map_err(|e| format!("create spill file {} failed: {e}", path.display()))?;
        let options = spill_set.codec().ipc_write_options()?;
        let writer =
            StreamWriter::try_new_with_options(BufWriter::new(file), schema.as_ref(), options)
                .map_err(|e| format!("open spill stream {} failed: {e}", path.display()))?;
        Ok(Self {
            spill_set,
            path,
            writer: Some(writer),
            batches: 0,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn append(&mut self, batch: &RecordBatch) -> Result<(), String> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| "append to finished spill writer".to_string())?;
        writer
            .write(batch)
            .map_err(|e| format!("write spilled batch to {} failed: {e}", self.path.display()))?;
        self.batches += 1;
        Ok(())
    }

    /// Write the end-of-stream marker, flush, and hand out the finished file.
    pub fn finish(&mut self) -> Result<SpillFile, String> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| "spill writer already finished".to_string())?;
        writer
            .finish()
            .map_err(|e| format!("finish spill stream {} failed: {e}", self.path.display()))?;
        let buffered = writer
            .into_inner()
            .map_err(|e| format!("close spill stream {} failed: {e}", self.path.display()))?;
        let file = buffered
            .into_inner()
            .map_err(|e| format!("flush spill file {} failed: {e}", self.path.display()))?;
        let bytes = file
            .metadata()
            .map_err(|e| format!("stat spill file {} failed: {e}", self.path.display()))?
            .len();

        self.spill_set.add_write_bytes(bytes);
        Ok(SpillFile {
            path: self.path.clone(),
            batches: self.batches,
            bytes,
        })
    }
}
