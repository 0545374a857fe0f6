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
//! Pull contract between operators and their inputs.
//!
//! Responsibilities:
//! - Defines the per-call `Outcome` protocol and the `BatchStream` trait the
//!   join operator drains build and probe inputs through.
//! - Provides `ChunkQueueStream`, the in-memory adapter used to feed
//!   operators from buffered chunks.

use std::collections::VecDeque;

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::Chunk;

/// Result of advancing a [`BatchStream`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A batch is available under the current schema.
    Ok,
    /// A batch is available and the stream's schema was (re)established.
    OkNewSchema,
    /// End of stream.
    None,
    /// No data available right now; try again.
    NotYet,
}

impl Outcome {
    /// True for outcomes that carry a batch.
    pub fn carries_batch(self) -> bool {
        matches!(self, Outcome::Ok | Outcome::OkNewSchema)
    }
}

/// A streaming, batched columnar input.
pub trait BatchStream {
    /// Schema of the stream, when known up front or after the first batch.
    fn schema(&self) -> Option<SchemaRef>;

    /// Advance to the next batch. When the returned outcome carries a batch
    /// it must be collected with [`BatchStream::take_batch`] before the next
    /// advance.
    fn next(&mut self) -> Result<Outcome, String>;

    /// Take the batch made available by the last `next()` call.
    fn take_batch(&mut self) -> Result<Chunk, String>;

    /// Tell the stream its remaining data is unwanted. Subsequent `next()`
    /// calls drain quickly to end-of-stream.
    fn cancel(&mut self);
}

/// In-memory [`BatchStream`] over a queue of chunks.
pub struct ChunkQueueStream {
    schema: SchemaRef,
    queue: VecDeque<Chunk>,
    current: Option<Chunk>,
    seen_schema: Option<SchemaRef>,
    cancelled: bool,
}

impl ChunkQueueStream {
    pub fn new(schema: SchemaRef, chunks: Vec<Chunk>) -> Self {
        Self {
            schema,
            queue: chunks.into(),
            current: None,
            seen_schema: None,
            cancelled: false,
        }
    }

    pub fn empty(schema: SchemaRef) -> Self {
        Self::new(schema, Vec::new())
    }
}

impl BatchStream for ChunkQueueStream {
    fn schema(&self) -> Option<SchemaRef> {
        Some(self.schema.clone())
    }

    fn next(&mut self) -> Result<Outcome, String> {
        if self.cancelled {
            return Ok(Outcome::None);
        }
        let Some(chunk) = self.queue.pop_front() else {
            return Ok(Outcome::None);
        };
        let chunk_schema = chunk.schema();
        let outcome = match self.seen_schema.as_ref() {
            Some(seen) if seen.as_ref() == chunk_schema.as_ref() => Outcome::Ok,
            _ => {
                self.seen_schema = Some(chunk_schema);
                Outcome::OkNewSchema
            }
        };
        self.current = Some(chunk);
        Ok(outcome)
    }

    fn take_batch(&mut self) -> Result<Chunk, String> {
        self.current
            .take()
            .ok_or_else(|| "no batch staged in chunk queue stream".to_string())
    }

    fn cancel(&mut self) {
        self.cancelled = true;
        self.queue.clear();
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn test_chunk(values: Vec<i32>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int32, true)]));
        Chunk::new(RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))]).unwrap())
    }

    #[test]
    fn first_batch_reports_new_schema() {
        let schema = test_chunk(vec![]).schema();
        let mut stream =
            ChunkQueueStream::new(schema, vec![test_chunk(vec![1]), test_chunk(vec![2])]);
        assert_eq!(stream.next().unwrap(), Outcome::OkNewSchema);
        assert_eq!(stream.take_batch().unwrap().len(), 1);
        assert_eq!(stream.next().unwrap(), Outcome::Ok);
        assert_eq!(stream.take_batch().unwrap().len(), 1);
        assert_eq!(stream.next().unwrap(), Outcome::None);
    }

    #[test]
    fn cancel_drains_to_end_of_stream() {
        let schema = test_chunk(vec![]).schema();
        let mut stream = ChunkQueueStream::new(schema, vec![test_chunk(vec![1])]);
        stream.cancel();
        assert_eq!(stream.next().unwrap(), Outcome::None);
    }
}
