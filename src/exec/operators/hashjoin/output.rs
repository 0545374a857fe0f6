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
//! Output-batch assembly for hash-join probing.
//!
//! Responsibilities:
//! - Builds joined batches from matched row-index pairs and null-padded
//!   batches for the preserved side of outer joins.
//! - Derives the operator output schema with nullable widening.

use std::sync::Arc;

use arrow::array::{ArrayRef, UInt32Array, new_null_array};
use arrow::compute::take;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::exec::chunk::Chunk;

/// Probe columns followed by build columns, with nullable widening on the
/// side that gets null-padded for the configured join.
pub(crate) fn join_output_schema(
    probe_schema: &SchemaRef,
    build_schema: &SchemaRef,
    widen_probe: bool,
    widen_build: bool,
) -> SchemaRef {
    let mut fields = Vec::with_capacity(probe_schema.fields().len() + build_schema.fields().len());
    for field in probe_schema.fields() {
        fields.push(widen_field(field, widen_probe));
    }
    for field in build_schema.fields() {
        fields.push(widen_field(field, widen_build));
    }
    Arc::new(Schema::new(fields))
}

fn widen_field(field: &Arc<Field>, widen: bool) -> Arc<Field> {
    if widen && !field.is_nullable() {
        Arc::new(field.as_ref().clone().with_nullable(true))
    } else {
        Arc::clone(field)
    }
}

/// Joined rows from matched (probe row, build row) index pairs.
pub(crate) fn matched_join_batch(
    probe: &Chunk,
    build: &Chunk,
    probe_indices: &[u32],
    build_indices: &[u32],
    output_schema: &SchemaRef,
) -> Result<Option<RecordBatch>, String> {
    if probe_indices.is_empty() || build_indices.is_empty() {
        return Ok(None);
    }
    let probe_idx = Arc::new(UInt32Array::from(probe_indices.to_vec())) as ArrayRef;
    let build_idx = Arc::new(UInt32Array::from(build_indices.to_vec())) as ArrayRef;

    let mut columns = Vec::with_capacity(probe.batch.num_columns() + build.batch.num_columns());
    for col in probe.batch.columns() {
        columns.push(take(col.as_ref(), &probe_idx, None).map_err(|e| e.to_string())?);
    }
    for col in build.batch.columns() {
        columns.push(take(col.as_ref(), &build_idx, None).map_err(|e| e.to_string())?);
    }

    let batch = RecordBatch::try_new(output_schema.clone(), columns).map_err(|e| e.to_string())?;
    Ok(Some(batch))
}

/// Probe-preserving rows with a null-filled build side.
pub(crate) fn probe_with_null_build(
    probe: &Chunk,
    probe_indices: &[u32],
    build_schema: &SchemaRef,
    output_schema: &SchemaRef,
) -> Result<Option<RecordBatch>, String> {
    if probe_indices.is_empty() {
        return Ok(None);
    }
    let len = probe_indices.len();
    let probe_idx = Arc::new(UInt32Array::from(probe_indices.to_vec())) as ArrayRef;

    let mut columns = Vec::with_capacity(probe.batch.num_columns() + build_schema.fields().len());
    for col in probe.batch.columns() {
        columns.push(take(col.as_ref(), &probe_idx, None).map_err(|e| e.to_string())?);
    }
    for field in build_schema.fields() {
        columns.push(new_null_array(field.data_type(), len));
    }

    let batch = RecordBatch::try_new(output_schema.clone(), columns).map_err(|e| e.to_string())?;
    Ok(Some(batch))
}

/// Build-preserving rows with a null-filled probe side.
pub(crate) fn build_with_null_probe(
    build: &Chunk,
    build_indices: &[u32],
    probe_schema: &SchemaRef,
    output_schema: &SchemaRef,
) -> Result<Option<RecordBatch>, String> {
    if build_indices.is_empty() {
        return Ok(None);
    }
    let len = build_indices.len();
    let build_idx = Arc::new(UInt32Array::from(build_indices.to_vec())) as ArrayRef;

    let mut columns = Vec::with_capacity(probe_schema.fields().len() + build.batch.num_columns());
    for field in probe_schema.fields() {
        columns.push(new_null_array(field.data_type(), len));
    }
    for col in build.batch.columns() {
        columns.push(take(col.as_ref(), &build_idx, None).map_err(|e| e.to_string())?);
    }

    let batch = RecordBatch::try_new(output_schema.clone(), columns).map_err(|e| e.to_string())?;
    Ok(Some(batch))
}

/// Probe-side-only rows (semi joins and set operations).
pub(crate) fn probe_only_batch(
    probe: &Chunk,
    probe_indices: &[u32],
    output_schema: &SchemaRef,
) -> Result<Option<RecordBatch>, String> {
    if probe_indices.is_empty() {
        return Ok(None);
    }
    let probe_idx = Arc::new(UInt32Array::from(probe_indices.to_vec())) as ArrayRef;
    let mut columns = Vec::with_capacity(probe.batch.num_columns());
    for col in probe.batch.columns() {
        columns.push(take(col.as_ref(), &probe_idx, None).map_err(|e| e.to_string())?);
    }
    let batch = RecordBatch::try_new(output_schema.clone(), columns).map_err(|e| e.to_string())?;
    Ok(Some(batch))
}

/// Estimated output row width, used to size output batches.
pub(crate) fn estimated_row_bytes(schema: &SchemaRef) -> usize {
    let mut bytes = 0usize;
    for field in schema.fields() {
        bytes += match field.data_type() {
            DataType::Boolean => 1,
            DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 | DataType::Date32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 | DataType::Date64 => 8,
            DataType::Timestamp(_, _) => 8,
            DataType::Decimal128(_, _) => 16,
            DataType::Utf8 | DataType::Binary => 24,
            DataType::LargeUtf8 | DataType::LargeBinary => 32,
            _ => 16,
        };
    }
    bytes.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int32Array, StringArray};

    fn probe_chunk() -> Chunk {
        let schema = Arc::new(Schema::new(vec![
            Field::new("pk", DataType::Int32, false),
            Field::new("pv", DataType::Utf8, true),
        ]));
        Chunk::new(
            RecordBatch::try_new(
                schema,
                vec![
                    Arc::new(Int32Array::from(vec![1, 2, 3])),
                    Arc::new(StringArray::from(vec![Some("x"), Some("y"), None])),
                ],
            )
            .unwrap(),
        )
    }

    fn build_chunk() -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("bk", DataType::Int32, false)]));
        Chunk::new(
            RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(vec![10, 20]))]).unwrap(),
        )
    }

    #[test]
    fn output_schema_widens_only_requested_side() {
        let probe = probe_chunk().schema();
        let build = build_chunk().schema();
        let schema = join_output_schema(&probe, &build, false, true);
        assert!(!schema.field(0).is_nullable());
        assert!(schema.field(2).is_nullable());

        let schema = join_output_schema(&probe, &build, true, false);
        assert!(schema.field(0).is_nullable());
        assert!(!schema.field(2).is_nullable());
    }

    #[test]
    fn matched_rows_take_both_sides() {
        let probe = probe_chunk();
        let build = build_chunk();
        let schema = join_output_schema(&probe.schema(), &build.schema(), false, false);
        let batch = matched_join_batch(&probe, &build, &[0, 2], &[1, 0], &schema)
            .unwrap()
            .unwrap();
        assert_eq!(batch.num_rows(), 2);
        let pk = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap();
        let bk = batch
            .column(2)
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap();
        assert_eq!((pk.value(0), bk.value(0)), (1, 20));
        assert_eq!((pk.value(1), bk.value(1)), (3, 10));
    }

    #[test]
    fn null_padded_sides_are_all_null() {
        let probe = probe_chunk();
        let build = build_chunk();
        let schema = join_output_schema(&probe.schema(), &build.schema(), true, true);

        let batch = probe_with_null_build(&probe, &[1], &build.schema(), &schema)
            .unwrap()
            .unwrap();
        assert_eq!(batch.num_rows(), 1);
        assert!(batch.column(2).is_null(0));

        let batch = build_with_null_probe(&build, &[0, 1], &probe.schema(), &schema)
            .unwrap()
            .unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert!(batch.column(0).is_null(0));
        assert!(batch.column(1).is_null(1));
    }
}
