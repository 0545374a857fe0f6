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
//! Integration tests for the partitioned spillable hash join operator.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arrow::array::{Array, Int32Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use tempfile::TempDir;

use gracerocks::{
    BloomFilterDef, Chunk, ChunkQueueStream, HashJoinOperator, JoinOptions, JoinSpec, JoinType,
    Outcome, RuntimeFilterDef, RuntimeFilterEntry, RuntimeFilterSink,
};

type Row = (Option<i32>, Option<String>);

fn probe_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("pk", DataType::Int32, true),
        Field::new("pv", DataType::Utf8, true),
    ]))
}

fn build_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("bk", DataType::Int32, true),
        Field::new("bv", DataType::Utf8, true),
    ]))
}

fn chunk(schema: SchemaRef, rows: &[Row]) -> Chunk {
    let keys = rows.iter().map(|(k, _)| *k).collect::<Vec<_>>();
    let values = rows
        .iter()
        .map(|(_, v)| v.clone())
        .collect::<StringArray>();
    Chunk::new(
        RecordBatch::try_new(
            schema,
            vec![Arc::new(Int32Array::from(keys)), Arc::new(values)],
        )
        .unwrap(),
    )
}

fn row(k: i32, v: &str) -> Row {
    (Some(k), Some(v.to_string()))
}

fn chunks_of(schema: SchemaRef, rows: &[Row], rows_per_chunk: usize) -> Vec<Chunk> {
    if rows.is_empty() {
        return Vec::new();
    }
    rows.chunks(rows_per_chunk)
        .map(|part| chunk(schema.clone(), part))
        .collect()
}

fn spec(join_type: JoinType) -> JoinSpec {
    JoinSpec {
        operator_id: 1,
        join_type,
        build_key_indices: vec![0],
        probe_key_indices: vec![0],
        runtime_filter: None,
    }
}

fn options_in(temp: &TempDir) -> JoinOptions {
    JoinOptions {
        spill_dirs: vec![temp.path().to_path_buf()],
        ..JoinOptions::default()
    }
}

fn spilling_options(temp: &TempDir) -> JoinOptions {
    JoinOptions {
        spill_dirs: vec![temp.path().to_path_buf()],
        num_partitions: 4,
        records_per_batch: 4,
        max_batches_in_memory: 2,
        ..JoinOptions::default()
    }
}

fn operator(
    join_type: JoinType,
    probe: Vec<Chunk>,
    build: Vec<Chunk>,
    options: JoinOptions,
) -> HashJoinOperator {
    HashJoinOperator::new(
        spec(join_type),
        options,
        Box::new(ChunkQueueStream::new(probe_schema(), probe)),
        Box::new(ChunkQueueStream::new(build_schema(), build)),
        None,
    )
    .unwrap()
}

fn drain(op: &mut HashJoinOperator) -> Vec<RecordBatch> {
    let mut batches = Vec::new();
    loop {
        match op.next().unwrap() {
            Outcome::Ok | Outcome::OkNewSchema => {
                if let Some(chunk) = op.take_output() {
                    assert_eq!(chunk.len(), op.record_count());
                    if chunk.len() > 0 {
                        batches.push(chunk.batch);
                    }
                }
            }
            Outcome::None => break,
            Outcome::NotYet => continue,
        }
    }
    batches
}

fn column_i32(batch: &RecordBatch, idx: usize) -> Vec<Option<i32>> {
    let array = batch
        .column(idx)
        .as_any()
        .downcast_ref::<Int32Array>()
        .unwrap();
    (0..array.len())
        .map(|i| (!array.is_null(i)).then(|| array.value(i)))
        .collect()
}

fn column_utf8(batch: &RecordBatch, idx: usize) -> Vec<Option<String>> {
    let array = batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .unwrap();
    (0..array.len())
        .map(|i| (!array.is_null(i)).then(|| array.value(i).to_string()))
        .collect()
}

/// Flatten joined output (probe columns then build columns) into sortable
/// tuples.
fn joined_rows(batches: &[RecordBatch]) -> Vec<(Row, Row)> {
    let mut out = Vec::new();
    for batch in batches {
        let pk = column_i32(batch, 0);
        let pv = column_utf8(batch, 1);
        let bk = column_i32(batch, 2);
        let bv = column_utf8(batch, 3);
        for i in 0..batch.num_rows() {
            out.push((
                (pk[i], pv[i].clone()),
                (bk[i], bv[i].clone()),
            ));
        }
    }
    out.sort();
    out
}

fn probe_rows(batches: &[RecordBatch]) -> Vec<Row> {
    let mut out = Vec::new();
    for batch in batches {
        let pk = column_i32(batch, 0);
        let pv = column_utf8(batch, 1);
        for i in 0..batch.num_rows() {
            out.push((pk[i], pv[i].clone()));
        }
    }
    out.sort();
    out
}

/// Reference inner-equijoin on the test tuples, NULL keys never matching.
fn reference_inner_join(probe: &[Row], build: &[Row]) -> Vec<(Row, Row)> {
    let mut by_key: HashMap<i32, Vec<Row>> = HashMap::new();
    for row in build {
        if let Some(k) = row.0 {
            by_key.entry(k).or_default().push(row.clone());
        }
    }
    let mut out = Vec::new();
    for p in probe {
        let Some(k) = p.0 else { continue };
        if let Some(matches) = by_key.get(&k) {
            for b in matches {
                out.push((p.clone(), b.clone()));
            }
        }
    }
    out.sort();
    out
}

fn assert_no_spill_leftovers(temp: &TempDir) {
    let leftover: Vec<_> = std::fs::read_dir(temp.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert!(leftover.is_empty(), "spill leftovers: {leftover:?}");
}

#[test]
fn inner_join_small() {
    let temp = TempDir::new().unwrap();
    let build = vec![chunk(
        build_schema(),
        &[row(1, "a"), row(2, "b"), row(2, "c")],
    )];
    let probe = vec![chunk(probe_schema(), &[row(2, "x"), row(3, "y")])];
    let mut op = operator(JoinType::Inner, probe, build, options_in(&temp));

    let batches = drain(&mut op);
    op.close();
    assert_eq!(
        joined_rows(&batches),
        vec![
            (row(2, "x"), row(2, "b")),
            (row(2, "x"), row(2, "c")),
        ]
    );
    assert_no_spill_leftovers(&temp);
}

#[test]
fn inner_join_with_empty_build_side_short_circuits() {
    let temp = TempDir::new().unwrap();
    let probe = vec![chunk(probe_schema(), &[row(1, "x")])];
    let mut op = operator(JoinType::Inner, probe, Vec::new(), options_in(&temp));

    assert_eq!(op.next().unwrap(), Outcome::OkNewSchema);
    assert_eq!(op.take_output().unwrap().len(), 0);
    assert_eq!(op.next().unwrap(), Outcome::None);
    op.close();
    assert_no_spill_leftovers(&temp);
}

#[test]
fn probe_preserving_join_streams_probe_rows_when_build_is_empty() {
    let temp = TempDir::new().unwrap();
    let probe = vec![chunk(probe_schema(), &[row(1, "x"), row(2, "y")])];
    let mut op = operator(JoinType::LeftOuter, probe, Vec::new(), options_in(&temp));

    let batches = drain(&mut op);
    op.close();
    assert_eq!(
        joined_rows(&batches),
        vec![
            (row(1, "x"), (None, None)),
            (row(2, "y"), (None, None)),
        ]
    );
    assert_no_spill_leftovers(&temp);
}

#[test]
fn build_preserving_join_emits_all_build_rows_when_probe_is_empty() {
    let temp = TempDir::new().unwrap();
    let build_rows: Vec<Row> = (0..100).map(|i| row(i, "b")).collect();
    let build = chunks_of(build_schema(), &build_rows, 32);
    let mut op = operator(JoinType::RightOuter, Vec::new(), build, options_in(&temp));

    let batches = drain(&mut op);
    op.close();
    let rows = joined_rows(&batches);
    assert_eq!(rows.len(), 100);
    assert!(rows.iter().all(|(p, b)| p.0.is_none() && b.0.is_some()));
    assert_no_spill_leftovers(&temp);
}

#[test]
fn probe_preserving_join_with_empty_probe_side_emits_nothing() {
    let temp = TempDir::new().unwrap();
    let build = vec![chunk(build_schema(), &[row(1, "a")])];
    let mut op = operator(JoinType::LeftOuter, Vec::new(), build, options_in(&temp));

    let batches = drain(&mut op);
    op.close();
    assert!(batches.is_empty());
    assert_no_spill_leftovers(&temp);
}

#[test]
fn full_outer_join_preserves_both_sides() {
    let temp = TempDir::new().unwrap();
    let build = vec![chunk(build_schema(), &[row(1, "a"), row(3, "c")])];
    let probe = vec![chunk(probe_schema(), &[row(1, "x"), row(2, "y")])];
    let mut op = operator(JoinType::FullOuter, probe, build, options_in(&temp));

    let batches = drain(&mut op);
    op.close();
    assert_eq!(
        joined_rows(&batches),
        vec![
            ((None, None), row(3, "c")),
            (row(1, "x"), row(1, "a")),
            (row(2, "y"), (None, None)),
        ]
    );
    assert_no_spill_leftovers(&temp);
}

#[test]
fn left_semi_join_emits_each_matched_probe_row_once() {
    let temp = TempDir::new().unwrap();
    let build = vec![chunk(
        build_schema(),
        &[row(1, "a"), row(1, "b"), row(2, "c")],
    )];
    let probe = vec![chunk(
        probe_schema(),
        &[row(1, "x"), row(1, "y"), row(3, "z")],
    )];
    let mut op = operator(JoinType::LeftSemi, probe, build, options_in(&temp));

    let batches = drain(&mut op);
    op.close();
    assert_eq!(probe_rows(&batches), vec![row(1, "x"), row(1, "y")]);
    assert_no_spill_leftovers(&temp);
}

#[test]
fn intersect_distinct_treats_nulls_as_equal() {
    let temp = TempDir::new().unwrap();
    let build = vec![chunk(
        build_schema(),
        &[row(1, "a"), (None, Some("n".to_string())), row(3, "c")],
    )];
    let probe = vec![chunk(
        probe_schema(),
        &[
            row(1, "x"),
            row(1, "y"),
            row(2, "z"),
            (None, Some("m".to_string())),
        ],
    )];
    let mut op = operator(JoinType::IntersectDistinct, probe, build, options_in(&temp));

    let batches = drain(&mut op);
    op.close();
    let rows = probe_rows(&batches);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, None);
    assert_eq!(rows[1].0, Some(1));
    assert_no_spill_leftovers(&temp);
}

#[test]
fn except_distinct_emits_unmatched_distinct_probe_keys() {
    let temp = TempDir::new().unwrap();
    let build = vec![chunk(
        build_schema(),
        &[row(1, "a"), (None, Some("n".to_string()))],
    )];
    let probe = vec![chunk(
        probe_schema(),
        &[
            row(1, "x"),
            row(2, "y"),
            row(2, "z"),
            row(4, "w"),
            (None, Some("m".to_string())),
        ],
    )];
    let mut op = operator(JoinType::ExceptDistinct, probe, build, options_in(&temp));

    let batches = drain(&mut op);
    op.close();
    let rows = probe_rows(&batches);
    let keys: Vec<Option<i32>> = rows.iter().map(|r| r.0).collect();
    assert_eq!(keys, vec![Some(2), Some(4)]);
    assert_no_spill_leftovers(&temp);
}

#[test]
fn except_distinct_with_empty_build_side_is_distinct_probe() {
    let temp = TempDir::new().unwrap();
    let probe = vec![chunk(
        probe_schema(),
        &[row(1, "x"), row(1, "y"), row(2, "z")],
    )];
    let mut op = operator(JoinType::ExceptDistinct, probe, Vec::new(), options_in(&temp));

    let batches = drain(&mut op);
    op.close();
    let keys: Vec<Option<i32>> = probe_rows(&batches).iter().map(|r| r.0).collect();
    assert_eq!(keys, vec![Some(1), Some(2)]);
    assert_no_spill_leftovers(&temp);
}

fn large_inputs() -> (Vec<Row>, Vec<Row>) {
    let build: Vec<Row> = (0..400).map(|i| row(i % 100, "b")).collect();
    let probe: Vec<Row> = (0..300).map(|i| row(i % 150, "p")).collect();
    (probe, build)
}

#[test]
fn spilling_run_matches_in_memory_run() {
    let (probe, build) = large_inputs();
    let expected = reference_inner_join(&probe, &build);

    let temp = TempDir::new().unwrap();
    let mut in_memory = operator(
        JoinType::Inner,
        chunks_of(probe_schema(), &probe, 64),
        chunks_of(build_schema(), &build, 64),
        options_in(&temp),
    );
    let in_memory_batches = drain(&mut in_memory);
    in_memory.close();
    assert_eq!(joined_rows(&in_memory_batches), expected);
    assert_no_spill_leftovers(&temp);

    let temp = TempDir::new().unwrap();
    let mut spilling = operator(
        JoinType::Inner,
        chunks_of(probe_schema(), &probe, 16),
        chunks_of(build_schema(), &build, 16),
        spilling_options(&temp),
    );
    let spilling_batches = drain(&mut spilling);
    let spilled_partitions = spilling
        .profile()
        .counter("SpilledPartitions")
        .map(|c| c.value())
        .unwrap_or(0);
    let spill_cycle = spilling
        .profile()
        .counter("SpillCycle")
        .map(|c| c.value())
        .unwrap_or(0);
    spilling.close();

    assert_eq!(joined_rows(&spilling_batches), expected);
    assert!(spilled_partitions > 0, "expected the build side to spill");
    assert!(spill_cycle >= 1, "expected at least one spill cycle");
    assert_no_spill_leftovers(&temp);
}

#[test]
fn spilling_outer_join_matches_in_memory_run() {
    let (probe, build) = large_inputs();
    let matched = reference_inner_join(&probe, &build);
    let matched_probe: Vec<Row> = matched.iter().map(|(p, _)| p.clone()).collect();
    let mut expected = matched;
    for p in &probe {
        if !matched_probe.contains(p) {
            expected.push((p.clone(), (None, None)));
        }
    }
    expected.sort();

    let temp = TempDir::new().unwrap();
    let mut op = operator(
        JoinType::LeftOuter,
        chunks_of(probe_schema(), &probe, 16),
        chunks_of(build_schema(), &build, 16),
        spilling_options(&temp),
    );
    let batches = drain(&mut op);
    op.close();
    assert_eq!(joined_rows(&batches), expected);
    assert_no_spill_leftovers(&temp);
}

#[test]
fn single_partition_fallback_matches_partitioned_run() {
    let (probe, build) = large_inputs();
    let expected = reference_inner_join(&probe, &build);

    let temp = TempDir::new().unwrap();
    let options = JoinOptions {
        spill_dirs: vec![temp.path().to_path_buf()],
        num_partitions: 1,
        fallback_enabled: true,
        ..JoinOptions::default()
    };
    let mut op = operator(
        JoinType::Inner,
        chunks_of(probe_schema(), &probe, 32),
        chunks_of(build_schema(), &build, 32),
        options,
    );
    let batches = drain(&mut op);
    op.close();
    assert_eq!(joined_rows(&batches), expected);
    assert_no_spill_leftovers(&temp);
}

#[test]
fn skewed_keys_fall_back_when_enabled() {
    let temp = TempDir::new().unwrap();
    let build: Vec<Row> = (0..200).map(|i| (Some(0), Some(format!("b{i}")))).collect();
    let probe = vec![chunk(probe_schema(), &[row(0, "x")])];
    let options = JoinOptions {
        spill_dirs: vec![temp.path().to_path_buf()],
        num_partitions: 16,
        records_per_batch: 4,
        max_memory: 512,
        fallback_enabled: true,
        ..JoinOptions::default()
    };
    let mut op = operator(
        JoinType::Inner,
        probe,
        chunks_of(build_schema(), &build, 16),
        options,
    );
    let batches = drain(&mut op);
    op.close();
    assert_eq!(joined_rows(&batches).len(), 200);
    assert_no_spill_leftovers(&temp);
}

#[test]
fn skewed_keys_without_fallback_raise_partition_exhaustion() {
    let temp = TempDir::new().unwrap();
    let build: Vec<Row> = (0..64).map(|i| (Some(0), Some(format!("b{i}")))).collect();
    let probe: Vec<Row> = (0..8).map(|_| row(0, "x")).collect();
    let options = JoinOptions {
        spill_dirs: vec![temp.path().to_path_buf()],
        num_partitions: 2,
        records_per_batch: 4,
        max_batches_in_memory: 1,
        fallback_enabled: false,
        ..JoinOptions::default()
    };
    let mut op = operator(
        JoinType::Inner,
        chunks_of(probe_schema(), &probe, 4),
        chunks_of(build_schema(), &build, 8),
        options,
    );

    let mut error = None;
    loop {
        match op.next() {
            Ok(Outcome::None) => break,
            Ok(_) => {
                let _ = op.take_output();
            }
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }
    op.close();
    let error = error.expect("expected partition exhaustion");
    assert!(
        error.contains("can not partition the inner data any further"),
        "{error}"
    );
    assert_no_spill_leftovers(&temp);
}

#[test]
fn estimate_strategy_without_fallback_raises_resource_error() {
    let temp = TempDir::new().unwrap();
    let (probe, build) = large_inputs();
    let options = JoinOptions {
        spill_dirs: vec![temp.path().to_path_buf()],
        num_partitions: 16,
        max_memory: 2 * 1024,
        fallback_enabled: false,
        ..JoinOptions::default()
    };
    let mut op = operator(
        JoinType::Inner,
        chunks_of(probe_schema(), &probe, 64),
        chunks_of(build_schema(), &build, 64),
        options,
    );

    assert_eq!(op.next().unwrap(), Outcome::OkNewSchema);
    let error = op.next().unwrap_err();
    assert!(
        error.contains("not enough memory for internal partitioning"),
        "{error}"
    );
    op.close();
    assert_no_spill_leftovers(&temp);
}

#[test]
fn cancel_leaves_no_spill_files_and_next_reports_end() {
    let (probe, build) = large_inputs();
    let temp = TempDir::new().unwrap();
    let mut op = operator(
        JoinType::Inner,
        chunks_of(probe_schema(), &probe, 16),
        chunks_of(build_schema(), &build, 16),
        spilling_options(&temp),
    );

    assert_eq!(op.next().unwrap(), Outcome::OkNewSchema);
    assert!(op.next().is_ok());
    op.cancel();
    assert_eq!(op.next().unwrap(), Outcome::None);
    assert_eq!(op.next().unwrap(), Outcome::None);
    op.close();
    op.close();
    assert_no_spill_leftovers(&temp);
}

struct CountingSink {
    sends: Arc<AtomicUsize>,
    entries: Arc<AtomicUsize>,
}

impl RuntimeFilterSink for CountingSink {
    fn send(&self, filters: Vec<RuntimeFilterEntry>, _operator_id: i32) {
        self.sends.fetch_add(1, Ordering::AcqRel);
        self.entries.fetch_add(filters.len(), Ordering::AcqRel);
    }
}

#[test]
fn runtime_filter_is_emitted_exactly_once_even_with_spill_cycles() {
    let (probe, build) = large_inputs();
    let temp = TempDir::new().unwrap();
    let sends = Arc::new(AtomicUsize::new(0));
    let entries = Arc::new(AtomicUsize::new(0));
    let sink = CountingSink {
        sends: Arc::clone(&sends),
        entries: Arc::clone(&entries),
    };

    let join_spec = JoinSpec {
        runtime_filter: Some(RuntimeFilterDef {
            bloom_filter_defs: vec![BloomFilterDef {
                build_field: "bk".to_string(),
                probe_field: "pk".to_string(),
                num_bytes: 4096,
            }],
        }),
        ..spec(JoinType::Inner)
    };
    let mut op = HashJoinOperator::new(
        join_spec,
        spilling_options(&temp),
        Box::new(ChunkQueueStream::new(
            probe_schema(),
            chunks_of(probe_schema(), &probe, 16),
        )),
        Box::new(ChunkQueueStream::new(
            build_schema(),
            chunks_of(build_schema(), &build, 16),
        )),
        Some(Box::new(sink)),
    )
    .unwrap();

    let batches = drain(&mut op);
    let spill_cycle = op
        .profile()
        .counter("SpillCycle")
        .map(|c| c.value())
        .unwrap_or(0);
    op.close();

    assert!(spill_cycle >= 1, "expected spill cycles in this run");
    assert_eq!(sends.load(Ordering::Acquire), 1);
    assert_eq!(entries.load(Ordering::Acquire), 1);
    assert_eq!(
        joined_rows(&batches),
        reference_inner_join(&large_inputs().0, &large_inputs().1)
    );
    assert_no_spill_leftovers(&temp);
}

#[test]
fn key_type_mismatch_is_a_schema_error() {
    let temp = TempDir::new().unwrap();
    let other_probe_schema: SchemaRef = Arc::new(Schema::new(vec![
        Field::new("pk", DataType::Utf8, true),
        Field::new("pv", DataType::Utf8, true),
    ]));
    let probe_chunk = Chunk::new(
        RecordBatch::try_new(
            other_probe_schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![Some("1")])),
                Arc::new(StringArray::from(vec![Some("x")])),
            ],
        )
        .unwrap(),
    );
    let mut op = HashJoinOperator::new(
        spec(JoinType::Inner),
        options_in(&temp),
        Box::new(ChunkQueueStream::new(other_probe_schema, vec![probe_chunk])),
        Box::new(ChunkQueueStream::new(
            build_schema(),
            vec![chunk(build_schema(), &[row(1, "a")])],
        )),
        None,
    )
    .unwrap();

    let error = op.next().unwrap_err();
    assert!(error.contains("join key type mismatch"), "{error}");
    op.close();
    assert_no_spill_leftovers(&temp);
}

#[test]
fn mid_stream_build_schema_change_is_fatal() {
    let temp = TempDir::new().unwrap();
    let changed_schema: SchemaRef = Arc::new(Schema::new(vec![
        Field::new("bk", DataType::Int32, true),
        Field::new("other", DataType::Utf8, true),
    ]));
    let changed = Chunk::new(
        RecordBatch::try_new(
            changed_schema,
            vec![
                Arc::new(Int32Array::from(vec![Some(9)])),
                Arc::new(StringArray::from(vec![Some("z")])),
            ],
        )
        .unwrap(),
    );
    let mut op = HashJoinOperator::new(
        spec(JoinType::Inner),
        options_in(&temp),
        Box::new(ChunkQueueStream::new(
            probe_schema(),
            vec![chunk(probe_schema(), &[row(1, "x")])],
        )),
        Box::new(ChunkQueueStream::new(
            build_schema(),
            vec![chunk(build_schema(), &[row(1, "a")]), changed],
        )),
        None,
    )
    .unwrap();

    assert_eq!(op.next().unwrap(), Outcome::OkNewSchema);
    let error = op.next().unwrap_err();
    assert!(
        error.contains("does not support schema changes in build side"),
        "{error}"
    );
    op.close();
    assert_no_spill_leftovers(&temp);
}
