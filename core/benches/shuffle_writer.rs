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

use arrow::array::{ArrayRef, Int32Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use criterion::{criterion_group, criterion_main, Criterion};
use datafusion::datasource::memory::MemorySourceConfig;
use datafusion::datasource::source::DataSourceExec;
use datafusion::execution::runtime_env::RuntimeEnv;
use datafusion::physical_plan::common::collect;
use datafusion::physical_plan::metrics::{ExecutionPlanMetricsSet, Time};
use datafusion::physical_plan::ExecutionPlan;
use datafusion::prelude::SessionContext;
use native_shuffle::execution::shuffle::write_block;
use native_shuffle::{
    CompressionCodec, LocalDiskPartitionWriter, PartitionIdSource, ShuffleWriter,
    ShuffleWriterConfig, ShuffleWriterExec, ShuffleWriterMetrics,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Cursor;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;

const NUM_PARTITIONS: usize = 16;

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("shuffle_writer");
    for (name, codec) in [
        ("no compression", CompressionCodec::None),
        ("snappy", CompressionCodec::Snappy),
        ("lz4", CompressionCodec::Lz4Frame),
        ("zstd level 1", CompressionCodec::Zstd(1)),
        ("zstd level 6", CompressionCodec::Zstd(6)),
    ] {
        group.bench_function(format!("shuffle_writer: encode ({name})"), |b| {
            let batch = sequence_batch(0, 8192, None);
            let mut buffer = vec![];
            let ipc_time = Time::default();
            b.iter(|| {
                buffer.clear();
                let mut cursor = Cursor::new(&mut buffer);
                write_block(&batch, &codec, &mut cursor, &ipc_time)
            });
        });
    }

    for (name, memory_limit) in [("in memory", 64 * 1024 * 1024), ("spilling", 256 * 1024)] {
        group.bench_function(format!("shuffle_writer: insert and stop ({name})"), |b| {
            let batches = create_batches(8192, 10);
            let runtime = Arc::new(RuntimeEnv::default());
            b.iter(|| {
                let dir = TempDir::new().unwrap();
                let config = ShuffleWriterConfig::default().with_memory_limit(memory_limit);
                let metrics = ShuffleWriterMetrics::new(&ExecutionPlanMetricsSet::new(), 0);
                let partition_writer = LocalDiskPartitionWriter::try_new(
                    NUM_PARTITIONS,
                    dir.path().join("data.out"),
                    Some(dir.path().join("index.out")),
                    &config,
                    Arc::clone(&runtime),
                    metrics.clone(),
                )
                .unwrap();
                let mut writer = ShuffleWriter::try_new(
                    0,
                    NUM_PARTITIONS,
                    batches[0].schema(),
                    PartitionIdSource::FirstColumn,
                    config,
                    Box::new(partition_writer),
                    &runtime,
                    metrics,
                )
                .unwrap();
                writer.init().unwrap();
                for batch in &batches {
                    writer.insert_batch(batch).unwrap();
                }
                criterion::black_box(writer.stop().unwrap());
            });
        });
    }

    group.bench_function("shuffle_writer: end to end", |b| {
        let ctx = SessionContext::new();
        let dir = TempDir::new().unwrap();
        let exec = create_shuffle_writer_exec(CompressionCodec::Zstd(1), &dir);
        b.iter(|| {
            let task_ctx = ctx.task_ctx();
            let stream = exec.execute(0, task_ctx).unwrap();
            let rt = Runtime::new().unwrap();
            criterion::black_box(rt.block_on(collect(stream)).unwrap());
        });
    });
}

fn create_shuffle_writer_exec(
    compression_codec: CompressionCodec,
    dir: &TempDir,
) -> ShuffleWriterExec {
    let batches = create_batches(8192, 10);
    let schema = batches[0].schema();
    let partitions = &[batches];
    ShuffleWriterExec::try_new(
        Arc::new(DataSourceExec::new(Arc::new(
            MemorySourceConfig::try_new(partitions, schema, None).unwrap(),
        ))),
        NUM_PARTITIONS,
        PartitionIdSource::FirstColumn,
        ShuffleWriterConfig::default().with_codec(compression_codec),
        dir.path().join("data.out").to_string_lossy().to_string(),
        dir.path().join("index.out").to_string_lossy().to_string(),
    )
    .unwrap()
}

/// `count` batches of `num_rows` rows led by a partition id column. A quarter of the rows go
/// to partition 0, the rest are spread uniformly.
fn create_batches(num_rows: usize, count: usize) -> Vec<RecordBatch> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..count)
        .map(|i| {
            let ids: Vec<i32> = (0..num_rows)
                .map(|_| {
                    if rng.random_bool(0.25) {
                        0
                    } else {
                        rng.random_range(0..NUM_PARTITIONS as i32)
                    }
                })
                .collect();
            sequence_batch((i * num_rows) as i32, num_rows, Some(&ids))
        })
        .collect()
}

fn sequence_schema(with_partition_id: bool) -> SchemaRef {
    let mut fields = vec![];
    if with_partition_id {
        fields.push(Field::new("pid", DataType::Int32, false));
    }
    fields.push(Field::new("seq", DataType::Int32, false));
    fields.push(Field::new("payload", DataType::Utf8, true));
    Arc::new(Schema::new(fields))
}

/// Rows numbered from `first`; every seventh payload is null.
fn sequence_batch(first: i32, num_rows: usize, partition_ids: Option<&[i32]>) -> RecordBatch {
    let seq = Int32Array::from_iter_values(first..first + num_rows as i32);
    let payload: StringArray = (0..num_rows)
        .map(|i| (i % 7 != 0).then(|| format!("payload {:08}", first as usize + i)))
        .collect();
    let mut columns: Vec<ArrayRef> = vec![];
    if let Some(ids) = partition_ids {
        columns.push(Arc::new(Int32Array::from(ids.to_vec())));
    }
    columns.push(Arc::new(seq));
    columns.push(Arc::new(payload));
    RecordBatch::try_new(sequence_schema(partition_ids.is_some()), columns).unwrap()
}

fn config() -> Criterion {
    Criterion::default()
}

criterion_group! {
    name = benches;
    config = config();
    targets = criterion_benchmark
}
criterion_main!(benches);
