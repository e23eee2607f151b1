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

use crate::errors::{ShuffleError, ShuffleResult};
use crate::execution::shuffle::codec::block_span;
use crate::execution::shuffle::writers::{PartitionWriter, ShuffleOutput, WriterPhase};
use crate::execution::shuffle::{
    CancellationToken, PartitionBuffer, ShuffleBlockWriter, ShuffleWriterConfig,
    ShuffleWriterMetrics,
};
use datafusion::physical_plan::metrics::Time;
use log::debug;
use std::fmt::Debug;

/// Transport that ships encoded partition data to a remote shuffle service.
pub trait PushClient: Send + Debug {
    /// Sends `data`, a run of complete shuffle blocks of one partition, and returns the
    /// number of bytes the service accepted.
    fn push_partition_data(&mut self, partition_id: usize, data: &[u8]) -> ShuffleResult<usize>;
}

/// Partition writer that pushes every evicted partition to a remote service instead of
/// spilling it locally. Nothing is merged at stop: the pushed bytes are the output, and the
/// service sees each partition's data in the order it was evicted.
///
/// Pushes are split into chunks of at most `push_buffer_max_size` bytes. Chunks always end
/// on a block boundary, so a single block larger than the limit is pushed on its own.
pub struct PushPartitionWriter<C: PushClient> {
    client: C,
    num_partitions: usize,
    block_writer: ShuffleBlockWriter,
    push_buffer_max_size: usize,
    partition_lengths: Vec<u64>,
    raw_partition_lengths: Vec<u64>,
    scratch: Vec<u8>,
    phase: WriterPhase,
    cancellation: CancellationToken,
    metrics: ShuffleWriterMetrics,
}

impl<C: PushClient> PushPartitionWriter<C> {
    pub fn try_new(
        client: C,
        num_partitions: usize,
        config: &ShuffleWriterConfig,
        metrics: ShuffleWriterMetrics,
    ) -> ShuffleResult<Self> {
        config.validate(num_partitions)?;
        Ok(Self {
            client,
            num_partitions,
            block_writer: ShuffleBlockWriter::new(
                config.codec.clone(),
                config.batch_compress_threshold,
            ),
            push_buffer_max_size: config.push_buffer_max_size,
            partition_lengths: vec![0; num_partitions],
            raw_partition_lengths: vec![0; num_partitions],
            scratch: Vec::new(),
            phase: WriterPhase::Created,
            cancellation: CancellationToken::new(),
            metrics,
        })
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn push(&mut self, partition_id: usize, buffer: &mut PartitionBuffer) -> ShuffleResult<usize> {
        self.scratch.clear();
        let Some(segment) =
            buffer.drain(&self.block_writer, &mut self.scratch, &self.metrics.encode_time)?
        else {
            return Ok(0);
        };
        push_chunks(
            &mut self.client,
            partition_id,
            &self.scratch,
            self.push_buffer_max_size,
            &self.metrics.write_time,
        )?;
        self.partition_lengths[partition_id] += segment.length as u64;
        self.raw_partition_lengths[partition_id] += segment.raw_bytes as u64;
        Ok(segment.length)
    }
}

fn push_chunks<C: PushClient>(
    client: &mut C,
    partition_id: usize,
    data: &[u8],
    max_chunk_size: usize,
    write_time: &Time,
) -> ShuffleResult<()> {
    let mut chunk_start = 0;
    let mut pos = 0;
    while pos < data.len() {
        let span = block_span(data, pos)?;
        if span.end - chunk_start > max_chunk_size && pos > chunk_start {
            push_chunk(client, partition_id, &data[chunk_start..pos], write_time)?;
            chunk_start = pos;
        }
        pos = span.end;
    }
    if chunk_start < data.len() {
        push_chunk(client, partition_id, &data[chunk_start..], write_time)?;
    }
    Ok(())
}

fn push_chunk<C: PushClient>(
    client: &mut C,
    partition_id: usize,
    chunk: &[u8],
    write_time: &Time,
) -> ShuffleResult<()> {
    let mut write_timer = write_time.timer();
    let accepted = client.push_partition_data(partition_id, chunk)?;
    write_timer.stop();
    if accepted != chunk.len() {
        return Err(ShuffleError::IO {
            source: std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!(
                    "Push of partition {partition_id} accepted {accepted} of {} bytes",
                    chunk.len()
                ),
            ),
        });
    }
    debug!("Pushed {} bytes of partition {partition_id}", chunk.len());
    Ok(())
}

impl<C: PushClient> PartitionWriter for PushPartitionWriter<C> {
    fn init(&mut self, cancellation: CancellationToken) -> ShuffleResult<()> {
        if self.phase != WriterPhase::Created {
            return Err(ShuffleError::InvalidState(format!(
                "init called on a partition writer in phase {}",
                self.phase.name()
            )));
        }
        self.cancellation = cancellation;
        self.phase = WriterPhase::Initialized;
        Ok(())
    }

    fn evict_partition(
        &mut self,
        partition_id: usize,
        buffer: &mut PartitionBuffer,
    ) -> ShuffleResult<usize> {
        self.phase.ensure_initialized("evict_partition")?;
        if partition_id >= self.num_partitions {
            return Err(ShuffleError::InvalidArgument(format!(
                "Partition {partition_id} is out of range for {} partitions",
                self.num_partitions
            )));
        }
        self.cancellation.check()?;

        let result = self.push(partition_id, buffer);
        match &result {
            Ok(bytes) if *bytes > 0 => {
                self.metrics.spill_count.add(1);
                self.metrics.spilled_bytes.add(*bytes);
            }
            Ok(_) => {}
            Err(_) => self.abort(),
        }
        result
    }

    fn stop(&mut self, buffers: &mut [PartitionBuffer]) -> ShuffleResult<ShuffleOutput> {
        if let WriterPhase::Stopped(output) = &self.phase {
            return Ok(output.clone());
        }
        self.phase.ensure_initialized("stop")?;
        if buffers.len() != self.num_partitions {
            return Err(ShuffleError::InvalidArgument(format!(
                "Expected {} partition buffers, got {}",
                self.num_partitions,
                buffers.len()
            )));
        }

        for (partition_id, buffer) in buffers.iter_mut().enumerate() {
            let pushed = self
                .cancellation
                .check()
                .and_then(|_| self.push(partition_id, buffer));
            if let Err(e) = pushed {
                self.abort();
                return Err(e);
            }
        }

        let output = ShuffleOutput {
            data_file: None,
            index_file: None,
            partition_lengths: self.partition_lengths.clone(),
            raw_partition_lengths: self.raw_partition_lengths.clone(),
        };
        self.phase = WriterPhase::Stopped(output.clone());
        Ok(output)
    }

    fn abort(&mut self) {
        if !matches!(self.phase, WriterPhase::Stopped(_)) {
            self.phase = WriterPhase::Aborted;
        }
    }
}

impl<C: PushClient> Debug for PushPartitionWriter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushPartitionWriter")
            .field("client", &self.client)
            .field("num_partitions", &self.num_partitions)
            .field("phase", &self.phase.name())
            .field("pushed_bytes", &self.partition_lengths.iter().sum::<u64>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::shuffle::test_util::create_batch;
    use crate::execution::shuffle::ShuffleBlockIterator;
    use arrow::array::RecordBatch;
    use datafusion::physical_plan::metrics::ExecutionPlanMetricsSet;
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct MemoryPushClient {
        pushes: Vec<(usize, Vec<u8>)>,
        /// accept only this many bytes of every push
        accept_limit: Option<usize>,
    }

    impl MemoryPushClient {
        fn partition_data(&self, partition_id: usize) -> Vec<u8> {
            self.pushes
                .iter()
                .filter(|(pid, _)| *pid == partition_id)
                .flat_map(|(_, data)| data.iter().copied())
                .collect()
        }
    }

    impl PushClient for MemoryPushClient {
        fn push_partition_data(
            &mut self,
            partition_id: usize,
            data: &[u8],
        ) -> ShuffleResult<usize> {
            let accepted = self.accept_limit.map_or(data.len(), |l| l.min(data.len()));
            self.pushes.push((partition_id, data[..accepted].to_vec()));
            Ok(accepted)
        }
    }

    fn new_writer(
        client: MemoryPushClient,
        config: &ShuffleWriterConfig,
    ) -> PushPartitionWriter<MemoryPushClient> {
        let metrics = ShuffleWriterMetrics::new(&ExecutionPlanMetricsSet::new(), 0);
        let mut writer = PushPartitionWriter::try_new(client, 2, config, metrics).unwrap();
        writer.init(CancellationToken::new()).unwrap();
        writer
    }

    fn buffer_with(partition_id: usize, batches: &[RecordBatch]) -> PartitionBuffer {
        let mut buffer = PartitionBuffer::new(partition_id, batches[0].schema(), 100);
        for batch in batches {
            buffer.append(batch.clone());
        }
        buffer
    }

    #[test]
    fn test_push_in_eviction_order() {
        let mut writer = new_writer(MemoryPushClient::default(), &ShuffleWriterConfig::default());
        let mut first = buffer_with(1, &[create_batch(20, false)]);
        let mut second = buffer_with(1, &[create_batch(30, true)]);
        writer.evict_partition(1, &mut first).unwrap();
        writer.evict_partition(1, &mut second).unwrap();

        let schema = create_batch(1, false).schema();
        let mut buffers = vec![
            buffer_with(0, &[create_batch(5, false)]),
            PartitionBuffer::new(1, schema, 100),
        ];
        let output = writer.stop(&mut buffers).unwrap();
        assert!(output.data_file.is_none());

        let client = writer.client();
        let p1 = client.partition_data(1);
        assert_eq!(p1.len() as u64, output.partition_lengths[1]);
        let decoded: Vec<RecordBatch> = ShuffleBlockIterator::new(&p1)
            .collect::<ShuffleResult<_>>()
            .unwrap();
        assert_eq!(vec![create_batch(20, false), create_batch(30, true)], decoded);
        assert_eq!(
            output.partition_lengths[0],
            client.partition_data(0).len() as u64
        );
        assert_eq!(output, writer.stop(&mut buffers).unwrap());
    }

    #[test]
    fn test_chunks_end_on_block_boundaries() {
        let config = ShuffleWriterConfig::default().with_push_buffer_max_size(1);
        let mut writer = new_writer(MemoryPushClient::default(), &config);
        // a batch size of 100 rows keeps the three buffered batches in separate blocks
        let mut buffer = buffer_with(
            0,
            &[
                create_batch(100, false),
                create_batch(100, false),
                create_batch(50, false),
            ],
        );
        let pushed = writer.evict_partition(0, &mut buffer).unwrap();

        let client = writer.client();
        assert_eq!(3, client.pushes.len());
        for (_, chunk) in &client.pushes {
            assert_eq!(1, ShuffleBlockIterator::new(chunk).count());
        }
        assert_eq!(pushed, client.partition_data(0).len());
    }

    #[test]
    fn test_large_chunk_limit_pushes_once() {
        let mut writer = new_writer(MemoryPushClient::default(), &ShuffleWriterConfig::default());
        let mut buffer = buffer_with(0, &[create_batch(250, false)]);
        writer.evict_partition(0, &mut buffer).unwrap();
        assert_eq!(1, writer.client().pushes.len());
    }

    #[test]
    fn test_short_push_fails_writer() {
        let client = MemoryPushClient {
            accept_limit: Some(4),
            ..Default::default()
        };
        let mut writer = new_writer(client, &ShuffleWriterConfig::default());
        let mut buffer = buffer_with(0, &[create_batch(10, false)]);
        assert!(matches!(
            writer.evict_partition(0, &mut buffer),
            Err(ShuffleError::IO { .. })
        ));
        let schema = Arc::clone(buffer.schema());
        let mut buffers = vec![
            PartitionBuffer::new(0, Arc::clone(&schema), 100),
            PartitionBuffer::new(1, schema, 100),
        ];
        assert!(matches!(
            writer.stop(&mut buffers),
            Err(ShuffleError::InvalidState(_))
        ));
    }
}
