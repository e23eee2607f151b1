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

//! Coordinator of the shuffle write path.

use crate::errors::{ShuffleError, ShuffleResult};
use crate::execution::shuffle::eviction::largest_partition;
use crate::execution::shuffle::memory::MemoryBudget;
use crate::execution::shuffle::partitioning::{compact_batch, ScratchSpace};
use crate::execution::shuffle::{
    CancellationToken, PartitionBuffer, PartitionIdSource, PartitionWriter, ShuffleOutput,
    ShuffleWriterConfig, ShuffleWriterMetrics,
};
use crate::execution::tracing::{log_counter, with_trace};
use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use datafusion::common::instant::Instant;
use datafusion::execution::runtime_env::RuntimeEnv;
use log::{debug, info, warn};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

/// Upper bound on evictions performed by one [`ShuffleWriter::evict_fixed_size`] call.
const MAX_EVICT_FIXED_SIZE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Created,
    Initialized,
    /// At least one batch was accepted.
    Active,
    Stopped,
    /// A fatal error or cancellation ended the writer. Nothing was published.
    Failed,
}

/// Outcome of a successful [`ShuffleWriter::stop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleWriteResult {
    pub output: ShuffleOutput,
    pub total_bytes_written: u64,
    pub total_bytes_evicted: u64,
    pub spill_count: usize,
    pub write_time_ns: u64,
    pub evict_time_ns: u64,
    pub compress_time_ns: u64,
}

impl ShuffleWriteResult {
    pub fn partition_lengths(&self) -> &[u64] {
        &self.output.partition_lengths
    }
}

/// Routes the rows of incoming batches into per-partition buffers, keeps the buffered bytes
/// under the memory budget by evicting partitions through its [`PartitionWriter`], and hands
/// everything still buffered to the writer when stopped.
///
/// Each instance owns its budget, so several writers in one process are independent apart
/// from sharing the runtime's memory pool.
pub struct ShuffleWriter {
    partition: usize,
    num_partitions: usize,
    /// Schema of the rows held in the partition buffers
    schema: SchemaRef,
    id_source: PartitionIdSource,
    config: ShuffleWriterConfig,
    buffers: Vec<PartitionBuffer>,
    partition_writer: Box<dyn PartitionWriter>,
    budget: MemoryBudget,
    scratch: ScratchSpace,
    metrics: ShuffleWriterMetrics,
    cancellation: CancellationToken,
    state: WriterState,
    result: Option<ShuffleWriteResult>,
}

impl ShuffleWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn try_new(
        partition: usize,
        num_partitions: usize,
        input_schema: SchemaRef,
        id_source: PartitionIdSource,
        config: ShuffleWriterConfig,
        partition_writer: Box<dyn PartitionWriter>,
        runtime: &RuntimeEnv,
        metrics: ShuffleWriterMetrics,
    ) -> ShuffleResult<Self> {
        config.validate(num_partitions)?;
        let schema = id_source.buffered_schema(&input_schema)?;
        let buffers = (0..num_partitions)
            .map(|partition_id| {
                PartitionBuffer::new(partition_id, Arc::clone(&schema), config.batch_size)
            })
            .collect();
        let budget = MemoryBudget::new(
            format!("ShuffleWriter[{partition}]"),
            config.memory_limit,
            runtime,
        );
        let scratch = ScratchSpace::new(config.batch_size, num_partitions);

        Ok(Self {
            partition,
            num_partitions,
            schema,
            id_source,
            config,
            buffers,
            partition_writer,
            budget,
            scratch,
            metrics,
            cancellation: CancellationToken::new(),
            state: WriterState::Created,
            result: None,
        })
    }

    pub fn init(&mut self) -> ShuffleResult<()> {
        if self.state != WriterState::Created {
            return Err(ShuffleError::InvalidState(format!(
                "init called in state {:?}",
                self.state
            )));
        }
        let result = self.partition_writer.init(self.cancellation.clone());
        match result {
            Ok(()) => {
                self.state = WriterState::Initialized;
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Buffers the rows of `batch`, taking partition ids from the configured
    /// [`PartitionIdSource`]. Batches larger than the batch size are routed in slices.
    pub fn insert_batch(&mut self, batch: &RecordBatch) -> ShuffleResult<()> {
        self.ensure_accepting("insert_batch")?;
        let tracing_enabled = self.config.tracing_enabled;
        let result = with_trace("shuffle_insert_batch", tracing_enabled, || {
            self.route_batch(batch, None)
        });
        self.track(result)
    }

    /// Buffers the rows of `batch` with one explicit partition id per row. The batch holds
    /// only the buffered columns.
    pub fn insert_batch_with_partition_ids(
        &mut self,
        batch: &RecordBatch,
        partition_ids: &[u32],
    ) -> ShuffleResult<()> {
        self.ensure_accepting("insert_batch_with_partition_ids")?;
        let tracing_enabled = self.config.tracing_enabled;
        let result = with_trace("shuffle_insert_batch", tracing_enabled, || {
            self.route_batch(batch, Some(partition_ids))
        });
        self.track(result)
    }

    /// Evicts the largest partitions until at least `size` bytes were released or
    /// [`MAX_EVICT_FIXED_SIZE_ATTEMPTS`] partitions were evicted. Returns the bytes released.
    pub fn evict_fixed_size(&mut self, size: usize) -> ShuffleResult<usize> {
        self.ensure_accepting("evict_fixed_size")?;
        let result = self.evict_largest_until(size);
        self.track(result)
    }

    /// Hands every buffered row to the partition writer and returns where the output went.
    /// Calling `stop` again returns the same result.
    pub fn stop(&mut self) -> ShuffleResult<ShuffleWriteResult> {
        match self.state {
            WriterState::Stopped => {
                return self.result.clone().ok_or_else(|| {
                    ShuffleError::Internal("Stopped shuffle writer has no result".to_string())
                })
            }
            WriterState::Initialized | WriterState::Active => {}
            state => {
                return Err(ShuffleError::InvalidState(format!(
                    "stop called in state {state:?}"
                )))
            }
        }

        let tracing_enabled = self.config.tracing_enabled;
        match with_trace("shuffle_write", tracing_enabled, || self.finish()) {
            Ok(result) => {
                self.state = WriterState::Stopped;
                self.result = Some(result.clone());
                Ok(result)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Requests cancellation. The next operation fails with [`ShuffleError::Cancelled`] and
    /// discards everything written so far.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// A handle that cancels this writer from another thread.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Bytes currently buffered across all partitions.
    pub fn memory_used(&self) -> usize {
        self.budget.used()
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    pub fn metrics(&self) -> &ShuffleWriterMetrics {
        &self.metrics
    }

    fn ensure_accepting(&self, operation: &str) -> ShuffleResult<()> {
        match self.state {
            WriterState::Initialized | WriterState::Active => Ok(()),
            state => Err(ShuffleError::InvalidState(format!(
                "{operation} called in state {state:?}"
            ))),
        }
    }

    fn track<T>(&mut self, result: ShuffleResult<T>) -> ShuffleResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.fail(e);
            }
        }
        result
    }

    fn fail(&mut self, error: &ShuffleError) {
        warn!(
            "ShuffleWriter[{}] failed in state {:?}: {error}",
            self.partition, self.state
        );
        self.state = WriterState::Failed;
        self.partition_writer.abort();
        for buffer in &mut self.buffers {
            buffer.clear();
        }
        self.budget.free();
    }

    fn route_batch(
        &mut self,
        batch: &RecordBatch,
        partition_ids: Option<&[u32]>,
    ) -> ShuffleResult<()> {
        self.cancellation.check()?;
        if batch.num_rows() == 0 {
            return Ok(());
        }
        let start_time = Instant::now();

        // partition ids of the whole batch are validated before any row is buffered
        let (data, by_partition_id) = {
            let mut timer = self.metrics.repart_time.timer();
            let routed = match (partition_ids, self.id_source) {
                (Some(ids), _) => {
                    if ids.len() != batch.num_rows() {
                        return Err(ShuffleError::InvalidArgument(format!(
                            "Got {} partition ids for a batch of {} rows",
                            ids.len(),
                            batch.num_rows()
                        )));
                    }
                    self.scratch.set_partition_ids(ids, self.num_partitions)?;
                    (batch.clone(), true)
                }
                (None, PartitionIdSource::FirstColumn) => (
                    self.scratch
                        .split_partition_id_column(batch, self.num_partitions)?,
                    true,
                ),
                (None, PartitionIdSource::Single) => (batch.clone(), false),
            };
            timer.stop();
            routed
        };
        if data.schema().fields() != self.schema.fields() {
            return Err(ShuffleError::InvalidArgument(format!(
                "Batch schema {:?} does not match the buffered schema {:?}",
                data.schema(),
                self.schema
            )));
        }
        debug_assert!(!by_partition_id || self.scratch.num_partition_ids() == data.num_rows());

        self.state = WriterState::Active;
        self.metrics.input_batches.add(1);

        let mut start = 0;
        while start < data.num_rows() {
            let len = self.config.batch_size.min(data.num_rows() - start);
            let owns_buffers = len == data.num_rows();
            let slice = data.slice(start, len);
            let routed = if by_partition_id {
                let mut timer = self.metrics.repart_time.timer();
                let routed = self.scratch.take_partitions(
                    &slice,
                    start,
                    self.num_partitions,
                    owns_buffers,
                )?;
                timer.stop();
                routed
            } else if owns_buffers {
                vec![(0, slice)]
            } else {
                vec![(0, compact_batch(&slice)?)]
            };
            for (partition_id, sub_batch) in routed {
                self.buffer_batch(partition_id, sub_batch)?;
            }
            start += len;
        }

        self.metrics.baseline.record_output(data.num_rows());
        self.metrics
            .baseline
            .elapsed_compute()
            .add_duration(start_time.elapsed());
        Ok(())
    }

    fn buffer_batch(&mut self, partition_id: usize, batch: RecordBatch) -> ShuffleResult<()> {
        let size = batch.get_array_memory_size();
        self.reserve(size)?;
        self.buffers[partition_id].append(batch);
        self.metrics.data_size.add(size);
        if self.config.tracing_enabled {
            log_counter("shuffle_memory_used", self.budget.used());
        }

        if self.config.prefer_evict
            && self.buffers[partition_id].num_rows() >= self.config.batch_size
        {
            self.evict(partition_id)?;
        }
        if self.budget.exceeded() {
            self.evict_until_within_budget()?;
        }
        Ok(())
    }

    /// Reserves `size` bytes from the memory pool. When the pool refuses, the largest
    /// partition is evicted and the reservation retried once.
    fn reserve(&mut self, size: usize) -> ShuffleResult<()> {
        let Err(e) = self.budget.try_grow(size) else {
            return Ok(());
        };
        let Some(partition_id) = largest_partition(&self.buffers) else {
            return Err(e);
        };
        info!(
            "ShuffleWriter[{}] could not reserve {size} bytes ({e}), evicting partition {partition_id}",
            self.partition
        );
        self.evict(partition_id)?;
        self.budget.try_grow(size)
    }

    fn evict_until_within_budget(&mut self) -> ShuffleResult<()> {
        info!(
            "ShuffleWriter[{}] evicting partitions: {} bytes buffered exceed the limit of {} ({} eviction(s) so far)",
            self.partition,
            self.budget.used(),
            self.budget.limit(),
            self.metrics.spill_count()
        );
        while self.budget.exceeded() {
            let selected = self.config.eviction_policy.select(&self.buffers);
            if selected.is_empty() {
                break;
            }
            for partition_id in selected {
                self.evict(partition_id)?;
            }
        }
        Ok(())
    }

    fn evict_largest_until(&mut self, size: usize) -> ShuffleResult<usize> {
        let mut released = 0;
        for _ in 0..MAX_EVICT_FIXED_SIZE_ATTEMPTS {
            if released >= size {
                break;
            }
            match largest_partition(&self.buffers) {
                Some(partition_id) => released += self.evict(partition_id)?,
                None => break,
            }
        }
        Ok(released)
    }

    /// Evicts one partition and returns the buffered bytes released.
    fn evict(&mut self, partition_id: usize) -> ShuffleResult<usize> {
        if self.buffers[partition_id].is_empty() {
            return Ok(0);
        }
        self.cancellation.check()?;

        let released = self.buffers[partition_id].size_bytes();
        let tracing_enabled = self.config.tracing_enabled;
        let mut timer = self.metrics.evict_time.timer();
        let written = with_trace("shuffle_spill", tracing_enabled, || {
            self.partition_writer
                .evict_partition(partition_id, &mut self.buffers[partition_id])
        })?;
        timer.stop();

        self.budget.shrink(released);
        debug!(
            "ShuffleWriter[{}] evicted partition {partition_id}: {released} bytes buffered, {written} bytes written",
            self.partition
        );
        Ok(released)
    }

    fn finish(&mut self) -> ShuffleResult<ShuffleWriteResult> {
        self.cancellation.check()?;
        let start_time = Instant::now();

        let output = self.partition_writer.stop(&mut self.buffers)?;
        self.budget.free();
        self.metrics
            .baseline
            .elapsed_compute()
            .add_duration(start_time.elapsed());
        self.metrics.baseline.done();

        let result = ShuffleWriteResult {
            total_bytes_written: output.total_length(),
            total_bytes_evicted: self.metrics.spilled_bytes() as u64,
            spill_count: self.metrics.spill_count(),
            write_time_ns: self.metrics.write_time.value() as u64,
            evict_time_ns: self.metrics.evict_time.value() as u64,
            compress_time_ns: self.metrics.encode_time.value() as u64,
            output,
        };
        info!(
            "ShuffleWriter[{}] wrote {} bytes for {} partitions ({} eviction(s), {} bytes evicted)",
            self.partition,
            result.total_bytes_written,
            self.num_partitions,
            result.spill_count,
            result.total_bytes_evicted
        );
        Ok(result)
    }
}

impl Debug for ShuffleWriter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShuffleWriter")
            .field("partition", &self.partition)
            .field("state", &self.state)
            .field("memory_used", &self.memory_used())
            .field("spilled_bytes", &self.metrics.spilled_bytes())
            .field("spilled_count", &self.metrics.spill_count())
            .field("data_size", &self.metrics.data_size())
            .field("partition_writer", &self.partition_writer)
            .finish()
    }
}
