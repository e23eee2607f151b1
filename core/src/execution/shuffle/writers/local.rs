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
use crate::execution::shuffle::merger::Merger;
use crate::execution::shuffle::writers::{PartitionWriter, ShuffleOutput, WriterPhase};
use crate::execution::shuffle::{
    CancellationToken, PartitionBuffer, ShuffleBlockWriter, ShuffleIndex, ShuffleWriterConfig,
    ShuffleWriterMetrics, SpillIndex, SpillIndexEntry,
};
use crate::execution::tracing::with_trace;
use datafusion::execution::disk_manager::RefCountedTempFile;
use datafusion::execution::runtime_env::RuntimeEnv;
use log::{debug, warn};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

struct SpillFile {
    temp_file: RefCountedTempFile,
    file: File,
}

/// Partition writer that spills evicted partitions to a temporary file on local disk and
/// merges them into a single data file plus an offsets index when stopped.
///
/// The data and index files are first written next to their destination and only moved
/// into place once complete, so a failed or aborted writer never leaves a partial artifact
/// under the destination name.
pub struct LocalDiskPartitionWriter {
    num_partitions: usize,
    data_file: PathBuf,
    index_file: Option<PathBuf>,
    runtime: Arc<RuntimeEnv>,
    /// Encoder for evicted segments
    spill_block_writer: ShuffleBlockWriter,
    /// Encoder for the final data file
    output_block_writer: ShuffleBlockWriter,
    /// Spill file for intermediate shuffle output. Each eviction appends to this file and
    /// the contents are copied to the data file when the writer is stopped.
    spill_file: Option<SpillFile>,
    spill_index: SpillIndex,
    raw_partition_lengths: Vec<u64>,
    /// Reused encode buffer
    scratch: Vec<u8>,
    phase: WriterPhase,
    cancellation: CancellationToken,
    metrics: ShuffleWriterMetrics,
    write_buffer_size: usize,
    sync_spill: bool,
    tracing_enabled: bool,
}

impl LocalDiskPartitionWriter {
    pub fn try_new(
        num_partitions: usize,
        data_file: impl Into<PathBuf>,
        index_file: Option<PathBuf>,
        config: &ShuffleWriterConfig,
        runtime: Arc<RuntimeEnv>,
        metrics: ShuffleWriterMetrics,
    ) -> ShuffleResult<Self> {
        config.validate(num_partitions)?;
        Ok(Self {
            num_partitions,
            data_file: data_file.into(),
            index_file,
            runtime,
            spill_block_writer: ShuffleBlockWriter::new(
                config.spill_codec().clone(),
                config.batch_compress_threshold,
            ),
            output_block_writer: ShuffleBlockWriter::new(
                config.codec.clone(),
                config.batch_compress_threshold,
            ),
            spill_file: None,
            spill_index: SpillIndex::new(num_partitions),
            raw_partition_lengths: vec![0; num_partitions],
            scratch: Vec::new(),
            phase: WriterPhase::Created,
            cancellation: CancellationToken::new(),
            metrics,
            write_buffer_size: config.write_buffer_size,
            sync_spill: config.sync_spill,
            tracing_enabled: config.tracing_enabled,
        })
    }

    /// Path of the temporary spill file while the writer holds one.
    pub fn spill_path(&self) -> Option<&Path> {
        self.spill_file
            .as_ref()
            .map(|spill_file| spill_file.temp_file.path())
    }

    pub fn spill_index(&self) -> &SpillIndex {
        &self.spill_index
    }

    fn create_spill_file(&self) -> ShuffleResult<SpillFile> {
        let temp_file = self
            .runtime
            .disk_manager
            .create_tmp_file("shuffle writer spill")?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp_file.path())?;
        Ok(SpillFile { temp_file, file })
    }

    fn spill(&mut self, partition_id: usize, buffer: &mut PartitionBuffer) -> ShuffleResult<usize> {
        self.scratch.clear();
        let Some(segment) = buffer.drain(
            &self.spill_block_writer,
            &mut self.scratch,
            &self.metrics.encode_time,
        )?
        else {
            return Ok(0);
        };

        let spill_file = self
            .spill_file
            .as_mut()
            .ok_or_else(|| ShuffleError::Internal("Spill file is not open".to_string()))?;
        let offset = self.spill_index.end_offset();

        let mut write_timer = self.metrics.write_time.timer();
        spill_file.file.write_all(&self.scratch)?;
        if self.sync_spill {
            spill_file.file.sync_data()?;
        }
        write_timer.stop();

        self.spill_index.append(SpillIndexEntry {
            partition_id,
            offset,
            length: segment.length as u64,
            codec: segment.codec,
            num_rows: segment.num_rows,
            raw_bytes: segment.raw_bytes,
        })?;
        self.raw_partition_lengths[partition_id] += segment.raw_bytes as u64;
        self.metrics.spill_count.add(1);
        self.metrics.spilled_bytes.add(segment.length);
        debug!(
            "Spilled {} rows ({} bytes) of partition {partition_id} at offset {offset}",
            segment.num_rows, segment.length
        );
        Ok(segment.length)
    }

    fn merge(&mut self, buffers: &mut [PartitionBuffer]) -> ShuffleResult<ShuffleOutput> {
        let merger = Merger::new(
            &self.output_block_writer,
            &self.metrics,
            &self.cancellation,
            self.write_buffer_size,
        );

        let mut staged_data = NamedTempFile::new_in(parent_dir(&self.data_file))?;
        let partition_lengths = {
            let spill_path = self
                .spill_file
                .as_ref()
                .map(|spill_file| spill_file.temp_file.path());
            let mut output = BufWriter::new(staged_data.as_file_mut());
            let lengths = merger.merge(
                spill_path,
                &self.spill_index,
                buffers,
                &mut self.raw_partition_lengths,
                &mut self.scratch,
                &mut output,
            )?;
            output.flush()?;
            lengths
        };

        let staged_index = match &self.index_file {
            Some(index_file) => {
                let index = ShuffleIndex::from_lengths(&partition_lengths);
                let mut staged = NamedTempFile::new_in(parent_dir(index_file))?;
                index.write_to(&mut BufWriter::new(staged.as_file_mut()))?;
                Some((staged, index_file))
            }
            None => None,
        };

        staged_data
            .persist(&self.data_file)
            .map_err(|e| e.error)?;
        if let Some((staged, index_file)) = staged_index {
            if let Err(e) = staged.persist(index_file) {
                if let Err(remove_err) = std::fs::remove_file(&self.data_file) {
                    warn!(
                        "Failed to remove data file {:?}: {remove_err}",
                        self.data_file
                    );
                }
                return Err(e.error.into());
            }
        }

        Ok(ShuffleOutput {
            data_file: Some(self.data_file.clone()),
            index_file: self.index_file.clone(),
            partition_lengths,
            raw_partition_lengths: self.raw_partition_lengths.clone(),
        })
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

impl PartitionWriter for LocalDiskPartitionWriter {
    fn init(&mut self, cancellation: CancellationToken) -> ShuffleResult<()> {
        if self.phase != WriterPhase::Created {
            return Err(ShuffleError::InvalidState(format!(
                "init called on a partition writer in phase {}",
                self.phase.name()
            )));
        }
        self.spill_file = Some(self.create_spill_file()?);
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

        let result = self.spill(partition_id, buffer);
        if result.is_err() {
            self.abort();
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

        let tracing_enabled = self.tracing_enabled;
        match with_trace("shuffle_merge", tracing_enabled, || self.merge(buffers)) {
            Ok(output) => {
                // the spill file is deleted once its last reference is dropped
                self.spill_file = None;
                self.phase = WriterPhase::Stopped(output.clone());
                Ok(output)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn abort(&mut self) {
        if let Some(spill_file) = self.spill_file.take() {
            debug!("Removing spill file {:?}", spill_file.temp_file.path());
        }
        if !matches!(self.phase, WriterPhase::Stopped(_)) {
            self.phase = WriterPhase::Aborted;
        }
    }
}

impl fmt::Debug for LocalDiskPartitionWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalDiskPartitionWriter")
            .field("num_partitions", &self.num_partitions)
            .field("data_file", &self.data_file)
            .field("index_file", &self.index_file)
            .field("phase", &self.phase.name())
            .field("spilled_segments", &self.spill_index.len())
            .field("spilled_bytes", &self.spill_index.end_offset())
            .finish()
    }
}
