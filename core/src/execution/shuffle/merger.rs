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

//! Produces the final partition-contiguous data stream from spilled segments and the rows
//! still resident in memory.

use crate::errors::{ShuffleError, ShuffleResult};
use crate::execution::shuffle::writers::BufBatchWriter;
use crate::execution::shuffle::{
    CancellationToken, PartitionBuffer, ShuffleBlockIterator, ShuffleBlockWriter,
    ShuffleWriterMetrics, SpillIndex, SpillIndexEntry,
};
use log::debug;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub(crate) struct Merger<'a> {
    block_writer: &'a ShuffleBlockWriter,
    metrics: &'a ShuffleWriterMetrics,
    cancellation: &'a CancellationToken,
    write_buffer_size: usize,
}

impl<'a> Merger<'a> {
    pub(crate) fn new(
        block_writer: &'a ShuffleBlockWriter,
        metrics: &'a ShuffleWriterMetrics,
        cancellation: &'a CancellationToken,
        write_buffer_size: usize,
    ) -> Self {
        Self {
            block_writer,
            metrics,
            cancellation,
            write_buffer_size,
        }
    }

    /// Writes every partition to `output` in ascending partition order: first its spilled
    /// segments in the order they were spilled, then the rows left in its buffer. Returns
    /// the encoded length of each partition and adds the raw size of the drained buffers to
    /// `raw_lengths`.
    ///
    /// Segments already encoded with the codec the output would use are copied byte for
    /// byte, anything else is decoded and re-encoded.
    pub(crate) fn merge<W: Write>(
        &self,
        spill_file: Option<&Path>,
        spill_index: &SpillIndex,
        buffers: &mut [PartitionBuffer],
        raw_lengths: &mut [u64],
        scratch: &mut Vec<u8>,
        output: &mut W,
    ) -> ShuffleResult<Vec<u64>> {
        let mut spill_reader = match spill_file {
            Some(path) if !spill_index.is_empty() => Some(File::open(path)?),
            _ => None,
        };

        let mut lengths = vec![0u64; buffers.len()];
        for (partition_id, buffer) in buffers.iter_mut().enumerate() {
            self.cancellation.check()?;

            let mut written = 0u64;
            for entry in spill_index.entries_for(partition_id) {
                let reader = spill_reader.as_mut().ok_or_else(|| {
                    ShuffleError::Internal(format!(
                        "Partition {partition_id} has spilled segments but no spill file"
                    ))
                })?;
                written += self.copy_segment(reader, entry, scratch, output)?;
            }

            scratch.clear();
            if let Some(segment) =
                buffer.drain(self.block_writer, scratch, &self.metrics.encode_time)?
            {
                let mut write_timer = self.metrics.write_time.timer();
                output.write_all(scratch)?;
                write_timer.stop();
                raw_lengths[partition_id] += segment.raw_bytes as u64;
                written += segment.length as u64;
            }
            lengths[partition_id] = written;
        }
        Ok(lengths)
    }

    fn copy_segment<W: Write>(
        &self,
        reader: &mut File,
        entry: &SpillIndexEntry,
        scratch: &mut Vec<u8>,
        output: &mut W,
    ) -> ShuffleResult<u64> {
        reader.seek(SeekFrom::Start(entry.offset))?;
        let target = self.block_writer.codec_for_rows(entry.num_rows);

        if &entry.codec == target {
            let mut write_timer = self.metrics.write_time.timer();
            let copied = std::io::copy(&mut (&mut *reader).take(entry.length), output)?;
            write_timer.stop();
            if copied != entry.length {
                return Err(ShuffleError::Codec(format!(
                    "Spilled segment of partition {} is truncated: expected {} bytes, read {copied}",
                    entry.partition_id, entry.length
                )));
            }
            return Ok(copied);
        }

        debug!(
            "Re-encoding spilled segment of partition {} from {} to {target}",
            entry.partition_id, entry.codec
        );
        scratch.clear();
        scratch.resize(entry.length as usize, 0);
        reader.read_exact(scratch)?;

        let mut written = 0;
        let mut buf_writer = BufBatchWriter::new(&mut *output, self.write_buffer_size);
        for batch in ShuffleBlockIterator::new(scratch) {
            written += buf_writer.write(
                &batch?,
                target,
                &self.metrics.encode_time,
                &self.metrics.write_time,
            )?;
        }
        buf_writer.flush(&self.metrics.write_time)?;
        Ok(written as u64)
    }
}
