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

//! Per-partition accumulation of routed rows.

use crate::errors::ShuffleResult;
use crate::execution::shuffle::codec::{write_block, CompressionCodec, ShuffleBlockWriter};
use arrow::array::RecordBatch;
use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use datafusion::physical_plan::metrics::Time;
use std::io::{Cursor, Seek, SeekFrom};

/// Description of the bytes produced by [`PartitionBuffer::drain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainedSegment {
    /// Rows in the segment
    pub num_rows: usize,
    /// In-memory size of the drained batches
    pub raw_bytes: usize,
    /// Encoded length in bytes
    pub length: usize,
    /// Codec every block of the segment was written with
    pub codec: CompressionCodec,
}

/// Record batches routed to one output partition that have not been written anywhere yet.
#[derive(Debug)]
pub struct PartitionBuffer {
    partition_id: usize,
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    size_bytes: usize,
    num_rows: usize,
    /// Maximum rows per encoded block
    batch_size: usize,
}

impl PartitionBuffer {
    pub fn new(partition_id: usize, schema: SchemaRef, batch_size: usize) -> Self {
        Self {
            partition_id,
            schema,
            batches: Vec::new(),
            size_bytes: 0,
            num_rows: 0,
            batch_size: batch_size.max(1),
        }
    }

    pub fn partition_id(&self) -> usize {
        self.partition_id
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// Appends a batch and returns how many bytes the buffer grew by.
    pub fn append(&mut self, batch: RecordBatch) -> usize {
        if batch.num_rows() == 0 {
            return 0;
        }
        let growth = batch.get_array_memory_size();
        self.size_bytes += growth;
        self.num_rows += batch.num_rows();
        self.batches.push(batch);
        growth
    }

    /// Encodes the buffered rows as consecutive blocks of at most `batch_size` rows, appends
    /// them to `out`, and resets the buffer. The batch vector keeps its allocation so the buffer
    /// can be refilled without reallocating.
    ///
    /// An empty buffer yields `None` and leaves `out` untouched. On failure `out` is truncated
    /// back to its original length and the buffer keeps its rows.
    pub fn drain(
        &mut self,
        block_writer: &ShuffleBlockWriter,
        out: &mut Vec<u8>,
        encode_time: &Time,
    ) -> ShuffleResult<Option<DrainedSegment>> {
        if self.is_empty() {
            return Ok(None);
        }

        let codec = block_writer.codec_for_rows(self.num_rows).clone();
        let start = out.len();
        if let Err(e) = self.encode_blocks(&codec, out, encode_time) {
            out.truncate(start);
            return Err(e);
        }

        let segment = DrainedSegment {
            num_rows: self.num_rows,
            raw_bytes: self.size_bytes,
            length: out.len() - start,
            codec,
        };
        self.clear();
        Ok(Some(segment))
    }

    /// Drops the buffered rows without writing them, returning the bytes released.
    pub(crate) fn clear(&mut self) -> usize {
        let released = self.size_bytes;
        self.batches.clear();
        self.size_bytes = 0;
        self.num_rows = 0;
        released
    }

    fn encode_blocks(
        &self,
        codec: &CompressionCodec,
        out: &mut Vec<u8>,
        encode_time: &Time,
    ) -> ShuffleResult<()> {
        let mut cursor = Cursor::new(out);
        cursor.seek(SeekFrom::End(0))?;

        let mut group: Vec<&RecordBatch> = Vec::new();
        let mut group_rows = 0;
        for batch in &self.batches {
            if !group.is_empty() && group_rows + batch.num_rows() > self.batch_size {
                self.write_group(&group, codec, &mut cursor, encode_time)?;
                group.clear();
                group_rows = 0;
            }
            group.push(batch);
            group_rows += batch.num_rows();
        }
        if !group.is_empty() {
            self.write_group(&group, codec, &mut cursor, encode_time)?;
        }
        Ok(())
    }

    fn write_group(
        &self,
        group: &[&RecordBatch],
        codec: &CompressionCodec,
        cursor: &mut Cursor<&mut Vec<u8>>,
        encode_time: &Time,
    ) -> ShuffleResult<()> {
        if let [batch] = group {
            write_block(batch, codec, cursor, encode_time)?;
        } else {
            let batch = concat_batches(&self.schema, group.iter().copied())?;
            write_block(&batch, codec, cursor, encode_time)?;
        }
        Ok(())
    }
}
