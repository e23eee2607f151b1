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

use crate::errors::ShuffleResult;
use crate::execution::shuffle::{write_block, CompressionCodec};
use arrow::array::RecordBatch;
use datafusion::physical_plan::metrics::Time;
use std::io::{Cursor, Seek, SeekFrom, Write};

/// Write batches to writer while using a buffer to avoid frequent system calls.
/// The record batches are first encoded as shuffle blocks into an internal buffer.
/// Once the buffer exceeds the max size, the buffer will be flushed to the writer.
pub(crate) struct BufBatchWriter<W: Write> {
    writer: W,
    buffer: Vec<u8>,
    buffer_max_size: usize,
}

impl<W: Write> BufBatchWriter<W> {
    pub(crate) fn new(writer: W, buffer_max_size: usize) -> Self {
        Self {
            writer,
            buffer: vec![],
            buffer_max_size,
        }
    }

    /// Encodes `batch` as one block with `codec`, returning the encoded length.
    pub(crate) fn write(
        &mut self,
        batch: &RecordBatch,
        codec: &CompressionCodec,
        encode_time: &Time,
        write_time: &Time,
    ) -> ShuffleResult<usize> {
        let mut cursor = Cursor::new(&mut self.buffer);
        cursor.seek(SeekFrom::End(0))?;
        let bytes_written = write_block(batch, codec, &mut cursor, encode_time)?;
        let pos = cursor.position();
        if pos >= self.buffer_max_size as u64 {
            let mut write_timer = write_time.timer();
            self.writer.write_all(&self.buffer)?;
            write_timer.stop();
            self.buffer.clear();
        }
        Ok(bytes_written)
    }

    pub(crate) fn flush(&mut self, write_time: &Time) -> ShuffleResult<()> {
        let mut write_timer = write_time.timer();
        if !self.buffer.is_empty() {
            self.writer.write_all(&self.buffer)?;
        }
        self.writer.flush()?;
        write_timer.stop();
        self.buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::shuffle::test_util::create_batch;
    use crate::execution::shuffle::ShuffleBlockIterator;

    #[test]
    fn test_buffered_until_flush() {
        let batch = create_batch(50, true);
        let time = Time::default();
        let mut out = Vec::new();
        {
            let mut writer = BufBatchWriter::new(&mut out, 1 << 20);
            let a = writer
                .write(&batch, &CompressionCodec::Zstd(1), &time, &time)
                .unwrap();
            let b = writer
                .write(&batch, &CompressionCodec::Snappy, &time, &time)
                .unwrap();
            writer.flush(&time).unwrap();
            assert!(a > 0 && b > 0);
        }
        let decoded: Vec<RecordBatch> = ShuffleBlockIterator::new(&out)
            .collect::<ShuffleResult<_>>()
            .unwrap();
        assert_eq!(vec![batch.clone(), batch], decoded);
    }

    #[test]
    fn test_small_buffer_writes_through() {
        let batch = create_batch(10, false);
        let time = Time::default();
        let mut out = Vec::new();
        let mut writer = BufBatchWriter::new(&mut out, 1);
        let written = writer
            .write(&batch, &CompressionCodec::None, &time, &time)
            .unwrap();
        assert!(writer.buffer.is_empty());
        drop(writer);
        assert_eq!(written, out.len());
    }
}
