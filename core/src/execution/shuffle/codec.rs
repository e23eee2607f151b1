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

//! Shuffle block framing and compression.
//!
//! Every block written by [`ShuffleBlockWriter`] is laid out as
//!
//! ```text
//! | block length: u64 LE | row count: u64 LE | codec tag: 4 bytes | Arrow IPC stream |
//! ```
//!
//! where the block length counts every byte after the length field itself and the IPC stream
//! (schema message followed by a single record batch) is wrapped in the codec's frame format.

use crate::errors::{ShuffleError, ShuffleResult};
use arrow::array::RecordBatch;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use datafusion::physical_plan::metrics::Time;
use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::str::FromStr;

const LENGTH_FIELD_LEN: usize = 8;
const ROWS_FIELD_LEN: usize = 8;
const CODEC_TAG_LEN: usize = 4;
const BLOCK_HEADER_LEN: usize = LENGTH_FIELD_LEN + ROWS_FIELD_LEN + CODEC_TAG_LEN;

/// Largest block body a downstream reader accepts.
const MAX_BLOCK_LENGTH: u64 = i32::MAX as u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionCodec {
    None,
    Lz4Frame,
    Zstd(i32),
    Snappy,
}

impl CompressionCodec {
    /// Resolves a codec by name. `zstd_level` only applies to `zstd`.
    pub fn try_from_name(name: &str, zstd_level: i32) -> ShuffleResult<Self> {
        match name.trim().to_lowercase().as_str() {
            "none" | "uncompressed" => Ok(CompressionCodec::None),
            "lz4" => Ok(CompressionCodec::Lz4Frame),
            "zstd" => Ok(CompressionCodec::Zstd(zstd_level)),
            "snappy" => Ok(CompressionCodec::Snappy),
            other => Err(ShuffleError::Config(format!(
                "Unsupported shuffle compression codec: {other}"
            ))),
        }
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self, CompressionCodec::None)
    }

    fn tag(&self) -> &'static [u8; CODEC_TAG_LEN] {
        match self {
            CompressionCodec::None => b"NONE",
            CompressionCodec::Lz4Frame => b"LZ4_",
            CompressionCodec::Zstd(_) => b"ZSTD",
            CompressionCodec::Snappy => b"SNAP",
        }
    }
}

impl FromStr for CompressionCodec {
    type Err = ShuffleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CompressionCodec::try_from_name(s, 1)
    }
}

impl fmt::Display for CompressionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionCodec::None => write!(f, "none"),
            CompressionCodec::Lz4Frame => write!(f, "lz4"),
            CompressionCodec::Zstd(level) => write!(f, "zstd({level})"),
            CompressionCodec::Snappy => write!(f, "snappy"),
        }
    }
}

/// Encodes record batches into shuffle blocks.
///
/// Segments holding no more than `compress_threshold` rows are written uncompressed, since
/// compressing tiny batches costs more than it saves.
#[derive(Debug, Clone)]
pub struct ShuffleBlockWriter {
    codec: CompressionCodec,
    compress_threshold: usize,
}

impl ShuffleBlockWriter {
    pub fn new(codec: CompressionCodec, compress_threshold: usize) -> Self {
        Self {
            codec,
            compress_threshold,
        }
    }

    pub fn codec(&self) -> &CompressionCodec {
        &self.codec
    }

    /// The codec used for a segment of `num_rows` rows.
    pub fn codec_for_rows(&self, num_rows: usize) -> &CompressionCodec {
        if num_rows <= self.compress_threshold {
            &CompressionCodec::None
        } else {
            &self.codec
        }
    }

    /// Writes `batch` as a single block, choosing the codec from its row count.
    pub fn write_batch<W: Write + Seek>(
        &self,
        batch: &RecordBatch,
        output: &mut W,
        encode_time: &Time,
    ) -> ShuffleResult<usize> {
        write_block(
            batch,
            self.codec_for_rows(batch.num_rows()),
            output,
            encode_time,
        )
    }
}

/// Writes `batch` as one block compressed with `codec`, returning the number of bytes written.
/// Empty batches produce no block.
pub fn write_block<W: Write + Seek>(
    batch: &RecordBatch,
    codec: &CompressionCodec,
    output: &mut W,
    encode_time: &Time,
) -> ShuffleResult<usize> {
    if batch.num_rows() == 0 {
        return Ok(0);
    }

    let mut timer = encode_time.timer();
    let start_pos = output.stream_position()?;

    // leave space for the block length, it is only known once the payload is written
    output.write_all(&[0u8; LENGTH_FIELD_LEN])?;
    output.write_all(&(batch.num_rows() as u64).to_le_bytes())?;
    output.write_all(codec.tag())?;

    match codec {
        CompressionCodec::None => {
            let mut arrow_writer = StreamWriter::try_new(&mut *output, &batch.schema())?;
            arrow_writer.write(batch)?;
            arrow_writer.finish()?;
        }
        CompressionCodec::Lz4Frame => {
            let mut wtr = lz4_flex::frame::FrameEncoder::new(&mut *output);
            {
                let mut arrow_writer = StreamWriter::try_new(&mut wtr, &batch.schema())?;
                arrow_writer.write(batch)?;
                arrow_writer.finish()?;
            }
            wtr.finish()
                .map_err(|e| ShuffleError::Codec(format!("lz4 compression error: {e}")))?;
        }
        CompressionCodec::Zstd(level) => {
            let encoder = zstd::Encoder::new(&mut *output, *level)?;
            let mut arrow_writer = StreamWriter::try_new(encoder, &batch.schema())?;
            arrow_writer.write(batch)?;
            arrow_writer.finish()?;
            let zstd_encoder = arrow_writer.into_inner()?;
            zstd_encoder.finish()?;
        }
        CompressionCodec::Snappy => {
            let mut wtr = snap::write::FrameEncoder::new(&mut *output);
            {
                let mut arrow_writer = StreamWriter::try_new(&mut wtr, &batch.schema())?;
                arrow_writer.write(batch)?;
                arrow_writer.finish()?;
            }
            wtr.into_inner().map_err(|e| {
                ShuffleError::Codec(format!("snappy compression error: {}", e.error()))
            })?;
        }
    }

    let end_pos = output.stream_position()?;
    let block_length = end_pos - start_pos - LENGTH_FIELD_LEN as u64;
    if block_length > MAX_BLOCK_LENGTH {
        return Err(ShuffleError::Codec(format!(
            "Shuffle block size {block_length} exceeds maximum size of {MAX_BLOCK_LENGTH}. \
             Try reducing batch size or increasing compression level"
        )));
    }

    output.seek(SeekFrom::Start(start_pos))?;
    output.write_all(&block_length.to_le_bytes())?;
    output.seek(SeekFrom::Start(end_pos))?;

    timer.stop();
    Ok((end_pos - start_pos) as usize)
}

/// Decodes a block body, i.e. everything after the length field.
pub fn read_shuffle_block(body: &[u8]) -> ShuffleResult<RecordBatch> {
    if body.len() < ROWS_FIELD_LEN + CODEC_TAG_LEN {
        return Err(ShuffleError::Codec(format!(
            "Shuffle block of {} bytes is too short for its header",
            body.len()
        )));
    }
    let num_rows = read_u64_le(body, 0)?;
    let payload = &body[ROWS_FIELD_LEN + CODEC_TAG_LEN..];

    let batch = match &body[ROWS_FIELD_LEN..ROWS_FIELD_LEN + CODEC_TAG_LEN] {
        b"NONE" => read_ipc_stream(payload)?,
        b"LZ4_" => read_ipc_stream(lz4_flex::frame::FrameDecoder::new(payload))?,
        b"ZSTD" => read_ipc_stream(zstd::Decoder::new(payload)?)?,
        b"SNAP" => read_ipc_stream(snap::read::FrameDecoder::new(payload))?,
        other => {
            return Err(ShuffleError::Codec(format!(
                "Failed to decode batch: invalid compression codec: {other:?}"
            )))
        }
    };

    if batch.num_rows() as u64 != num_rows {
        return Err(ShuffleError::Codec(format!(
            "Shuffle block header declares {num_rows} rows but {} were decoded",
            batch.num_rows()
        )));
    }
    Ok(batch)
}

fn read_ipc_stream<R: Read>(input: R) -> ShuffleResult<RecordBatch> {
    let mut reader = StreamReader::try_new(input, None)?;
    match reader.next() {
        Some(batch) => Ok(batch?),
        None => Err(ShuffleError::Codec(
            "Shuffle block does not contain a record batch".to_string(),
        )),
    }
}

fn read_u64_le(bytes: &[u8], pos: usize) -> ShuffleResult<u64> {
    bytes
        .get(pos..pos.saturating_add(8))
        .and_then(|b| <[u8; 8]>::try_from(b).ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| ShuffleError::Codec(format!("Truncated shuffle block at offset {pos}")))
}

/// Returns the span of the block starting at `pos`, length field included.
pub(crate) fn block_span(data: &[u8], pos: usize) -> ShuffleResult<Range<usize>> {
    let body_len = read_u64_le(data, pos)?;
    let end = usize::try_from(body_len)
        .ok()
        .and_then(|len| pos.checked_add(LENGTH_FIELD_LEN)?.checked_add(len))
        .filter(|end| *end <= data.len());
    match end {
        Some(end) if body_len >= (BLOCK_HEADER_LEN - LENGTH_FIELD_LEN) as u64 => Ok(pos..end),
        _ => Err(ShuffleError::Codec(format!(
            "Shuffle block at offset {pos} with length {body_len} overruns region of {} bytes",
            data.len()
        ))),
    }
}

/// Iterates over the record batches of a region holding consecutive blocks.
pub struct ShuffleBlockIterator<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ShuffleBlockIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl Iterator for ShuffleBlockIterator<'_> {
    type Item = ShuffleResult<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let result = block_span(self.data, self.pos).and_then(|span| {
            self.pos = span.end;
            read_shuffle_block(&self.data[span.start + LENGTH_FIELD_LEN..span.end])
        });
        if result.is_err() {
            // a corrupt region cannot be resynchronized
            self.pos = self.data.len();
        }
        Some(result)
    }
}
