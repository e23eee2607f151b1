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

//! Lengths index of a shuffle artifact.
//!
//! On disk the index is stored as offsets:
//!
//! ```text
//! [i64: offset_0][i64: offset_1]...[i64: offset_n-1][i64: total_length]
//! ```
//!
//! All values are little-endian. Partition `i` spans `[offset_i, offset_i+1)` of the data file,
//! so the per-partition lengths are the differences of consecutive offsets.

use crate::errors::{ShuffleError, ShuffleResult};
use crate::execution::shuffle::codec::ShuffleBlockIterator;
use arrow::array::RecordBatch;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::ops::Range;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleIndex {
    /// One entry per partition plus the total length
    offsets: Vec<u64>,
}

impl ShuffleIndex {
    /// Builds the index from per-partition byte lengths in partition order.
    pub fn from_lengths(lengths: &[u64]) -> Self {
        let mut offsets = Vec::with_capacity(lengths.len() + 1);
        let mut accum = 0;
        offsets.push(accum);
        for length in lengths {
            accum += length;
            offsets.push(accum);
        }
        Self { offsets }
    }

    pub fn partition_count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    pub fn partition_lengths(&self) -> Vec<u64> {
        self.offsets.windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn partition_range(&self, partition_id: usize) -> ShuffleResult<Range<u64>> {
        if partition_id >= self.partition_count() {
            return Err(ShuffleError::InvalidArgument(format!(
                "Partition {partition_id} out of range [0, {})",
                self.partition_count()
            )));
        }
        Ok(self.offsets[partition_id]..self.offsets[partition_id + 1])
    }

    pub fn total_length(&self) -> u64 {
        self.offsets.last().copied().unwrap_or(0)
    }

    /// Decodes the batches of one partition from the artifact bytes.
    pub fn read_partition(
        &self,
        data: &[u8],
        partition_id: usize,
    ) -> ShuffleResult<Vec<RecordBatch>> {
        if data.len() as u64 != self.total_length() {
            return Err(ShuffleError::Codec(format!(
                "Shuffle data of {} bytes does not match index total of {}",
                data.len(),
                self.total_length()
            )));
        }
        let range = self.partition_range(partition_id)?;
        ShuffleBlockIterator::new(&data[range.start as usize..range.end as usize]).collect()
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> ShuffleResult<()> {
        for offset in &self.offsets {
            writer.write_all(&(*offset as i64).to_le_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> ShuffleResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len() as usize;

        if file_size % 8 != 0 {
            return Err(ShuffleError::Codec(format!(
                "Invalid index file size: {file_size} (must be multiple of 8)"
            )));
        }
        let entry_count = file_size / 8;
        if entry_count < 2 {
            return Err(ShuffleError::Codec(format!(
                "Index file too small: {entry_count} entries (need at least 2)"
            )));
        }

        let mut reader = BufReader::new(file);
        let mut offsets = Vec::with_capacity(entry_count);
        let mut buf = [0u8; 8];
        for _ in 0..entry_count {
            reader.read_exact(&mut buf)?;
            let offset = i64::from_le_bytes(buf);
            if offset < 0 || offsets.last().is_some_and(|prev: &u64| (offset as u64) < *prev) {
                return Err(ShuffleError::Codec(format!(
                    "Index file offsets must be non-negative and ascending, found {offset}"
                )));
            }
            offsets.push(offset as u64);
        }
        Ok(Self { offsets })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_lengths() {
        let index = ShuffleIndex::from_lengths(&[100, 0, 150]);
        assert_eq!(3, index.partition_count());
        assert_eq!(vec![100, 0, 150], index.partition_lengths());
        assert_eq!(0..100, index.partition_range(0).unwrap());
        assert_eq!(100..100, index.partition_range(1).unwrap());
        assert_eq!(100..250, index.partition_range(2).unwrap());
        assert_eq!(250, index.total_length());
        assert!(index.partition_range(3).is_err());
    }

    #[test]
    fn test_all_empty_partitions() {
        let index = ShuffleIndex::from_lengths(&[0, 0, 0, 0]);
        assert_eq!(vec![0, 0, 0, 0], index.partition_lengths());
        assert_eq!(0, index.total_length());
        assert!(index.read_partition(&[], 2).unwrap().is_empty());
    }

    #[test]
    fn test_write_and_read() -> ShuffleResult<()> {
        let temp_dir = TempDir::new()?;
        let index_path = temp_dir.path().join("test.index");

        let index = ShuffleIndex::from_lengths(&[100, 200, 200]);
        let mut file = File::create(&index_path)?;
        index.write_to(&mut file)?;
        assert_eq!(32, std::fs::metadata(&index_path)?.len());

        let loaded = ShuffleIndex::read_from_file(&index_path)?;
        assert_eq!(index, loaded);
        assert_eq!(100..300, loaded.partition_range(1)?);
        Ok(())
    }

    #[test]
    fn test_invalid_index_files() -> ShuffleResult<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("bad.index");

        std::fs::write(&path, [0u8; 12])?;
        assert!(ShuffleIndex::read_from_file(&path).is_err());

        std::fs::write(&path, 0i64.to_le_bytes())?;
        assert!(ShuffleIndex::read_from_file(&path).is_err());

        let mut descending = Vec::new();
        descending.extend_from_slice(&10i64.to_le_bytes());
        descending.extend_from_slice(&5i64.to_le_bytes());
        std::fs::write(&path, descending)?;
        assert!(ShuffleIndex::read_from_file(&path).is_err());
        Ok(())
    }
}
