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

//! Index of the segments written to a spill store.

use crate::errors::{ShuffleError, ShuffleResult};
use crate::execution::shuffle::codec::CompressionCodec;

/// One evicted segment. Entries are immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillIndexEntry {
    pub partition_id: usize,
    /// Byte offset of the segment in the spill store
    pub offset: u64,
    /// Encoded length of the segment in bytes
    pub length: u64,
    pub codec: CompressionCodec,
    pub num_rows: usize,
    /// In-memory size of the rows before encoding
    pub raw_bytes: usize,
}

impl SpillIndexEntry {
    pub fn is_compressed(&self) -> bool {
        self.codec.is_compressed()
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Append-only list of the segments in a spill store, in write order.
#[derive(Debug, Default)]
pub struct SpillIndex {
    entries: Vec<SpillIndexEntry>,
    /// Positions in `entries` per partition, in write order
    partition_entries: Vec<Vec<usize>>,
}

impl SpillIndex {
    pub fn new(num_partitions: usize) -> Self {
        Self {
            entries: Vec::new(),
            partition_entries: vec![Vec::new(); num_partitions],
        }
    }

    /// Records a segment. Segments are laid out back to back, so an entry must start where the
    /// previous one ended.
    pub fn append(&mut self, entry: SpillIndexEntry) -> ShuffleResult<()> {
        if entry.partition_id >= self.partition_entries.len() {
            return Err(ShuffleError::Internal(format!(
                "Spill entry for partition {} but only {} partitions exist",
                entry.partition_id,
                self.partition_entries.len()
            )));
        }
        if entry.offset != self.end_offset() {
            return Err(ShuffleError::Internal(format!(
                "Spill entry at offset {} does not follow the previous segment ending at {}",
                entry.offset,
                self.end_offset()
            )));
        }
        if entry.length == 0 {
            return Err(ShuffleError::Internal(format!(
                "Empty spill entry for partition {}",
                entry.partition_id
            )));
        }
        self.partition_entries[entry.partition_id].push(self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    /// Segments of `partition_id` in the order they were written.
    pub fn entries_for(&self, partition_id: usize) -> impl Iterator<Item = &SpillIndexEntry> {
        self.partition_entries
            .get(partition_id)
            .into_iter()
            .flatten()
            .map(|i| &self.entries[*i])
    }

    pub fn entries(&self) -> &[SpillIndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offset one past the last recorded segment.
    pub fn end_offset(&self) -> u64 {
        self.entries.last().map(|e| e.end()).unwrap_or(0)
    }

    pub fn num_rows(&self, partition_id: usize) -> usize {
        self.entries_for(partition_id).map(|e| e.num_rows).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(partition_id: usize, offset: u64, length: u64) -> SpillIndexEntry {
        SpillIndexEntry {
            partition_id,
            offset,
            length,
            codec: CompressionCodec::Lz4Frame,
            num_rows: 10,
            raw_bytes: 100,
        }
    }

    #[test]
    fn test_entries_per_partition_in_write_order() {
        let mut index = SpillIndex::new(3);
        index.append(entry(1, 0, 10)).unwrap();
        index.append(entry(0, 10, 5)).unwrap();
        index.append(entry(1, 15, 7)).unwrap();

        assert_eq!(3, index.len());
        assert_eq!(22, index.end_offset());
        let p1 = index.entries_for(1).map(|e| e.offset).collect::<Vec<_>>();
        assert_eq!(vec![0, 15], p1);
        assert_eq!(0, index.entries_for(2).count());
        assert_eq!(0, index.entries_for(7).count());
        assert_eq!(20, index.num_rows(1));
        assert!(index.entries()[0].is_compressed());
    }

    #[test]
    fn test_rejects_gaps_and_unknown_partitions() {
        let mut index = SpillIndex::new(2);
        index.append(entry(0, 0, 10)).unwrap();
        assert!(index.append(entry(0, 12, 10)).is_err());
        assert!(index.append(entry(2, 10, 10)).is_err());
        assert!(index.append(entry(1, 10, 0)).is_err());
        assert_eq!(1, index.len());
    }
}
