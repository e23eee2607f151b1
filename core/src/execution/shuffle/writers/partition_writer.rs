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
use crate::execution::shuffle::{CancellationToken, PartitionBuffer};
use std::fmt::Debug;
use std::path::PathBuf;

/// Where the finished shuffle output of one writer ended up.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShuffleOutput {
    /// Data file holding every partition's blocks back to back, when written locally
    pub data_file: Option<PathBuf>,
    /// Offsets index next to the data file
    pub index_file: Option<PathBuf>,
    /// Encoded bytes per partition, in partition order
    pub partition_lengths: Vec<u64>,
    /// In-memory bytes per partition before encoding
    pub raw_partition_lengths: Vec<u64>,
}

impl ShuffleOutput {
    pub fn total_length(&self) -> u64 {
        self.partition_lengths.iter().sum()
    }
}

/// Destination of evicted and final partition data.
///
/// A writer is initialized once, receives any number of evictions and is stopped once.
/// `stop` drains every remaining buffer and returns the per-partition lengths; calling it
/// again returns the same output. `abort` releases everything the writer holds and leaves
/// no partial output behind.
pub trait PartitionWriter: Send + Debug {
    fn init(&mut self, cancellation: CancellationToken) -> ShuffleResult<()>;

    /// Writes out and clears `buffer`, returning the encoded bytes produced. Evicting an
    /// empty buffer is a no-op.
    fn evict_partition(
        &mut self,
        partition_id: usize,
        buffer: &mut PartitionBuffer,
    ) -> ShuffleResult<usize>;

    fn stop(&mut self, buffers: &mut [PartitionBuffer]) -> ShuffleResult<ShuffleOutput>;

    fn abort(&mut self);
}

/// Lifecycle shared by the partition writer implementations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WriterPhase {
    Created,
    Initialized,
    Stopped(ShuffleOutput),
    Aborted,
}

impl WriterPhase {
    pub(crate) fn ensure_initialized(&self, operation: &str) -> ShuffleResult<()> {
        match self {
            WriterPhase::Initialized => Ok(()),
            other => Err(ShuffleError::InvalidState(format!(
                "{operation} called on a partition writer in phase {}",
                other.name()
            ))),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            WriterPhase::Created => "created",
            WriterPhase::Initialized => "initialized",
            WriterPhase::Stopped(_) => "stopped",
            WriterPhase::Aborted => "aborted",
        }
    }
}
