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

//! Partitioned shuffle write path.

mod buffer;
mod cancellation;
pub(crate) mod codec;
mod config;
mod eviction;
mod index;
mod memory;
mod merger;
mod metrics;
mod partitioning;
mod shuffle_writer;
mod shuffle_writer_exec;
mod spill;
mod writers;

pub use buffer::{DrainedSegment, PartitionBuffer};
pub use cancellation::CancellationToken;
pub use codec::{
    read_shuffle_block, write_block, CompressionCodec, ShuffleBlockIterator, ShuffleBlockWriter,
};
pub use config::{ShuffleWriterConfig, MAX_NUM_PARTITIONS};
pub use eviction::EvictionPolicy;
pub use index::ShuffleIndex;
pub use metrics::ShuffleWriterMetrics;
pub use partitioning::PartitionIdSource;
pub use shuffle_writer::{ShuffleWriteResult, ShuffleWriter, WriterState};
pub use shuffle_writer_exec::ShuffleWriterExec;
pub use spill::{SpillIndex, SpillIndexEntry};
pub use writers::{
    LocalDiskPartitionWriter, PartitionWriter, PushClient, PushPartitionWriter, ShuffleOutput,
};
