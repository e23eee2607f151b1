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

//! Selection of partitions to evict once the memory budget is exceeded.

use crate::errors::ShuffleError;
use crate::execution::shuffle::buffer::PartitionBuffer;
use std::fmt;
use std::str::FromStr;

/// How partitions are picked for eviction. Both policies only look at buffer sizes, so the
/// choice is deterministic for a given buffer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Evict the largest buffer, repeating until back under the budget. Ties go to the lowest
    /// partition id.
    #[default]
    LargestFirst,
    /// Evict every non-empty buffer at once.
    All,
}

impl EvictionPolicy {
    /// Partitions to evict next, in eviction order. Empty when no buffer holds rows.
    pub(crate) fn select(&self, buffers: &[PartitionBuffer]) -> Vec<usize> {
        match self {
            EvictionPolicy::LargestFirst => largest_partition(buffers).into_iter().collect(),
            EvictionPolicy::All => buffers
                .iter()
                .filter(|b| !b.is_empty())
                .map(|b| b.partition_id())
                .collect(),
        }
    }
}

impl FromStr for EvictionPolicy {
    type Err = ShuffleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "largest" | "largest_first" => Ok(EvictionPolicy::LargestFirst),
            "all" => Ok(EvictionPolicy::All),
            other => Err(ShuffleError::Config(format!(
                "Unsupported shuffle eviction policy: {other}"
            ))),
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionPolicy::LargestFirst => write!(f, "largest_first"),
            EvictionPolicy::All => write!(f, "all"),
        }
    }
}

/// The non-empty buffer holding the most bytes.
pub(crate) fn largest_partition(buffers: &[PartitionBuffer]) -> Option<usize> {
    let mut largest: Option<&PartitionBuffer> = None;
    for buffer in buffers.iter().filter(|b| !b.is_empty()) {
        // strict comparison keeps the lowest id on ties
        if largest.is_none_or(|l| buffer.size_bytes() > l.size_bytes()) {
            largest = Some(buffer);
        }
    }
    largest.map(|b| b.partition_id())
}
