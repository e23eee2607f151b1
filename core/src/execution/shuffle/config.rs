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
use crate::execution::shuffle::{CompressionCodec, EvictionPolicy};

/// Partition ids are stored in 16 bits by downstream readers.
pub const MAX_NUM_PARTITIONS: usize = 64 * 1024;

/// Tunables of a [`ShuffleWriter`](crate::execution::shuffle::ShuffleWriter).
#[derive(Debug, Clone)]
pub struct ShuffleWriterConfig {
    /// Soft ceiling on bytes buffered across all partitions (default: 64MB)
    pub memory_limit: usize,
    /// Maximum rows per encoded block and per routed input slice (default: 8192)
    pub batch_size: usize,
    /// Codec of the final artifact (default: LZ4 frame)
    pub codec: CompressionCodec,
    /// Codec of spilled segments, `None` means same as `codec`
    pub spill_codec: Option<CompressionCodec>,
    /// Segments with at most this many rows are written uncompressed (default: 100)
    pub batch_compress_threshold: usize,
    /// How partitions are picked once the memory limit is exceeded
    pub eviction_policy: EvictionPolicy,
    /// Evict a partition as soon as it buffers `batch_size` rows
    pub prefer_evict: bool,
    /// Bytes buffered before re-encoded blocks are written out (default: 1MB)
    pub write_buffer_size: usize,
    /// Largest payload handed to a push client in one call (default: 4MB)
    pub push_buffer_max_size: usize,
    /// fsync the spill file after every eviction
    pub sync_spill: bool,
    pub tracing_enabled: bool,
}

impl Default for ShuffleWriterConfig {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024,
            batch_size: 8192,
            codec: CompressionCodec::Lz4Frame,
            spill_codec: None,
            batch_compress_threshold: 100,
            eviction_policy: EvictionPolicy::LargestFirst,
            prefer_evict: false,
            write_buffer_size: 1024 * 1024,
            push_buffer_max_size: 4 * 1024 * 1024,
            sync_spill: false,
            tracing_enabled: false,
        }
    }
}

impl ShuffleWriterConfig {
    pub fn with_memory_limit(mut self, memory_limit: usize) -> Self {
        self.memory_limit = memory_limit;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_codec(mut self, codec: CompressionCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_spill_codec(mut self, codec: CompressionCodec) -> Self {
        self.spill_codec = Some(codec);
        self
    }

    pub fn with_batch_compress_threshold(mut self, rows: usize) -> Self {
        self.batch_compress_threshold = rows;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_prefer_evict(mut self, prefer_evict: bool) -> Self {
        self.prefer_evict = prefer_evict;
        self
    }

    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn with_push_buffer_max_size(mut self, size: usize) -> Self {
        self.push_buffer_max_size = size;
        self
    }

    pub fn with_sync_spill(mut self, sync_spill: bool) -> Self {
        self.sync_spill = sync_spill;
        self
    }

    pub fn with_tracing_enabled(mut self, enabled: bool) -> Self {
        self.tracing_enabled = enabled;
        self
    }

    /// Codec used when writing spilled segments.
    pub fn spill_codec(&self) -> &CompressionCodec {
        self.spill_codec.as_ref().unwrap_or(&self.codec)
    }

    pub fn validate(&self, num_partitions: usize) -> ShuffleResult<()> {
        if num_partitions == 0 || num_partitions > MAX_NUM_PARTITIONS {
            return Err(ShuffleError::Config(format!(
                "Number of shuffle partitions must be between 1 and {MAX_NUM_PARTITIONS}, got {num_partitions}"
            )));
        }
        if self.batch_size == 0 {
            return Err(ShuffleError::Config(
                "Shuffle batch size must be positive".to_string(),
            ));
        }
        if self.push_buffer_max_size == 0 {
            return Err(ShuffleError::Config(
                "Push buffer size must be positive".to_string(),
            ));
        }
        for codec in [&self.codec, self.spill_codec()] {
            if let CompressionCodec::Zstd(level) = codec {
                if !zstd::compression_level_range().contains(level) {
                    return Err(ShuffleError::Config(format!(
                        "Unsupported zstd compression level {level}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ShuffleWriterConfig::default();
        assert_eq!(config.memory_limit, 64 * 1024 * 1024);
        assert_eq!(config.batch_size, 8192);
        assert_eq!(config.batch_compress_threshold, 100);
        assert_eq!(config.eviction_policy, EvictionPolicy::LargestFirst);
        assert_eq!(config.spill_codec(), &CompressionCodec::Lz4Frame);
        assert!(config.validate(200).is_ok());
    }

    #[test]
    fn test_spill_codec_override() {
        let config = ShuffleWriterConfig::default()
            .with_codec(CompressionCodec::Zstd(3))
            .with_spill_codec(CompressionCodec::None);
        assert_eq!(config.spill_codec(), &CompressionCodec::None);
        assert_eq!(config.codec, CompressionCodec::Zstd(3));
    }

    #[test]
    fn test_validate() {
        let config = ShuffleWriterConfig::default();
        assert!(matches!(config.validate(0), Err(ShuffleError::Config(_))));
        assert!(config.validate(MAX_NUM_PARTITIONS).is_ok());
        assert!(config.validate(MAX_NUM_PARTITIONS + 1).is_err());
        assert!(config.clone().with_batch_size(0).validate(4).is_err());
        assert!(config
            .with_codec(CompressionCodec::Zstd(1000))
            .validate(4)
            .is_err());
    }
}
