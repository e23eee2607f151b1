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

//! Partitioned shuffle writer for a native columnar execution engine.
//!
//! Upstream operators hand [`ShuffleWriter`] Arrow record batches together with a partition
//! id per row. Rows are buffered per output partition, spilled through a [`PartitionWriter`]
//! when the memory budget is exceeded, and merged into one data artifact plus a lengths index
//! when the writer is stopped.

// The lint makes easier for code reader/reviewer separate references clones from more heavyweight ones
#![deny(clippy::clone_on_ref_ptr)]

use log::{info, LevelFilter};
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{load_config_file, Appender, Deserializers, Root},
    encode::pattern::PatternEncoder,
    Config,
};

pub mod errors;
pub mod execution;

pub use errors::{ShuffleError, ShuffleResult};
pub use execution::shuffle::{
    CancellationToken, CompressionCodec, EvictionPolicy, LocalDiskPartitionWriter,
    PartitionIdSource, PartitionWriter, PushClient, PushPartitionWriter, ShuffleOutput,
    ShuffleWriteResult, ShuffleWriter, ShuffleWriterConfig, ShuffleWriterExec,
    ShuffleWriterMetrics, WriterState,
};

const LOG_PATTERN: &str = "{d(%y/%m/%d %H:%M:%S)} {l} {f}: {m}{n}";

/// Installs the global logger.
///
/// An empty or missing path falls back to the default console configuration. Installing a
/// logger twice is not an error; the first logger stays in place.
pub fn init_logging(log_conf_path: Option<&str>) -> ShuffleResult<()> {
    let log_config = match log_conf_path {
        Some(path) if !path.is_empty() => load_config_file(path, Deserializers::default())
            .map_err(|err| ShuffleError::Config(err.to_string()))?,
        _ => default_logger_config()?,
    };

    let _ = log4rs::init_config(log_config).map_err(|err| ShuffleError::Config(err.to_string()));

    info!(
        "Native shuffle library version {} initialized",
        env!("CARGO_PKG_VERSION")
    );
    Ok(())
}

// Creates a default log4rs config, which logs to console with `INFO` level.
fn default_logger_config() -> ShuffleResult<Config> {
    let console_append = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();
    let appender = Appender::builder().build("console", Box::new(console_append));
    let root = Root::builder().appender("console").build(LevelFilter::Info);
    Config::builder()
        .appender(appender)
        .build(root)
        .map_err(|err| ShuffleError::Config(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_logger_config_builds() {
        assert!(default_logger_config().is_ok());
        init_logging(None).unwrap();
        // a second init keeps the existing logger
        init_logging(Some("")).unwrap();
    }

    #[test]
    fn missing_log_config_file_is_a_config_error() {
        let err = init_logging(Some("/nonexistent/log4rs.yaml")).unwrap_err();
        assert!(matches!(err, ShuffleError::Config(_)));
    }
}
