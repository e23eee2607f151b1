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

//! Error types for the shuffle write path.

use arrow::error::ArrowError;
use datafusion::common::DataFusionError;

#[derive(thiserror::Error, Debug)]
pub enum ShuffleError {
    #[error("Configuration Error: {0}")]
    Config(String),

    /// An operation was called out of order, e.g. append before init or after stop.
    #[error("Invalid shuffle writer state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Buffer memory could not be reserved even after evicting the largest partition.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// A shuffle block could not be encoded or decoded.
    #[error("Shuffle codec error: {0}")]
    Codec(String),

    #[error("Shuffle writer was cancelled")]
    Cancelled,

    #[error("Shuffle Internal Error: {0}")]
    Internal(String),

    #[error(transparent)]
    Arrow {
        #[from]
        source: ArrowError,
    },

    #[error(transparent)]
    IO {
        #[from]
        source: std::io::Error,
    },

    #[error("{msg}")]
    DataFusion {
        msg: String,
        #[source]
        source: DataFusionError,
    },
}

pub type ShuffleResult<T> = Result<T, ShuffleError>;

impl ShuffleError {
    /// Errors after which the writer instance can no longer be used.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ShuffleError::InvalidState(_)
                | ShuffleError::InvalidArgument(_)
                | ShuffleError::Config(_)
        )
    }
}

impl From<DataFusionError> for ShuffleError {
    fn from(value: DataFusionError) -> Self {
        match value {
            DataFusionError::ResourcesExhausted(msg) => ShuffleError::OutOfMemory(msg),
            DataFusionError::IoError(source) => ShuffleError::IO { source },
            other => ShuffleError::DataFusion {
                msg: other.message().to_string(),
                source: other,
            },
        }
    }
}

impl From<ShuffleError> for DataFusionError {
    fn from(value: ShuffleError) -> Self {
        match value {
            ShuffleError::DataFusion { msg: _, source } => source,
            ShuffleError::OutOfMemory(msg) => DataFusionError::ResourcesExhausted(msg),
            ShuffleError::IO { source } => DataFusionError::IoError(source),
            _ => DataFusionError::Execution(value.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datafusion_error_roundtrip() {
        let err: ShuffleError = DataFusionError::Execution("boom".to_string()).into();
        assert!(matches!(err, ShuffleError::DataFusion { .. }));
        assert_eq!("boom", err.to_string());

        let back: DataFusionError = err.into();
        assert!(matches!(back, DataFusionError::Execution(msg) if msg == "boom"));
    }

    #[test]
    fn resources_exhausted_maps_to_out_of_memory() {
        let err: ShuffleError =
            DataFusionError::ResourcesExhausted("pool is full".to_string()).into();
        assert!(matches!(err, ShuffleError::OutOfMemory(_)));
        assert!(err.is_fatal());

        let back: DataFusionError = err.into();
        assert!(matches!(back, DataFusionError::ResourcesExhausted(_)));
    }

    #[test]
    fn state_errors_are_not_fatal() {
        assert!(!ShuffleError::InvalidState("stopped".to_string()).is_fatal());
        assert!(ShuffleError::Cancelled.is_fatal());
        assert_eq!(
            "Configuration Error: bad codec",
            ShuffleError::Config("bad codec".to_string()).to_string()
        );
    }
}
