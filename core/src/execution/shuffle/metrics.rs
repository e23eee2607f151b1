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

use datafusion::physical_plan::metrics::{
    BaselineMetrics, Count, ExecutionPlanMetricsSet, MetricBuilder, Time,
};

/// Metrics of one shuffle writer. Clones share the underlying counters, so the coordinator
/// and its partition writer report into the same set.
#[derive(Debug, Clone)]
pub struct ShuffleWriterMetrics {
    /// metrics
    pub(crate) baseline: BaselineMetrics,

    /// Time to route rows into partition buffers
    pub(crate) repart_time: Time,

    /// Time encoding and compressing batches to IPC format
    pub(crate) encode_time: Time,

    /// Time spent writing spill and output files. Maps to "shuffleWriteTime" in Spark SQL Metrics.
    pub(crate) write_time: Time,

    /// Time spent evicting partitions, encoding included
    pub(crate) evict_time: Time,

    /// Number of input batches
    pub(crate) input_batches: Count,

    /// count of evicted segments during the execution of the operator
    pub(crate) spill_count: Count,

    /// total spilled bytes during the execution of the operator
    pub(crate) spilled_bytes: Count,

    /// The in-memory size of buffered data. Different to `spilled_bytes` because of compression.
    pub(crate) data_size: Count,
}

impl ShuffleWriterMetrics {
    pub fn new(metrics: &ExecutionPlanMetricsSet, partition: usize) -> Self {
        Self {
            baseline: BaselineMetrics::new(metrics, partition),
            repart_time: MetricBuilder::new(metrics).subset_time("repart_time", partition),
            encode_time: MetricBuilder::new(metrics).subset_time("encode_time", partition),
            write_time: MetricBuilder::new(metrics).subset_time("write_time", partition),
            evict_time: MetricBuilder::new(metrics).subset_time("evict_time", partition),
            input_batches: MetricBuilder::new(metrics).counter("input_batches", partition),
            spill_count: MetricBuilder::new(metrics).spill_count(partition),
            spilled_bytes: MetricBuilder::new(metrics).spilled_bytes(partition),
            data_size: MetricBuilder::new(metrics).counter("data_size", partition),
        }
    }

    pub fn spill_count(&self) -> usize {
        self.spill_count.value()
    }

    pub fn spilled_bytes(&self) -> usize {
        self.spilled_bytes.value()
    }

    pub fn data_size(&self) -> usize {
        self.data_size.value()
    }

    pub fn output_rows(&self) -> usize {
        self.baseline.output_rows().value()
    }
}
