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

//! Defines the shuffle write plan.

use crate::execution::shuffle::{
    LocalDiskPartitionWriter, PartitionIdSource, ShuffleWriter, ShuffleWriterConfig,
    ShuffleWriterMetrics,
};
use crate::execution::tracing::with_trace;
use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;
use datafusion::common::{internal_err, Result};
use datafusion::execution::context::TaskContext;
use datafusion::physical_expr::{EquivalenceProperties, Partitioning};
use datafusion::physical_plan::execution_plan::{Boundedness, EmissionType};
use datafusion::physical_plan::metrics::{ExecutionPlanMetricsSet, MetricsSet};
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use datafusion::physical_plan::{
    DisplayAs, DisplayFormatType, EmptyRecordBatchStream, ExecutionPlan, PlanProperties,
    SendableRecordBatchStream, Statistics,
};
use futures::{StreamExt, TryFutureExt, TryStreamExt};
use std::any::Any;
use std::fmt::{self, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

/// The shuffle writer operator maps each input partition to M output partitions, writing one
/// data file and one index file. It produces no rows.
#[derive(Debug)]
pub struct ShuffleWriterExec {
    /// Input execution plan
    input: Arc<dyn ExecutionPlan>,
    num_partitions: usize,
    id_source: PartitionIdSource,
    config: ShuffleWriterConfig,
    /// Output data file path
    output_data_file: String,
    /// Output index file path
    output_index_file: String,
    /// Metrics
    metrics: ExecutionPlanMetricsSet,
    /// Cache for expensive-to-compute plan properties
    cache: PlanProperties,
}

impl ShuffleWriterExec {
    /// Create a new ShuffleWriterExec
    pub fn try_new(
        input: Arc<dyn ExecutionPlan>,
        num_partitions: usize,
        id_source: PartitionIdSource,
        config: ShuffleWriterConfig,
        output_data_file: String,
        output_index_file: String,
    ) -> Result<Self> {
        config.validate(num_partitions)?;
        id_source.buffered_schema(&input.schema())?;
        let cache = PlanProperties::new(
            EquivalenceProperties::new(Arc::clone(&input.schema())),
            Partitioning::UnknownPartitioning(1),
            EmissionType::Final,
            Boundedness::Bounded,
        );

        Ok(ShuffleWriterExec {
            input,
            num_partitions,
            id_source,
            config,
            output_data_file,
            output_index_file,
            metrics: ExecutionPlanMetricsSet::new(),
            cache,
        })
    }
}

impl DisplayAs for ShuffleWriterExec {
    fn fmt_as(&self, t: DisplayFormatType, f: &mut Formatter) -> fmt::Result {
        match t {
            DisplayFormatType::Default | DisplayFormatType::Verbose => {
                write!(
                    f,
                    "ShuffleWriterExec: partitions={}, source={:?}, compression={}",
                    self.num_partitions, self.id_source, self.config.codec
                )
            }
            DisplayFormatType::TreeRender => {
                writeln!(f, "partitions={}", self.num_partitions)?;
                write!(f, "compression={}", self.config.codec)
            }
        }
    }
}

impl ExecutionPlan for ShuffleWriterExec {
    /// Return a reference to Any that can be used for downcasting
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn name(&self) -> &str {
        "ShuffleWriterExec"
    }

    fn metrics(&self) -> Option<MetricsSet> {
        Some(self.metrics.clone_inner())
    }

    fn statistics(&self) -> Result<Statistics> {
        self.input.partition_statistics(None)
    }

    fn properties(&self) -> &PlanProperties {
        &self.cache
    }

    /// Get the schema for this execution plan
    fn schema(&self) -> SchemaRef {
        self.input.schema()
    }

    fn children(&self) -> Vec<&Arc<dyn ExecutionPlan>> {
        vec![&self.input]
    }

    fn with_new_children(
        self: Arc<Self>,
        children: Vec<Arc<dyn ExecutionPlan>>,
    ) -> Result<Arc<dyn ExecutionPlan>> {
        match children.len() {
            1 => Ok(Arc::new(ShuffleWriterExec::try_new(
                Arc::clone(&children[0]),
                self.num_partitions,
                self.id_source,
                self.config.clone(),
                self.output_data_file.clone(),
                self.output_index_file.clone(),
            )?)),
            n => internal_err!("ShuffleWriterExec expects one child, got {n}"),
        }
    }

    fn execute(
        &self,
        partition: usize,
        context: Arc<TaskContext>,
    ) -> Result<SendableRecordBatchStream> {
        let input = self.input.execute(partition, Arc::clone(&context))?;
        let metrics = ShuffleWriterMetrics::new(&self.metrics, partition);

        Ok(Box::pin(RecordBatchStreamAdapter::new(
            self.schema(),
            futures::stream::once(
                external_shuffle(
                    input,
                    partition,
                    self.num_partitions,
                    self.id_source,
                    self.config.clone(),
                    PathBuf::from(&self.output_data_file),
                    PathBuf::from(&self.output_index_file),
                    metrics,
                    context,
                )
                .map_err(|e| ArrowError::ExternalError(Box::new(e))),
            )
            .try_flatten(),
        )))
    }
}

#[allow(clippy::too_many_arguments)]
async fn external_shuffle(
    mut input: SendableRecordBatchStream,
    partition: usize,
    num_partitions: usize,
    id_source: PartitionIdSource,
    config: ShuffleWriterConfig,
    output_data_file: PathBuf,
    output_index_file: PathBuf,
    metrics: ShuffleWriterMetrics,
    context: Arc<TaskContext>,
) -> Result<SendableRecordBatchStream> {
    let schema = input.schema();
    let runtime = context.runtime_env();
    let tracing_enabled = config.tracing_enabled;

    let partition_writer = LocalDiskPartitionWriter::try_new(
        num_partitions,
        output_data_file,
        Some(output_index_file),
        &config,
        Arc::clone(&runtime),
        metrics.clone(),
    )?;
    let mut writer = ShuffleWriter::try_new(
        partition,
        num_partitions,
        Arc::clone(&schema),
        id_source,
        config,
        Box::new(partition_writer),
        &runtime,
        metrics,
    )?;
    writer.init()?;

    while let Some(batch) = input.next().await {
        writer.insert_batch(&batch?)?;
    }
    with_trace("external_shuffle_stop", tracing_enabled, || writer.stop())?;

    // shuffle writer always has empty output
    Ok(Box::pin(EmptyRecordBatchStream::new(Arc::clone(&schema))) as SendableRecordBatchStream)
}
