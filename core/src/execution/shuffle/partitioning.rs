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

//! Routing of input rows to output partitions.
//!
//! Partition ids are computed upstream. They either arrive next to the batch or are stored in
//! its leading `Int32` column; the writer never derives them itself.

use crate::errors::{ShuffleError, ShuffleResult};
use arrow::array::{Array, AsArray, RecordBatch, UInt32Array};
use arrow::compute::take_record_batch;
use arrow::datatypes::{DataType, Int32Type, Schema, SchemaRef};
use itertools::Itertools;
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;

/// Where the partition id of each input row comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionIdSource {
    /// Every row belongs to partition 0.
    Single,
    /// The first column holds a non-null `Int32` partition id per row. The column is removed
    /// before rows are buffered.
    FirstColumn,
}

impl FromStr for PartitionIdSource {
    type Err = ShuffleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "single" => Ok(PartitionIdSource::Single),
            "hash" | "range" | "pid" => Ok(PartitionIdSource::FirstColumn),
            other => Err(ShuffleError::Config(format!(
                "Unsupported shuffle partitioning: {other}"
            ))),
        }
    }
}

impl PartitionIdSource {
    /// Schema of the rows held in partition buffers for batches of `input` schema.
    pub fn buffered_schema(&self, input: &SchemaRef) -> ShuffleResult<SchemaRef> {
        match self {
            PartitionIdSource::Single => Ok(Arc::clone(input)),
            PartitionIdSource::FirstColumn => {
                match input.fields().first().map(|f| f.data_type()) {
                    Some(DataType::Int32) => {}
                    other => {
                        return Err(ShuffleError::InvalidArgument(format!(
                            "Expected an Int32 partition id as first column, found {other:?}"
                        )))
                    }
                }
                let fields = input.fields().iter().skip(1).cloned().collect::<Vec<_>>();
                Ok(Arc::new(Schema::new_with_metadata(
                    fields,
                    input.metadata().clone(),
                )))
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct ScratchSpace {
    /// Partition ids for each row in the current batch.
    partition_ids: Vec<u32>,
    /// The row indices of the rows in each partition. This array is conceptually divided into
    /// partitions, where each partition contains the row indices of the rows in that partition.
    /// The length of this array is the same as the number of rows in the batch.
    partition_row_indices: Vec<u32>,
    /// The start indices of partitions in partition_row_indices. partition_starts[K] and
    /// partition_starts[K + 1] are the start and end indices of partition K in partition_row_indices.
    /// The length of this array is 1 + the number of partitions.
    partition_starts: Vec<u32>,
}

impl ScratchSpace {
    pub(crate) fn new(batch_size: usize, num_output_partitions: usize) -> Self {
        Self {
            partition_ids: Vec::with_capacity(batch_size),
            partition_row_indices: Vec::with_capacity(batch_size),
            partition_starts: vec![0; num_output_partitions + 1],
        }
    }

    pub(crate) fn set_partition_ids(
        &mut self,
        ids: &[u32],
        num_output_partitions: usize,
    ) -> ShuffleResult<()> {
        if let Some(bad) = ids.iter().find(|id| **id as usize >= num_output_partitions) {
            return Err(ShuffleError::InvalidArgument(format!(
                "Partition id {bad} out of range [0, {num_output_partitions})"
            )));
        }
        self.partition_ids.clear();
        self.partition_ids.extend_from_slice(ids);
        Ok(())
    }

    /// Reads partition ids from the leading column of `batch` and returns the remaining columns.
    pub(crate) fn split_partition_id_column(
        &mut self,
        batch: &RecordBatch,
        num_output_partitions: usize,
    ) -> ShuffleResult<RecordBatch> {
        let pid_array = batch
            .columns()
            .first()
            .and_then(|col| col.as_primitive_opt::<Int32Type>())
            .ok_or_else(|| {
                ShuffleError::InvalidArgument(
                    "Expected an Int32 partition id as first column".to_string(),
                )
            })?;
        if pid_array.null_count() > 0 {
            return Err(ShuffleError::InvalidArgument(
                "Partition id column must not contain nulls".to_string(),
            ));
        }

        self.partition_ids.clear();
        for pid in pid_array.values().iter() {
            if *pid < 0 || *pid as usize >= num_output_partitions {
                return Err(ShuffleError::InvalidArgument(format!(
                    "Partition id {pid} out of range [0, {num_output_partitions})"
                )));
            }
            self.partition_ids.push(*pid as u32);
        }

        let projection = (1..batch.num_columns()).collect::<Vec<_>>();
        Ok(batch.project(&projection)?)
    }

    fn map_partition_ids_to_starts_and_indices(
        &mut self,
        rows: Range<usize>,
        num_output_partitions: usize,
    ) {
        let partition_ids = &self.partition_ids[rows];

        // count each partition size, while leaving the last extra element as 0
        let partition_counters = &mut self.partition_starts;
        partition_counters.resize(num_output_partitions + 1, 0);
        partition_counters.fill(0);
        partition_ids
            .iter()
            .for_each(|partition_id| partition_counters[*partition_id as usize] += 1);

        // accumulate partition counters into partition ends
        // e.g. partition counter: [1, 3, 2, 1, 0] => [1, 4, 6, 7, 7]
        let partition_ends = partition_counters;
        let mut accum = 0;
        partition_ends.iter_mut().for_each(|v| {
            *v += accum;
            accum = *v;
        });

        // e.g. partition ids: [3, 1, 1, 1, 2, 2, 0] will produce
        //
        //  partition_row_indices: [6, 1, 2, 3, 4, 5, 0]
        //  partition_starts: [0, 1, 4, 6, 7]
        //
        // so partition K owns partition_row_indices[partition_starts[K]..partition_starts[K + 1]],
        // and row indices within a partition stay in arrival order.
        let partition_row_indices = &mut self.partition_row_indices;
        partition_row_indices.resize(partition_ids.len(), 0);
        for (index, partition_id) in partition_ids.iter().enumerate().rev() {
            partition_ends[*partition_id as usize] -= 1;
            let end = partition_ends[*partition_id as usize];
            partition_row_indices[end as usize] = index as u32;
        }

        // after calculating, partition ends become partition starts
    }

    pub(crate) fn num_partition_ids(&self) -> usize {
        self.partition_ids.len()
    }

    /// Splits `batch` by the loaded partition ids starting at `row_offset`, returning one
    /// sub-batch per non-empty partition in ascending partition order.
    ///
    /// When every row lands in one partition the batch is returned as is if it `owns_buffers`,
    /// otherwise it is compacted so the buffered size covers only its own rows.
    pub(crate) fn take_partitions(
        &mut self,
        batch: &RecordBatch,
        row_offset: usize,
        num_output_partitions: usize,
        owns_buffers: bool,
    ) -> ShuffleResult<Vec<(usize, RecordBatch)>> {
        let rows = row_offset..row_offset + batch.num_rows();
        if rows.end > self.partition_ids.len() {
            return Err(ShuffleError::InvalidArgument(format!(
                "Got {} partition ids for rows {rows:?}",
                self.partition_ids.len(),
            )));
        }
        self.map_partition_ids_to_starts_and_indices(rows, num_output_partitions);

        let mut routed = Vec::new();
        for (partition_id, (&start, &end)) in self
            .partition_starts
            .iter()
            .tuple_windows()
            .enumerate()
            .filter(|(_, (start, end))| start < end)
        {
            let sub_batch = if (end - start) as usize == batch.num_rows() {
                if owns_buffers {
                    batch.clone()
                } else {
                    compact_batch(batch)?
                }
            } else {
                let indices = UInt32Array::from(
                    self.partition_row_indices[start as usize..end as usize].to_vec(),
                );
                take_record_batch(batch, &indices)?
            };
            routed.push((partition_id, sub_batch));
        }
        Ok(routed)
    }
}

/// Copies a zero-copy slice into buffers of its own. `get_array_memory_size` of a slice reports
/// the whole parent buffers.
pub(crate) fn compact_batch(batch: &RecordBatch) -> ShuffleResult<RecordBatch> {
    let indices = UInt32Array::from_iter_values(0..batch.num_rows() as u32);
    Ok(take_record_batch(batch, &indices)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::shuffle::test_util::{create_batch, with_partition_ids};
    use arrow::array::{Int32Array, StringArray};
    use arrow::datatypes::Field;

    #[test]
    fn test_map_partition_ids() {
        let mut scratch = ScratchSpace::new(8, 4);
        scratch.set_partition_ids(&[3, 1, 1, 1, 2, 2, 0], 4).unwrap();
        scratch.map_partition_ids_to_starts_and_indices(0..7, 4);
        assert_eq!(vec![6, 1, 2, 3, 4, 5, 0], scratch.partition_row_indices);
        assert_eq!(vec![0, 1, 4, 6, 7], scratch.partition_starts);
    }

    #[test]
    fn test_take_partitions_preserves_order() {
        let batch = create_batch(6, false);
        let mut scratch = ScratchSpace::new(8, 3);
        scratch.set_partition_ids(&[2, 0, 2, 0, 2, 2], 3).unwrap();
        let routed = scratch.take_partitions(&batch, 0, 3, true).unwrap();

        assert_eq!(vec![0, 2], routed.iter().map(|(p, _)| *p).collect::<Vec<_>>());
        let p0 = routed[0].1.column(0).as_primitive::<Int32Type>();
        assert_eq!(&[1, 3], p0.values().as_ref());
        let p2 = routed[1].1.column(0).as_primitive::<Int32Type>();
        assert_eq!(&[0, 2, 4, 5], p2.values().as_ref());
    }

    #[test]
    fn test_take_partitions_with_row_offset() {
        let batch = create_batch(6, false);
        let mut scratch = ScratchSpace::new(8, 2);
        scratch.set_partition_ids(&[0, 0, 0, 1, 0, 1], 2).unwrap();
        let slice = batch.slice(3, 3);
        let routed = scratch.take_partitions(&slice, 3, 2, false).unwrap();
        let p0 = routed[0].1.column(0).as_primitive::<Int32Type>();
        assert_eq!(&[4], p0.values().as_ref());
        let p1 = routed[1].1.column(0).as_primitive::<Int32Type>();
        assert_eq!(&[3, 5], p1.values().as_ref());
        assert!(scratch.take_partitions(&slice, 4, 2, false).is_err());
    }

    #[test]
    fn test_single_partition_keeps_batch() {
        let batch = create_batch(4, true);
        let mut scratch = ScratchSpace::new(8, 2);
        scratch.set_partition_ids(&[1, 1, 1, 1], 2).unwrap();
        let routed = scratch.take_partitions(&batch, 0, 2, true).unwrap();
        assert_eq!(1, routed.len());
        assert_eq!((1, batch), routed[0].clone());
    }

    #[test]
    fn test_single_partition_slice_is_compacted() {
        let batch = create_batch(1000, false);
        let mut scratch = ScratchSpace::new(1000, 2);
        scratch.set_partition_ids(&[1; 1000], 2).unwrap();
        let slice = batch.slice(100, 100);
        let routed = scratch.take_partitions(&slice, 100, 2, false).unwrap();
        assert_eq!(1, routed.len());
        let (partition_id, sub_batch) = &routed[0];
        assert_eq!(1, *partition_id);
        assert_eq!(&slice, sub_batch);
        assert!(sub_batch.get_array_memory_size() < slice.get_array_memory_size());
        assert!(sub_batch.get_array_memory_size() * 5 < batch.get_array_memory_size());
    }

    #[test]
    fn test_invalid_partition_ids() {
        let batch = create_batch(3, false);
        let mut scratch = ScratchSpace::new(8, 2);
        assert!(matches!(
            scratch.set_partition_ids(&[0, 2, 1], 2),
            Err(ShuffleError::InvalidArgument(_))
        ));
        scratch.set_partition_ids(&[0, 1], 2).unwrap();
        assert!(matches!(
            scratch.take_partitions(&batch, 0, 2, true),
            Err(ShuffleError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_split_partition_id_column() {
        let batch = with_partition_ids(&create_batch(3, false), &[1, 0, 1]);
        let mut scratch = ScratchSpace::new(8, 2);
        let data = scratch.split_partition_id_column(&batch, 2).unwrap();
        assert_eq!(create_batch(3, false), data);
        assert_eq!(vec![1, 0, 1], scratch.partition_ids);

        let out_of_range = with_partition_ids(&create_batch(2, false), &[0, 5]);
        assert!(scratch.split_partition_id_column(&out_of_range, 2).is_err());

        let schema = Arc::new(Schema::new(vec![
            Field::new("pid", DataType::Int32, true),
            Field::new("s", DataType::Utf8, true),
        ]));
        let with_null = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![Some(0), None])),
                Arc::new(StringArray::from(vec!["a", "b"])),
            ],
        )
        .unwrap();
        assert!(scratch.split_partition_id_column(&with_null, 2).is_err());
    }

    #[test]
    fn test_buffered_schema() {
        let batch = with_partition_ids(&create_batch(1, false), &[0]);
        let schema = PartitionIdSource::FirstColumn
            .buffered_schema(&batch.schema())
            .unwrap();
        assert_eq!(create_batch(1, false).schema(), schema);

        let plain = create_batch(1, false).schema();
        assert_eq!(
            plain,
            PartitionIdSource::Single.buffered_schema(&plain).unwrap()
        );

        let no_pid = Arc::new(Schema::new(vec![Field::new("s", DataType::Utf8, true)]));
        assert!(PartitionIdSource::FirstColumn
            .buffered_schema(&no_pid)
            .is_err());
        assert_eq!(
            PartitionIdSource::FirstColumn,
            "hash".parse::<PartitionIdSource>().unwrap()
        );
        assert!("round_robin".parse::<PartitionIdSource>().is_err());
    }
}
