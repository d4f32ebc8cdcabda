//! Dataset Model
//!
//! A [`Dataset`] is an ordered set of partitions, each owning exactly
//! `batches_per_partition` [`Batch`]es. Batches are the unit of storage: one
//! batch becomes one chunk under one key.
//!
//! ## Tagging
//!
//! Source files carry plain record batches. [`BatchTagger`] assigns each one a
//! [`ChunkId`]:
//!
//! - the partition is the first value of a `partition` column when the batch
//!   has one (any integer type), otherwise `linear_index / batches_per_partition`
//! - the batch index is a running counter per partition, so batches keep the
//!   order they had in the source
//!
//! ## Invariants
//!
//! `Dataset` guarantees dense partition ids `0..partitions`, exactly
//! `batches_per_partition` batches in each, a single schema, and storage in
//! `(partition, batch)` order.

use crate::error::{CoreError, Result};
use crate::key::{validate_shape, ChunkId};
use crate::table::Table;
use arrow::array::{Array, Int64Array};
use arrow::compute::cast;
use arrow::datatypes::{DataType, SchemaRef};
use arrow::ipc::reader::FileReader;
use arrow::record_batch::RecordBatch;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::Path;

/// Name of the column the tagger reads partition ids from.
pub const PARTITION_COLUMN: &str = "partition";

/// One tagged record batch.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: ChunkId,
    /// Position of the batch in the source, across all partitions.
    pub global_index: u64,
    pub data: RecordBatch,
}

impl Batch {
    pub fn num_rows(&self) -> usize {
        self.data.num_rows()
    }
}

/// Assigns chunk ids to source batches one at a time.
#[derive(Debug)]
pub struct BatchTagger {
    batches_per_partition: u32,
    next_batch: BTreeMap<u32, u32>,
    seen: u64,
}

impl BatchTagger {
    pub fn new(batches_per_partition: u32) -> Result<Self> {
        if batches_per_partition == 0 {
            return Err(CoreError::InvalidShape(
                "batches_per_partition must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            batches_per_partition,
            next_batch: BTreeMap::new(),
            seen: 0,
        })
    }

    pub fn tag(&mut self, data: RecordBatch) -> Result<Batch> {
        let global_index = self.seen;
        let partition = match partition_column_value(&data)? {
            Some(p) => p,
            None => u32::try_from(global_index / u64::from(self.batches_per_partition))
                .map_err(|_| CoreError::InvalidShape("partition id overflows u32".to_string()))?,
        };

        let slot = self.next_batch.entry(partition).or_insert(0);
        let batch = *slot;
        *slot += 1;
        self.seen += 1;

        Ok(Batch {
            id: ChunkId::new(partition, batch),
            global_index,
            data,
        })
    }
}

fn partition_column_value(data: &RecordBatch) -> Result<Option<u32>> {
    let Some(column) = data.column_by_name(PARTITION_COLUMN) else {
        return Ok(None);
    };
    if data.num_rows() == 0 || !column.data_type().is_integer() {
        return Ok(None);
    }

    let first = cast(&column.slice(0, 1), &DataType::Int64)?;
    let Some(values) = first.as_any().downcast_ref::<Int64Array>() else {
        return Ok(None);
    };
    if values.is_null(0) {
        return Ok(None);
    }
    u32::try_from(values.value(0)).map(Some).map_err(|_| {
        CoreError::InvalidShape(format!(
            "partition column holds invalid id {}",
            values.value(0)
        ))
    })
}

/// Immutable, validated dataset.
#[derive(Debug, Clone)]
pub struct Dataset {
    schema: SchemaRef,
    partitions: u32,
    batches_per_partition: u32,
    batches: Vec<Batch>,
}

impl Dataset {
    /// Tag and validate plain record batches.
    pub fn from_record_batches(
        batches: impl IntoIterator<Item = RecordBatch>,
        batches_per_partition: u32,
    ) -> Result<Self> {
        let mut tagger = BatchTagger::new(batches_per_partition)?;
        let tagged = batches
            .into_iter()
            .map(|b| tagger.tag(b))
            .collect::<Result<Vec<_>>>()?;
        Self::from_batches(tagged, batches_per_partition)
    }

    /// Validate already-tagged batches.
    pub fn from_batches(mut batches: Vec<Batch>, batches_per_partition: u32) -> Result<Self> {
        let Some(first) = batches.first() else {
            return Err(CoreError::InvalidShape("dataset has no batches".to_string()));
        };
        let schema = first.data.schema();
        if let Some(bad) = batches.iter().find(|b| b.data.schema() != schema) {
            return Err(CoreError::InvalidShape(format!(
                "batch at {} has a different schema",
                bad.id
            )));
        }

        batches.sort_by_key(|b| b.id);

        let mut per_partition: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
        for b in &batches {
            if !per_partition.entry(b.id.partition).or_default().insert(b.id.batch) {
                return Err(CoreError::InvalidShape(format!("duplicate chunk {}", b.id)));
            }
        }

        let partitions = u32::try_from(per_partition.len())
            .map_err(|_| CoreError::InvalidShape("too many partitions".to_string()))?;
        for (expected, (partition, indices)) in (0..partitions).zip(&per_partition) {
            if *partition != expected {
                return Err(CoreError::InvalidShape(format!(
                    "partition ids are not dense: expected {expected}, found {partition}"
                )));
            }
            let dense = indices.len() == batches_per_partition as usize
                && indices.iter().copied().eq(0..batches_per_partition);
            if !dense {
                return Err(CoreError::InvalidShape(format!(
                    "partition {partition} has {} batches, expected {batches_per_partition}",
                    indices.len()
                )));
            }
        }
        validate_shape(partitions, batches_per_partition)?;

        Ok(Self {
            schema,
            partitions,
            batches_per_partition,
            batches,
        })
    }

    /// Load every batch of one Arrow IPC file and tag it.
    pub fn read_ipc_file(path: impl AsRef<Path>, batches_per_partition: u32) -> Result<Self> {
        let path = path.as_ref();
        let reader = FileReader::try_new(File::open(path)?, None)?;
        let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
        tracing::debug!(
            path = %path.display(),
            batches = batches.len(),
            "Read record batches from IPC file"
        );
        Self::from_record_batches(batches, batches_per_partition)
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions
    }

    pub fn batches_per_partition(&self) -> u32 {
        self.batches_per_partition
    }

    /// All batches in `(partition, batch)` order.
    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn chunk_count(&self) -> usize {
        self.batches.len()
    }

    pub fn total_rows(&self) -> usize {
        self.batches.iter().map(Batch::num_rows).sum()
    }

    /// Batches of one partition, empty if it does not exist.
    pub fn partition(&self, partition: u32) -> &[Batch] {
        if partition >= self.partitions {
            return &[];
        }
        let per = self.batches_per_partition as usize;
        let start = partition as usize * per;
        &self.batches[start..start + per]
    }

    /// The whole dataset as a table.
    pub fn to_table(&self) -> Table {
        Table::from_checked(
            self.schema(),
            self.batches.iter().map(|b| b.data.clone()).collect(),
        )
    }

    /// The selected partitions as a table, in ascending partition order.
    pub fn select(&self, partitions: &[u32]) -> Table {
        let wanted: BTreeSet<u32> = partitions.iter().copied().collect();
        let batches = wanted
            .into_iter()
            .flat_map(|p| self.partition(p).iter().map(|b| b.data.clone()))
            .collect();
        Table::from_checked(self.schema(), batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, Int64Array};
    use arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    fn batch_with_partition(partition: i32, id: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id64", DataType::Int64, false),
            Field::new(PARTITION_COLUMN, DataType::Int32, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![id, id + 1])),
                Arc::new(Int32Array::from(vec![partition, partition])),
            ],
        )
        .unwrap()
    }

    fn batch_without_partition(id: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("id64", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![id]))]).unwrap()
    }

    #[test]
    fn test_tags_from_partition_column_and_keeps_source_order() {
        // interleaved source: p1, p0, p1, p0
        let source = vec![
            batch_with_partition(1, 100),
            batch_with_partition(0, 0),
            batch_with_partition(1, 102),
            batch_with_partition(0, 2),
        ];
        let ds = Dataset::from_record_batches(source, 2).unwrap();
        let ids: Vec<_> = ds.batches().iter().map(|b| b.id).collect();
        assert_eq!(
            ids,
            vec![
                ChunkId::new(0, 0),
                ChunkId::new(0, 1),
                ChunkId::new(1, 0),
                ChunkId::new(1, 1)
            ]
        );
        // partition 1 batch 0 is the first p1 batch of the source
        assert_eq!(ds.partition(1)[0].global_index, 0);
        assert_eq!(ds.partition(1)[1].global_index, 2);
    }

    #[test]
    fn test_tags_by_linear_order_without_partition_column() {
        let source = (0..6).map(batch_without_partition);
        let ds = Dataset::from_record_batches(source, 3).unwrap();
        assert_eq!(ds.partition_count(), 2);
        assert_eq!(ds.batches_per_partition(), 3);
        assert_eq!(ds.partition(1)[2].id, ChunkId::new(1, 2));
        assert_eq!(ds.total_rows(), 6);
    }

    #[test]
    fn test_rejects_ragged_partitions() {
        let source = (0..5).map(batch_without_partition);
        let err = Dataset::from_record_batches(source, 3).unwrap_err();
        assert!(matches!(err, CoreError::InvalidShape(_)));
    }

    #[test]
    fn test_rejects_sparse_partition_ids() {
        let source = vec![batch_with_partition(0, 0), batch_with_partition(2, 10)];
        assert!(Dataset::from_record_batches(source, 1).is_err());
    }

    #[test]
    fn test_rejects_zero_batches_per_partition_and_empty_input() {
        assert!(BatchTagger::new(0).is_err());
        assert!(Dataset::from_record_batches(Vec::new(), 4).is_err());
    }

    #[test]
    fn test_select_returns_requested_partitions_in_order() {
        let source = (0..6).map(batch_without_partition);
        let ds = Dataset::from_record_batches(source, 2).unwrap();
        let table = ds.select(&[2, 0, 2]);
        let ids: Vec<i64> = table
            .batches()
            .iter()
            .map(|b| {
                b.column(0)
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .unwrap()
                    .value(0)
            })
            .collect();
        assert_eq!(ids, vec![0, 1, 4, 5]);
        assert!(ds.partition(9).is_empty());
    }
}
