//! In-memory columnar table: one schema plus an ordered list of record batches.

use crate::codec::Compression;
use crate::error::{CoreError, Result};
use arrow::compute::concat_batches;
use arrow::datatypes::{Schema, SchemaRef};
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Table {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl Table {
    /// Build a table, checking every batch carries `schema`.
    pub fn try_new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<Self> {
        if let Some(pos) = batches.iter().position(|b| b.schema() != schema) {
            return Err(CoreError::InvalidShape(format!(
                "batch {pos} schema differs from table schema"
            )));
        }
        Ok(Self { schema, batches })
    }

    /// Caller guarantees every batch already carries `schema`.
    pub(crate) fn from_checked(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self { schema, batches }
    }

    /// Table without columns or rows.
    pub fn empty() -> Self {
        Self {
            schema: Arc::new(Schema::empty()),
            batches: Vec::new(),
        }
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn into_batches(self) -> Vec<RecordBatch> {
        self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    pub fn num_columns(&self) -> usize {
        self.schema.fields().len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    /// Collapse all batches into one.
    pub fn concat(&self) -> Result<RecordBatch> {
        Ok(concat_batches(&self.schema, &self.batches)?)
    }

    /// Write the table as one Arrow IPC file.
    pub fn write_ipc_file(&self, path: impl AsRef<Path>, compression: Compression) -> Result<u64> {
        let path = path.as_ref();
        let file = File::create(path)?;
        let mut writer =
            FileWriter::try_new_with_options(file, &self.schema, compression.write_options()?)?;
        for batch in &self.batches {
            writer.write(batch)?;
        }
        writer.finish()?;
        drop(writer);

        let bytes = std::fs::metadata(path)?.len();
        tracing::info!(
            path = %path.display(),
            rows = self.num_rows(),
            batches = self.batches.len(),
            bytes,
            "Wrote table to IPC file"
        );
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field};

    fn batch(values: Vec<i32>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))]).unwrap()
    }

    #[test]
    fn test_rows_and_concat() {
        let a = batch(vec![1, 2]);
        let b = batch(vec![3]);
        let table = Table::try_new(a.schema(), vec![a, b]).unwrap();
        assert_eq!(table.num_rows(), 3);
        assert_eq!(table.num_columns(), 1);

        let merged = table.concat().unwrap();
        let col = merged
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap();
        assert_eq!(col.values(), &[1, 2, 3]);
    }

    #[test]
    fn test_rejects_mismatched_schema() {
        let a = batch(vec![1]);
        let other_schema = Arc::new(Schema::new(vec![Field::new("w", DataType::Int32, false)]));
        let b = RecordBatch::try_new(other_schema, vec![Arc::new(Int32Array::from(vec![2]))])
            .unwrap();
        assert!(Table::try_new(a.schema(), vec![a, b]).is_err());
    }

    #[test]
    fn test_empty_table() {
        let table = Table::empty();
        assert!(table.is_empty());
        assert_eq!(table.num_columns(), 0);
        assert_eq!(table.concat().unwrap().num_rows(), 0);
    }
}
