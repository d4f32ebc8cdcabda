//! Integrity check between a reference table and a reassembled one.
//!
//! Comparison is by value: field names and types in order (nullability and
//! metadata ignored), then row count, then every column across all batches.
//! Batch boundaries do not matter, so a table fetched as many small chunks
//! matches the same rows loaded as one batch.

use crate::error::{CoreError, Result};
use crate::table::Table;
use arrow::array::{Array, ArrayRef};
use arrow::compute::concat;
use arrow::datatypes::SchemaRef;
use std::fmt;

/// First point where two tables diverge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    Schema { expected: String, actual: String },
    RowCount { expected: usize, actual: usize },
    Column { column: String, row: usize },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::Schema { expected, actual } => {
                write!(f, "schema differs: expected [{expected}], got [{actual}]")
            }
            Mismatch::RowCount { expected, actual } => {
                write!(f, "row count differs: expected {expected}, got {actual}")
            }
            Mismatch::Column { column, row } => {
                write!(f, "column '{column}' differs at row {row}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub equal: bool,
    pub mismatch: Option<Mismatch>,
}

impl Verification {
    fn ok() -> Self {
        Self {
            equal: true,
            mismatch: None,
        }
    }

    fn failed(mismatch: Mismatch) -> Self {
        Self {
            equal: false,
            mismatch: Some(mismatch),
        }
    }

    /// `Err(VerificationMismatch)` when the tables differ.
    pub fn into_result(self) -> Result<()> {
        match self.mismatch {
            Some(m) => Err(CoreError::VerificationMismatch(m)),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self
    }

    pub fn verify(&self, expected: &Table, actual: &Table) -> Result<Verification> {
        if let Some(m) = schema_mismatch(&expected.schema(), &actual.schema()) {
            tracing::warn!(%m, "Integrity check failed");
            return Ok(Verification::failed(m));
        }

        if expected.num_rows() != actual.num_rows() {
            let m = Mismatch::RowCount {
                expected: expected.num_rows(),
                actual: actual.num_rows(),
            };
            tracing::warn!(%m, "Integrity check failed");
            return Ok(Verification::failed(m));
        }

        let schema = expected.schema();
        for (index, field) in schema.fields().iter().enumerate() {
            let left = column(expected, index)?;
            let right = column(actual, index)?;
            if left.as_ref() == right.as_ref() {
                continue;
            }
            let row = (0..left.len())
                .find(|&i| left.slice(i, 1).as_ref() != right.slice(i, 1).as_ref())
                .unwrap_or(0);
            let m = Mismatch::Column {
                column: field.name().clone(),
                row,
            };
            tracing::warn!(%m, "Integrity check failed");
            return Ok(Verification::failed(m));
        }

        tracing::debug!(rows = expected.num_rows(), "Integrity check passed");
        Ok(Verification::ok())
    }
}

fn describe(schema: &SchemaRef) -> String {
    schema
        .fields()
        .iter()
        .map(|f| format!("{}: {}", f.name(), f.data_type()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn schema_mismatch(expected: &SchemaRef, actual: &SchemaRef) -> Option<Mismatch> {
    let same = expected.fields().len() == actual.fields().len()
        && expected
            .fields()
            .iter()
            .zip(actual.fields().iter())
            .all(|(e, a)| e.name() == a.name() && e.data_type() == a.data_type());
    if same {
        None
    } else {
        Some(Mismatch::Schema {
            expected: describe(expected),
            actual: describe(actual),
        })
    }
}

fn column(table: &Table, index: usize) -> Result<ArrayRef> {
    let parts: Vec<&dyn Array> = table
        .batches()
        .iter()
        .map(|b| b.column(index).as_ref())
        .collect();
    if parts.is_empty() {
        let field = table.schema().field(index).clone();
        return Ok(arrow::array::new_empty_array(field.data_type()));
    }
    Ok(concat(&parts)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id64", DataType::Int64, false),
            Field::new("str_c", DataType::Utf8, true),
            Field::new("f", DataType::Float64, true),
        ]))
    }

    fn batch(ids: Vec<i64>) -> RecordBatch {
        let names: Vec<String> = ids.iter().map(|i| format!("row-{i}")).collect();
        let floats: Vec<f64> = ids.iter().map(|i| *i as f64 * 0.5).collect();
        RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(names)),
                Arc::new(Float64Array::from(floats)),
            ],
        )
        .unwrap()
    }

    fn table(batches: Vec<RecordBatch>) -> Table {
        Table::try_new(schema(), batches).unwrap()
    }

    #[test]
    fn test_equal_across_different_batch_boundaries() {
        let expected = table(vec![batch(vec![1, 2, 3, 4])]);
        let actual = table(vec![batch(vec![1]), batch(vec![2, 3]), batch(vec![4])]);
        let v = IntegrityVerifier::new().verify(&expected, &actual).unwrap();
        assert!(v.equal);
        assert!(v.into_result().is_ok());
    }

    #[test]
    fn test_reports_row_count_difference() {
        let expected = table(vec![batch(vec![1, 2, 3])]);
        let actual = table(vec![batch(vec![1, 2])]);
        let v = IntegrityVerifier::new().verify(&expected, &actual).unwrap();
        assert_eq!(
            v.mismatch,
            Some(Mismatch::RowCount {
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_reports_first_differing_row() {
        let expected = table(vec![batch(vec![1, 2, 3, 4])]);
        let actual = table(vec![batch(vec![1, 2]), batch(vec![9, 4])]);
        let v = IntegrityVerifier::new().verify(&expected, &actual).unwrap();
        assert_eq!(
            v.mismatch,
            Some(Mismatch::Column {
                column: "id64".to_string(),
                row: 2
            })
        );
        assert!(matches!(
            v.into_result(),
            Err(CoreError::VerificationMismatch(_))
        ));
    }

    #[test]
    fn test_reports_schema_difference() {
        let expected = table(vec![batch(vec![1])]);
        let other = Arc::new(Schema::new(vec![Field::new("id64", DataType::Int32, false)]));
        let actual = Table::try_new(
            other.clone(),
            vec![RecordBatch::try_new(
                other,
                vec![Arc::new(arrow::array::Int32Array::from(vec![1]))],
            )
            .unwrap()],
        )
        .unwrap();
        let v = IntegrityVerifier::new().verify(&expected, &actual).unwrap();
        assert!(matches!(v.mismatch, Some(Mismatch::Schema { .. })));
    }

    #[test]
    fn test_empty_tables_with_same_schema_are_equal() {
        let v = IntegrityVerifier::new()
            .verify(&table(vec![]), &table(vec![]))
            .unwrap();
        assert!(v.equal);
    }
}
