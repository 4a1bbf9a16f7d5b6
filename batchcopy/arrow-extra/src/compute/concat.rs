use arrow::{
    array::{RecordBatch, RecordBatchOptions},
    datatypes::SchemaRef,
    error::ArrowError,
};

/// Concatenates `batches` into a single batch of `schema`.
///
/// Unlike [`arrow::compute::concat_batches`] this keeps the row count when
/// the schema has no columns.
pub fn concat_collection<'a>(
    schema: &SchemaRef,
    batches: impl IntoIterator<Item = &'a RecordBatch>,
) -> Result<RecordBatch, ArrowError> {
    if schema.fields().is_empty() {
        let num_rows: usize = batches.into_iter().map(RecordBatch::num_rows).sum();
        let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
        return RecordBatch::try_new_with_options(schema.clone(), vec![], &options);
    }

    let batches: Vec<&RecordBatch> = batches.into_iter().collect();
    if batches.is_empty() {
        return Ok(RecordBatch::new_empty(schema.clone()));
    }
    arrow::compute::concat_batches(schema, batches)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    use super::*;

    #[test]
    fn concatenates_chunks_in_order() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let chunk = |values: Vec<i64>| {
            RecordBatch::try_new(
                Arc::clone(&schema),
                vec![Arc::new(Int64Array::from(values)) as arrow::array::ArrayRef],
            )
            .unwrap()
        };
        let out = concat_collection(&schema, &[chunk(vec![1, 2]), chunk(vec![3])]).unwrap();
        assert_eq!(out.num_rows(), 3);
        let values = out.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(values.values().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn empty_schema_keeps_row_count() {
        let schema = Arc::new(Schema::empty());
        let options = RecordBatchOptions::new().with_row_count(Some(7));
        let batch =
            RecordBatch::try_new_with_options(Arc::clone(&schema), vec![], &options).unwrap();
        let out = concat_collection(&schema, &[batch.clone(), batch]).unwrap();
        assert_eq!(out.num_rows(), 14);
    }

    #[test]
    fn no_batches_yields_empty() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let out = concat_collection(&schema, []).unwrap();
        assert_eq!(out.num_rows(), 0);
    }
}
