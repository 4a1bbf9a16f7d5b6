use arrow::array::RecordBatch;
use arrow_schema::SchemaRef;
use batchcopy_arrow_extra::compute::concat_collection;
use batchcopy_arrow_extra::utils::batch_bytes;
use datafusion_common::Result;

/// An append-only run of record batches with cached row and byte counts.
///
/// Chunk byte sizes are measured once, at append time, and travel with the
/// chunk through repartitioning. The bytes the sink adds to the global
/// unflushed counter are therefore exactly the bytes the flusher subtracts
/// once the chunk reaches the backend.
pub struct BatchCollection {
    schema: SchemaRef,
    chunks: Vec<RecordBatch>,
    chunk_bytes: Vec<usize>,
    num_rows: usize,
    size_bytes: usize,
}

impl BatchCollection {
    pub fn new(schema: SchemaRef) -> Self {
        Self {
            schema,
            chunks: Vec::new(),
            chunk_bytes: Vec::new(),
            num_rows: 0,
            size_bytes: 0,
        }
    }

    pub fn append(&mut self, chunk: RecordBatch) {
        let bytes = batch_bytes(&chunk);
        self.append_sized(chunk, bytes);
    }

    pub(crate) fn append_sized(&mut self, chunk: RecordBatch, bytes: usize) {
        self.num_rows += chunk.num_rows();
        self.size_bytes += bytes;
        self.chunks.push(chunk);
        self.chunk_bytes.push(bytes);
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.chunks
    }

    /// Concatenates the collection into a single batch.
    pub fn concat(&self) -> Result<RecordBatch> {
        Ok(concat_collection(&self.schema, &self.chunks)?)
    }

    pub(crate) fn into_sized_chunks(self) -> impl Iterator<Item = (RecordBatch, usize)> {
        self.chunks.into_iter().zip(self.chunk_bytes)
    }
}
