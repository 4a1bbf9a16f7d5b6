//! Arrow IPC file backend for the fixed batch copy operator.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use arrow::array::RecordBatch;
use arrow::ipc::writer::FileWriter;
use arrow_schema::SchemaRef;
use datafusion_common::{internal_err, Result};
use parking_lot::Mutex;

use crate::collection::BatchCollection;
use crate::function::CopyFunction;

/// Copies batches into an Arrow IPC file.
///
/// Preparation concatenates a collection into one record batch; flushing
/// appends it to the file. The operator guarantees flush order, so the
/// writer only needs a mutex, not reordering logic.
pub struct IpcCopyFunction {
    schema: SchemaRef,
    batch_size: usize,
}

impl IpcCopyFunction {
    pub fn new(schema: SchemaRef, batch_size: usize) -> Self {
        Self { schema, batch_size }
    }
}

pub struct IpcCopyGlobal {
    writer: Mutex<Option<FileWriter<BufWriter<File>>>>,
}

pub struct IpcCopyLocal;

impl CopyFunction for IpcCopyFunction {
    type GlobalState = IpcCopyGlobal;
    type LocalState = IpcCopyLocal;
    type Prepared = RecordBatch;

    fn init_global(&self, path: &Path) -> Result<Self::GlobalState> {
        let file = File::create(path)?;
        let writer = FileWriter::try_new(BufWriter::new(file), &self.schema)?;
        Ok(IpcCopyGlobal {
            writer: Mutex::new(Some(writer)),
        })
    }

    fn init_local(&self) -> Result<Self::LocalState> {
        Ok(IpcCopyLocal)
    }

    fn desired_batch_size(&self) -> usize {
        self.batch_size
    }

    fn prepare_batch(
        &self,
        _global: &Self::GlobalState,
        collection: BatchCollection,
    ) -> Result<Self::Prepared> {
        collection.concat()
    }

    fn flush_batch(&self, global: &Self::GlobalState, prepared: RecordBatch) -> Result<()> {
        let mut writer = global.writer.lock();
        match writer.as_mut() {
            Some(writer) => Ok(writer.write(&prepared)?),
            None => internal_err!("ipc copy received a batch after finalize"),
        }
    }

    fn finalize(&self, global: &Self::GlobalState) -> Result<()> {
        let Some(mut writer) = global.writer.lock().take() else {
            return internal_err!("ipc copy finalized twice");
        };
        writer.finish()?;
        let buffered = writer.into_inner()?;
        buffered.into_inner().map_err(|e| e.into_error())?;
        Ok(())
    }
}
