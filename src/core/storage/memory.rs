// In-process ordered backend; state lives only as long as the handle.
use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::core::error::Error;
use crate::core::storage::{Backend, BatchLimits, OpenRequest, Visit, WriteBatch};

pub const NAME: &str = "memory";

pub fn open(request: &OpenRequest<'_>) -> Result<Box<dyn Backend>, Error> {
    Ok(Box::new(MemoryBackend::new(request.limits)))
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    limits: BatchLimits,
}

impl MemoryBackend {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            entries: BTreeMap::new(),
            limits,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn location(&self) -> Option<&Path> {
        None
    }

    fn batch_limits(&self) -> BatchLimits {
        self.limits
    }

    fn apply(&mut self, batch: WriteBatch) -> Result<(), Error> {
        let count = batch.len();
        for (key, value) in batch.into_entries() {
            self.entries.insert(key, value);
        }
        debug!(entries = count, total = self.entries.len(), "memory batch applied");
        Ok(())
    }

    fn iterate(&self, visit: &mut Visit<'_>) -> Result<(), Error> {
        for (key, value) in &self.entries {
            visit(key, value)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.entries.clear();
        Ok(())
    }
}
