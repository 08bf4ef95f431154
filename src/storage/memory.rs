use anyhow::Result;

use crate::storage::{StorageConfig, TraceRecord, TraceStorage};

/// Keep all trace records in memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryConfig;

impl StorageConfig for MemoryConfig {
    type Storage = MemoryTraceStorage;

    fn new_storage(self) -> Result<Self::Storage> {
        Ok(MemoryTraceStorage::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTraceStorage {
    records: Vec<TraceRecord>,
}

impl TraceStorage for MemoryTraceStorage {
    type Finalized = Vec<TraceRecord>;

    fn record_trace(&mut self, record: TraceRecord) -> Result<()> {
        self.records.push(record);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn finalize(self) -> Result<Self::Finalized> {
        Ok(self.records)
    }
}
