mod core;
mod jsonl;
mod memory;

pub use core::{StorageConfig, TraceRecord, TraceStorage, VariableRecord};
pub use jsonl::{JsonlConfig, JsonlTraceStorage, OfflineRecords, OfflineTraces};
pub use memory::{MemoryConfig, MemoryTraceStorage};
