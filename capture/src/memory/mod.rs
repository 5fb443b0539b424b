//! In-memory source, sink and checkpoint store for driving captures
//! without external systems.

pub mod checkpoint;
pub mod database;
pub mod sink;

pub use checkpoint::MemoryCheckpointStore;
pub use database::MemoryDatabase;
pub use sink::MemorySink;
