pub mod backfill;
pub mod checkpoint;
pub mod config;
pub mod connector;
pub mod error;
pub mod event;
pub mod kafka;
pub mod memory;
pub mod position;
pub mod reader;
pub mod reconcile;
pub mod retry;
pub mod shutdown;
pub mod sink;
pub mod watermark;
