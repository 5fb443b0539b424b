use crate::checkpoint::Checkpoint;
use crate::error::CaptureResult;
use async_trait::async_trait;

/// Durable home of the capture's checkpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> CaptureResult<Option<Checkpoint>>;

    async fn save(&self, checkpoint: &Checkpoint) -> CaptureResult<()>;
}
