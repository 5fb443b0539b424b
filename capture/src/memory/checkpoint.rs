use crate::checkpoint::store::CheckpointStore;
use crate::checkpoint::Checkpoint;
use crate::error::{CaptureError, CaptureResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Inner {
    checkpoint: Option<Checkpoint>,
    saves: u64,
    failures: u32,
    unavailable: bool,
}

#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.inner().checkpoint.clone()
    }

    pub fn saves(&self) -> u64 {
        self.inner().saves
    }

    pub fn fail_next(&self, count: u32) {
        self.inner().failures = count;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner().unavailable = unavailable;
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> CaptureResult<Option<Checkpoint>> {
        Ok(self.inner().checkpoint.clone())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> CaptureResult<()> {
        let mut inner = self.inner();
        if inner.unavailable {
            return Err(CaptureError::Transient("checkpoint store unreachable".into()));
        }
        if inner.failures > 0 {
            inner.failures -= 1;
            return Err(CaptureError::Transient("checkpoint store busy".into()));
        }
        inner.checkpoint = Some(checkpoint.clone());
        inner.saves += 1;
        Ok(())
    }
}
