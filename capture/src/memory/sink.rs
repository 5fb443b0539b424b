use crate::error::{CaptureError, CaptureResult};
use crate::event::event::ChangeEvent;
use crate::sink::Sink;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Inner {
    batches: Vec<Vec<ChangeEvent>>,
    failures: u32,
    unavailable: bool,
}

/// Records every delivered batch.
#[derive(Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_next(&self, count: u32) {
        self.inner().failures = count;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner().unavailable = unavailable;
    }

    pub fn batches(&self) -> Vec<Vec<ChangeEvent>> {
        self.inner().batches.clone()
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.inner().batches.iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn deliver(&self, batch: &[ChangeEvent]) -> CaptureResult<()> {
        let mut inner = self.inner();
        if inner.unavailable {
            return Err(CaptureError::Transient("sink unreachable".into()));
        }
        if inner.failures > 0 {
            inner.failures -= 1;
            return Err(CaptureError::Transient("sink busy".into()));
        }
        inner.batches.push(batch.to_vec());
        Ok(())
    }
}
