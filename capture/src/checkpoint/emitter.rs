use crate::checkpoint::store::CheckpointStore;
use crate::checkpoint::{Checkpoint, TableBackfillState};
use crate::config::RetryConfig;
use crate::error::{CaptureError, CaptureResult};
use crate::event::table_id::TableId;
use crate::position::LogPosition;
use crate::retry::{retry, retry_if};
use log::{debug, error};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Persists checkpoints after the batches they describe were delivered.
pub struct CheckpointEmitter {
    store: Arc<dyn CheckpointStore>,
    retry: RetryConfig,
    committed: Checkpoint,
}

impl CheckpointEmitter {
    pub fn new(store: Arc<dyn CheckpointStore>, retry: RetryConfig) -> Self {
        CheckpointEmitter {
            store,
            retry,
            committed: Checkpoint::default(),
        }
    }

    /// Loads the stored checkpoint, or an empty one for a first run.
    pub async fn load(&mut self) -> CaptureResult<Checkpoint> {
        let store = &self.store;
        let loaded = retry(&self.retry, "loading checkpoint", || store.load()).await?;
        self.committed = loaded.unwrap_or_default();
        Ok(self.committed.clone())
    }

    pub async fn commit(
        &mut self,
        log_position: Option<LogPosition>,
        per_table: BTreeMap<TableId, TableBackfillState>,
    ) -> CaptureResult<()> {
        let checkpoint = Checkpoint {
            log_position,
            per_table,
        };
        if checkpoint == self.committed {
            return Ok(());
        }
        let store = &self.store;
        let pending = &checkpoint;
        retry_if(&self.retry, "saving checkpoint", |_| true, || store.save(pending))
            .await
            .map_err(|failure| {
                error!("Checkpoint store unavailable: {}", failure.error);
                CaptureError::CheckpointStoreUnavailable {
                    attempts: failure.attempts,
                    last_error: failure.error.to_string(),
                }
            })?;
        match &checkpoint.log_position {
            Some(position) => debug!("Committed checkpoint at {}", position),
            None => debug!("Committed checkpoint"),
        }
        self.committed = checkpoint;
        Ok(())
    }

    pub fn committed(&self) -> &Checkpoint {
        &self.committed
    }
}
