pub mod kafka;
pub mod output;

use crate::error::CaptureResult;
use crate::event::event::ChangeEvent;
use async_trait::async_trait;

/// Destination of the reconciled event stream. A successful `deliver`
/// acknowledges the whole batch; events within a batch are in emission order.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, batch: &[ChangeEvent]) -> CaptureResult<()>;
}
