use crate::error::CaptureResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub slot_id: String,
    pub token: String,
}

impl Watermark {
    pub fn fresh(slot_id: &str) -> Self {
        Watermark {
            slot_id: slot_id.to_string(),
            token: Uuid::new_v4().to_string(),
        }
    }
}

/// The sentinel table replicated through the source's own change log.
/// One row per slot; every write replaces the slot's token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn write(&self, watermark: &Watermark) -> CaptureResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_tokens_are_unique() {
        let a = Watermark::fresh("slot");
        let b = Watermark::fresh("slot");
        assert_eq!(a.slot_id, "slot");
        assert_ne!(a.token, b.token);
        assert!(Uuid::parse_str(&a.token).is_ok());
    }
}
