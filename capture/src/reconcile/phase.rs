use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SequencerPhase {
    Idle,
    Initializing,
    /// Backfills running while the log is tailed.
    Backfilling,
    /// Log tailing only.
    Streaming,
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_phase_strings() {
        assert_eq!(SequencerPhase::Backfilling.to_string(), "backfilling");
        assert_eq!(
            SequencerPhase::from_str("streaming").unwrap(),
            SequencerPhase::Streaming
        );
        assert_eq!(
            serde_json::to_string(&SequencerPhase::Stopped).unwrap(),
            "\"stopped\""
        );
    }
}
