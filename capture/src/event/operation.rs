use crate::error::CaptureError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize, Clone, Copy)]
pub enum Operation {
    #[serde(rename = "c")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "c",
            Operation::Update => "u",
            Operation::Delete => "d",
        }
    }
}

impl FromStr for Operation {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "c" | "insert" => Ok(Operation::Insert),
            "u" | "update" => Ok(Operation::Update),
            "d" | "delete" => Ok(Operation::Delete),
            _ => Err(CaptureError::InvalidConfig(format!(
                "Unknown operation: {}",
                s
            ))),
        }
    }
}
