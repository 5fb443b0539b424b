use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Display};

/// Opaque cursor into a source change log.
///
/// Positions of the same kind are totally ordered. Positions of different
/// kinds come from different sources and are incomparable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogPosition {
    /// MySQL binlog file, start offset of the event, row ordinal inside it.
    Binlog { file: String, offset: u64, index: u32 },
    Lsn { lsn: u64 },
    Sequence { seq: u64 },
}

impl LogPosition {
    pub fn binlog(file: &str, offset: u64, index: u32) -> Self {
        LogPosition::Binlog {
            file: file.to_string(),
            offset,
            index,
        }
    }

    pub fn lsn(lsn: u64) -> Self {
        LogPosition::Lsn { lsn }
    }

    pub fn sequence(seq: u64) -> Self {
        LogPosition::Sequence { seq }
    }

    /// `Some(true)` if `self` comes strictly after `other` in the same log.
    pub fn is_after(&self, other: &LogPosition) -> Option<bool> {
        self.partial_cmp(other).map(|o| o == Ordering::Greater)
    }
}

impl PartialOrd for LogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (
                LogPosition::Binlog {
                    file: f1,
                    offset: o1,
                    index: i1,
                },
                LogPosition::Binlog {
                    file: f2,
                    offset: o2,
                    index: i2,
                },
            ) => Some((f1, o1, i1).cmp(&(f2, o2, i2))),
            (LogPosition::Lsn { lsn: a }, LogPosition::Lsn { lsn: b }) => Some(a.cmp(b)),
            (LogPosition::Sequence { seq: a }, LogPosition::Sequence { seq: b }) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogPosition::Binlog {
                file,
                offset,
                index,
            } => {
                if *index == 0 {
                    write!(f, "{}:{}", file, offset)
                } else {
                    write!(f, "{}:{}#{}", file, offset, index)
                }
            }
            LogPosition::Lsn { lsn } => write!(f, "{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF),
            LogPosition::Sequence { seq } => write!(f, "#{}", seq),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binlog_ordering() {
        let a = LogPosition::binlog("mysql-bin.000001", 900, 0);
        let b = LogPosition::binlog("mysql-bin.000002", 4, 0);
        let c = LogPosition::binlog("mysql-bin.000002", 4, 1);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(c.is_after(&a), Some(true));
        assert_eq!(a.is_after(&a), Some(false));
    }

    #[test]
    fn test_mixed_kinds_are_incomparable() {
        let a = LogPosition::sequence(5);
        let b = LogPosition::lsn(5);
        assert_eq!(a.partial_cmp(&b), None);
        assert_eq!(a.is_after(&b), None);
        assert!(!(a < b) && !(a > b));
    }

    #[test]
    fn test_display() {
        assert_eq!(LogPosition::lsn(0x1_0000_00AB).to_string(), "1/AB");
        assert_eq!(LogPosition::sequence(42).to_string(), "#42");
        assert_eq!(
            LogPosition::binlog("mysql-bin.000003", 154, 2).to_string(),
            "mysql-bin.000003:154#2"
        );
    }

    #[test]
    fn test_serialized_form() {
        let pos = LogPosition::binlog("mysql-bin.000003", 154, 0);
        assert_eq!(
            serde_json::to_string(&pos).unwrap(),
            r#"{"kind":"binlog","file":"mysql-bin.000003","offset":154,"index":0}"#
        );
        assert_eq!(
            serde_json::to_string(&LogPosition::sequence(9)).unwrap(),
            r#"{"kind":"sequence","seq":9}"#
        );
    }
}
