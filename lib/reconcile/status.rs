use std::fmt;

use crate::record::Collection;
use crate::store::HighWaterMarks;

/// High-water marks of one collection on both sides, fixed for the length of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    pub source_max_id: i64,
    pub target_max_id: i64,
}

impl SyncStatus {
    pub const EMPTY: SyncStatus = SyncStatus {
        source_max_id: -1,
        target_max_id: -1,
    };

    pub fn new(source_max_id: i64, target_max_id: i64) -> Self {
        Self {
            source_max_id,
            target_max_id,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "source_max_id={} target_max_id={}",
            self.source_max_id, self.target_max_id
        )
    }
}

/// Snapshot of both stores taken once at the top of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleStatus {
    pub source: HighWaterMarks,
    pub target: HighWaterMarks,
}

impl CycleStatus {
    pub fn new(source: HighWaterMarks, target: HighWaterMarks) -> Self {
        Self { source, target }
    }

    pub fn for_collection(&self, collection: Collection) -> SyncStatus {
        SyncStatus::new(self.source.get(collection), self.target.get(collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collections_read_their_own_marks() {
        let status = CycleStatus::new(
            HighWaterMarks {
                user: 30,
                feature_model_0330: 900,
            },
            HighWaterMarks {
                user: 12,
                feature_model_0330: -1,
            },
        );
        assert_eq!(status.for_collection(Collection::User), SyncStatus::new(30, 12));
        assert_eq!(
            status.for_collection(Collection::FeatureModel0330),
            SyncStatus::new(900, -1)
        );
    }
}
