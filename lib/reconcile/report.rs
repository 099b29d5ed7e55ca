use std::fmt;

use serde::Serialize;

use super::status::SyncStatus;
use crate::record::Collection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    ForwardInsert,
    MissInsert,
    Delete,
    Update,
}

impl Pass {
    /// Execution order within one collection.
    pub const ALL: [Pass; 4] = [Pass::ForwardInsert, Pass::MissInsert, Pass::Delete, Pass::Update];

    pub fn as_str(self) -> &'static str {
        match self {
            Pass::ForwardInsert => "forward_insert",
            Pass::MissInsert => "miss_insert",
            Pass::Delete => "delete",
            Pass::Update => "update",
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one pass did. `cursor` is where the scan stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub pass: Pass,
    pub pages: usize,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub cursor: i64,
}

impl PassReport {
    pub fn new(pass: Pass, cursor: i64) -> Self {
        Self {
            pass,
            pages: 0,
            inserted: 0,
            updated: 0,
            deleted: 0,
            skipped: 0,
            cursor,
        }
    }

    pub fn writes(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    pub collection: Collection,
    #[serde(skip)]
    pub status: SyncStatus,
    pub passes: Vec<PassReport>,
}

impl CollectionReport {
    pub fn new(collection: Collection, status: SyncStatus) -> Self {
        Self {
            collection,
            status,
            passes: Vec::with_capacity(Pass::ALL.len()),
        }
    }

    pub fn pass(&self, pass: Pass) -> Option<&PassReport> {
        self.passes.iter().find(|report| report.pass == pass)
    }

    pub fn inserted(&self) -> u64 {
        self.passes.iter().map(|p| p.inserted).sum()
    }

    pub fn updated(&self) -> u64 {
        self.passes.iter().map(|p| p.updated).sum()
    }

    pub fn deleted(&self) -> u64 {
        self.passes.iter().map(|p| p.deleted).sum()
    }

    pub fn skipped(&self) -> u64 {
        self.passes.iter().map(|p| p.skipped).sum()
    }

    pub fn writes(&self) -> u64 {
        self.passes.iter().map(PassReport::writes).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub collections: Vec<CollectionReport>,
}

impl CycleReport {
    pub fn collection(&self, collection: Collection) -> Option<&CollectionReport> {
        self.collections.iter().find(|c| c.collection == collection)
    }

    pub fn writes(&self) -> u64 {
        self.collections.iter().map(CollectionReport::writes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_sum_across_passes() {
        let mut report = CollectionReport::new(Collection::User, SyncStatus::new(3, 2));
        report.passes.push(PassReport {
            inserted: 1,
            ..PassReport::new(Pass::ForwardInsert, 3)
        });
        report.passes.push(PassReport {
            updated: 2,
            skipped: 1,
            ..PassReport::new(Pass::Update, 3)
        });
        assert_eq!(report.writes(), 3);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.pass(Pass::Update).map(|p| p.updated), Some(2));
        assert!(report.pass(Pass::Delete).is_none());
    }
}
