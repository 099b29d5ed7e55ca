use std::fmt;

use thiserror::Error;

use super::report::Pass;
use crate::record::Collection;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Source => "source",
            Side::Target => "target",
        })
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("reading sync status from the {side} store failed")]
    Status {
        side: Side,
        #[source]
        source: StoreError,
    },

    #[error("{pass} pass of {collection} failed on the {side} store")]
    Pass {
        collection: Collection,
        pass: Pass,
        side: Side,
        #[source]
        source: StoreError,
    },
}

impl EngineError {
    pub fn store_error(&self) -> &StoreError {
        match self {
            EngineError::Status { source, .. } | EngineError::Pass { source, .. } => source,
        }
    }
}
