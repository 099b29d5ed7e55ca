//! Reconciliation engine: converges the target toward the source one bounded page at a
//! time, using only id-ordered range queries and the high-water marks captured at the top
//! of each cycle.
//!
//! Each collection runs four passes in order:
//!
//! * forward insert over `(target_max, source_max]`
//! * miss insert over `(-1, source_max]`
//! * delete over `(-1, target_max]`
//! * update over `(-1, source_max]`
//!
//! Passes and writes run strictly one after another. Any store error aborts the cycle; the
//! next cycle re-derives every difference from scratch.

pub mod error;
pub mod ranges;
pub mod report;
pub mod status;

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::record::{first_difference, Collection, Record};
use crate::server::monitoring::{inc_collection, RECONCILE_METRICS};
use crate::store::{
    clamp_limit, DeleteOutcome, IdRange, Scope, SourceStore, StoreError, TargetStore,
    MAX_PAGE_LIMIT,
};

pub use error::{EngineError, Side};
pub use report::{CollectionReport, CycleReport, Pass, PassReport};
pub use status::{CycleStatus, SyncStatus};

use ranges::{covered_bound, window};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Rows requested per range query; clamped to `1..=MAX_PAGE_LIMIT`.
    pub page_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_limit: MAX_PAGE_LIMIT,
        }
    }
}

pub struct ReconciliationEngine<S, T> {
    source: S,
    target: T,
    scope: Scope,
    page_limit: usize,
}

/// Wraps a store error with the pass and side it came from.
fn on(collection: Collection, pass: Pass, side: Side) -> impl FnOnce(StoreError) -> EngineError {
    move |source| EngineError::Pass {
        collection,
        pass,
        side,
        source,
    }
}

fn ids_of(rows: &[Record]) -> Vec<i64> {
    rows.iter().filter_map(Record::id).collect()
}

impl<S, T> ReconciliationEngine<S, T>
where
    S: SourceStore,
    T: TargetStore,
{
    pub fn new(source: S, target: T, scope: Scope, config: EngineConfig) -> Self {
        Self {
            source,
            target,
            scope,
            page_limit: clamp_limit(config.page_limit),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// Reads both stores' high-water marks. Called once per cycle before any pass runs.
    pub async fn capture_status(&self) -> Result<CycleStatus, EngineError> {
        let source = self
            .source
            .get_sync_status(&self.scope)
            .await
            .map_err(|source| EngineError::Status {
                side: Side::Source,
                source,
            })?;
        let target = self
            .target
            .get_sync_status(&self.scope)
            .await
            .map_err(|source| EngineError::Status {
                side: Side::Target,
                source,
            })?;
        Ok(CycleStatus::new(source, target))
    }

    /// One full cycle: status snapshot, then every pass of `user` followed by every pass of
    /// `feature_model_0330`.
    pub async fn run_cycle(&self) -> Result<CycleReport, EngineError> {
        let status = self.capture_status().await?;
        let mut report = CycleReport::default();
        for collection in Collection::ALL {
            let collection_status = status.for_collection(collection);
            report
                .collections
                .push(self.reconcile(collection, collection_status).await?);
        }
        Ok(report)
    }

    pub async fn reconcile(
        &self,
        collection: Collection,
        status: SyncStatus,
    ) -> Result<CollectionReport, EngineError> {
        info!(
            event = "collection_reconcile_started",
            collection = %collection,
            scope = %self.scope,
            source_max_id = status.source_max_id,
            target_max_id = status.target_max_id,
            "reconciling collection"
        );
        if let Some(metrics) = RECONCILE_METRICS.get() {
            metrics
                .source_max_id
                .get_or_create(&collection.into())
                .set(status.source_max_id);
            metrics
                .target_max_id
                .get_or_create(&collection.into())
                .set(status.target_max_id);
        }

        let mut report = CollectionReport::new(collection, status);
        for pass in Pass::ALL {
            report
                .passes
                .push(self.run_pass(collection, pass, status).await?);
        }

        info!(
            event = "collection_reconcile_finished",
            collection = %collection,
            inserted = report.inserted(),
            updated = report.updated(),
            deleted = report.deleted(),
            skipped = report.skipped(),
            "collection reconciled"
        );
        Ok(report)
    }

    pub async fn run_pass(
        &self,
        collection: Collection,
        pass: Pass,
        status: SyncStatus,
    ) -> Result<PassReport, EngineError> {
        let range = match pass {
            Pass::ForwardInsert => IdRange::new(status.target_max_id, status.source_max_id),
            Pass::MissInsert | Pass::Update => IdRange::new(-1, status.source_max_id),
            Pass::Delete => IdRange::new(-1, status.target_max_id),
        };
        debug!(
            event = "pass_started",
            collection = %collection,
            pass = %pass,
            window = %range,
        );

        let report = match pass {
            Pass::ForwardInsert => self.forward_insert(collection, range).await,
            Pass::MissInsert => self.miss_insert(collection, range).await,
            Pass::Delete => self.delete_extra(collection, range).await,
            Pass::Update => self.update_changed(collection, range).await,
        }?;

        info!(
            event = "pass_finished",
            collection = %collection,
            pass = %pass,
            pages = report.pages,
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            skipped = report.skipped,
            cursor = report.cursor,
            "pass finished"
        );
        Ok(report)
    }

    /// Copies the source rows above the target's high-water mark.
    pub async fn forward_insert(
        &self,
        collection: Collection,
        range: IdRange,
    ) -> Result<PassReport, EngineError> {
        let pass = Pass::ForwardInsert;
        let mut report = PassReport::new(pass, range.begin_id);

        while let Some(page) = window(report.cursor, range.end_id) {
            let rows = self
                .source
                .query_row_range(collection, &self.scope, page, self.page_limit)
                .await
                .map_err(on(collection, pass, Side::Source))?;
            if rows.is_empty() {
                break;
            }
            report.pages += 1;

            let bound = covered_bound(page, &ids_of(&rows), self.page_limit);
            for row in &rows {
                if row.id().is_some_and(|id| id <= bound) {
                    self.insert(collection, pass, row).await?;
                    report.inserted += 1;
                }
            }
            if !self.advance(&mut report, bound, collection) {
                break;
            }
        }
        Ok(report)
    }

    /// Inserts source rows whose ids the target lacks anywhere in `range`.
    pub async fn miss_insert(
        &self,
        collection: Collection,
        range: IdRange,
    ) -> Result<PassReport, EngineError> {
        let pass = Pass::MissInsert;
        let mut report = PassReport::new(pass, range.begin_id);

        while let Some(page) = window(report.cursor, range.end_id) {
            let rows = self
                .source
                .query_row_range(collection, &self.scope, page, self.page_limit)
                .await
                .map_err(on(collection, pass, Side::Source))?;
            if rows.is_empty() {
                break;
            }
            let target_ids = self
                .target
                .query_id_range(collection, &self.scope, page, self.page_limit)
                .await
                .map_err(on(collection, pass, Side::Target))?;
            report.pages += 1;

            let bound = covered_bound(page, &ids_of(&rows), self.page_limit)
                .min(covered_bound(page, &target_ids, self.page_limit));
            let present: HashSet<i64> = target_ids.into_iter().collect();
            for row in &rows {
                let Some(id) = row.id() else { continue };
                if id <= bound && !present.contains(&id) {
                    self.insert(collection, pass, row).await?;
                    report.inserted += 1;
                }
            }
            if !self.advance(&mut report, bound, collection) {
                break;
            }
        }
        Ok(report)
    }

    /// Deletes target ids the source no longer has.
    pub async fn delete_extra(
        &self,
        collection: Collection,
        range: IdRange,
    ) -> Result<PassReport, EngineError> {
        let pass = Pass::Delete;
        let mut report = PassReport::new(pass, range.begin_id);

        while let Some(page) = window(report.cursor, range.end_id) {
            let target_ids = self
                .target
                .query_id_range(collection, &self.scope, page, self.page_limit)
                .await
                .map_err(on(collection, pass, Side::Target))?;
            if target_ids.is_empty() {
                break;
            }
            let source_ids = self
                .source
                .query_id_range(collection, &self.scope, page, self.page_limit)
                .await
                .map_err(on(collection, pass, Side::Source))?;
            report.pages += 1;

            let bound = covered_bound(page, &target_ids, self.page_limit)
                .min(covered_bound(page, &source_ids, self.page_limit));
            let present: HashSet<i64> = source_ids.into_iter().collect();
            for &id in &target_ids {
                if id > bound || present.contains(&id) {
                    continue;
                }
                match self
                    .target
                    .delete_by_id(collection, id)
                    .await
                    .map_err(on(collection, pass, Side::Target))?
                {
                    DeleteOutcome::Deleted(_) => {
                        report.deleted += 1;
                        debug!(event = "row_deleted", collection = %collection, id);
                        if let Some(metrics) = RECONCILE_METRICS.get() {
                            inc_collection(&metrics.deleted_total, collection);
                        }
                    }
                    DeleteOutcome::DependencyExists => {
                        report.skipped += 1;
                        warn!(
                            event = "delete_skipped",
                            collection = %collection,
                            id,
                            "target still references this row; leaving it in place"
                        );
                        if let Some(metrics) = RECONCILE_METRICS.get() {
                            inc_collection(&metrics.delete_skipped_total, collection);
                        }
                    }
                }
            }
            if !self.advance(&mut report, bound, collection) {
                break;
            }
        }
        Ok(report)
    }

    /// Rewrites target rows that drifted from the source, as judged by the collection's
    /// update policy.
    pub async fn update_changed(
        &self,
        collection: Collection,
        range: IdRange,
    ) -> Result<PassReport, EngineError> {
        let pass = Pass::Update;
        let mut report = PassReport::new(pass, range.begin_id);

        while let Some(page) = window(report.cursor, range.end_id) {
            // Marker collections only need `id` and the marker from the target.
            let target_rows = match collection.revision_marker() {
                Some(_) => {
                    self.target
                        .query_revision_range(collection, &self.scope, page, self.page_limit)
                }
                None => self
                    .target
                    .query_row_range(collection, &self.scope, page, self.page_limit),
            }
            .await
            .map_err(on(collection, pass, Side::Target))?;
            if target_rows.is_empty() {
                break;
            }
            let source_rows = self
                .source
                .query_row_range(collection, &self.scope, page, self.page_limit)
                .await
                .map_err(on(collection, pass, Side::Source))?;
            report.pages += 1;

            let bound = covered_bound(page, &ids_of(&target_rows), self.page_limit)
                .min(covered_bound(page, &ids_of(&source_rows), self.page_limit));
            let source_by_id: HashMap<i64, &Record> = source_rows
                .iter()
                .filter_map(|row| row.id().map(|id| (id, row)))
                .collect();

            for target_row in &target_rows {
                let Some(id) = target_row.id() else { continue };
                if id > bound {
                    break;
                }
                let Some(source_row) = source_by_id.get(&id) else {
                    continue;
                };
                let Some(field) = first_difference(collection, source_row, target_row) else {
                    continue;
                };
                self.target
                    .update(collection, source_row)
                    .await
                    .map_err(on(collection, pass, Side::Target))?;
                report.updated += 1;
                debug!(event = "row_updated", collection = %collection, id, field);
                if let Some(metrics) = RECONCILE_METRICS.get() {
                    inc_collection(&metrics.updated_total, collection);
                }
            }
            if !self.advance(&mut report, bound, collection) {
                break;
            }
        }
        Ok(report)
    }

    async fn insert(&self, collection: Collection, pass: Pass, row: &Record) -> Result<(), EngineError> {
        self.target
            .insert(collection, row)
            .await
            .map_err(on(collection, pass, Side::Target))?;
        debug!(
            event = "row_inserted",
            collection = %collection,
            pass = %pass,
            id = row.id().unwrap_or_default(),
        );
        if let Some(metrics) = RECONCILE_METRICS.get() {
            inc_collection(&metrics.inserted_total, collection);
        }
        Ok(())
    }

    /// Moves the cursor to `bound`. Returns false when that would not move it forward,
    /// which only happens if a store answered with ids outside the requested window.
    fn advance(&self, report: &mut PassReport, bound: i64, collection: Collection) -> bool {
        if bound <= report.cursor {
            warn!(
                event = "cursor_stalled",
                collection = %collection,
                pass = %report.pass,
                cursor = report.cursor,
                bound,
                "page did not move the cursor; ending pass"
            );
            return false;
        }
        report.cursor = bound;
        true
    }
}
