use crate::build_info;
use crate::record::Collection;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Registers a constant `build_info` gauge carrying the process's build identity as labels.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str, service: &'static str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service,
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    registry.sub_registry_with_prefix(prefix).register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CollectionLabels {
    pub collection: &'static str,
}

impl From<Collection> for CollectionLabels {
    fn from(collection: Collection) -> Self {
        Self {
            collection: collection.name(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CommandLabels {
    pub command: String,
}

/// Client-side reconciliation counters, labelled by collection where it applies.
#[derive(Clone)]
pub struct ReconcileMetrics {
    pub inserted_total: Family<CollectionLabels, Counter>,
    pub updated_total: Family<CollectionLabels, Counter>,
    pub deleted_total: Family<CollectionLabels, Counter>,
    /// Deletes the target refused because a dependent row still exists.
    pub delete_skipped_total: Family<CollectionLabels, Counter>,
    pub source_max_id: Family<CollectionLabels, Gauge>,
    pub target_max_id: Family<CollectionLabels, Gauge>,
    pub cycles_completed_total: Counter,
    pub cycles_failed_total: Counter,
    /// Triggers dropped because a cycle was already running.
    pub cycles_rejected_total: Counter,
    pub last_cycle_duration_ms: Gauge,
}

impl ReconcileMetrics {
    fn init() -> Self {
        Self {
            inserted_total: Family::default(),
            updated_total: Family::default(),
            deleted_total: Family::default(),
            delete_skipped_total: Family::default(),
            source_max_id: Family::default(),
            target_max_id: Family::default(),
            cycles_completed_total: Counter::default(),
            cycles_failed_total: Counter::default(),
            cycles_rejected_total: Counter::default(),
            last_cycle_duration_ms: Gauge::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "inserted",
            "Rows inserted into the target",
            metrics.inserted_total.clone(),
        );
        sub_registry.register(
            "updated",
            "Rows updated on the target",
            metrics.updated_total.clone(),
        );
        sub_registry.register(
            "deleted",
            "Rows deleted from the target",
            metrics.deleted_total.clone(),
        );
        sub_registry.register(
            "delete_skipped",
            "Target deletes skipped because a dependent row still exists",
            metrics.delete_skipped_total.clone(),
        );
        sub_registry.register(
            "source_max_id",
            "Source high-water mark captured at the start of the latest cycle",
            metrics.source_max_id.clone(),
        );
        sub_registry.register(
            "target_max_id",
            "Target high-water mark captured at the start of the latest cycle",
            metrics.target_max_id.clone(),
        );
        sub_registry.register(
            "cycles_completed",
            "Reconciliation cycles that ran every pass",
            metrics.cycles_completed_total.clone(),
        );
        sub_registry.register(
            "cycles_failed",
            "Reconciliation cycles aborted by a store error",
            metrics.cycles_failed_total.clone(),
        );
        sub_registry.register(
            "cycles_rejected",
            "Cycle triggers ignored because a cycle was already running",
            metrics.cycles_rejected_total.clone(),
        );
        sub_registry.register(
            "last_cycle_duration_ms",
            "Wall time of the most recent cycle in milliseconds",
            metrics.last_cycle_duration_ms.clone(),
        );
        metrics
    }
}

/// Bumps one collection's series of a per-collection counter.
pub fn inc_collection(family: &Family<CollectionLabels, Counter>, collection: Collection) {
    family.get_or_create(&collection.into()).inc();
}

pub static RECONCILE_METRICS: OnceCell<ReconcileMetrics> = OnceCell::const_new();

/// Target-side command counters.
#[derive(Clone)]
pub struct ServerMetrics {
    pub commands_served_total: Family<CommandLabels, Counter>,
    pub commands_failed_total: Family<CommandLabels, Counter>,
}

impl ServerMetrics {
    fn init() -> Self {
        Self {
            commands_served_total: Family::default(),
            commands_failed_total: Family::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "commands_served",
            "Commands answered with code 0",
            metrics.commands_served_total.clone(),
        );
        sub_registry.register(
            "commands_failed",
            "Commands answered with a non-zero code",
            metrics.commands_failed_total.clone(),
        );
        metrics
    }
}

pub static SERVER_METRICS: OnceCell<ServerMetrics> = OnceCell::const_new();
