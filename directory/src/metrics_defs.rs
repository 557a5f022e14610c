//! Metrics definitions for the shard directory.

use shared::metrics_defs::{MetricDef, MetricType};

pub const NEGATIVE_CACHE_HIT: MetricDef = MetricDef {
    name: "directory.negative_cache.hit",
    metric_type: MetricType::Counter,
    description: "Cold misses routed by hash because the store failed recently. Tagged with failure.",
};

pub const NEGATIVE_CACHE_MISS: MetricDef = MetricDef {
    name: "directory.negative_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of cold misses that were not in the negative cache",
};

pub const COLD_MISS: MetricDef = MetricDef {
    name: "directory.cold_miss",
    metric_type: MetricType::Counter,
    description: "Number of realm lookups that went to the store. Tagged with outcome.",
};

pub const STORE_LOAD_DURATION: MetricDef = MetricDef {
    name: "directory.store.load.duration",
    metric_type: MetricType::Histogram,
    description: "Time to load all assignments from the store in seconds",
};

pub const STORE_LOAD_ROWS: MetricDef = MetricDef {
    name: "directory.store.load.rows",
    metric_type: MetricType::Histogram,
    description: "Number of assignments returned by a full load",
};

pub const MIGRATION_TRANSITIONS: MetricDef = MetricDef {
    name: "directory.migration.transitions",
    metric_type: MetricType::Counter,
    description: "Migration phase transitions. Tagged with phase.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    NEGATIVE_CACHE_HIT,
    NEGATIVE_CACHE_MISS,
    COLD_MISS,
    STORE_LOAD_DURATION,
    STORE_LOAD_ROWS,
    MIGRATION_TRANSITIONS,
];
