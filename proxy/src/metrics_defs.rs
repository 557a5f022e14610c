use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Proxy request duration in seconds. Tagged with status, decision.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently being processed",
};

pub const ROUTE_ERRORS: MetricDef = MetricDef {
    name: "route.errors",
    metric_type: MetricType::Counter,
    description: "Requests answered with a routing error. Tagged with kind.",
};

pub const STALE_QUEUE_FROM_SHARD: MetricDef = MetricDef {
    name: "route.stale_queue_from_shard",
    metric_type: MetricType::Counter,
    description: "BAD_EVENT_QUEUE_ID responses returned by shards. Tagged with shard.",
};

pub const BUFFERED_REQUESTS: MetricDef = MetricDef {
    name: "buffer.size",
    metric_type: MetricType::Gauge,
    description: "Requests currently held for a shard. Tagged with shard.",
};

pub const BUFFER_RELEASES: MetricDef = MetricDef {
    name: "buffer.releases",
    metric_type: MetricType::Counter,
    description: "Held requests leaving the buffer. Tagged with shard, reason.",
};

pub const HEALTH_TRANSITIONS: MetricDef = MetricDef {
    name: "health.transitions",
    metric_type: MetricType::Counter,
    description: "Shard liveness changes. Tagged with shard, state.",
};

pub const MIGRATIONS: MetricDef = MetricDef {
    name: "migrations",
    metric_type: MetricType::Counter,
    description: "Finished migrations. Tagged with strategy, outcome.",
};

pub const HANDOFFS: MetricDef = MetricDef {
    name: "handoffs",
    metric_type: MetricType::Counter,
    description: "Restart handoffs. Tagged with side, outcome.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
    ROUTE_ERRORS,
    STALE_QUEUE_FROM_SHARD,
    BUFFERED_REQUESTS,
    BUFFER_RELEASES,
    HEALTH_TRANSITIONS,
    MIGRATIONS,
    HANDOFFS,
];
