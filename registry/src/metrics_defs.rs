//! Metrics definitions for the register client.

use shared::metrics_defs::{MetricDef, MetricType};

pub const TOKEN_GRANTS: MetricDef = MetricDef {
    name: "identity.token_grants",
    metric_type: MetricType::Counter,
    description: "Token requests sent to the identity provider, tagged by grant and outcome",
};

pub const REGISTRY_LOOKUPS: MetricDef = MetricDef {
    name: "registry.lookups",
    metric_type: MetricType::Counter,
    description: "Completed register lookups, tagged by outcome",
};

pub const REGISTRY_RETRIES: MetricDef = MetricDef {
    name: "registry.retries",
    metric_type: MetricType::Counter,
    description: "Register requests retried after a transient or rate-limited response",
};

pub const REGISTRY_LOOKUP_DURATION: MetricDef = MetricDef {
    name: "registry.lookup.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a register lookup including retries, in seconds",
};

pub const LIMITER_WAIT: MetricDef = MetricDef {
    name: "registry.limiter.wait",
    metric_type: MetricType::Histogram,
    description: "Time a call waited for the rate limiter before starting, in seconds",
};

pub const ALL_METRICS: &[MetricDef] = &[
    TOKEN_GRANTS,
    REGISTRY_LOOKUPS,
    REGISTRY_RETRIES,
    REGISTRY_LOOKUP_DURATION,
    LIMITER_WAIT,
];
