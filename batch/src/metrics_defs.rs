//! Metrics definitions for batch jobs.

use shared::metrics_defs::{MetricDef, MetricType};

pub const JOBS_CREATED: MetricDef = MetricDef {
    name: "jobs.created",
    metric_type: MetricType::Counter,
    description: "Number of batch jobs accepted",
};

pub const JOBS_FINISHED: MetricDef = MetricDef {
    name: "jobs.finished",
    metric_type: MetricType::Counter,
    description: "Number of batch jobs whose rows have all completed",
};

pub const ROWS_PROCESSED: MetricDef = MetricDef {
    name: "jobs.rows",
    metric_type: MetricType::Counter,
    description: "Rows completed, tagged by outcome",
};

pub const JOB_ROWS: MetricDef = MetricDef {
    name: "jobs.size",
    metric_type: MetricType::Histogram,
    description: "Number of rows in each accepted job",
};

pub const ROW_DURATION: MetricDef = MetricDef {
    name: "jobs.row.duration",
    metric_type: MetricType::Histogram,
    description: "Seconds from row scheduling to completion, including limiter wait",
};

pub const ALL_METRICS: &[MetricDef] = &[
    JOBS_CREATED,
    JOBS_FINISHED,
    ROWS_PROCESSED,
    JOB_ROWS,
    ROW_DURATION,
];
