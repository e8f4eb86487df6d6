//! Metric definitions for the proxy.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "Counter",
            MetricType::Gauge => "Gauge",
            MetricType::Histogram => "Histogram",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

pub const UPSTREAM_REQUEST_DURATION: MetricDef = MetricDef {
    name: "upstream.request.duration",
    metric_type: MetricType::Histogram,
    description: "Upstream request duration in seconds. Tagged with status.",
};

pub const REQUESTS_REJECTED: MetricDef = MetricDef {
    name: "requests.rejected",
    metric_type: MetricType::Counter,
    description: "Requests answered 502 because no server could be selected",
};

pub const CONFIG_RELOADS: MetricDef = MetricDef {
    name: "config.reloads",
    metric_type: MetricType::Counter,
    description: "Config reload attempts. Tagged with outcome.",
};

pub const RESERVE_ATTEMPTS: MetricDef = MetricDef {
    name: "reserve.attempts",
    metric_type: MetricType::Histogram,
    description: "Upstream attempts needed to settle one reservation request",
};

pub const ALL_METRICS: &[MetricDef] = &[
    UPSTREAM_REQUEST_DURATION,
    REQUESTS_REJECTED,
    CONFIG_RELOADS,
    RESERVE_ATTEMPTS,
];
