use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramVec, register_counter,
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
    register_histogram_vec,
};

lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("platform_ops_requests_total", "Total number of requests").unwrap();
    pub static ref REQUEST_LATENCY: HistogramVec = register_histogram_vec!(
        "platform_ops_request_latency_seconds",
        "Request latency in seconds",
        &["method", "status"]
    )
    .unwrap();
    pub static ref RATE_LIMIT_REJECTIONS: CounterVec = register_counter_vec!(
        "platform_ops_rate_limit_rejections_total",
        "Requests rejected by a rate limiter",
        &["limiter"]
    )
    .unwrap();
    pub static ref RATE_LIMIT_KEYS: GaugeVec = register_gauge_vec!(
        "platform_ops_rate_limit_keys",
        "Keys currently tracked by a rate limiter",
        &["limiter"]
    )
    .unwrap();
    pub static ref DEPLOYMENTS_TOTAL: CounterVec = register_counter_vec!(
        "platform_ops_deployments_total",
        "Finished deployments by environment and outcome",
        &["environment", "status"]
    )
    .unwrap();
    pub static ref DEPLOYMENT_DURATION: Histogram = register_histogram!(
        "platform_ops_deployment_duration_seconds",
        "Wall time from acceptance to terminal state"
    )
    .unwrap();
    pub static ref DEPLOYMENT_ACTIVE: Gauge =
        register_gauge!("platform_ops_deployment_active", "1 while a deployment is running").unwrap();
}
