//metrics.rs
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, HistogramOpts,
    IntCounter, IntCounterVec, Opts,
};

lazy_static! {
    // Admission
    pub static ref CANDIDATES_SUBMITTED: IntCounter = register_int_counter!(Opts::new(
        "candidates_submitted_total",
        "Total number of notification candidates submitted"
    ))
    .unwrap();

    pub static ref CANDIDATES_REJECTED: IntCounterVec = register_int_counter_vec!(
        Opts::new("candidates_rejected_total", "Candidates dropped at admission"),
        &["reason"]
    )
    .unwrap();

    pub static ref ENTRIES_ADMITTED: IntCounterVec = register_int_counter_vec!(
        Opts::new("entries_admitted_total", "Entries created by admitted candidates"),
        &["lane"]
    )
    .unwrap();

    // Delivery
    pub static ref NOTIFICATIONS_SENT: IntCounter = register_int_counter!(Opts::new(
        "notifications_sent_total",
        "Total number of pushes accepted by a transport"
    ))
    .unwrap();

    pub static ref DELIVERY_FAILURES: IntCounterVec = register_int_counter_vec!(
        Opts::new("delivery_failures_total", "Failed push attempts"),
        &["class"]
    )
    .unwrap();

    pub static ref RETRIES_SCHEDULED: IntCounter = register_int_counter!(Opts::new(
        "retries_scheduled_total",
        "Entries rescheduled after a failed attempt"
    ))
    .unwrap();

    pub static ref ENTRIES_FAILED: IntCounter = register_int_counter!(Opts::new(
        "entries_failed_total",
        "Entries that reached the failed state"
    ))
    .unwrap();

    pub static ref ENTRIES_CANCELLED: IntCounter = register_int_counter!(Opts::new(
        "entries_cancelled_total",
        "Entries cancelled before delivery"
    ))
    .unwrap();

    // Timing
    pub static ref BATCH_SIZE: Histogram = register_histogram!(
        HistogramOpts::new(
            "batch_size",
            "Number of entries merged into one push"
        )
        .buckets(vec![1.0, 2.0, 5.0, 10.0, 15.0, 20.0, 25.0, 50.0])
    )
    .unwrap();

    pub static ref TICK_DURATION: Histogram = register_histogram!(
        HistogramOpts::new(
            "tick_duration_seconds",
            "Time taken by one processing tick"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    )
    .unwrap();

    pub static ref SEND_LATENCY: Histogram = register_histogram!(
        HistogramOpts::new(
            "send_latency_seconds",
            "Latency of a single push send"
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0])
    )
    .unwrap();
}

pub fn metrics_handler() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return format!("Error encoding metrics: {}", e);
    }

    match String::from_utf8(buffer) {
        Ok(metrics) => metrics,
        Err(e) => format!("Error converting metrics to string: {}", e),
    }
}
