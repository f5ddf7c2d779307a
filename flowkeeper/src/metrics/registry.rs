//! Global metrics registry and collector definitions.
//!
//! Every counter the pipeline maintains lives here. Scraping is left to the
//! embedding process; `flowkeeper` itself only registers and updates them.

use std::sync::Mutex;

use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry,
};

static REGISTERED: Mutex<bool> = Mutex::new(false);

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Channel Subsystem
    // ============================================================================

    pub static ref CHANNEL_CAPACITY: IntGaugeVec = IntGaugeVec::new(
        Opts::new("capacity", "Capacity of the bounded queues between pipeline stages")
            .namespace("flowkeeper")
            .subsystem("channel"),
        &["channel"]  // ingest, dedup, export
    ).expect("failed to create channel_capacity metric");

    /// Labels: channel, status = "success" | "backpressure" | "closed"
    pub static ref CHANNEL_SENDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sends_total", "Total number of non-blocking sends to pipeline queues")
            .namespace("flowkeeper")
            .subsystem("channel"),
        &["channel", "status"]
    ).expect("failed to create channel_sends_total metric");

    // ============================================================================
    // Flow Subsystem
    // ============================================================================

    /// Labels: status = "received" | "accepted" | "filtered" | "sampled_out" | "direction_mismatch" | "unknown_interface" | "decode_error"
    pub static ref FLOW_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("events_total", "Total number of raw events seen at pipeline ingest")
            .namespace("flowkeeper")
            .subsystem("flow"),
        &["status"]
    ).expect("failed to create flow_events_total metric");

    pub static ref PROCESSING_LATENCY_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("processing_latency_seconds", "Processing latency by pipeline stage")
            .namespace("flowkeeper")
            .subsystem("flow")
            .buckets(vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        &["stage"]  // cache_sweep, dedup_sweep, export
    ).expect("failed to create processing_latency_seconds metric");

    // ============================================================================
    // Dedup Subsystem
    // ============================================================================

    /// Labels: result = "new" | "owner" | "merged" | "marked" | "dropped" | "passthrough"
    pub static ref DEDUP_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("events_total", "Total number of events classified by the deduplicator")
            .namespace("flowkeeper")
            .subsystem("dedup"),
        &["result"]
    ).expect("failed to create dedup_events_total metric");

    pub static ref DEDUP_ENTRIES: IntGauge = IntGauge::with_opts(
        Opts::new("entries", "Current number of tracked flow owners")
            .namespace("flowkeeper")
            .subsystem("dedup")
    ).expect("failed to create dedup_entries metric");

    pub static ref DEDUP_EXPIRED_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("expired_total", "Total number of flow owners forgotten after inactivity")
            .namespace("flowkeeper")
            .subsystem("dedup")
    ).expect("failed to create dedup_expired_total metric");

    // ============================================================================
    // Cache Subsystem
    // ============================================================================

    pub static ref CACHE_FLOWS: IntGauge = IntGauge::with_opts(
        Opts::new("flows", "Current number of flows held by the accounting cache")
            .namespace("flowkeeper")
            .subsystem("cache")
    ).expect("failed to create cache_flows metric");

    /// Labels: reason = "capacity" | "timeout" | "shutdown"
    pub static ref CACHE_EVICTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("evictions_total", "Total number of flows evicted from the accounting cache")
            .namespace("flowkeeper")
            .subsystem("cache"),
        &["reason"]
    ).expect("failed to create cache_evictions_total metric");

    pub static ref CACHE_SHRINKS_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("shrinks_total", "Total number of forced table capacity reclamations")
            .namespace("flowkeeper")
            .subsystem("cache")
    ).expect("failed to create cache_shrinks_total metric");

    // ============================================================================
    // Export Subsystem
    // ============================================================================

    /// Labels: exporter, status = "ok" | "error" | "async_error"
    pub static ref EXPORT_RECORDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("records_total", "Total number of flow records handed to the exporter")
            .namespace("flowkeeper")
            .subsystem("export"),
        &["exporter", "status"]
    ).expect("failed to create export_records_total metric");

    pub static ref EXPORT_BATCH_SIZE: Histogram = Histogram::with_opts(
        HistogramOpts::new("batch_size", "Number of flow records per export batch")
            .namespace("flowkeeper")
            .subsystem("export")
            .buckets(vec![1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 10000.0])
    ).expect("failed to create export_batch_size metric");

    // ============================================================================
    // Interface Subsystem
    // ============================================================================

    /// Labels: event = "added" | "removed"
    pub static ref IFACE_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("events_total", "Total number of interface lifecycle events")
            .namespace("flowkeeper")
            .subsystem("interface"),
        &["event"]
    ).expect("failed to create interface_events_total metric");

    /// Labels: operation = "attach" | "detach", status = "ok" | "error"
    pub static ref IFACE_CAPTURE_OPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("capture_ops_total", "Total number of capture attach and detach operations")
            .namespace("flowkeeper")
            .subsystem("interface"),
        &["operation", "status"]
    ).expect("failed to create interface_capture_ops_total metric");

    pub static ref IFACE_ATTACHED: IntGauge = IntGauge::with_opts(
        Opts::new("attached", "Current number of interfaces with capture attached")
            .namespace("flowkeeper")
            .subsystem("interface")
    ).expect("failed to create interface_attached metric");

    // ============================================================================
    // Taskmanager Subsystem
    // ============================================================================

    /// Labels: status = "spawned" | "completed" | "cancelled" | "panicked"
    pub static ref TASKMANAGER_TASKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tasks_total", "Total tasks handled by the task manager")
            .namespace("flowkeeper")
            .subsystem("taskmanager"),
        &["status"]
    ).expect("failed to create taskmanager_tasks_total metric");

    pub static ref TASKS_ACTIVE_BY_NAME: IntGaugeVec = IntGaugeVec::new(
        Opts::new("tasks_active", "Current number of running tasks by task name")
            .namespace("flowkeeper")
            .subsystem("taskmanager"),
        &["task_name"]
    ).expect("failed to create taskmanager_tasks_active metric");

    pub static ref SHUTDOWN_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("shutdown_duration_seconds", "Duration of shutdown operations")
            .namespace("flowkeeper")
            .subsystem("taskmanager")
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0])
    ).expect("failed to create shutdown_duration metric");

    pub static ref SHUTDOWN_TIMEOUTS_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("shutdown_timeouts_total", "Total number of shutdown operations that timed out")
            .namespace("flowkeeper")
            .subsystem("taskmanager")
    ).expect("failed to create shutdown_timeouts metric");
}

macro_rules! register {
    ($($metric:expr),+ $(,)?) => {{
        $( REGISTRY.register(Box::new($metric.clone()))?; )+
    }};
}

/// Registers every collector with [`REGISTRY`]. Calling it again is a no-op.
pub fn init_registry() -> Result<(), prometheus::Error> {
    let mut registered = REGISTERED.lock().unwrap_or_else(|e| e.into_inner());
    if *registered {
        return Ok(());
    }

    register!(CHANNEL_CAPACITY, CHANNEL_SENDS_TOTAL);
    register!(FLOW_EVENTS_TOTAL, PROCESSING_LATENCY_SECONDS);
    register!(DEDUP_EVENTS_TOTAL, DEDUP_ENTRIES, DEDUP_EXPIRED_TOTAL);
    register!(CACHE_FLOWS, CACHE_EVICTIONS_TOTAL, CACHE_SHRINKS_TOTAL);
    register!(EXPORT_RECORDS_TOTAL, EXPORT_BATCH_SIZE);
    register!(IFACE_EVENTS_TOTAL, IFACE_CAPTURE_OPS_TOTAL, IFACE_ATTACHED);
    register!(
        TASKMANAGER_TASKS_TOTAL,
        TASKS_ACTIVE_BY_NAME,
        SHUTDOWN_DURATION_SECONDS,
        SHUTDOWN_TIMEOUTS_TOTAL,
    );

    *registered = true;
    Ok(())
}

/// Reads a counter value for one label set. Used for the shutdown summary.
pub fn counter_value(counter: &IntCounterVec, labels: &[&str]) -> u64 {
    counter
        .get_metric_with_label_values(labels)
        .map(|c| c.get())
        .unwrap_or(0)
}
