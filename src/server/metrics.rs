//! Metrics collection using metrics-rs.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const MEMORY_USAGE_BYTES: &str = "arbor_instances_memory_usage_bytes";
const DATA_REQUESTS_TOTAL: &str = "arbor_data_requests_total";
const CONNECTIONS_TOTAL: &str = "arbor_connections_total";

/// Describe all metrics once at startup. Safe to call repeatedly.
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    describe_gauge!(
        MEMORY_USAGE_BYTES,
        "Bytes of shared memory currently carved into payloads"
    );
    describe_counter!(
        DATA_REQUESTS_TOTAL,
        "Metadata requests served, labelled by operation"
    );
    describe_counter!(CONNECTIONS_TOTAL, "Connections accepted since startup");
}

/// Record the bulk-store footprint after an allocation or free.
#[inline]
pub fn record_memory_usage(instance_id: u64, bytes: usize) {
    gauge!(MEMORY_USAGE_BYTES, "instance" => instance_id.to_string()).set(bytes as f64);
}

/// Count one metadata-plane request.
#[inline]
pub fn record_data_request(operation: &'static str) {
    counter!(DATA_REQUESTS_TOTAL, "operation" => operation).increment(1);
}

/// Count one accepted connection.
#[inline]
pub fn record_connection() {
    counter!(CONNECTIONS_TOTAL).increment(1);
}
