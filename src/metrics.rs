//! Prometheus metrics for sessions, runs and transports.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec,
    TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────────────

    /// Sessions currently held by the registry.
    pub static ref SESSIONS_ACTIVE: Gauge = register_gauge!(
        "sandbox_sessions_active",
        "Number of live notebook sessions"
    ).expect("failed to register SESSIONS_ACTIVE metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Runs
    // ─────────────────────────────────────────────────────────────────────────────

    /// Completed kernel exchanges.
    ///
    /// Labels:
    /// - mode: "rich" or "plain"
    /// - status: "success", "error" or "input_required"
    pub static ref RUNS_TOTAL: CounterVec = register_counter_vec!(
        "sandbox_runs_total",
        "Cell runs by execution mode and outcome",
        &["mode", "status"]
    ).expect("failed to register RUNS_TOTAL metric");

    /// Wall time of one kernel exchange, including waiting for the session lock.
    pub static ref RUN_DURATION: Histogram = register_histogram!(
        "sandbox_run_duration_seconds",
        "Cell run duration in seconds",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]
    ).expect("failed to register RUN_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // VMs and transports
    // ─────────────────────────────────────────────────────────────────────────────

    /// Time to provision a VM, by backend.
    pub static ref VM_CREATE_DURATION: HistogramVec = register_histogram_vec!(
        "sandbox_vm_create_duration_seconds",
        "VM provisioning time in seconds",
        &["backend"],
        vec![0.005, 0.05, 0.25, 1.0, 2.5, 5.0, 10.0, 20.0]
    ).expect("failed to register VM_CREATE_DURATION metric");

    /// Commands that got no answer within the transport timeout.
    pub static ref TRANSPORT_TIMEOUTS: Counter = register_counter!(
        "sandbox_transport_timeouts_total",
        "Agent commands that timed out"
    ).expect("failed to register TRANSPORT_TIMEOUTS metric");
}

/// Render every registered metric in the Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
