//! Prometheus metrics for the engine
//!
//! Collectors register into the default registry on first use.
//! `encode_metrics()` renders them in the text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec, CounterVec,
    Encoder, Gauge, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Routing & turns
    // ─────────────────────────────────────────────────────────────────────────────

    /// Routing decisions.
    ///
    /// Labels:
    /// - path: "chat" or "agent"
    /// - trigger: "prefix", "keyword" or "none"
    pub static ref ROUTE_DECISIONS: CounterVec = register_counter_vec!(
        "localagent_route_decisions_total",
        "Routing decisions by path and trigger",
        &["path", "trigger"]
    ).expect("failed to register ROUTE_DECISIONS metric");

    /// Completed agent turns by how they ended.
    pub static ref TURNS_TOTAL: CounterVec = register_counter_vec!(
        "localagent_turns_total",
        "Agent turns by completion reason",
        &["reason"]
    ).expect("failed to register TURNS_TOTAL metric");

    /// Latency of one model call, from request to last streamed segment.
    pub static ref MODEL_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "localagent_model_call_duration_seconds",
        "Model call latency",
        &["model"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register MODEL_CALL_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────────

    /// Code blocks handled, by language and final status.
    pub static ref BLOCKS_TOTAL: CounterVec = register_counter_vec!(
        "localagent_blocks_total",
        "Code blocks by language and status",
        &["language", "status"]
    ).expect("failed to register BLOCKS_TOTAL metric");

    pub static ref EXECUTION_DURATION: Histogram = register_histogram!(
        "localagent_execution_duration_seconds",
        "Wall time of one code block",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
    ).expect("failed to register EXECUTION_DURATION metric");

    /// Safety gate verdicts, by mode and verdict.
    pub static ref SAFETY_VERDICTS: CounterVec = register_counter_vec!(
        "localagent_safety_verdicts_total",
        "Safety gate verdicts",
        &["mode", "verdict"]
    ).expect("failed to register SAFETY_VERDICTS metric");

    /// Runtime start attempts by language and result ("ok" / "error").
    pub static ref SESSION_STARTS: CounterVec = register_counter_vec!(
        "localagent_session_starts_total",
        "Runtime start attempts",
        &["language", "result"]
    ).expect("failed to register SESSION_STARTS metric");

    /// Sessions currently held by the registry.
    pub static ref LIVE_SESSIONS: Gauge = register_gauge!(
        "localagent_live_sessions",
        "Execution sessions currently alive"
    ).expect("failed to register LIVE_SESSIONS metric");

    /// Execution outputs cut down to the output budget.
    pub static ref OUTPUT_TRUNCATIONS: CounterVec = register_counter_vec!(
        "localagent_output_truncations_total",
        "Execution outputs truncated by the output governor",
        &["language"]
    ).expect("failed to register OUTPUT_TRUNCATIONS metric");
}

/// Render every registered metric in the Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_touched_metrics() {
        ROUTE_DECISIONS.with_label_values(&["chat", "none"]).inc();
        let text = encode_metrics().unwrap();
        assert!(text.contains("localagent_route_decisions_total"));
    }
}
