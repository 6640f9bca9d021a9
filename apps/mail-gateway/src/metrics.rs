use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use shell_bridge::{ExecutionResult, PoolStats};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static COMMAND_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("shell_commands_total", "Commands executed, by final outcome"),
        &["infrastructure", "outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static COMMAND_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("shell_command_attempts_total", "Attempts made, retries included"),
        &["infrastructure"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static COMMAND_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    let h = HistogramVec::new(
        HistogramOpts::new(
            "shell_command_latency_ms",
            "End-to-end command latency in milliseconds, acquire and retries included",
        )
        .buckets(vec![
            5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 15000.0, 60000.0,
        ]),
        &["infrastructure"],
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

pub static POOL_SESSIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new("shell_pool_sessions", "Pooled sessions by state"),
        &["infrastructure", "state"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static LOGIN_RESULTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("gateway_logins_total", "Login attempts by result"),
        &["result"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SESSION_EXPIRY_REWRITES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "gateway_session_expiry_rewrites_total",
        "Server-error responses rewritten to 401 because they carried the session-invalid marker",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn record_execution(result: &ExecutionResult) {
    let infrastructure = result.infrastructure_id.as_deref().unwrap_or("unresolved");
    let outcome = match &result.outcome {
        Ok(_) => "success",
        Err(err) => err.code(),
    };
    COMMAND_OUTCOMES
        .with_label_values(&[infrastructure, outcome])
        .inc();
    COMMAND_ATTEMPTS
        .with_label_values(&[infrastructure])
        .inc_by(u64::from(result.attempts));
    COMMAND_LATENCY_MS
        .with_label_values(&[infrastructure])
        .observe(result.elapsed.as_secs_f64() * 1000.0);
}

pub fn refresh_pool_gauges(stats: &[PoolStats]) {
    for pool in stats {
        for (state, value) in [
            ("idle", pool.idle),
            ("in_use", pool.in_use),
            ("creating", pool.creating),
        ] {
            POOL_SESSIONS
                .with_label_values(&[pool.infrastructure_id.as_str(), state])
                .set(i64::try_from(value).unwrap_or(i64::MAX));
        }
    }
}

pub fn export_prometheus() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
