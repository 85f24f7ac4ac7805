//! Structured logging and tracing setup (C12). Grounded on the teacher's
//! OTLP tracer construction in `daemon.rs`, trimmed to this domain's needs:
//! an env-filtered `tracing-subscriber` layer plus an optional OTLP
//! exporter, and — behind the `metrics` feature — a small Prometheus
//! registry of job-queue and LLM-call counters instead of the teacher's
//! much larger `spacebot_*` surface.

use crate::config::TelemetryConfig;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Holds the OTLP tracer provider alive for the process lifetime; dropping
/// it flushes any buffered spans.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                eprintln!("failed to shut down tracer provider: {err}");
            }
        }
    }
}

pub fn init(config: &TelemetryConfig) -> anyhow::Result<TelemetryGuard> {
    let env_filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "supportbot.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (
                Some(tracing_subscriber::fmt::layer().with_writer(non_blocking).json()),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true);

    let tracer_provider = match &config.otlp_endpoint {
        Some(endpoint) => Some(build_otlp_tracer(endpoint)?),
        None => None,
    };

    let otel_layer = tracer_provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer("supportbot")));

    Registry::default()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(TelemetryGuard { tracer_provider, _file_guard: file_guard })
}

fn build_otlp_tracer(endpoint: &str) -> anyhow::Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .build())
}

/// Job-queue and LLM-call counters, registered lazily behind the `metrics`
/// feature. Mirrors the teacher's `LazyLock<Metrics>` singleton shape at a
/// much smaller scope.
#[cfg(feature = "metrics")]
pub mod metrics {
    use prometheus::{IntCounterVec, Opts, Registry};
    use std::sync::LazyLock;

    pub struct Metrics {
        pub jobs_enqueued: IntCounterVec,
        pub jobs_completed: IntCounterVec,
        pub jobs_failed: IntCounterVec,
        pub llm_calls: IntCounterVec,
        pub registry: Registry,
    }

    pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

    impl Metrics {
        fn new() -> Self {
            let registry = Registry::new();

            let jobs_enqueued = IntCounterVec::new(
                Opts::new("supportbot_jobs_enqueued_total", "Jobs enqueued by kind"),
                &["kind"],
            )
            .expect("valid metric");
            let jobs_completed = IntCounterVec::new(
                Opts::new("supportbot_jobs_completed_total", "Jobs completed by kind"),
                &["kind"],
            )
            .expect("valid metric");
            let jobs_failed = IntCounterVec::new(
                Opts::new("supportbot_jobs_failed_total", "Jobs failed by kind"),
                &["kind"],
            )
            .expect("valid metric");
            let llm_calls = IntCounterVec::new(
                Opts::new("supportbot_llm_calls_total", "LLM gateway calls by task"),
                &["task"],
            )
            .expect("valid metric");

            registry.register(Box::new(jobs_enqueued.clone())).expect("register metric");
            registry.register(Box::new(jobs_completed.clone())).expect("register metric");
            registry.register(Box::new(jobs_failed.clone())).expect("register metric");
            registry.register(Box::new(llm_calls.clone())).expect("register metric");

            Self { jobs_enqueued, jobs_completed, jobs_failed, llm_calls, registry }
        }
    }
}
