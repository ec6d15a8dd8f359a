use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "signal-relay";
const OTEL_STDOUT_ENV: &str = "SIGNAL_RELAY_OTEL_STDOUT";

pub const CONNECTIONS_TOTAL: &str = "signal_relay_connections_total";
pub const CONNECTIONS_CLOSED_TOTAL: &str = "signal_relay_connections_closed_total";
pub const CONNECTIONS_ACTIVE: &str = "signal_relay_connections_active";
pub const MESSAGES_FORWARDED_TOTAL: &str = "signal_relay_messages_forwarded_total";
pub const BYTES_FORWARDED_TOTAL: &str = "signal_relay_bytes_forwarded_total";
pub const MESSAGE_SIZE_BYTES: &str = "signal_relay_message_size_bytes";
pub const DECODE_FAILURES_TOTAL: &str = "signal_relay_decode_failures_total";
pub const FLOW_CONTROL_DROPS_TOTAL: &str = "signal_relay_flow_control_drops_total";

/// Which entry point is logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// The relay server: info logs, described relay metrics, optional span export.
    Relay,
    /// The `probe` client: only the frames it prints plus warnings.
    Probe,
}

impl Profile {
    /// Filter used when `RUST_LOG` is unset.
    pub fn default_filter(self) -> &'static str {
        match self {
            Profile::Relay => "info",
            Profile::Probe => "warn,signal_relay::probe=info",
        }
    }

    fn exports_spans(self) -> bool {
        self == Profile::Relay && env_truthy(OTEL_STDOUT_ENV)
    }
}

/// Process-wide logging and metrics for the relay binary.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init(profile: Profile) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        if profile == Profile::Relay {
            describe_relay_metrics();
        }

        let tracer_provider = if profile.exports_spans() {
            let provider = stdout_tracer_provider();
            let tracer = provider.tracer(SERVICE_NAME);
            global::set_tracer_provider(provider.clone());
            tracing_subscriber::registry()
                .with(env_filter(profile.default_filter()))
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
            Some(provider)
        } else {
            tracing_subscriber::registry()
                .with(env_filter(profile.default_filter()))
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            None
        };

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

fn describe_relay_metrics() {
    describe_counter!(CONNECTIONS_TOTAL, "Websocket clients accepted");
    describe_counter!(CONNECTIONS_CLOSED_TOTAL, "Websocket clients that went away");
    describe_gauge!(CONNECTIONS_ACTIVE, "Clients currently registered");
    describe_counter!(
        MESSAGES_FORWARDED_TOTAL,
        "Frame deliveries queued to other clients"
    );
    describe_counter!(
        BYTES_FORWARDED_TOTAL,
        Unit::Bytes,
        "Payload bytes queued to other clients"
    );
    describe_histogram!(
        MESSAGE_SIZE_BYTES,
        Unit::Bytes,
        "Size of each forwarded frame"
    );
    describe_counter!(
        DECODE_FAILURES_TOTAL,
        "Frames dropped because they were not signaling envelopes"
    );
    describe_counter!(
        FLOW_CONTROL_DROPS_TOTAL,
        "Frames dropped because a recipient queue was full"
    );
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|value| is_truthy(&value))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::{is_truthy, Profile};

    #[test]
    fn truthy_values() {
        for value in ["1", "true", "TRUE", " yes ", "on"] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["", "0", "false", "off", "nope"] {
            assert!(!is_truthy(value), "{value}");
        }
    }

    #[test]
    fn probe_logs_quieter_than_the_relay() {
        assert_eq!(Profile::Relay.default_filter(), "info");
        assert!(Profile::Probe.default_filter().starts_with("warn"));
        assert!(!Profile::Probe.exports_spans());
    }
}
