//! Logging setup.
//!
//! Diagnostics go to stderr so `--format json` output on stdout stays clean.
//! `TRUNKLINE_LOG` takes an `EnvFilter` directive (default `warn`) and
//! `TRUNKLINE_LOG_FORMAT=json` switches to one JSON object per line. With the
//! `otel` feature and `OTEL_EXPORTER_OTLP_ENDPOINT` set, spans and log events
//! are also exported over OTLP/HTTP.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const FILTER_VAR: &str = "TRUNKLINE_LOG";
const FORMAT_VAR: &str = "TRUNKLINE_LOG_FORMAT";
const DEFAULT_FILTER: &str = "warn";

/// Flushes exporters when dropped. Keep it alive for the whole command.
#[must_use]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    otel: Option<otel::Providers>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(providers) = self.otel.take() {
            providers.shutdown();
        }
    }
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(FILTER_VAR).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn json_requested() -> bool {
    std::env::var(FORMAT_VAR).is_ok_and(|v| v.eq_ignore_ascii_case("json"))
}

/// Install the global subscriber. A second call is a no-op.
pub fn init() -> TelemetryGuard {
    let console = if json_requested() {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed()
    };
    let registry = tracing_subscriber::registry().with(filter()).with(console);

    #[cfg(feature = "otel")]
    {
        let providers = otel::Providers::from_env();
        let layers = providers.as_ref().map(otel::Providers::layers);
        if registry.with(layers).try_init().is_err() {
            return TelemetryGuard { otel: None };
        }
        TelemetryGuard { otel: providers }
    }

    #[cfg(not(feature = "otel"))]
    {
        let _ = registry.try_init();
        TelemetryGuard {}
    }
}

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::logs::SdkLoggerProvider;
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use tracing_subscriber::Layer;
    use tracing_subscriber::registry::LookupSpan;

    const ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
    const SERVICE: &str = "trunkline";

    pub struct Providers {
        tracer: SdkTracerProvider,
        logger: SdkLoggerProvider,
    }

    impl Providers {
        /// Build exporters when an OTLP endpoint is configured. The exporters
        /// read the endpoint and headers from the standard OTEL_* variables.
        pub fn from_env() -> Option<Self> {
            std::env::var_os(ENDPOINT_VAR)?;
            let resource = Resource::builder().with_service_name(SERVICE).build();

            let spans = match opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .build()
            {
                Ok(exporter) => exporter,
                Err(e) => {
                    eprintln!("warning: OTLP span export disabled: {e}");
                    return None;
                }
            };
            let logs = match opentelemetry_otlp::LogExporter::builder()
                .with_http()
                .build()
            {
                Ok(exporter) => exporter,
                Err(e) => {
                    eprintln!("warning: OTLP log export disabled: {e}");
                    return None;
                }
            };

            let tracer = SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build();
            let logger = SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(resource)
                .build();
            Some(Self { tracer, logger })
        }

        pub fn layers<S>(&self) -> Box<dyn Layer<S> + Send + Sync + 'static>
        where
            S: tracing::Subscriber + for<'a> LookupSpan<'a> + Send + Sync,
        {
            let spans = tracing_opentelemetry::layer().with_tracer(self.tracer.tracer(SERVICE));
            let logs = OpenTelemetryTracingBridge::new(&self.logger);
            spans.and_then(logs).boxed()
        }

        pub fn shutdown(self) {
            if let Err(e) = self.tracer.shutdown() {
                eprintln!("warning: flushing spans failed: {e}");
            }
            if let Err(e) = self.logger.shutdown() {
                eprintln!("warning: flushing logs failed: {e}");
            }
        }
    }
}
