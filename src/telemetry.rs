use opentelemetry::trace::TraceId;
use tracing_subscriber::{prelude::*, EnvFilter, Layer, Registry};

/// Trace id of the current span, when spans are exported
pub fn get_trace_id() -> Option<TraceId> {
    use opentelemetry::trace::TraceContextExt as _;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;

    let id = tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id();
    (id != TraceId::INVALID).then_some(id)
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[cfg(feature = "telemetry")]
fn otlp_layer(endpoint: &str) -> anyhow::Result<BoxedLayer> {
    use anyhow::Context;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::{SpanExporter, WithExportConfig};
    use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .with_context(|| format!("Failed to create OTLP span exporter for {endpoint}"))?;
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(Resource::builder().with_service_name("cloudsap").build())
        .build();
    let tracer = provider.tracer("cloudsap");
    // the global provider keeps the exporter alive
    opentelemetry::global::set_tracer_provider(provider);
    Ok(tracing_opentelemetry::layer().with_tracer(tracer).boxed())
}

#[cfg(not(feature = "telemetry"))]
fn otlp_layer(_endpoint: &str) -> anyhow::Result<BoxedLayer> {
    anyhow::bail!("span export needs a build with the `telemetry` feature")
}

/// Install the global subscriber: compact logs filtered by `RUST_LOG` (or `default_filter`),
/// plus OTLP span export when an endpoint is given.
pub fn init(default_filter: &str, otlp_endpoint: Option<&str>) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or(EnvFilter::try_new(default_filter))?;
    let spans = otlp_endpoint.map(otlp_layer).transpose()?;

    let collector = Registry::default()
        .with(spans)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(env_filter);
    tracing::subscriber::set_global_default(collector)?;
    Ok(())
}
