//! OTel internals: tracing layer and sampling.

use opentelemetry::trace::{
    Link, SamplingDecision, SamplingResult, SpanKind, TraceContextExt, TraceId, TraceState,
    TracerProvider as _,
};
use opentelemetry::{Context, KeyValue, global};
use opentelemetry_otlp::SpanExporter;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracer, SdkTracerProvider, ShouldSample, SpanLimits};
use tracing_opentelemetry::OpenTelemetryLayer;

/// Guard that shuts down the OTel tracer provider on drop, flushing pending spans.
pub struct OtelGuard {
    provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("OTel shutdown error: {e}");
        }
    }
}

/// Build an OpenTelemetry tracing layer and guard.
///
/// Must be called inside a Tokio runtime: the batch exporter spawns onto it.
/// The guard must be held for the lifetime of the process so spans are
/// flushed on exit.
pub fn otel_layer<S>(
    service_name: &str,
) -> Result<(OpenTelemetryLayer<S, SdkTracer>, OtelGuard), Box<dyn std::error::Error + Send + Sync>>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let exporter = SpanExporter::builder().with_tonic().build()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(BucketfsSampler)
        .with_resource(resource)
        .with_span_limits(SpanLimits::default())
        .build();

    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer("bucketfs");
    let layer = tracing_opentelemetry::layer().with_tracer(tracer);

    Ok((layer, OtelGuard { provider }))
}

// ============================================================================
// BucketfsSampler: differentiated sampling by span category
// ============================================================================

/// Sampling rate for a span name.
///
/// | Prefix      | Rate | Spans                                   |
/// |-------------|------|-----------------------------------------|
/// | `worker.*`  | 100% | Worker sessions, one per open path      |
/// | `remote.*`  | 100% | Object-store calls                      |
/// | `route.*`   | 10%  | Every socket request                    |
/// | other       | 10%  | Default for unclassified spans          |
fn sample_rate(name: &str) -> f64 {
    if name.starts_with("worker") || name.starts_with("remote") {
        1.0
    } else {
        0.1
    }
}

/// Custom sampler with differentiated rates by span name prefix.
///
/// Sampled parents and error spans are always kept.
#[derive(Debug, Clone)]
struct BucketfsSampler;

impl ShouldSample for BucketfsSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        // If parent is sampled, always sample (maintain trace continuity)
        if let Some(cx) = parent_context {
            let parent_span = cx.span();
            let parent_ctx = parent_span.span_context();
            if parent_ctx.is_sampled() {
                return SamplingResult {
                    decision: SamplingDecision::RecordAndSample,
                    attributes: vec![],
                    trace_state: parent_ctx.trace_state().clone(),
                };
            }
        }

        let is_error = attributes.iter().any(|kv| {
            (kv.key.as_str() == "otel.status_code" && kv.value.as_str() == "ERROR")
                || (kv.key.as_str() == "error" && kv.value.as_str() == "true")
        });
        if is_error {
            return SamplingResult {
                decision: SamplingDecision::RecordAndSample,
                attributes: vec![],
                trace_state: TraceState::default(),
            };
        }

        // Delegate to trace-id ratio sampler for deterministic decisions
        Sampler::TraceIdRatioBased(sample_rate(name)).should_sample(
            parent_context,
            trace_id,
            name,
            span_kind,
            attributes,
            links,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rates() {
        assert_eq!(sample_rate("worker.session"), 1.0);
        assert_eq!(sample_rate("remote.call"), 1.0);
        assert_eq!(sample_rate("route.execute"), 0.1);
        assert_eq!(sample_rate("misc"), 0.1);
    }

    #[test]
    fn test_errors_always_sampled() {
        let result = BucketfsSampler.should_sample(
            None,
            TraceId::from_bytes([0xff; 16]),
            "route.execute",
            &SpanKind::Internal,
            &[KeyValue::new("error", "true")],
            &[],
        );
        assert!(matches!(result.decision, SamplingDecision::RecordAndSample));
    }
}
