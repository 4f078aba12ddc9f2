//! OpenTelemetry integration for bucketfs.
//!
//! Provides the OTel tracing layer and a sampler with differentiated rates
//! by span category. Everything except [`otel_enabled`] needs the
//! `telemetry` feature.
//!
//! # Activation
//!
//! OTel export activates when standard OTel environment variables are set:
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 bucketfs-server --local-root /srv/bucket
//! ```
//!
//! Set `OTEL_SDK_DISABLED=true` to explicitly disable even when the endpoint is set.

#[cfg(feature = "telemetry")]
mod otel;

#[cfg(feature = "telemetry")]
pub use otel::{OtelGuard, otel_layer};

/// Check whether OTel export should be enabled.
///
/// Returns `true` when standard OTel env vars indicate export is desired:
/// - `OTEL_SDK_DISABLED` is NOT set to `"true"`
/// - AND at least one of:
///   - `OTEL_EXPORTER_OTLP_ENDPOINT` is set
///   - `OTEL_TRACES_EXPORTER` is set (and not `"none"`)
pub fn otel_enabled() -> bool {
    let var = |name: &str| std::env::var(name).ok();
    enabled_from(
        var("OTEL_SDK_DISABLED").as_deref(),
        var("OTEL_EXPORTER_OTLP_ENDPOINT").as_deref(),
        var("OTEL_TRACES_EXPORTER").as_deref(),
    )
}

fn enabled_from(disabled: Option<&str>, endpoint: Option<&str>, exporter: Option<&str>) -> bool {
    // Explicit disable takes priority
    if disabled.is_some_and(|v| v.eq_ignore_ascii_case("true")) {
        return false;
    }
    if endpoint.is_some() {
        return true;
    }
    exporter.is_some_and(|e| !e.eq_ignore_ascii_case("none"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_from_env() {
        assert!(!enabled_from(None, None, None));
        assert!(enabled_from(None, Some("http://localhost:4317"), None));
        assert!(!enabled_from(Some("TRUE"), Some("http://localhost:4317"), None));
        assert!(enabled_from(None, None, Some("otlp")));
        assert!(!enabled_from(None, None, Some("none")));
    }
}
