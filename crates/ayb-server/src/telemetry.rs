//! Logging and trace-export bootstrap.
//!
//! Console logging via `tracing-subscriber` is always on. Span export is
//! opt-in: it requires an OTLP collector endpoint in the environment and a
//! non-zero `AYB_OTEL_SAMPLING_RATE`. The guard owns the tracer provider so
//! buffered spans are flushed — and flush failures logged — before the
//! process exits.

use std::env;

use anyhow::Result;
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_sdk::{
    propagation::TraceContextPropagator, runtime::Tokio, trace as sdktrace, Resource,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_SAMPLING_RATE: f64 = 1.0;

pub struct TelemetryGuard {
    provider: Option<sdktrace::TracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let Some(provider) = self.provider.take() else {
            return;
        };
        for result in provider.force_flush() {
            if let Err(error) = result {
                warn!(%error, "failed to flush buffered spans on shutdown");
            }
        }
        global::shutdown_tracer_provider();
    }
}

pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (sampling_rate, deferred_note) =
        read_sampling_rate(env::var("AYB_OTEL_SAMPLING_RATE").ok().as_deref());

    let console = tracing_subscriber::registry().with(filter).with(fmt::layer());

    let mut guard = TelemetryGuard { provider: None };
    match build_tracer(service_name, sampling_rate) {
        Ok(Some((provider, tracer))) => {
            console
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
            guard.provider = Some(provider);
        }
        Ok(None) => console.init(),
        Err(error) => {
            console.init();
            warn!(%error, "OTLP exporter unavailable; continuing with console logs only");
        }
    }

    // The note was produced before any subscriber existed; surface it now.
    if let Some(note) = deferred_note {
        warn!("{note}");
    }
    info!(
        sampling_rate,
        span_export = guard.provider.is_some(),
        "telemetry ready"
    );
    Ok(guard)
}

/// Stands up the OTLP span pipeline. Returns `None` when export is off:
/// sampling rate zero, or no collector endpoint configured.
fn build_tracer(
    service_name: &str,
    sampling_rate: f64,
) -> Result<Option<(sdktrace::TracerProvider, sdktrace::Tracer)>> {
    if sampling_rate <= 0.0 {
        return Ok(None);
    }
    if env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_err()
        && env::var("OTEL_EXPORTER_OTLP_TRACES_ENDPOINT").is_err()
    {
        return Ok(None);
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    let mut attributes = vec![KeyValue::new("service.name", service_name.to_owned())];
    if let Ok(environment) = env::var("AYB_ENV") {
        if !environment.is_empty() {
            attributes.push(KeyValue::new("deployment.environment", environment));
        }
    }

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .build_span_exporter()?;
    let provider = sdktrace::TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            sdktrace::Config::default()
                .with_sampler(sdktrace::Sampler::TraceIdRatioBased(sampling_rate))
                .with_resource(Resource::new(attributes)),
        )
        .build();
    let tracer = provider.tracer(service_name.to_owned());
    global::set_tracer_provider(provider.clone());

    Ok(Some((provider, tracer)))
}

/// Parses `AYB_OTEL_SAMPLING_RATE`, clamping into `0.0..=1.0`. The second
/// element is a warning to emit once logging is up, since this runs before
/// the subscriber is installed.
fn read_sampling_rate(raw: Option<&str>) -> (f64, Option<String>) {
    let Some(raw) = raw else {
        return (DEFAULT_SAMPLING_RATE, None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (
            DEFAULT_SAMPLING_RATE,
            Some("AYB_OTEL_SAMPLING_RATE is set but empty; sampling everything".to_owned()),
        );
    }
    let Ok(parsed) = trimmed.parse::<f64>() else {
        return (
            DEFAULT_SAMPLING_RATE,
            Some(format!(
                "ignoring unparsable AYB_OTEL_SAMPLING_RATE \"{trimmed}\"; sampling everything"
            )),
        );
    };
    let clamped = parsed.clamp(0.0, 1.0);
    if (clamped - parsed).abs() > f64::EPSILON {
        return (
            clamped,
            Some(format!(
                "AYB_OTEL_SAMPLING_RATE {parsed} clamped to {clamped}"
            )),
        );
    }
    (clamped, None)
}

#[cfg(test)]
mod tests {
    use super::read_sampling_rate;

    #[test]
    fn absent_means_sample_everything() {
        assert_eq!(read_sampling_rate(None), (1.0, None));
    }

    #[test]
    fn in_range_values_pass_through() {
        assert_eq!(read_sampling_rate(Some("0.5")), (0.5, None));
        assert_eq!(read_sampling_rate(Some("0")), (0.0, None));
        assert_eq!(read_sampling_rate(Some("1")), (1.0, None));
    }

    #[test]
    fn out_of_range_values_clamp_with_a_note() {
        let (rate, note) = read_sampling_rate(Some("2.5"));
        assert_eq!(rate, 1.0);
        assert!(note.unwrap().contains("clamped"));

        let (rate, note) = read_sampling_rate(Some("-0.5"));
        assert_eq!(rate, 0.0);
        assert!(note.is_some());
    }

    #[test]
    fn garbage_and_empty_fall_back_noisily() {
        let (rate, note) = read_sampling_rate(Some("fast"));
        assert_eq!(rate, 1.0);
        assert!(note.unwrap().contains("unparsable"));

        let (rate, note) = read_sampling_rate(Some("  "));
        assert_eq!(rate, 1.0);
        assert!(note.unwrap().contains("empty"));
    }
}
