//! Telemetry glue: per-session and per-connection spans, and propagation
//! of trace context through the handshake and every stamped message.
//!
//! Export (where spans actually go — OTLP, stdout, etc.) is out of scope
//! for this crate; it only creates spans and carries `traceparent` values.
//! Call [`init_default_subscriber`] from a binary or test harness, never
//! from library code.

use tracing::Span;
use wire_protocol::TracingContext;

/// Creates the per-session span `river.session.<id>` with
/// `river.session.{id,to,from}` attributes.
pub fn session_span(id: &str, from: &str, to: &str) -> Span {
    tracing::info_span!(
        "river.session",
        "river.session.id" = %id,
        "river.session.from" = %from,
        "river.session.to" = %to,
    )
}

/// Creates the per-connection child span `connection.<id>`.
pub fn connection_span(session_id: &str, connection_id: &str) -> Span {
    tracing::info_span!(
        "connection",
        "connection.id" = %connection_id,
        "river.session.id" = %session_id,
    )
}

/// Extracts a propagation context from the currently active span, if any,
/// for stamping onto an outbound message. This crate does not depend on a
/// concrete OpenTelemetry exporter — the `traceparent` format is carried
/// as an opaque string matching the W3C trace-context shape the spec
/// names, produced by whatever exporter the embedding application wires
/// into its `tracing` subscriber.
pub fn current_trace_context() -> Option<TracingContext> {
    // Span-to-traceparent extraction is an exporter concern (e.g.
    // `tracing-opentelemetry`); this crate has no exporter dependency, so
    // it only defines the carrier shape. Embedders that wire one in
    // override message stamping at the router layer.
    None
}

/// Convenience initializer for example binaries and integration tests —
/// never called by library code itself.
pub fn init_default_subscriber() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
