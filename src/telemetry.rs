//! Request lifecycle hooks.
//!
//! The pipeline calls a [`Telemetry`] implementation when a request starts,
//! when it finishes with a response, and when it fails before producing one.
//! Delivery (metrics, traces, logs) belongs to the implementation.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;

use crate::error::NormalizedError;
use crate::rate_limit::RateLimitInfo;

/// What the hooks are told about a request.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub exchange: String,
    pub method: Method,
    pub path: String,
    /// HTTP status, when a response arrived
    pub status: Option<u16>,
    /// Time since the request entered the pipeline
    pub duration: Duration,
    /// Quota snapshot parsed from the response headers
    pub rate_limit: Option<Arc<RateLimitInfo>>,
}

impl RequestEvent {
    pub fn new(exchange: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            method,
            path: path.into(),
            status: None,
            duration: Duration::ZERO,
            rate_limit: None,
        }
    }
}

/// Request lifecycle hooks. All methods default to doing nothing.
pub trait Telemetry: Send + Sync {
    fn on_start(&self, _event: &RequestEvent) {}

    /// A response was received, successful or not.
    fn on_stop(&self, _event: &RequestEvent, _error: Option<&NormalizedError>) {}

    /// No response: circuit open, signing failure, transport failure.
    fn on_exception(&self, _event: &RequestEvent, _error: &NormalizedError) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {}

/// Emits `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn on_start(&self, event: &RequestEvent) {
        tracing::debug!(
            exchange = %event.exchange,
            method = %event.method,
            path = %event.path,
            "request start"
        );
    }

    fn on_stop(&self, event: &RequestEvent, error: Option<&NormalizedError>) {
        let remaining = event.rate_limit.as_ref().and_then(|info| info.remaining);
        match error {
            None => tracing::debug!(
                exchange = %event.exchange,
                method = %event.method,
                path = %event.path,
                status = event.status,
                duration_ms = event.duration.as_millis() as u64,
                remaining,
                "request complete"
            ),
            Some(error) => tracing::info!(
                exchange = %event.exchange,
                method = %event.method,
                path = %event.path,
                status = event.status,
                duration_ms = event.duration.as_millis() as u64,
                remaining,
                kind = %error.kind,
                code = error.code.as_deref(),
                "request rejected"
            ),
        }
    }

    fn on_exception(&self, event: &RequestEvent, error: &NormalizedError) {
        tracing::warn!(
            exchange = %event.exchange,
            method = %event.method,
            path = %event.path,
            duration_ms = event.duration.as_millis() as u64,
            kind = %error.kind,
            "request failed"
        );
    }
}
