//! Correlation ids for cross-system debugging.
//!
//! An evaluation records whatever id its provider returns. Absence is
//! normal and never an error.

use std::sync::Arc;

/// Source of an optional correlation id for the current evaluation.
pub trait CorrelationIdProvider: Send + Sync {
    fn correlation_id(&self) -> Option<String>;
}

/// Uses the id of the current `tracing` span, rendered as 32 hex digits.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpanCorrelation;

impl CorrelationIdProvider for SpanCorrelation {
    fn correlation_id(&self) -> Option<String> {
        tracing::Span::current()
            .id()
            .map(|id| format!("{:032x}", id.into_u64()))
    }
}

/// Never produces an id.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCorrelation;

impl CorrelationIdProvider for NoCorrelation {
    fn correlation_id(&self) -> Option<String> {
        None
    }
}

/// Fixed id, for callers that already carry one (e.g. a request id).
#[derive(Debug, Clone)]
pub struct StaticCorrelation(pub String);

impl CorrelationIdProvider for StaticCorrelation {
    fn correlation_id(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

impl<T: CorrelationIdProvider + ?Sized> CorrelationIdProvider for Arc<T> {
    fn correlation_id(&self) -> Option<String> {
        (**self).correlation_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_correlation_without_subscriber_is_none() {
        // No subscriber installed: spans are disabled and carry no id.
        let span = tracing::info_span!("evaluate_case");
        let _guard = span.enter();
        assert!(SpanCorrelation.correlation_id().is_none());
    }

    #[test]
    fn test_static_and_none() {
        assert_eq!(
            StaticCorrelation("req-7".to_string()).correlation_id().as_deref(),
            Some("req-7")
        );
        assert!(NoCorrelation.correlation_id().is_none());
    }
}
