use meshwire_core::{DependencyKind, ObjectKey};
use tracing::error;

use crate::BridgeError;

/// Structured report for a dependency event the bridge could not turn into enqueues.
#[derive(Debug)]
pub struct Diagnostic {
    pub operation: &'static str,
    pub kind: DependencyKind,
    pub dependency: ObjectKey,
    pub error: BridgeError,
}

/// Observability sink for [`Diagnostic`]s. Must not panic or block.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diag: Diagnostic);
}

/// Default sink: one `error` event plus a counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, d: Diagnostic) {
        metrics::counter!("bridge_diagnostics_total", 1u64, "kind" => d.kind.as_str(), "operation" => d.operation);
        error!(
            operation = d.operation,
            kind = %d.kind,
            dependency = %d.dependency,
            error = %d.error,
            "failed to enqueue dependents for dependency event"
        );
    }
}
