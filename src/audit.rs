use async_trait::async_trait;
use serde_json::Value;

/// key: audit-sink -> collaborator boundary
///
/// Fire-and-forget. Implementations own their failure handling; a broken
/// audit pipeline must never block an engine operation, so `record` cannot
/// return an error.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &str, metadata: Value);
}

/// Default sink: structured log lines only. Hosts that persist audit events
/// substitute their own implementation.
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &str, metadata: Value) {
        tracing::info!(event, %metadata, "engine audit event");
    }
}
