use async_trait::async_trait;

/// Receives start/end notifications for runs, steps and agent invocations.
///
/// `id` is unique per tracked unit (for example `"<execution_id>:<step_id>"`).
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// A unit of work started.
    async fn start(&self, id: &str, metadata: serde_json::Value);

    /// A unit of work finished. `metadata` carries at least `success`.
    async fn end(&self, id: &str, metadata: serde_json::Value);
}

/// A sink that discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

#[async_trait]
impl MetricsSink for NoopMetrics {
    async fn start(&self, _id: &str, _metadata: serde_json::Value) {}

    async fn end(&self, _id: &str, _metadata: serde_json::Value) {}
}
