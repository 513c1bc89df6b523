use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::MetricsSink;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
}

/// One tracked unit of work (a run, a step or an agent invocation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub status: ExecutionStatus,
    /// Start metadata, merged with end metadata once the unit finishes.
    pub metadata: Value,
}

/// Totals across every tracked unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSummary {
    pub total: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_duration_ms: u64,
}

/// In-memory [`MetricsSink`] that tracks start/end notifications.
pub struct ExecutionMonitor {
    records: Arc<RwLock<HashMap<String, ExecutionRecord>>>,
}

impl ExecutionMonitor {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// All records, oldest first.
    pub async fn snapshot(&self) -> Vec<ExecutionRecord> {
        let records = self.records.read().await;
        let mut all: Vec<ExecutionRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub async fn get(&self, id: &str) -> Option<ExecutionRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn running_count(&self) -> usize {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.status == ExecutionStatus::Running)
            .count()
    }

    pub async fn summary(&self) -> MonitorSummary {
        let records = self.records.read().await;
        let mut summary = MonitorSummary {
            total: records.len(),
            ..MonitorSummary::default()
        };
        for record in records.values() {
            match record.status {
                ExecutionStatus::Running => summary.running += 1,
                ExecutionStatus::Succeeded => summary.succeeded += 1,
                ExecutionStatus::Failed => summary.failed += 1,
            }
            summary.total_duration_ms += record.duration_ms.unwrap_or(0);
        }
        summary
    }

    /// Serialize the current state as JSON.
    pub async fn to_json(&self) -> Value {
        let records = self.snapshot().await;
        let summary = self.summary().await;
        serde_json::json!({
            "executions": records,
            "summary": summary,
        })
    }
}

impl Default for ExecutionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsSink for ExecutionMonitor {
    async fn start(&self, id: &str, metadata: Value) {
        let mut records = self.records.write().await;
        records.insert(
            id.to_string(),
            ExecutionRecord {
                id: id.to_string(),
                started_at: Utc::now(),
                ended_at: None,
                duration_ms: None,
                status: ExecutionStatus::Running,
                metadata,
            },
        );
    }

    async fn end(&self, id: &str, metadata: Value) {
        let now = Utc::now();
        let success = metadata
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let mut records = self.records.write().await;
        let record = records
            .entry(id.to_string())
            .or_insert_with(|| ExecutionRecord {
                id: id.to_string(),
                started_at: now,
                ended_at: None,
                duration_ms: None,
                status: ExecutionStatus::Running,
                metadata: Value::Object(serde_json::Map::new()),
            });

        record.ended_at = Some(now);
        record.duration_ms = Some((now - record.started_at).num_milliseconds().max(0) as u64);
        record.status = if success {
            ExecutionStatus::Succeeded
        } else {
            ExecutionStatus::Failed
        };
        match (&mut record.metadata, metadata) {
            (Value::Object(existing), Value::Object(extra)) => existing.extend(extra),
            (slot, extra) => *slot = extra,
        }
    }
}
