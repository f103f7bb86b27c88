//! Where a scan's work items come from.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::Job;
use crate::processing::WorkItem;

/// Produces the items a scan will process. Called once per scan run.
#[async_trait]
pub trait ItemSource: Send + Sync {
    async fn items(&self, job: &Job) -> Result<Vec<WorkItem>>;
}

/// Fixed item list, mostly useful in tests and one-off runs
#[derive(Debug, Clone, Default)]
pub struct StaticItemSource {
    payloads: Vec<(String, serde_json::Value)>,
}

impl StaticItemSource {
    pub fn new(payloads: Vec<(String, serde_json::Value)>) -> Self {
        Self { payloads }
    }

    /// `count` items with ids `item-0..count`
    pub fn numbered(count: usize) -> Self {
        Self::new(
            (0..count)
                .map(|n| (format!("item-{n}"), serde_json::Value::Null))
                .collect(),
        )
    }
}

#[async_trait]
impl ItemSource for StaticItemSource {
    async fn items(&self, job: &Job) -> Result<Vec<WorkItem>> {
        Ok(self
            .payloads
            .iter()
            .map(|(id, payload)| WorkItem::new(job.id, id.clone(), payload.clone()))
            .collect())
    }
}
