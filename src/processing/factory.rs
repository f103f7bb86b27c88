//! # Processor Factory
//!
//! Builds [`ItemProcessor`] implementations by tier and caches one instance
//! per `(scope, tier)` pair. A missing scope is its own cache key (`None`).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::processor::ItemProcessor;
use crate::models::JobMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorTier {
    Fast,
    #[default]
    Standard,
    Thorough,
}

impl ProcessorTier {
    pub const METADATA_KEY: &'static str = "tier";

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Standard => "standard",
            Self::Thorough => "thorough",
        }
    }

    /// Tier requested by job metadata, falling back to the default
    pub fn from_metadata(metadata: &JobMetadata) -> Self {
        metadata
            .param(Self::METADATA_KEY)
            .and_then(|tier| tier.parse().ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for ProcessorTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessorTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "standard" => Ok(Self::Standard),
            "thorough" => Ok(Self::Thorough),
            other => Err(format!("unknown processor tier: {other}")),
        }
    }
}

type Builder = dyn Fn(Option<&str>, ProcessorTier) -> Arc<dyn ItemProcessor> + Send + Sync;

pub struct ProcessorFactory {
    builder: Box<Builder>,
    cache: RwLock<HashMap<(Option<String>, ProcessorTier), Arc<dyn ItemProcessor>>>,
}

impl fmt::Debug for ProcessorFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorFactory").finish_non_exhaustive()
    }
}

impl ProcessorFactory {
    pub fn new<B>(builder: B) -> Self
    where
        B: Fn(Option<&str>, ProcessorTier) -> Arc<dyn ItemProcessor> + Send + Sync + 'static,
    {
        Self {
            builder: Box::new(builder),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// One processor for every scope and tier
    pub fn single(processor: Arc<dyn ItemProcessor>) -> Self {
        Self::new(move |_, _| Arc::clone(&processor))
    }

    pub async fn processor(&self, scope: Option<&str>, tier: ProcessorTier) -> Arc<dyn ItemProcessor> {
        let key = (scope.map(str::to_string), tier);

        {
            let cache = self.cache.read().await;
            if let Some(processor) = cache.get(&key) {
                return Arc::clone(processor);
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(processor) = cache.get(&key) {
            return Arc::clone(processor);
        }

        let processor = (self.builder)(scope, tier);
        debug!(
            scope = ?scope,
            tier = %tier,
            processor = processor.name(),
            "Built item processor"
        );
        cache.insert(key, Arc::clone(&processor));
        processor
    }

    /// Processor for a job, keyed by its scope and requested tier
    pub async fn for_job(&self, metadata: &JobMetadata) -> Arc<dyn ItemProcessor> {
        let scope = metadata.scope_id();
        self.processor(scope.as_deref(), ProcessorTier::from_metadata(metadata))
            .await
    }

    pub async fn cached(&self) -> usize {
        self.cache.read().await.len()
    }
}
