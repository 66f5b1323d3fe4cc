use super::{AgentRun, AgentRunRepository, Feature, FeatureRepository};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryFeatureRepository {
    features: RwLock<BTreeMap<String, Feature>>,
}

impl MemoryFeatureRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn remove(&self, id: &str) -> Option<Feature> {
        self.features.write().await.remove(id)
    }
}

#[async_trait]
impl FeatureRepository for MemoryFeatureRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Feature>> {
        Ok(self.features.read().await.get(id).cloned())
    }

    async fn update(&self, feature: &Feature) -> Result<()> {
        self.features
            .write()
            .await
            .insert(feature.id.clone(), feature.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Feature>> {
        Ok(self.features.read().await.values().cloned().collect())
    }
}

#[derive(Default)]
pub struct MemoryAgentRunRepository {
    runs: RwLock<BTreeMap<String, AgentRun>>,
}

impl MemoryAgentRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn remove(&self, id: &str) -> Option<AgentRun> {
        self.runs.write().await.remove(id)
    }
}

#[async_trait]
impl AgentRunRepository for MemoryAgentRunRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<AgentRun>> {
        Ok(self.runs.read().await.get(id).cloned())
    }

    async fn upsert(&self, run: &AgentRun) -> Result<()> {
        self.runs.write().await.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<AgentRun>> {
        Ok(self.runs.read().await.values().cloned().collect())
    }
}
