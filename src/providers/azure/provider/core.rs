use std::sync::Arc;

use log::{info, warn};

use crate::auth::CredentialStore;
use crate::config::Config;
use crate::error::Result;
use crate::insights::ClearCacheResponse;
use crate::providers::azure::cache::{CacheStore, Clock};
use crate::providers::azure::client::pipelines::ProjectListDto;
use crate::providers::azure::client::AzureClient;

pub struct AzureProvider {
    pub client: AzureClient,
    pub cache: CacheStore,
    pub config: Config,
}

impl AzureProvider {
    pub fn new(
        config: Config,
        credentials: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = AzureClient::new(&config, credentials)?;
        let cache = CacheStore::new(clock, config.cache_duration_minutes);

        Ok(Self {
            client,
            cache,
            config,
        })
    }

    pub fn clear_cache(&self) -> ClearCacheResponse {
        self.cache.reset();

        ClearCacheResponse {
            success: true,
            message: "Cache cleared successfully".to_string(),
            timestamp: self.cache.now(),
        }
    }

    /// Projects visible to the credential. Cached until the cache is cleared.
    pub async fn list_projects(&self) -> Option<ProjectListDto> {
        if let Some(projects) = self.cache.get_projects() {
            return Some(projects);
        }

        info!("Fetching project list");
        let Some(projects) = self.client.fetch_projects(&self.config.api_version).await else {
            warn!("Project list unavailable");
            return None;
        };

        self.cache.put_projects(projects.clone());
        Some(projects)
    }
}
