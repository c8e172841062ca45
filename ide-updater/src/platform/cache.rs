use crate::error::UpdaterError;
use crate::platform::model::UpdatesInfo;
use crate::platform::parser::parse_updates_info;
use async_trait::async_trait;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(60 * 60);

/// Where the raw update metadata document comes from.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch_metadata(&self, url: &Url) -> Result<String, UpdaterError>;
}

#[derive(Debug)]
struct CacheEntry {
    info: Arc<UpdatesInfo>,
    source_url: Url,
    expires_at: Instant,
}

/// Caches the parsed metadata document of one source URL for a fixed time.
#[derive(Clone)]
pub struct MetadataCache {
    source: Arc<dyn MetadataSource>,
    ttl: Duration,
    entry: Arc<Mutex<Option<CacheEntry>>>,
}

impl MetadataCache {
    pub fn new(source: Arc<dyn MetadataSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entry: Arc::new(Mutex::new(None)),
        }
    }

    /// Get the metadata published at `url`, fetching it if the cached copy is
    /// missing, stale or from a different URL.
    #[tracing::instrument(skip(self, cancel), fields(url = url.as_str()))]
    pub async fn get(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<Arc<UpdatesInfo>, UpdaterError> {
        let mut entry = self.entry.lock().await;

        if let Some(cached) = entry.as_ref() {
            if cached.source_url == *url && Instant::now() < cached.expires_at {
                tracing::trace!("Using cached update metadata");
                return Ok(cached.info.clone());
            }
        }

        let xml = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpdaterError::Cancelled),
            result = self.source.fetch_metadata(url) => result?,
        };

        let info = Arc::new(parse_updates_info(&xml)?);
        tracing::debug!("Fetched update metadata with {} products", info.products.len());

        let expires_at = Instant::now() + self.ttl;
        *entry = Some(CacheEntry {
            info: info.clone(),
            source_url: url.clone(),
            expires_at,
        });
        drop(entry);

        self.schedule_invalidation(url.clone(), expires_at);

        Ok(info)
    }

    fn schedule_invalidation(&self, url: Url, expires_at: Instant) {
        let entry = Arc::clone(&self.entry);

        tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;

            // A fetch holding the lock will replace the entry anyway.
            let Ok(mut guard) = entry.try_lock() else {
                tracing::trace!("Skipping metadata invalidation, cache is busy");
                return;
            };

            if guard
                .as_ref()
                .is_some_and(|cached| cached.source_url == url && Instant::now() >= cached.expires_at)
            {
                tracing::trace!("Invalidating cached update metadata for {}", url);
                *guard = None;
            }
        });
    }
}
