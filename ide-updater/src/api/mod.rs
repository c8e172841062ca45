mod custom;
mod models;
pub use custom::parse_plugin_list;
use models::*;

use crate::args::UpdaterArgs;
use crate::download::FileDownloader;
use crate::error::UpdaterError;
use crate::platform::build_number::{BuildNumber, BuildRange};
use crate::platform::cache::MetadataSource;
use crate::plugins::installed::PluginId;
use crate::plugins::repository::{
    BrokenPlugins, CompatibleUpdate, PluginRepository, RemotePlugin, RepositoryHost,
};
use async_trait::async_trait;
use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect::Policy;
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use sha2::Digest as _;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// HTTP access to the plugin marketplace, custom plugin repositories and
/// the update metadata document.
#[derive(Debug, Clone)]
pub struct RepositoryApi {
    client: Client,
    request_semaphore: Arc<Semaphore>,
    download_semaphore: Arc<Semaphore>,
    base: Url,
}

impl RepositoryApi {
    /// Prepare the API client.
    pub fn new(args: &UpdaterArgs) -> Result<Self, UpdaterError> {
        Self::with_base(
            args.marketplace_url.clone(),
            args.max_parallel_requests,
            args.max_parallel_downloads,
        )
    }

    pub fn with_base(
        base: Url,
        max_parallel_requests: NonZeroUsize,
        max_parallel_downloads: NonZeroUsize,
    ) -> Result<Self, UpdaterError> {
        let client = Client::builder()
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .redirect(Policy::limited(10))
            .hickory_dns(true)
            .build()?;

        Ok(Self {
            client,
            request_semaphore: Arc::new(Semaphore::new(max_parallel_requests.get())),
            download_semaphore: Arc::new(Semaphore::new(max_parallel_downloads.get())),
            base,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, UpdaterError> {
        let permit = self.acquire(&self.request_semaphore).await?;

        let response = successful(self.client.get(url).send().await?)?;
        let data = response.bytes().await?;
        drop(permit);

        serde_json::from_slice(&data).map_err(UpdaterError::from)
    }

    async fn get_text(&self, url: Url) -> Result<String, UpdaterError> {
        let permit = self.acquire(&self.request_semaphore).await?;

        let response = successful(self.client.get(url).send().await?)?;
        let text = response.text().await?;
        drop(permit);

        Ok(text)
    }

    /// Fetch the published digest of a download, `None` if there is none.
    #[tracing::instrument(skip_all, fields(url = url.as_str()))]
    async fn fetch_download_hash(&self, url: &Url) -> Result<Option<RepoDownloadHash>, UpdaterError> {
        let mut hash_url = url.clone();
        hash_url.set_path(&(url.path().to_owned() + ".hash.json"));

        let permit = self.acquire(&self.request_semaphore).await?;
        let response = self.client.get(hash_url).send().await?;

        if matches!(
            response.status(),
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN
        ) {
            tracing::debug!(
                "No published hash for {} (status {})",
                url,
                response.status().as_str()
            );
            return Ok(None);
        }

        let data = successful(response)?.bytes().await?;
        drop(permit);

        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Stream `url` into `destination`, returning the final URL and its sha256.
    async fn stream_to_file(
        &self,
        url: &Url,
        destination: &Path,
    ) -> Result<(Url, Vec<u8>), UpdaterError> {
        let permit = self.acquire(&self.download_semaphore).await?;

        let mut response = successful(self.client.get(url.clone()).send().await?)?;
        let final_url = response.url().clone();

        let mut file = tokio::fs::File::create(destination).await?;
        let mut hasher = sha2::Sha256::new();

        while let Some(chunk) = response.chunk().await? {
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        drop(permit);

        Ok((final_url, hasher.finalize().to_vec()))
    }

    async fn verify_download(&self, url: &Url, digest: &[u8]) -> Result<(), UpdaterError> {
        match self.fetch_download_hash(url).await? {
            Some(expected) if expected.algorithm.eq_ignore_ascii_case("SHA-256") => {
                let expected = BASE64_STANDARD.decode(&expected.hash)?;
                if expected != digest {
                    return Err(UpdaterError::ChecksumMismatch(url.to_string()));
                }
                tracing::debug!("Verified sha256 of {}", url);
            }
            Some(expected) => {
                tracing::debug!(
                    "Not verifying {}, unsupported hash algorithm {}",
                    url,
                    expected.algorithm
                );
            }
            None => {}
        }

        Ok(())
    }

    fn path(&self, segments: impl IntoIterator<Item = impl AsRef<str>>) -> Url {
        let mut new_path = self.base.clone();
        if let Ok(mut path) = new_path.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }

        new_path
    }

    fn download_url(&self, update_id: u64) -> Url {
        let mut url = self.path(["plugin", "download"]);
        url.query_pairs_mut()
            .append_pair("updateId", &update_id.to_string());
        url
    }

    async fn acquire(&self, semaphore: &Arc<Semaphore>) -> Result<OwnedSemaphorePermit, UpdaterError> {
        semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| UpdaterError::Cancelled)
    }
}

fn successful(response: Response) -> Result<Response, UpdaterError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(UpdaterError::HttpStatus {
            url: response.url().clone(),
            status,
        })
    }
}

fn custom_listing_url(host: &Url, build: Option<&BuildNumber>) -> Url {
    let mut url = host.clone();
    if let Some(build) = build {
        url.query_pairs_mut().append_pair("build", &build.to_string());
    }
    url
}

#[async_trait]
impl MetadataSource for RepositoryApi {
    #[tracing::instrument(skip_all, fields(url = url.as_str()))]
    async fn fetch_metadata(&self, url: &Url) -> Result<String, UpdaterError> {
        self.get_text(url.clone()).await
    }
}

#[async_trait]
impl FileDownloader for RepositoryApi {
    #[tracing::instrument(skip_all, fields(url = url.as_str()))]
    async fn download_file(&self, url: &Url, destination: &Path) -> Result<(), UpdaterError> {
        let result = match self.stream_to_file(url, destination).await {
            Ok((final_url, digest)) => self.verify_download(&final_url, &digest).await,
            Err(err) => Err(err),
        };

        if result.is_err() {
            if let Err(err) = tokio::fs::remove_file(destination).await {
                tracing::trace!("Could not remove partial download: {}", err);
            }
        }

        result
    }
}

#[async_trait]
impl PluginRepository for RepositoryApi {
    #[tracing::instrument(skip(self))]
    async fn marketplace_plugin_ids(&self) -> Result<HashSet<PluginId>, UpdaterError> {
        let ids: HashSet<String> = self.get_json(self.path(["files", "pluginsXMLIds.json"])).await?;
        Ok(ids.into_iter().map(PluginId::new).collect())
    }

    #[tracing::instrument(skip(self, ids), fields(count = ids.len()))]
    async fn last_compatible_updates(
        &self,
        ids: &[PluginId],
        build: Option<&BuildNumber>,
    ) -> Result<Vec<CompatibleUpdate>, UpdaterError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::to_vec(&CompatibleUpdatesRequest {
            build: build.map(ToString::to_string),
            plugin_xml_ids: ids.iter().map(PluginId::as_str).collect(),
        })?;

        let permit = self.acquire(&self.request_semaphore).await?;
        let response = self
            .client
            .post(self.path(["api", "search", "compatibleUpdates"]))
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let data = successful(response)?.bytes().await?;
        drop(permit);

        let updates: Vec<RepoCompatibleUpdate> = serde_json::from_slice(&data)?;
        Ok(updates
            .into_iter()
            .map(|update| CompatibleUpdate {
                plugin_id: PluginId::new(update.plugin_xml_id),
                marketplace_id: update.plugin_id,
                update_id: update.id,
                version: update.version,
            })
            .collect())
    }

    #[tracing::instrument(skip_all, fields(plugin_id = update.plugin_id.as_str(), update_id = update.update_id))]
    async fn plugin_model(&self, update: &CompatibleUpdate) -> Result<RemotePlugin, UpdaterError> {
        let marketplace_id = update.marketplace_id.to_string();
        let update_id = update.update_id.to_string();

        let meta: RepoUpdateMetadata = self
            .get_json(self.path(["files", &marketplace_id, &update_id, "meta.json"]))
            .await?;

        Ok(RemotePlugin {
            id: update.plugin_id.clone(),
            name: if meta.name.is_empty() {
                meta.id
            } else {
                meta.name
            },
            version: meta.version,
            compatibility: BuildRange::new(
                custom::parse_bound(meta.since.as_deref()),
                custom::parse_bound(meta.until.as_deref()),
            ),
            download_url: Some(self.download_url(update.update_id)),
            host: RepositoryHost::Marketplace,
        })
    }

    #[tracing::instrument(skip_all, fields(host = %host))]
    async fn custom_repository_plugins(
        &self,
        host: &Url,
        build: Option<&BuildNumber>,
    ) -> Result<Vec<RemotePlugin>, UpdaterError> {
        let xml = self.get_text(custom_listing_url(host, build)).await?;
        parse_plugin_list(&xml, host)
    }

    #[tracing::instrument(skip(self))]
    async fn broken_plugins(&self) -> Result<BrokenPlugins, UpdaterError> {
        let broken: Vec<RepoBrokenPlugin> = self
            .get_json(self.path(["files", "brokenPlugins.json"]))
            .await?;

        Ok(BrokenPlugins::new(
            broken
                .into_iter()
                .map(|plugin| (PluginId::new(plugin.id), plugin.version)),
        ))
    }
}
