use crate::download::file_name_from_url;
use crate::error::UpdaterError;
use crate::plugins::installed::{InstalledPlugin, PluginId};
use crate::plugins::repository::{PluginRepository, RemotePlugin, RepositoryHost};
use crate::settings::plugin_ignore_key;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// A candidate plugin update bound to one repository and version.
#[derive(Debug, Clone)]
pub struct PluginDownloader {
    pub plugin_id: PluginId,
    pub plugin_name: String,
    pub version: String,
    pub installed_version: Option<String>,
    pub remote: RemotePlugin,
    prepared_file: Option<PathBuf>,
}

impl PluginDownloader {
    pub fn new(remote: RemotePlugin, installed: Option<&InstalledPlugin>) -> Self {
        Self {
            plugin_id: remote.id.clone(),
            plugin_name: if remote.name.is_empty() {
                remote.id.to_string()
            } else {
                remote.name.clone()
            },
            version: remote.version.clone(),
            installed_version: installed.map(|p| p.version.clone()),
            remote,
            prepared_file: None,
        }
    }

    pub fn host(&self) -> &RepositoryHost {
        &self.remote.host
    }

    pub fn ignore_key(&self) -> String {
        plugin_ignore_key(self.plugin_id.as_str(), &self.version)
    }

    /// The downloaded archive, once [`Self::prepare_to_install`] succeeded.
    pub fn prepared_file(&self) -> Option<&Path> {
        self.prepared_file.as_deref()
    }

    pub fn file_name(&self) -> String {
        let fallback = format!("{}-{}.zip", self.plugin_id, self.version);
        let name = match &self.remote.download_url {
            Some(url) => file_name_from_url(url, &fallback),
            None => fallback,
        };

        // Marketplace download URLs end in a generic segment.
        let name = if name == "download" {
            format!("{}-{}.zip", self.plugin_id, self.version)
        } else {
            name
        };

        name.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Download the plugin archive into `directory`.
    #[tracing::instrument(
        skip_all,
        fields(plugin_id = self.plugin_id.as_str(), version = self.version.as_str())
    )]
    pub async fn prepare_to_install(
        &mut self,
        repository: &dyn PluginRepository,
        directory: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), UpdaterError> {
        tokio::fs::create_dir_all(directory).await?;
        let destination = directory.join(self.file_name());

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpdaterError::Cancelled),
            result = repository.download_plugin(&self.remote, &destination) => result?,
        }

        tracing::debug!("Downloaded plugin to {}", destination.display());
        self.prepared_file = Some(destination);

        Ok(())
    }
}
