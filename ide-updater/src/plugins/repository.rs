use crate::download::FileDownloader;
use crate::error::UpdaterError;
use crate::platform::build_number::{BuildNumber, BuildRange};
use crate::plugins::installed::PluginId;
use async_trait::async_trait;
use reqwest::Url;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

/// A plugin repository: the built-in marketplace or a custom host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RepositoryHost {
    Marketplace,
    Custom(Url),
}

impl fmt::Display for RepositoryHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Marketplace => f.write_str("marketplace"),
            Self::Custom(url) => f.write_str(url.as_str()),
        }
    }
}

/// One version of a plugin offered by a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePlugin {
    pub id: PluginId,
    pub name: String,
    pub version: String,
    pub compatibility: BuildRange,
    pub download_url: Option<Url>,
    pub host: RepositoryHost,
}

impl RemotePlugin {
    pub fn is_compatible_with(&self, build: &BuildNumber) -> bool {
        self.compatibility.contains(build)
    }
}

/// Marketplace answer to "what is the newest update of this plugin for build X".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibleUpdate {
    pub plugin_id: PluginId,
    pub marketplace_id: u64,
    pub update_id: u64,
    pub version: String,
}

/// Plugin versions known to be broken, by plugin id.
#[derive(Debug, Clone, Default)]
pub struct BrokenPlugins {
    versions: HashMap<PluginId, HashSet<String>>,
}

impl BrokenPlugins {
    pub fn new(entries: impl IntoIterator<Item = (PluginId, String)>) -> Self {
        let mut versions: HashMap<PluginId, HashSet<String>> = HashMap::new();
        for (id, version) in entries {
            versions.entry(id).or_default().insert(version);
        }
        Self { versions }
    }

    pub fn is_broken(&self, id: &PluginId, version: &str) -> bool {
        self.versions
            .get(id)
            .is_some_and(|versions| versions.contains(version))
    }

    pub fn len(&self) -> usize {
        self.versions.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

#[async_trait]
pub trait PluginRepository: FileDownloader {
    /// Ids of all plugins the marketplace knows about.
    async fn marketplace_plugin_ids(&self) -> Result<HashSet<PluginId>, UpdaterError>;

    async fn last_compatible_updates(
        &self,
        ids: &[PluginId],
        build: Option<&BuildNumber>,
    ) -> Result<Vec<CompatibleUpdate>, UpdaterError>;

    async fn plugin_model(&self, update: &CompatibleUpdate) -> Result<RemotePlugin, UpdaterError>;

    /// Full plugin listing of a custom repository.
    async fn custom_repository_plugins(
        &self,
        host: &Url,
        build: Option<&BuildNumber>,
    ) -> Result<Vec<RemotePlugin>, UpdaterError>;

    async fn broken_plugins(&self) -> Result<BrokenPlugins, UpdaterError>;

    async fn download_plugin(
        &self,
        plugin: &RemotePlugin,
        destination: &Path,
    ) -> Result<(), UpdaterError> {
        let url = plugin
            .download_url
            .as_ref()
            .ok_or_else(|| UpdaterError::NoDownloadUrl(plugin.id.to_string()))?;

        self.download_file(url, destination).await
    }
}
