use crate::error::UpdaterError;
use crate::platform::build_number::{BuildNumber, BuildRange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub const INSTALLED_PLUGINS_FILE: &str = "plugins.json";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(pub String);

impl PluginId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PluginId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Descriptor of a plugin present in (or imported into) the installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledPlugin {
    pub id: PluginId,
    #[serde(default)]
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub bundled: bool,
    #[serde(default)]
    pub allow_bundled_update: bool,
    /// Taken over from a previous installation and not loaded yet.
    #[serde(default)]
    pub imported: bool,
    #[serde(default)]
    pub since_build: Option<BuildNumber>,
    #[serde(default)]
    pub until_build: Option<BuildNumber>,
}

fn default_true() -> bool {
    true
}

impl InstalledPlugin {
    pub fn compatibility(&self) -> BuildRange {
        BuildRange::new(self.since_build.clone(), self.until_build.clone())
    }

    pub fn is_compatible_with(&self, build: &BuildNumber) -> bool {
        self.compatibility().contains(build)
    }

    /// Bundled plugins only take part in updates when they opt in.
    pub fn is_updatable(&self) -> bool {
        !self.bundled || self.allow_bundled_update
    }
}

/// Lookup of installed plugin descriptors.
pub trait InstalledPluginSource: Send + Sync {
    fn find(&self, id: &PluginId) -> Option<InstalledPlugin>;

    fn all(&self) -> Vec<InstalledPlugin>;
}

/// Installed plugins as listed in `plugins.json`.
#[derive(Debug, Clone, Default)]
pub struct InstalledPlugins {
    plugins: BTreeMap<PluginId, InstalledPlugin>,
}

impl InstalledPlugins {
    pub fn new(plugins: impl IntoIterator<Item = InstalledPlugin>) -> Self {
        Self {
            plugins: plugins.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    /// Load descriptors from a JSON array. A missing file means no plugins.
    #[tracing::instrument]
    pub async fn load(path: &Path) -> Result<Self, UpdaterError> {
        let data = match tokio::fs::read(path).await {
            Ok(v) => v,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No installed plugins file at {}", path.display());
                return Ok(Self::default());
            }
            Err(err) => return Err(err.into()),
        };

        let plugins: Vec<InstalledPlugin> = serde_json::from_slice(&data)?;
        tracing::debug!("Loaded {} installed plugins", plugins.len());

        Ok(Self::new(plugins))
    }
}

impl InstalledPluginSource for InstalledPlugins {
    fn find(&self, id: &PluginId) -> Option<InstalledPlugin> {
        self.plugins.get(id).cloned()
    }

    fn all(&self) -> Vec<InstalledPlugin> {
        self.plugins.values().cloned().collect()
    }
}
