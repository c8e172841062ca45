use crate::error::UpdaterError;
use crate::platform::build_number::BuildNumber;
use crate::platform::model::{ChannelStatus, TargetOs};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

pub const IGNORED_BUILDS_FILE: &str = "ignored-builds.txt";
pub const IGNORED_PLUGINS_FILE: &str = "ignored-plugins.txt";

/// User choices that influence which platform build is offered.
#[derive(Debug, Clone)]
pub struct UpdateSettings {
    pub selected_channel: ChannelStatus,
    /// Build numbers without product code.
    pub ignored_builds: HashSet<String>,
    pub os: TargetOs,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            selected_channel: ChannelStatus::Release,
            ignored_builds: HashSet::new(),
            os: TargetOs::current(),
        }
    }
}

impl UpdateSettings {
    pub fn is_build_ignored(&self, build: &BuildNumber) -> bool {
        self.ignored_builds
            .contains(&build.as_string_without_product_code())
    }
}

/// A plain-text file storing one entry per line.
#[derive(Debug, Clone)]
pub struct LineSetFile {
    path: PathBuf,
}

impl LineSetFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn ignored_builds(config_dir: &Path) -> Self {
        Self::new(config_dir.join(IGNORED_BUILDS_FILE))
    }

    pub fn ignored_plugins(config_dir: &Path) -> Self {
        Self::new(config_dir.join(IGNORED_PLUGINS_FILE))
    }

    /// Read all entries. A missing file is an empty set.
    #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn load(&self) -> Result<BTreeSet<String>, UpdaterError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(v) => v,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => return Err(err.into()),
        };

        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    #[tracing::instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn save(&self, entries: &BTreeSet<String>) -> Result<(), UpdaterError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut content = String::new();
        for entry in entries {
            content.push_str(entry);
            content.push('\n');
        }

        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    pub async fn add_all(
        &self,
        new_entries: impl IntoIterator<Item = String>,
    ) -> Result<(), UpdaterError> {
        let mut entries = self.load().await?;
        let before = entries.len();
        entries.extend(
            new_entries
                .into_iter()
                .map(|entry| entry.trim().to_owned())
                .filter(|entry| !entry.is_empty()),
        );

        if entries.len() != before {
            self.save(&entries).await?;
        }

        Ok(())
    }
}

/// Key under which a single plugin update is ignored.
pub fn plugin_ignore_key(plugin_id: &str, version: &str) -> String {
    format!("{}+{}", plugin_id, version)
}
