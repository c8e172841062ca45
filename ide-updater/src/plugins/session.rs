use crate::error::UpdaterError;
use crate::platform::build_number::BuildNumber;
use crate::plugins::aggregator::{PluginRepositoryAggregator, PluginUpdateSet, ScanRequest};
use crate::plugins::downloader::PluginDownloader;
use crate::plugins::installed::{InstalledPluginSource, PluginId};
use crate::plugins::repository::{PluginRepository, RemotePlugin};
use crate::settings::LineSetFile;
use parking_lot::Mutex;
use reqwest::Url;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Session {
    created_at: Instant,
    downloaders: BTreeMap<PluginId, PluginDownloader>,
}

/// Downloaders offered by a check, kept until the matching install or ignore.
///
/// Sessions live until deleted. With a TTL configured, sessions older than
/// the TTL are dropped the next time the registry is touched.
#[derive(Default)]
pub struct DownloadSessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Option<Duration>,
}

impl DownloadSessionRegistry {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn register(
        &self,
        session_id: &str,
        downloaders: impl IntoIterator<Item = PluginDownloader>,
    ) {
        let mut sessions = self.sessions.lock();
        self.evict_expired(&mut sessions);

        let session = sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| Session {
                created_at: Instant::now(),
                downloaders: BTreeMap::new(),
            });

        for downloader in downloaders {
            session
                .downloaders
                .insert(downloader.plugin_id.clone(), downloader);
        }
    }

    pub fn get(&self, session_id: &str, plugin_id: &PluginId) -> Option<PluginDownloader> {
        let mut sessions = self.sessions.lock();
        self.evict_expired(&mut sessions);

        sessions
            .get(session_id)
            .and_then(|session| session.downloaders.get(plugin_id))
            .cloned()
    }

    /// All downloaders of a session, `None` if the session is unknown.
    pub fn get_all(&self, session_id: &str) -> Option<Vec<PluginDownloader>> {
        let mut sessions = self.sessions.lock();
        self.evict_expired(&mut sessions);

        sessions
            .get(session_id)
            .map(|session| session.downloaders.values().cloned().collect())
    }

    pub fn delete_session(&self, session_id: &str) -> bool {
        self.sessions.lock().remove(session_id).is_some()
    }

    fn evict_expired(&self, sessions: &mut HashMap<String, Session>) {
        let Some(ttl) = self.ttl else {
            return;
        };

        sessions.retain(|id, session| {
            let keep = session.created_at.elapsed() < ttl;
            if !keep {
                tracing::debug!("Evicting expired download session {}", id);
            }
            keep
        });
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginUpdateInfo {
    pub id: PluginId,
    pub name: String,
    pub version: String,
    pub installed_version: Option<String>,
    pub repository: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<Url>,
}

impl From<&PluginDownloader> for PluginUpdateInfo {
    fn from(downloader: &PluginDownloader) -> Self {
        Self {
            id: downloader.plugin_id.clone(),
            name: downloader.plugin_name.clone(),
            version: downloader.version.clone(),
            installed_version: downloader.installed_version.clone(),
            repository: downloader.host().to_string(),
            download_url: downloader.remote.download_url.clone(),
        }
    }
}

impl From<&RemotePlugin> for PluginUpdateInfo {
    fn from(plugin: &RemotePlugin) -> Self {
        Self {
            id: plugin.id.clone(),
            name: plugin.name.clone(),
            version: plugin.version.clone(),
            installed_version: None,
            repository: plugin.host.to_string(),
            download_url: plugin.download_url.clone(),
        }
    }
}

/// Answer to a session check.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateModel {
    pub not_ignored_updates: Vec<PluginUpdateInfo>,
    pub incompatible_names: Vec<String>,
    pub custom_repo_updates: Vec<PluginUpdateInfo>,
    /// Error messages by repository host.
    pub errors: BTreeMap<String, String>,
    /// Error messages by plugin id.
    pub plugin_errors: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct InstallReport {
    pub prepared: Vec<(PluginId, PathBuf)>,
    pub failed: Vec<(PluginId, UpdaterError)>,
}

/// Check, install and ignore plugin updates through download sessions.
pub struct UpdateSessionService {
    aggregator: PluginRepositoryAggregator,
    repository: Arc<dyn PluginRepository>,
    installed: Arc<dyn InstalledPluginSource>,
    registry: Arc<DownloadSessionRegistry>,
    ignored_plugins: LineSetFile,
    current_build: BuildNumber,
    install_dir: PathBuf,
    check_lane: tokio::sync::Mutex<()>,
    download_lane: tokio::sync::Mutex<()>,
}

impl UpdateSessionService {
    pub fn new(
        aggregator: PluginRepositoryAggregator,
        repository: Arc<dyn PluginRepository>,
        installed: Arc<dyn InstalledPluginSource>,
        registry: Arc<DownloadSessionRegistry>,
        ignored_plugins: LineSetFile,
        current_build: BuildNumber,
        install_dir: PathBuf,
    ) -> Self {
        Self {
            aggregator,
            repository,
            installed,
            registry,
            ignored_plugins,
            current_build,
            install_dir,
            check_lane: tokio::sync::Mutex::new(()),
            download_lane: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<DownloadSessionRegistry> {
        &self.registry
    }

    /// Scan for plugin updates compatible with `api_version` (the current
    /// build if unset) and bind the offered ones to `session_id`.
    ///
    /// Checks never run concurrently.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn check(
        &self,
        api_version: Option<BuildNumber>,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<UpdateModel, UpdaterError> {
        let _lane = self.check_lane.lock().await;

        let mut request = ScanRequest::new(self.installed.all(), self.current_build.clone());
        request.target_build = api_version;

        let set = self.aggregator.scan(&request, cancel).await?;
        let ignored = self.ignored_plugins.load().await?;

        Ok(self.bind_session(session_id, set, &ignored))
    }

    fn bind_session(
        &self,
        session_id: &str,
        set: PluginUpdateSet,
        ignored: &BTreeSet<String>,
    ) -> UpdateModel {
        let updates = set
            .enabled
            .into_iter()
            .filter(|downloader| !ignored.contains(&downloader.ignore_key()))
            .collect::<Vec<_>>();

        let model = UpdateModel {
            not_ignored_updates: updates.iter().map(PluginUpdateInfo::from).collect(),
            incompatible_names: set
                .incompatible
                .iter()
                .map(|plugin| {
                    if plugin.name.is_empty() {
                        plugin.id.to_string()
                    } else {
                        plugin.name.clone()
                    }
                })
                .collect(),
            custom_repo_updates: set
                .custom_repository_plugins
                .iter()
                .map(PluginUpdateInfo::from)
                .collect(),
            errors: set
                .errors
                .iter()
                .map(|(host, err)| (host.to_string(), err.to_string()))
                .collect(),
            plugin_errors: set
                .plugin_errors
                .iter()
                .map(|(id, err)| (id.to_string(), err.to_string()))
                .collect(),
        };

        self.registry.delete_session(session_id);
        self.registry.register(session_id, updates);

        model
    }

    /// Download the selected updates of a session into the install directory.
    ///
    /// The session is deleted afterwards, whether downloads failed or not.
    #[tracing::instrument(skip(self, selected, cancel))]
    pub async fn install(
        &self,
        session_id: &str,
        selected: &HashSet<PluginId>,
        cancel: &CancellationToken,
    ) -> Result<InstallReport, UpdaterError> {
        let downloaders = self
            .registry
            .get_all(session_id)
            .ok_or_else(|| UpdaterError::UnknownSession(session_id.to_owned()))?;

        let _lane = self.download_lane.lock().await;
        let mut report = InstallReport::default();

        for mut downloader in downloaders
            .into_iter()
            .filter(|downloader| selected.contains(&downloader.plugin_id))
        {
            let result = downloader
                .prepare_to_install(self.repository.as_ref(), &self.install_dir, cancel)
                .await;

            match result.map(|()| downloader.prepared_file().map(Path::to_path_buf)) {
                Ok(Some(path)) => {
                    tracing::info!("Prepared {} {}", downloader.plugin_id, downloader.version);
                    report.prepared.push((downloader.plugin_id, path));
                }
                Ok(None) => {}
                Err(err) if err.is_cancellation() => {
                    tracing::debug!("Install of session {} cancelled", session_id);
                    self.registry.delete_session(session_id);
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!("Failed to download {}: {}", downloader.plugin_id, err);
                    report.failed.push((downloader.plugin_id, err));
                }
            }
        }

        self.registry.delete_session(session_id);
        Ok(report)
    }

    /// Remember every update of the session as ignored.
    #[tracing::instrument(skip(self))]
    pub async fn ignore(&self, session_id: &str) -> Result<usize, UpdaterError> {
        let downloaders = self
            .registry
            .get_all(session_id)
            .ok_or_else(|| UpdaterError::UnknownSession(session_id.to_owned()))?;

        self.ignored_plugins
            .add_all(downloaders.iter().map(PluginDownloader::ignore_key))
            .await?;
        self.registry.delete_session(session_id);

        Ok(downloaders.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::aggregator::DefaultPluginUpdatePolicy;
    use crate::plugins::aggregator::tests::{FakeModel, FakeRepository, bn, installed, remote};
    use crate::plugins::installed::InstalledPlugins;
    use crate::plugins::repository::RepositoryHost;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn downloader(id: &str, version: &str) -> PluginDownloader {
        PluginDownloader::new(remote(id, version, RepositoryHost::Marketplace), None)
    }

    #[test]
    fn sessions_register_and_delete() {
        let registry = DownloadSessionRegistry::default();
        registry.register("s1", [downloader("a", "1"), downloader("b", "2")]);
        registry.register("s1", [downloader("a", "3")]);

        let all = registry.get_all("s1").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(registry.get("s1", &"a".into()).unwrap().version, "3");
        assert!(registry.get("s2", &"a".into()).is_none());

        assert!(registry.delete_session("s1"));
        assert!(!registry.delete_session("s1"));
        assert!(registry.get_all("s1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_expire_with_ttl() {
        let registry = DownloadSessionRegistry::new(Some(Duration::from_secs(60)));
        registry.register("old", [downloader("a", "1")]);

        tokio::time::sleep(Duration::from_secs(45)).await;
        registry.register("new", [downloader("b", "1")]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(registry.get_all("old").is_none());
        assert_eq!(registry.get_all("new").unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_live_forever_without_ttl() {
        let registry = DownloadSessionRegistry::new(None);
        registry.register("s", [downloader("a", "1")]);

        tokio::time::sleep(Duration::from_secs(60 * 60 * 24)).await;
        assert!(registry.get_all("s").is_some());
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        ignored: LineSetFile,
        install_dir: PathBuf,
        repository: Arc<FakeRepository>,
        service: UpdateSessionService,
    }

    fn fixture(repository: FakeRepository) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(repository);
        let ignored = LineSetFile::ignored_plugins(dir.path());
        let install_dir = dir.path().join("install");

        let aggregator = PluginRepositoryAggregator::new(
            repository.clone(),
            vec![],
            Arc::new(DefaultPluginUpdatePolicy),
        );
        let service = UpdateSessionService::new(
            aggregator,
            repository.clone(),
            Arc::new(InstalledPlugins::new([installed("a", "1"), installed("b", "1")])),
            Arc::new(DownloadSessionRegistry::default()),
            ignored.clone(),
            bn("241.100"),
            install_dir.clone(),
        );

        Fixture {
            _dir: dir,
            ignored,
            install_dir,
            repository,
            service,
        }
    }

    fn two_updates() -> FakeRepository {
        FakeRepository::default()
            .with_marketplace(remote("a", "2", RepositoryHost::Marketplace))
            .with_marketplace(remote("b", "2", RepositoryHost::Marketplace))
    }

    #[tokio::test]
    async fn check_skips_ignored_updates() {
        let fixture = fixture(two_updates());
        fixture.ignored.add_all(["a+2".to_owned()]).await.unwrap();

        let model = fixture
            .service
            .check(None, "s", &CancellationToken::new())
            .await
            .unwrap();

        let ids = model
            .not_ignored_updates
            .iter()
            .map(|u| u.id.to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["b".to_owned()]);
        assert_eq!(fixture.service.registry().get_all("s").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn install_prepares_selected_and_deletes_session() {
        let fixture = fixture(two_updates());
        let cancel = CancellationToken::new();
        fixture.service.check(None, "s", &cancel).await.unwrap();

        let report = fixture
            .service
            .install("s", &HashSet::from([PluginId::from("b")]), &cancel)
            .await
            .unwrap();

        assert_eq!(report.prepared.len(), 1);
        assert!(report.failed.is_empty());
        let (id, path) = &report.prepared[0];
        assert_eq!(id.as_str(), "b");
        assert!(path.starts_with(&fixture.install_dir));
        assert_eq!(tokio::fs::read_to_string(path).await.unwrap(), "2");
        assert_eq!(*fixture.repository.downloads.lock(), vec![PluginId::from("b")]);

        assert!(fixture.service.registry().get_all("s").is_none());
        assert!(matches!(
            fixture.service.install("s", &HashSet::new(), &cancel).await,
            Err(UpdaterError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn ignore_persists_keys() {
        let fixture = fixture(two_updates());
        let cancel = CancellationToken::new();
        fixture.service.check(None, "s", &cancel).await.unwrap();

        assert_eq!(fixture.service.ignore("s").await.unwrap(), 2);

        let keys = fixture.ignored.load().await.unwrap();
        assert!(keys.contains("a+2"));
        assert!(keys.contains("b+2"));

        let model = fixture.service.check(None, "s2", &cancel).await.unwrap();
        assert!(model.not_ignored_updates.is_empty());
    }

    #[tokio::test]
    async fn concurrent_checks_both_complete() {
        let fixture = fixture(two_updates());
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(
            fixture.service.check(None, "one", &cancel),
            fixture.service.check(None, "two", &cancel),
        );

        assert_eq!(first.unwrap().not_ignored_updates.len(), 2);
        assert_eq!(second.unwrap().not_ignored_updates.len(), 2);
        assert_eq!(fixture.service.registry().get_all("one").unwrap().len(), 2);
        assert_eq!(fixture.service.registry().get_all("two").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_checks_never_overlap() {
        let fixture = fixture(two_updates());
        let cancel = CancellationToken::new();

        let (first, second, third) = tokio::join!(
            fixture.service.check(None, "one", &cancel),
            fixture.service.check(None, "two", &cancel),
            fixture.service.check(None, "three", &cancel),
        );

        first.unwrap();
        second.unwrap();
        third.unwrap();
        assert_eq!(fixture.repository.max_id_lookups_in_flight.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn model_lists_unserved_plugin_errors() {
        let mut repository = FakeRepository::default();
        repository.marketplace.insert("a".into(), FakeModel::ServerError);
        let fixture = fixture(repository);

        let model = fixture
            .service
            .check(None, "s", &CancellationToken::new())
            .await
            .unwrap();

        assert!(model.not_ignored_updates.is_empty());
        assert_eq!(model.plugin_errors.keys().collect::<Vec<_>>(), vec!["a"]);
    }
}
