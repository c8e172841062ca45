use crate::error::UpdaterError;
use crate::platform::build_number::BuildNumber;
use crate::plugins::downloader::PluginDownloader;
use crate::plugins::installed::{InstalledPlugin, PluginId};
use crate::plugins::repository::{
    BrokenPlugins, CompatibleUpdate, PluginRepository, RemotePlugin, RepositoryHost,
};
use crate::plugins::version::{compare_versions, is_newer_version};
use futures::{StreamExt as _, stream};
use indicatif::ProgressStyle;
use reqwest::Url;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_indicatif::span_ext::IndicatifSpanExt as _;

const MAX_PARALLEL_MODEL_REQUESTS: usize = 8;
const SCAN_PROGRESS_TEMPLATE: &str = "{spinner} checking plugin repositories [{bar:30}] {pos}/{len}";

/// Decides which direction of version change is acceptable for a plugin.
pub trait PluginUpdatePolicy: Send + Sync {
    fn allow_upgrade(&self, _plugin: &PluginId) -> bool {
        true
    }

    fn allow_downgrade(&self, _plugin: &PluginId) -> bool {
        false
    }

    /// `ordering` is the candidate version compared to the reference version.
    fn permits(&self, plugin: &PluginId, ordering: Ordering) -> bool {
        match ordering {
            Ordering::Greater => self.allow_upgrade(plugin),
            Ordering::Less => self.allow_downgrade(plugin),
            Ordering::Equal => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPluginUpdatePolicy;

impl PluginUpdatePolicy for DefaultPluginUpdatePolicy {}

/// What to look for in a plugin scan.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    /// Installed and imported plugin descriptors.
    pub plugins: Vec<InstalledPlugin>,
    /// Restrict the scan to these ids.
    pub only: Option<HashSet<PluginId>>,
    pub current_build: BuildNumber,
    /// Build the updates have to be compatible with, the current one if unset.
    pub target_build: Option<BuildNumber>,
    pub check_broken_plugins: bool,
}

impl ScanRequest {
    pub fn new(plugins: Vec<InstalledPlugin>, current_build: BuildNumber) -> Self {
        Self {
            plugins,
            only: None,
            current_build,
            target_build: None,
            check_broken_plugins: true,
        }
    }

    fn effective_build(&self) -> &BuildNumber {
        self.target_build.as_ref().unwrap_or(&self.current_build)
    }
}

/// Result of one plugin scan.
#[derive(Debug, Default)]
pub struct PluginUpdateSet {
    pub enabled: Vec<PluginDownloader>,
    pub disabled: Vec<PluginDownloader>,
    pub incompatible: Vec<InstalledPlugin>,
    /// Newest plugin versions seen on custom hosts, installed or not.
    pub custom_repository_plugins: Vec<RemotePlugin>,
    pub errors: BTreeMap<RepositoryHost, UpdaterError>,
    /// Non-transient lookup failures of plugins no host could serve.
    pub plugin_errors: BTreeMap<PluginId, UpdaterError>,
}

/// Merges plugin updates from the marketplace and any custom repositories.
#[derive(Clone)]
pub struct PluginRepositoryAggregator {
    repository: Arc<dyn PluginRepository>,
    custom_hosts: Vec<Url>,
    policy: Arc<dyn PluginUpdatePolicy>,
}

struct ScanState<'a> {
    build: &'a BuildNumber,
    broken: BrokenPlugins,
    policy: &'a dyn PluginUpdatePolicy,
    /// Ids no repository supplied a usable candidate for yet.
    wanted: BTreeMap<PluginId, InstalledPlugin>,
    installed: BTreeMap<PluginId, InstalledPlugin>,
    enabled: BTreeMap<PluginId, PluginDownloader>,
    disabled: BTreeMap<PluginId, PluginDownloader>,
    custom: BTreeMap<PluginId, RemotePlugin>,
    plugin_errors: BTreeMap<PluginId, UpdaterError>,
}

impl PluginRepositoryAggregator {
    pub fn new(
        repository: Arc<dyn PluginRepository>,
        custom_hosts: Vec<Url>,
        policy: Arc<dyn PluginUpdatePolicy>,
    ) -> Self {
        Self {
            repository,
            custom_hosts,
            policy,
        }
    }

    pub fn hosts(&self) -> Vec<RepositoryHost> {
        std::iter::once(RepositoryHost::Marketplace)
            .chain(self.custom_hosts.iter().cloned().map(RepositoryHost::Custom))
            .collect()
    }

    /// Collect available updates for the plugins in `request`.
    ///
    /// Repository failures are collected per host; only cancellation fails the
    /// whole scan.
    #[tracing::instrument(skip_all, fields(build = %request.effective_build()))]
    pub async fn scan(
        &self,
        request: &ScanRequest,
        cancel: &CancellationToken,
    ) -> Result<PluginUpdateSet, UpdaterError> {
        let wanted = request
            .plugins
            .iter()
            .filter(|plugin| plugin.is_updatable())
            .filter(|plugin| request.only.as_ref().is_none_or(|only| only.contains(&plugin.id)))
            .map(|plugin| (plugin.id.clone(), plugin.clone()))
            .collect::<BTreeMap<_, _>>();

        if wanted.is_empty() {
            tracing::debug!("No updatable plugins, skipping scan");
            return Ok(PluginUpdateSet::default());
        }

        let broken = if request.check_broken_plugins {
            self.load_broken_plugins(cancel).await?
        } else {
            BrokenPlugins::default()
        };

        let mut state = ScanState {
            build: request.effective_build(),
            broken,
            policy: self.policy.as_ref(),
            installed: wanted.clone(),
            wanted,
            enabled: BTreeMap::new(),
            disabled: BTreeMap::new(),
            custom: BTreeMap::new(),
            plugin_errors: BTreeMap::new(),
        };

        let hosts = self.hosts();
        let span = tracing::Span::current();
        if let Ok(style) = ProgressStyle::with_template(SCAN_PROGRESS_TEMPLATE) {
            span.pb_set_style(&style);
        }
        span.pb_set_length(hosts.len() as u64);

        let mut errors = BTreeMap::new();

        for host in hosts {
            if cancel.is_cancelled() {
                return Err(UpdaterError::Cancelled);
            }

            let result = match &host {
                RepositoryHost::Marketplace => self.scan_marketplace(&mut state, cancel).await,
                RepositoryHost::Custom(url) => self.scan_custom_host(&mut state, url, cancel).await,
            };

            match result {
                Ok(()) => {}
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => {
                    tracing::error!("Failed to check plugin updates from {}: {}", host, err);
                    errors.insert(host, err);
                }
            }

            span.pb_inc(1);
        }

        let incompatible = state
            .wanted
            .values()
            .filter(|plugin| {
                plugin.enabled
                    && !plugin.bundled
                    && !plugin.imported
                    && !plugin.is_compatible_with(state.build)
            })
            .cloned()
            .collect::<Vec<_>>();

        let wanted = &state.wanted;
        let plugin_errors = std::mem::take(&mut state.plugin_errors)
            .into_iter()
            .filter(|(id, _)| wanted.contains_key(id))
            .collect::<BTreeMap<_, _>>();

        tracing::info!(
            "Found {} enabled and {} disabled plugin updates, {} incompatible plugins",
            state.enabled.len(),
            state.disabled.len(),
            incompatible.len()
        );

        Ok(PluginUpdateSet {
            enabled: state.enabled.into_values().collect(),
            disabled: state.disabled.into_values().collect(),
            incompatible,
            custom_repository_plugins: state.custom.into_values().collect(),
            errors,
            plugin_errors,
        })
    }

    async fn load_broken_plugins(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BrokenPlugins, UpdaterError> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpdaterError::Cancelled),
            result = self.repository.broken_plugins() => result,
        };

        match result {
            Ok(broken) => {
                if !broken.is_empty() {
                    tracing::debug!("Loaded {} broken plugin versions", broken.len());
                }
                Ok(broken)
            }
            Err(err) => {
                tracing::warn!("Failed to load broken plugins list: {}", err);
                Ok(BrokenPlugins::default())
            }
        }
    }

    #[tracing::instrument(skip_all)]
    async fn scan_marketplace(
        &self,
        state: &mut ScanState<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), UpdaterError> {
        let known_ids = cancellable(cancel, self.repository.marketplace_plugin_ids()).await?;

        let ids = state
            .wanted
            .keys()
            .filter(|id| known_ids.contains(*id))
            .cloned()
            .collect::<Vec<_>>();

        if ids.is_empty() {
            return Ok(());
        }

        let updates = cancellable(
            cancel,
            self.repository.last_compatible_updates(&ids, Some(state.build)),
        )
        .await?;

        // `buffered` keeps the answer order.
        let mut models = stream::iter(updates)
            .map(|update| async move {
                let model = self.repository.plugin_model(&update).await;
                (update, model)
            })
            .buffered(MAX_PARALLEL_MODEL_REQUESTS);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UpdaterError::Cancelled),
                next = models.next() => next,
            };
            let Some((update, model)) = next else {
                break;
            };

            match model {
                Ok(model) => state.consider(model),
                Err(err) => {
                    log_model_error(&update, &err);
                    if !err.is_transient() {
                        state.plugin_errors.insert(update.plugin_id, err);
                    }
                }
            }
        }

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(host = %host))]
    async fn scan_custom_host(
        &self,
        state: &mut ScanState<'_>,
        host: &Url,
        cancel: &CancellationToken,
    ) -> Result<(), UpdaterError> {
        let plugins = cancellable(
            cancel,
            self.repository.custom_repository_plugins(host, Some(state.build)),
        )
        .await?;

        tracing::debug!("Custom repository lists {} plugins", plugins.len());

        for plugin in plugins {
            if state.wanted.contains_key(&plugin.id) {
                state.consider(plugin.clone());
            }
            state.remember_custom(plugin);
        }

        Ok(())
    }
}

impl ScanState<'_> {
    fn is_usable(&self, candidate: &RemotePlugin) -> bool {
        !self.broken.is_broken(&candidate.id, &candidate.version)
            && candidate.is_compatible_with(self.build)
    }

    /// Compare a candidate to the installed version, treating a broken or
    /// incompatible installed version as older than anything.
    fn compare_to_installed(&self, candidate: &RemotePlugin, installed: &InstalledPlugin) -> Ordering {
        let ordering = compare_versions(&candidate.version, &installed.version);

        if ordering == Ordering::Less
            && (self.broken.is_broken(&installed.id, &installed.version)
                || !installed.is_compatible_with(self.build))
        {
            Ordering::Greater
        } else {
            ordering
        }
    }

    /// Offer a candidate for a still wanted plugin.
    fn consider(&mut self, candidate: RemotePlugin) {
        if !self.is_usable(&candidate) {
            tracing::debug!(
                "Skipping unusable {} {} from {}",
                candidate.id,
                candidate.version,
                candidate.host
            );
            return;
        }

        // First host with a usable candidate wins.
        let Some(installed) = self.wanted.remove(&candidate.id) else {
            return;
        };

        let ordering = self.compare_to_installed(&candidate, &installed);
        if !self.policy.permits(&candidate.id, ordering) {
            tracing::trace!(
                "{} {} is not an acceptable update from {}",
                candidate.id,
                candidate.version,
                installed.version
            );
            return;
        }

        let bucket = if installed.enabled {
            &mut self.enabled
        } else {
            &mut self.disabled
        };

        if let Some(existing) = bucket.get(&candidate.id) {
            if !is_newer_version(&candidate.version, &existing.version) {
                return;
            }
        }

        tracing::debug!(
            "Update {} {} -> {} from {}",
            candidate.id,
            installed.version,
            candidate.version,
            candidate.host
        );

        bucket.insert(
            candidate.id.clone(),
            PluginDownloader::new(candidate, Some(&installed)),
        );
    }

    /// Track the newest version a custom host offers for `plugin`.
    fn remember_custom(&mut self, plugin: RemotePlugin) {
        let reference = self
            .enabled
            .get(&plugin.id)
            .or_else(|| self.disabled.get(&plugin.id))
            .map(|downloader| downloader.version.as_str())
            .or_else(|| self.installed.get(&plugin.id).map(|p| p.version.as_str()));

        if let Some(reference) = reference {
            let ordering = compare_versions(&plugin.version, reference);
            if ordering != Ordering::Equal && !self.policy.permits(&plugin.id, ordering) {
                return;
            }
        }

        match self.custom.get(&plugin.id) {
            Some(existing) if !is_newer_version(&plugin.version, &existing.version) => {}
            _ => {
                self.custom.insert(plugin.id.clone(), plugin);
            }
        }
    }
}

fn log_model_error(update: &CompatibleUpdate, err: &UpdaterError) {
    if err.is_transient() {
        tracing::debug!(
            "Skipping {} {}, marketplace model unavailable: {}",
            update.plugin_id,
            update.version,
            err
        );
    } else {
        tracing::warn!(
            "Failed to load marketplace model for {} {}: {}",
            update.plugin_id,
            update.version,
            err
        );
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = Result<T, UpdaterError>>,
) -> Result<T, UpdaterError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UpdaterError::Cancelled),
        result = future => result,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::download::FileDownloader;
    use crate::platform::build_number::BuildRange;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    pub(crate) fn bn(value: &str) -> BuildNumber {
        value.parse().unwrap()
    }

    pub(crate) fn installed(id: &str, version: &str) -> InstalledPlugin {
        InstalledPlugin {
            id: id.into(),
            name: id.to_owned(),
            version: version.to_owned(),
            path: PathBuf::from(format!("/plugins/{}", id)),
            enabled: true,
            bundled: false,
            allow_bundled_update: false,
            imported: false,
            since_build: None,
            until_build: None,
        }
    }

    pub(crate) fn remote(id: &str, version: &str, host: RepositoryHost) -> RemotePlugin {
        RemotePlugin {
            id: id.into(),
            name: id.to_owned(),
            version: version.to_owned(),
            compatibility: BuildRange::default(),
            download_url: Some(
                Url::parse(&format!("https://files.example.com/{}-{}.zip", id, version)).unwrap(),
            ),
            host,
        }
    }

    pub(crate) fn custom_host(name: &str) -> Url {
        Url::parse(&format!("https://{}.example.com/updatePlugins.xml", name)).unwrap()
    }

    #[derive(Clone)]
    pub(crate) enum FakeModel {
        Found(RemotePlugin),
        NotFound,
        ServerError,
    }

    /// In-memory repository. Downloads write the plugin version into the file.
    #[derive(Default)]
    pub(crate) struct FakeRepository {
        pub marketplace: BTreeMap<PluginId, FakeModel>,
        pub custom: HashMap<Url, Option<Vec<RemotePlugin>>>,
        pub broken: Vec<(PluginId, String)>,
        pub requests: AtomicUsize,
        pub downloads: parking_lot::Mutex<Vec<PluginId>>,
        id_lookups_in_flight: AtomicUsize,
        pub max_id_lookups_in_flight: AtomicUsize,
    }

    impl FakeRepository {
        pub(crate) fn with_marketplace(mut self, plugin: RemotePlugin) -> Self {
            self.marketplace
                .insert(plugin.id.clone(), FakeModel::Found(plugin));
            self
        }

        pub(crate) fn with_custom(mut self, host: &Url, plugins: Vec<RemotePlugin>) -> Self {
            self.custom.insert(host.clone(), Some(plugins));
            self
        }

        fn request(&self) {
            self.requests.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    #[async_trait]
    impl FileDownloader for FakeRepository {
        async fn download_file(&self, url: &Url, destination: &Path) -> Result<(), UpdaterError> {
            self.request();
            tokio::fs::write(destination, url.as_str()).await?;
            Ok(())
        }
    }

    #[async_trait]
    impl PluginRepository for FakeRepository {
        async fn marketplace_plugin_ids(&self) -> Result<HashSet<PluginId>, UpdaterError> {
            self.request();
            let in_flight = self.id_lookups_in_flight.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.max_id_lookups_in_flight.fetch_max(in_flight, AtomicOrdering::SeqCst);
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            self.id_lookups_in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
            Ok(self.marketplace.keys().cloned().collect())
        }

        async fn last_compatible_updates(
            &self,
            ids: &[PluginId],
            _build: Option<&BuildNumber>,
        ) -> Result<Vec<CompatibleUpdate>, UpdaterError> {
            self.request();
            Ok(ids
                .iter()
                .enumerate()
                .map(|(idx, id)| CompatibleUpdate {
                    plugin_id: id.clone(),
                    marketplace_id: idx as u64,
                    update_id: idx as u64,
                    version: match self.marketplace.get(id) {
                        Some(FakeModel::Found(p)) => p.version.clone(),
                        _ => "0".to_owned(),
                    },
                })
                .collect())
        }

        async fn plugin_model(&self, update: &CompatibleUpdate) -> Result<RemotePlugin, UpdaterError> {
            self.request();
            let url = Url::parse("https://plugins.example.com/model").unwrap();
            match self.marketplace.get(&update.plugin_id) {
                Some(FakeModel::Found(plugin)) => Ok(plugin.clone()),
                Some(FakeModel::ServerError) => Err(UpdaterError::HttpStatus {
                    url,
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                }),
                _ => Err(UpdaterError::HttpStatus {
                    url,
                    status: StatusCode::NOT_FOUND,
                }),
            }
        }

        async fn custom_repository_plugins(
            &self,
            host: &Url,
            _build: Option<&BuildNumber>,
        ) -> Result<Vec<RemotePlugin>, UpdaterError> {
            self.request();
            match self.custom.get(host) {
                Some(Some(plugins)) => Ok(plugins.clone()),
                _ => Err(UpdaterError::HttpStatus {
                    url: host.clone(),
                    status: StatusCode::BAD_GATEWAY,
                }),
            }
        }

        async fn broken_plugins(&self) -> Result<BrokenPlugins, UpdaterError> {
            self.request();
            Ok(BrokenPlugins::new(self.broken.clone()))
        }

        async fn download_plugin(
            &self,
            plugin: &RemotePlugin,
            destination: &Path,
        ) -> Result<(), UpdaterError> {
            self.request();
            self.downloads.lock().push(plugin.id.clone());
            tokio::fs::write(destination, plugin.version.as_bytes()).await?;
            Ok(())
        }
    }

    fn aggregator(repository: FakeRepository, hosts: Vec<Url>) -> (Arc<FakeRepository>, PluginRepositoryAggregator) {
        aggregator_with_policy(repository, hosts, Arc::new(DefaultPluginUpdatePolicy))
    }

    fn aggregator_with_policy(
        repository: FakeRepository,
        hosts: Vec<Url>,
        policy: Arc<dyn PluginUpdatePolicy>,
    ) -> (Arc<FakeRepository>, PluginRepositoryAggregator) {
        let repository = Arc::new(repository);
        let aggregator = PluginRepositoryAggregator::new(repository.clone(), hosts, policy);
        (repository, aggregator)
    }

    async fn scan(aggregator: &PluginRepositoryAggregator, plugins: Vec<InstalledPlugin>) -> PluginUpdateSet {
        aggregator
            .scan(&ScanRequest::new(plugins, bn("241.100")), &CancellationToken::new())
            .await
            .unwrap()
    }

    fn versions(downloaders: &[PluginDownloader]) -> Vec<(String, String, RepositoryHost)> {
        downloaders
            .iter()
            .map(|d| (d.plugin_id.to_string(), d.version.clone(), d.host().clone()))
            .collect()
    }

    #[tokio::test]
    async fn marketplace_wins_over_older_custom_version() {
        let host = custom_host("custom");
        let repository = FakeRepository::default()
            .with_marketplace(remote("p", "2", RepositoryHost::Marketplace))
            .with_custom(&host, vec![remote("p", "1.5", RepositoryHost::Custom(host.clone()))]);
        let (_, aggregator) = aggregator(repository, vec![host.clone()]);

        let result = scan(&aggregator, vec![installed("p", "1")]).await;

        assert_eq!(
            versions(&result.enabled),
            vec![("p".to_owned(), "2".to_owned(), RepositoryHost::Marketplace)]
        );
        assert!(result.disabled.is_empty());
        assert!(result.custom_repository_plugins.is_empty());
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn first_custom_host_wins_but_newest_version_is_reported() {
        let first = custom_host("first");
        let second = custom_host("second");
        let repository = FakeRepository::default()
            .with_custom(&first, vec![remote("c", "1.1", RepositoryHost::Custom(first.clone()))])
            .with_custom(
                &second,
                vec![
                    remote("c", "1.4", RepositoryHost::Custom(second.clone())),
                    remote("other", "9", RepositoryHost::Custom(second.clone())),
                ],
            );
        let (_, aggregator) = aggregator(repository, vec![first.clone(), second.clone()]);

        let result = scan(&aggregator, vec![installed("c", "1.0")]).await;

        assert_eq!(
            versions(&result.enabled),
            vec![("c".to_owned(), "1.1".to_owned(), RepositoryHost::Custom(first))]
        );
        let custom = result
            .custom_repository_plugins
            .iter()
            .map(|p| (p.id.to_string(), p.version.clone()))
            .collect::<Vec<_>>();
        assert_eq!(
            custom,
            vec![("c".to_owned(), "1.4".to_owned()), ("other".to_owned(), "9".to_owned())]
        );
    }

    #[tokio::test]
    async fn failed_models_leave_plugin_to_other_hosts() {
        let host = custom_host("custom");
        let mut repository = FakeRepository::default().with_custom(
            &host,
            vec![
                remote("missing", "2", RepositoryHost::Custom(host.clone())),
                remote("failing", "2", RepositoryHost::Custom(host.clone())),
            ],
        );
        repository.marketplace.insert("missing".into(), FakeModel::NotFound);
        repository.marketplace.insert("failing".into(), FakeModel::ServerError);
        let (_, aggregator) = aggregator(repository, vec![host.clone()]);

        let result = scan(
            &aggregator,
            vec![installed("missing", "1"), installed("failing", "1")],
        )
        .await;

        let hosts = result.enabled.iter().map(|d| d.host().clone()).collect::<Vec<_>>();
        assert_eq!(hosts, vec![RepositoryHost::Custom(host.clone()); 2]);
        assert!(result.errors.is_empty());
        assert!(result.plugin_errors.is_empty());
    }

    #[tokio::test]
    async fn unserved_model_failures_are_reported_per_plugin() {
        let mut repository = FakeRepository::default();
        repository.marketplace.insert("missing".into(), FakeModel::NotFound);
        repository.marketplace.insert("failing".into(), FakeModel::ServerError);
        let (_, aggregator) = aggregator(repository, vec![]);

        let result = scan(
            &aggregator,
            vec![installed("missing", "1"), installed("failing", "1")],
        )
        .await;

        assert!(result.enabled.is_empty());
        assert!(result.errors.is_empty());
        let ids = result.plugin_errors.keys().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(ids, vec!["failing".to_owned()]);
        assert!(matches!(
            result.plugin_errors[&PluginId::from("failing")],
            UpdaterError::HttpStatus { .. }
        ));
    }

    #[tokio::test]
    async fn host_failures_are_collected_without_aborting() {
        let broken_host = custom_host("down");
        let mut repository = FakeRepository::default()
            .with_marketplace(remote("p", "2", RepositoryHost::Marketplace));
        repository.custom.insert(broken_host.clone(), None);
        let (_, aggregator) = aggregator(repository, vec![broken_host.clone()]);

        let result = scan(&aggregator, vec![installed("p", "1")]).await;

        assert_eq!(result.enabled.len(), 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors.contains_key(&RepositoryHost::Custom(broken_host)));
    }

    #[tokio::test]
    async fn disabled_plugins_use_their_own_bucket() {
        let repository = FakeRepository::default()
            .with_marketplace(remote("on", "2", RepositoryHost::Marketplace))
            .with_marketplace(remote("off", "2", RepositoryHost::Marketplace));
        let (_, aggregator) = aggregator(repository, vec![]);

        let mut off = installed("off", "1");
        off.enabled = false;
        let result = scan(&aggregator, vec![installed("on", "1"), off]).await;

        assert_eq!(versions(&result.enabled)[0].0, "on");
        assert_eq!(versions(&result.disabled)[0].0, "off");
    }

    #[tokio::test]
    async fn broken_candidates_are_skipped_and_broken_installs_replaced() {
        let mut repository = FakeRepository::default()
            .with_marketplace(remote("bad-candidate", "2", RepositoryHost::Marketplace))
            .with_marketplace(remote("bad-install", "1.9", RepositoryHost::Marketplace));
        repository.broken = vec![
            ("bad-candidate".into(), "2".to_owned()),
            ("bad-install".into(), "2.0".to_owned()),
        ];
        let (_, aggregator) = aggregator(repository, vec![]);

        let result = scan(
            &aggregator,
            vec![installed("bad-candidate", "1"), installed("bad-install", "2.0")],
        )
        .await;

        assert_eq!(
            versions(&result.enabled),
            vec![("bad-install".to_owned(), "1.9".to_owned(), RepositoryHost::Marketplace)]
        );
    }

    #[tokio::test]
    async fn broken_list_can_be_ignored() {
        let mut repository = FakeRepository::default()
            .with_marketplace(remote("p", "2", RepositoryHost::Marketplace));
        repository.broken = vec![("p".into(), "2".to_owned())];
        let (_, aggregator) = aggregator(repository, vec![]);

        let mut request = ScanRequest::new(vec![installed("p", "1")], bn("241.100"));
        request.check_broken_plugins = false;
        let result = aggregator.scan(&request, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.enabled.len(), 1);
    }

    #[tokio::test]
    async fn unserved_incompatible_plugins_are_reported() {
        let (_, aggregator) = aggregator(FakeRepository::default(), vec![]);

        let mut old = installed("old", "1");
        old.until_build = Some(bn("241.*"));
        let mut old_disabled = old.clone();
        old_disabled.id = "old-disabled".into();
        old_disabled.enabled = false;

        let mut request = ScanRequest::new(vec![old, old_disabled, installed("fine", "1")], bn("241.100"));
        request.target_build = Some(bn("242.1"));
        let result = aggregator.scan(&request, &CancellationToken::new()).await.unwrap();

        let ids = result.incompatible.iter().map(|p| p.id.to_string()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["old".to_owned()]);
    }

    #[tokio::test]
    async fn imported_plugins_are_never_incompatible() {
        let (_, aggregator) = aggregator(FakeRepository::default(), vec![]);

        let mut imported = installed("imp", "1");
        imported.imported = true;
        imported.until_build = Some(bn("241.*"));
        let mut installed_old = installed("old", "1");
        installed_old.until_build = Some(bn("241.*"));

        let mut request = ScanRequest::new(vec![imported, installed_old], bn("241.100"));
        request.target_build = Some(bn("242.1"));
        let result = aggregator.scan(&request, &CancellationToken::new()).await.unwrap();

        let ids = result.incompatible.iter().map(|p| p.id.to_string()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["old".to_owned()]);
    }

    #[tokio::test]
    async fn nothing_updatable_means_no_requests() {
        let (repository, aggregator) = aggregator(
            FakeRepository::default().with_marketplace(remote("b", "2", RepositoryHost::Marketplace)),
            vec![custom_host("custom")],
        );

        let mut bundled = installed("b", "1");
        bundled.bundled = true;
        let result = scan(&aggregator, vec![bundled]).await;

        assert!(result.enabled.is_empty() && result.disabled.is_empty());
        assert_eq!(repository.requests.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn only_filter_restricts_the_scan() {
        let repository = FakeRepository::default()
            .with_marketplace(remote("a", "2", RepositoryHost::Marketplace))
            .with_marketplace(remote("b", "2", RepositoryHost::Marketplace));
        let (_, aggregator) = aggregator(repository, vec![]);

        let mut request = ScanRequest::new(vec![installed("a", "1"), installed("b", "1")], bn("241.100"));
        request.only = Some(HashSet::from([PluginId::from("b")]));
        let result = aggregator.scan(&request, &CancellationToken::new()).await.unwrap();

        assert_eq!(versions(&result.enabled)[0].0, "b");
        assert_eq!(result.enabled.len(), 1);
    }

    #[tokio::test]
    async fn downgrades_need_policy_permission() {
        struct AllowDowngrades;
        impl PluginUpdatePolicy for AllowDowngrades {
            fn allow_downgrade(&self, _plugin: &PluginId) -> bool {
                true
            }
        }

        let repository = || {
            FakeRepository::default().with_marketplace(remote("p", "1.5", RepositoryHost::Marketplace))
        };

        let (_, strict) = aggregator(repository(), vec![]);
        assert!(scan(&strict, vec![installed("p", "2")]).await.enabled.is_empty());

        let (_, lenient) = aggregator_with_policy(repository(), vec![], Arc::new(AllowDowngrades));
        let result = scan(&lenient, vec![installed("p", "2")]).await;
        assert_eq!(versions(&result.enabled)[0].1, "1.5");
    }

    #[tokio::test]
    async fn scans_are_repeatable() {
        let host = custom_host("custom");
        let repository = FakeRepository::default()
            .with_marketplace(remote("a", "2", RepositoryHost::Marketplace))
            .with_custom(&host, vec![remote("b", "3", RepositoryHost::Custom(host.clone()))]);
        let (_, aggregator) = aggregator(repository, vec![host]);
        let plugins = vec![installed("a", "1"), installed("b", "1")];

        let first = scan(&aggregator, plugins.clone()).await;
        let second = scan(&aggregator, plugins).await;

        assert_eq!(versions(&first.enabled), versions(&second.enabled));
        assert_eq!(first.enabled.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_scan_fails() {
        let (_, aggregator) = aggregator(
            FakeRepository::default().with_marketplace(remote("p", "2", RepositoryHost::Marketplace)),
            vec![],
        );
        let token = CancellationToken::new();
        token.cancel();

        let result = aggregator
            .scan(&ScanRequest::new(vec![installed("p", "1")], bn("241.100")), &token)
            .await;
        assert!(matches!(result, Err(UpdaterError::Cancelled)));
    }
}
